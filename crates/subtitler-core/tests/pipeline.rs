//! End-to-end exercise of `TranslationEngine::run` against in-memory
//! collaborators: a fake `Provider` standing in for a real LLM, and a fake
//! `AsrBackend` standing in for the ASR model runtime external collaborator
//! (both out of scope per §1; these are the "one concrete, testable
//! implementation sufficient to exercise the pipeline end to end" doubles).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use subtitler_common::Result;
use subtitler_core::engine::{AsrBackend, EngineConfig};
use subtitler_core::provider::{GenerateRequest, GenerateResponse, ModelInfo, Provider, ProviderEntry, ProviderRegistry};
use subtitler_core::{EventBus, JobStore, TranslationCache, TranslationEngine};
use subtitler_protocol::{JobInputs, SourceType, WritebackMode};
use subtitler_subtitle::{Cue, SubtitleFile};

/// Echoes each `[n] text` line back as `[n] TR:text`, the same per-cue
/// marker contract `parse_batch_response` expects (§4.6 step 2c).
struct FakeProvider {
    name: String,
    calls: AtomicUsize,
}

impl FakeProvider {
    fn new() -> Self {
        Self { name: "local".to_string(), calls: AtomicUsize::new(0) }
    }

    fn named(name: &str) -> Self {
        Self { name: name.to_string(), calls: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        Ok(vec![ModelInfo { name: "fake-model".to_string(), context_window: None }])
    }

    async fn generate(&self, req: &GenerateRequest) -> Result<GenerateResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut out = String::new();
        for line in req.prompt.lines() {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix('[')
                && let Some((index, text)) = rest.split_once(']')
            {
                out.push_str(&format!("[{}] TR:{}\n", index.trim(), text.trim()));
            }
        }
        Ok(GenerateResponse {
            text: out,
            input_tokens: Some(10),
            output_tokens: Some(10),
            finish_reason: Some("stop".to_string()),
        })
    }

    async fn health_check(&self) -> bool {
        true
    }
}

struct MockAsrBackend;

#[async_trait]
impl AsrBackend for MockAsrBackend {
    async fn transcribe_chunk(&self, _source_path: &str, _start_ms: u64, _end_ms: u64) -> Result<Vec<Cue>> {
        Ok(vec![
            Cue::new(1, 0, 1_000, "hello"),
            Cue::new(2, 1_000, 2_000, "world"),
        ])
    }

    async fn audio_duration_ms(&self, _source_path: &str) -> Result<u64> {
        Ok(2_000)
    }
}

fn local_engine(asr: Option<Arc<dyn AsrBackend>>, output_dir: String, provider: Arc<FakeProvider>) -> TranslationEngine {
    let mut providers = ProviderRegistry::new();
    providers.register(
        ProviderEntry { provider_name: "local".to_string(), priority: 0, enabled: true },
        provider as Arc<dyn Provider>,
    );

    TranslationEngine {
        job_store: JobStore::new(),
        event_bus: EventBus::new(),
        cache: TranslationCache::new(),
        providers: Arc::new(providers),
        quota: Arc::new(subtitler_core::QuotaLedger::new(10, Duration::from_secs(60))),
        rules: Vec::new(),
        model_owners: HashMap::new(),
        asr,
        media_host: None,
        config: EngineConfig { output_dir, ..EngineConfig::default() },
    }
}

fn sample_srt(dir: &std::path::Path) -> String {
    let path = dir.join("source.srt");
    let file = SubtitleFile {
        cues: vec![
            Cue::new(1, 0, 1_000, "hello"),
            Cue::new(2, 1_000, 2_000, "world"),
        ],
    };
    file.save_srt(&path).unwrap();
    path.to_str().unwrap().to_string()
}

#[tokio::test]
async fn subtitle_source_runs_to_success_and_writes_sidecar() {
    let dir = tempfile::tempdir().unwrap();
    let source_path = sample_srt(dir.path());
    let provider = Arc::new(FakeProvider::new());
    let engine = local_engine(None, dir.path().join("out").to_str().unwrap().to_string(), provider.clone());

    let job = engine.job_store.create(
        JobInputs {
            source_type: SourceType::Subtitle,
            source_path: Some(source_path),
            source_lang: "en".to_string(),
            target_langs: vec!["zh-CN".to_string()],
            model: "local:fake-model".to_string(),
            provider: None,
            writeback_mode: WritebackMode::Sidecar,
            priority: 5,
        },
        chrono::Utc::now(),
    );

    let (_tx, rx) = tokio::sync::watch::channel(false);
    engine.run(job.id, &rx).await.unwrap();

    let finished = engine.job_store.get(job.id).unwrap();
    assert_eq!(finished.status, subtitler_protocol::JobStatus::Success);
    assert_eq!(finished.result_paths.len(), 1);
    assert!(provider.calls.load(Ordering::SeqCst) >= 1);

    let sidecar = dir.path().join("source.zh-CN.srt");
    assert!(sidecar.exists());
    let translated = SubtitleFile::parse_srt_file(&sidecar).unwrap();
    assert_eq!(translated.cues[0].text, "TR:hello");
}

#[tokio::test]
async fn cache_hit_skips_the_provider_entirely() {
    let dir = tempfile::tempdir().unwrap();
    let source_path = sample_srt(dir.path());
    let provider = Arc::new(FakeProvider::new());
    let engine = local_engine(None, dir.path().join("out").to_str().unwrap().to_string(), provider.clone());

    engine.cache.put("hello", "en", "zh-CN", "local:fake-model", "cached-hello".to_string());
    engine.cache.put("world", "en", "zh-CN", "local:fake-model", "cached-world".to_string());

    let job = engine.job_store.create(
        JobInputs {
            source_type: SourceType::Subtitle,
            source_path: Some(source_path),
            source_lang: "en".to_string(),
            target_langs: vec!["zh-CN".to_string()],
            model: "local:fake-model".to_string(),
            provider: None,
            writeback_mode: WritebackMode::Sidecar,
            priority: 5,
        },
        chrono::Utc::now(),
    );

    let (_tx, rx) = tokio::sync::watch::channel(false);
    engine.run(job.id, &rx).await.unwrap();

    assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    let finished = engine.job_store.get(job.id).unwrap();
    assert_eq!(finished.status, subtitler_protocol::JobStatus::Success);
    let out_file = SubtitleFile::parse_srt_file(&finished.result_paths[0]).unwrap();
    assert_eq!(out_file.cues[0].text, "cached-hello");
    assert_eq!(out_file.cues[1].text, "cached-world");
}

#[tokio::test]
async fn audio_source_runs_through_asr_before_translation() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(FakeProvider::new());
    let engine = local_engine(
        Some(Arc::new(MockAsrBackend) as Arc<dyn AsrBackend>),
        dir.path().join("out").to_str().unwrap().to_string(),
        provider.clone(),
    );

    let job = engine.job_store.create(
        JobInputs {
            source_type: SourceType::Audio,
            source_path: Some("/media/episode.wav".to_string()),
            source_lang: "en".to_string(),
            target_langs: vec!["zh-CN".to_string()],
            model: "local:fake-model".to_string(),
            provider: None,
            writeback_mode: WritebackMode::Sidecar,
            priority: 5,
        },
        chrono::Utc::now(),
    );

    let (_tx, rx) = tokio::sync::watch::channel(false);
    engine.run(job.id, &rx).await.unwrap();

    let finished = engine.job_store.get(job.id).unwrap();
    assert_eq!(finished.status, subtitler_protocol::JobStatus::Success);
    assert!(finished.checkpoint.asr_output_path.is_some());
}

#[tokio::test]
async fn successful_batch_translate_logs_usage_and_advances_quota() {
    let dir = tempfile::tempdir().unwrap();
    let source_path = sample_srt(dir.path());
    let provider = Arc::new(FakeProvider::named("openai"));

    let mut providers = ProviderRegistry::new();
    providers.register(
        ProviderEntry { provider_name: "openai".to_string(), priority: 0, enabled: true },
        provider.clone() as Arc<dyn Provider>,
    );

    let quota = Arc::new(subtitler_core::QuotaLedger::new(10, Duration::from_secs(60)));
    quota.register_provider(
        subtitler_core::quota::ProviderConfig {
            provider_name: "openai".to_string(),
            display_name: "openai".to_string(),
            enabled: true,
            default_model: None,
            priority: 0,
        },
        subtitler_core::quota::Quota::new("openai", 1000.0, 1000.0, chrono::Utc::now()),
    );

    let engine = TranslationEngine {
        job_store: JobStore::new(),
        event_bus: EventBus::new(),
        cache: TranslationCache::new(),
        providers: Arc::new(providers),
        quota: quota.clone(),
        rules: Vec::new(),
        model_owners: HashMap::new(),
        asr: None,
        media_host: None,
        config: EngineConfig { output_dir: dir.path().join("out").to_str().unwrap().to_string(), ..EngineConfig::default() },
    };

    let job = engine.job_store.create(
        JobInputs {
            source_type: SourceType::Subtitle,
            source_path: Some(source_path),
            source_lang: "en".to_string(),
            target_langs: vec!["zh-CN".to_string()],
            model: "openai:gpt-4o-mini".to_string(),
            provider: None,
            writeback_mode: WritebackMode::Sidecar,
            priority: 5,
        },
        chrono::Utc::now(),
    );

    let (_tx, rx) = tokio::sync::watch::channel(false);
    engine.run(job.id, &rx).await.unwrap();

    let finished = engine.job_store.get(job.id).unwrap();
    assert_eq!(finished.status, subtitler_protocol::JobStatus::Success);
    assert!(provider.calls.load(Ordering::SeqCst) >= 1);

    let usage = quota.usage_stats("openai");
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].input_tokens, 10);
    assert_eq!(usage[0].output_tokens, 10);

    let snapshot = quota.quota_snapshot("openai").unwrap();
    assert_eq!(snapshot.current_daily_tokens, 20);
    assert_eq!(snapshot.current_monthly_tokens, 20);
}

#[tokio::test]
async fn daily_quota_at_limit_pauses_job_with_daily_reason() {
    let dir = tempfile::tempdir().unwrap();
    let source_path = sample_srt(dir.path());
    let provider = Arc::new(FakeProvider::named("openai"));

    let mut providers = ProviderRegistry::new();
    providers.register(
        ProviderEntry { provider_name: "openai".to_string(), priority: 0, enabled: true },
        provider.clone() as Arc<dyn Provider>,
    );

    let now = chrono::Utc::now();
    let quota = Arc::new(subtitler_core::QuotaLedger::new(10, Duration::from_secs(60)));
    quota.register_provider(
        subtitler_core::quota::ProviderConfig {
            provider_name: "openai".to_string(),
            display_name: "openai".to_string(),
            enabled: true,
            default_model: None,
            priority: 0,
        },
        // daily_limit already exhausted (§8 scenario 2: "current 0.001").
        subtitler_core::quota::Quota::new("openai", 0.001, 1000.0, now),
    );
    // Drive current_daily_cost to the limit via a zero-pricing usage log so
    // the very first pause-on-exceed check inside `mt` already breaches.
    quota.register_model(subtitler_core::quota::ModelConfig {
        provider_name: "openai".to_string(),
        model_name: "gpt-4o-mini".to_string(),
        is_default: true,
        input_price_per_m: Some(1_000_000.0),
        output_price_per_m: Some(0.0),
    });
    quota.log_usage("openai", "gpt-4o-mini", None, 1, 0, now);

    let engine = TranslationEngine {
        job_store: JobStore::new(),
        event_bus: EventBus::new(),
        cache: TranslationCache::new(),
        providers: Arc::new(providers),
        quota: quota.clone(),
        rules: Vec::new(),
        model_owners: HashMap::new(),
        asr: None,
        media_host: None,
        config: EngineConfig { output_dir: dir.path().join("out").to_str().unwrap().to_string(), ..EngineConfig::default() },
    };

    let job = engine.job_store.create(
        JobInputs {
            source_type: SourceType::Subtitle,
            source_path: Some(source_path),
            source_lang: "en".to_string(),
            target_langs: vec!["zh-CN".to_string()],
            model: "openai:gpt-4o-mini".to_string(),
            provider: None,
            writeback_mode: WritebackMode::Sidecar,
            priority: 5,
        },
        now,
    );

    let (_tx, rx) = tokio::sync::watch::channel(false);
    engine.run(job.id, &rx).await.unwrap();

    let finished = engine.job_store.get(job.id).unwrap();
    assert_eq!(finished.status, subtitler_protocol::JobStatus::Paused);
    assert_eq!(finished.pause.pause_reason.as_deref(), Some("daily_quota_exceeded"));
    assert!(finished.pause.resume_at.is_some());
    assert!(finished.result_paths.is_empty());
    assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancellation_mid_run_stops_without_failing_the_job() {
    let dir = tempfile::tempdir().unwrap();
    let source_path = sample_srt(dir.path());
    let provider = Arc::new(FakeProvider::new());
    let engine = local_engine(None, dir.path().join("out").to_str().unwrap().to_string(), provider);

    let job = engine.job_store.create(
        JobInputs {
            source_type: SourceType::Subtitle,
            source_path: Some(source_path),
            source_lang: "en".to_string(),
            target_langs: vec!["zh-CN".to_string()],
            model: "local:fake-model".to_string(),
            provider: None,
            writeback_mode: WritebackMode::Sidecar,
            priority: 5,
        },
        chrono::Utc::now(),
    );

    let (tx, rx) = tokio::sync::watch::channel(false);
    tx.send(true).unwrap();
    engine.run(job.id, &rx).await.unwrap();

    let finished = engine.job_store.get(job.id).unwrap();
    assert_eq!(finished.status, subtitler_protocol::JobStatus::Cancelled);
}
