//! C6 — the stage machine that executes a job end to end (§4.6):
//! init → pull → asr → mt → post → writeback → done, with the
//! `mt ↔ paused ↔ mt` pause loop driven by the quota ledger.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use subtitler_common::{QuotaWindow, Result, SubtitlerError};
use subtitler_protocol::{EventPayload, Job, JobId, JobStatus, Phase, SourceType, WritebackMode};
use subtitler_subtitle::{soft_wrap, Cue, SubtitleFile};

use crate::asr::{merge_chunks, segment_chunks};
use crate::cache::TranslationCache;
use crate::event_bus::EventBus;
use crate::job_store::{JobStore, StatusPatch};
use crate::provider::{GenerateRequest, Provider, ProviderRegistry};
use crate::quota::QuotaLedger;
use crate::rules::{apply_rules, CorrectionRule};

/// The ASR model runtime and audio extraction are external collaborators
/// (§1); the engine only needs one chunk transcribed with timestamps
/// relative to the chunk's own start.
#[async_trait]
pub trait AsrBackend: Send + Sync {
    async fn transcribe_chunk(&self, source_path: &str, start_ms: u64, end_ms: u64) -> Result<Vec<Cue>>;
    async fn audio_duration_ms(&self, source_path: &str) -> Result<u64>;
}

/// The media-host client is an external collaborator (§1); the engine only
/// needs item→path resolution and subtitle upload.
#[async_trait]
pub trait MediaHost: Send + Sync {
    async fn resolve_item_path(&self, item_id: &str) -> Result<String>;
    async fn upload_subtitle(&self, item_id: &str, lang: &str, path: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub translation_batch_size: usize,
    pub translation_max_line_length: usize,
    pub asr_auto_segment_threshold_ms: u64,
    pub asr_segment_overlap_ms: u64,
    pub output_dir: String,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            translation_batch_size: 10,
            translation_max_line_length: 42,
            asr_auto_segment_threshold_ms: 600_000,
            asr_segment_overlap_ms: 10_000,
            output_dir: "./output".to_string(),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
        }
    }
}

pub struct TranslationEngine {
    pub job_store: JobStore,
    pub event_bus: EventBus,
    pub cache: TranslationCache,
    pub providers: Arc<ProviderRegistry>,
    pub quota: Arc<QuotaLedger>,
    pub rules: Vec<CorrectionRule>,
    pub model_owners: HashMap<String, Vec<String>>,
    pub asr: Option<Arc<dyn AsrBackend>>,
    pub media_host: Option<Arc<dyn MediaHost>>,
    pub config: EngineConfig,
}

/// What a completed phase should do next; `Paused`/`Cancelled` stop the run
/// without marking the job failed (§7 propagation policy).
enum StepOutcome {
    Continue,
    Paused,
    Cancelled,
    Done,
}

impl TranslationEngine {
    fn publish(&self, job: &Job) {
        self.event_bus.publish(EventPayload::from_job(job), Utc::now());
    }

    /// Drives `job_id` through as many phases as it can complete in one
    /// call, stopping cleanly on pause, cancellation, or completion.
    /// Returns `Ok(())` in all non-bug cases; phase failures are recorded on
    /// the Job row rather than propagated, per §7.
    pub async fn run(&self, job_id: JobId, cancel: &tokio::sync::watch::Receiver<bool>) -> Result<()> {
        loop {
            if *cancel.borrow() {
                self.transition_cancelled(job_id)?;
                return Ok(());
            }

            let job = self
                .job_store
                .get(job_id)
                .ok_or_else(|| SubtitlerError::NotFound(format!("job {job_id}")))?;

            let outcome = match job.current_phase {
                Phase::Init => self.run_init(&job).await,
                Phase::Pull => self.run_pull(&job).await,
                Phase::Asr => self.run_asr(&job).await,
                Phase::Mt => self.run_mt(&job, cancel).await,
                Phase::Post => self.run_post(&job).await,
                Phase::Writeback => self.run_writeback(&job).await,
                Phase::Done => Ok(StepOutcome::Done),
            };

            match outcome {
                Ok(StepOutcome::Continue) => continue,
                Ok(StepOutcome::Paused) => return Ok(()),
                Ok(StepOutcome::Cancelled) => return Ok(()),
                Ok(StepOutcome::Done) => return Ok(()),
                Err(err) => {
                    self.fail_job(job_id, &err)?;
                    return Ok(());
                }
            }
        }
    }

    fn advance_phase(&self, job_id: JobId, next: Phase) -> Result<()> {
        let job = self.job_store.update_status(
            job_id,
            StatusPatch {
                current_phase: Some(next),
                ..Default::default()
            },
            None,
        )?;
        self.publish(&job);
        Ok(())
    }

    fn fail_job(&self, job_id: JobId, err: &SubtitlerError) -> Result<()> {
        let job = self.job_store.update_status(
            job_id,
            StatusPatch {
                status: Some(JobStatus::Failed),
                error: Some(Some(err.to_string())),
                finished_at: Some(Utc::now()),
                ..Default::default()
            },
            None,
        )?;
        self.publish(&job);
        Ok(())
    }

    fn transition_cancelled(&self, job_id: JobId) -> Result<()> {
        let job = self.job_store.cancel(job_id, Utc::now())?;
        self.publish(&job);
        Ok(())
    }

    async fn run_init(&self, job: &Job) -> Result<StepOutcome> {
        let mut source_path = job.inputs.source_path.clone();

        if job.inputs.source_type == SourceType::HostItem {
            let host = self
                .media_host
                .as_ref()
                .ok_or_else(|| SubtitlerError::Internal("no media host configured".into()))?;
            let item_id = source_path
                .clone()
                .ok_or_else(|| SubtitlerError::BadInput("host_item source requires source_path as item id".into()))?;
            source_path = Some(host.resolve_item_path(&item_id).await?);
        }

        self.job_store.update_status(
            job.id,
            StatusPatch {
                started_at: Some(Utc::now()),
                status: Some(JobStatus::Running),
                ..Default::default()
            },
            None,
        )?;

        let _ = source_path;
        self.advance_phase(job.id, Phase::Pull)?;
        Ok(StepOutcome::Continue)
    }

    async fn run_pull(&self, job: &Job) -> Result<StepOutcome> {
        let (provider_name, model_name) = self.providers.resolve(&job.inputs.model, &self.model_owners)?;
        if let Some(client) = self.providers.get(&provider_name)
            && client.supports_model_pull() && !client.model_exists(&model_name).await.unwrap_or(true) {
                client.pull_model(&model_name).await?;
            }
        self.advance_phase(job.id, Phase::Asr)?;
        Ok(StepOutcome::Continue)
    }

    fn needs_asr(&self, job: &Job) -> bool {
        matches!(
            job.inputs.source_type,
            SourceType::Audio | SourceType::Media | SourceType::HostItem
        )
    }

    async fn run_asr(&self, job: &Job) -> Result<StepOutcome> {
        if !self.needs_asr(job) {
            self.advance_phase(job.id, Phase::Mt)?;
            return Ok(StepOutcome::Continue);
        }

        let backend = self
            .asr
            .as_ref()
            .ok_or_else(|| SubtitlerError::Internal("no asr backend configured".into()))?;
        let source_path = job
            .inputs
            .source_path
            .clone()
            .ok_or_else(|| SubtitlerError::BadInput("missing source_path for asr".into()))?;

        let duration_ms = backend.audio_duration_ms(&source_path).await?;
        let bounds = segment_chunks(
            duration_ms,
            self.config.asr_auto_segment_threshold_ms,
            self.config.asr_segment_overlap_ms,
        );

        let mut chunk_cues = Vec::with_capacity(bounds.len());
        for &(start, end) in &bounds {
            let mut cues = backend.transcribe_chunk(&source_path, start, end).await?;
            for cue in &mut cues {
                cue.start_ms += start as u32;
                cue.end_ms += start as u32;
            }
            chunk_cues.push(cues);
        }

        let merged = merge_chunks(chunk_cues, &bounds, self.config.asr_segment_overlap_ms);
        let file = SubtitleFile { cues: merged };
        let out_path = format!("{}/{}/asr.srt", self.config.output_dir, job.id);
        if let Some(parent) = std::path::Path::new(&out_path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        file.save_srt(&out_path)?;

        self.job_store
            .append_checkpoint(job.id, Phase::Asr, None, Some(out_path), Utc::now())?;
        self.advance_phase(job.id, Phase::Mt)?;
        Ok(StepOutcome::Continue)
    }

    fn source_subtitle_path(&self, job: &Job) -> Result<String> {
        if job.inputs.source_type == SourceType::Subtitle {
            job.inputs
                .source_path
                .clone()
                .ok_or_else(|| SubtitlerError::BadInput("subtitle source requires source_path".into()))
        } else {
            job.checkpoint
                .asr_output_path
                .clone()
                .ok_or_else(|| SubtitlerError::Internal("asr phase did not produce an output path".into()))
        }
    }

    async fn run_mt(&self, job: &Job, cancel: &tokio::sync::watch::Receiver<bool>) -> Result<StepOutcome> {
        let (provider_name, model_name) = self.providers.resolve(&job.inputs.model, &self.model_owners)?;
        let model_identifier = format!("{provider_name}:{model_name}");
        let client = self
            .providers
            .get(&provider_name)
            .ok_or_else(|| SubtitlerError::NotFound(format!("provider {provider_name}")))?;

        let source_path = self.source_subtitle_path(job)?;
        let source_file = SubtitleFile::parse_srt_file(&source_path)?;

        let remaining: Vec<String> = job
            .inputs
            .target_langs
            .iter()
            .filter(|l| !job.checkpoint.completed_target_langs.contains(*l))
            .cloned()
            .collect();

        let Some(target_lang) = remaining.first().cloned() else {
            self.advance_phase(job.id, Phase::Post)?;
            return Ok(StepOutcome::Continue);
        };

        let mut translated_cues: Vec<Cue> = Vec::with_capacity(source_file.cues.len());
        let total = source_file.cues.len();

        for batch in source_file.cues.chunks(self.config.translation_batch_size) {
            if *cancel.borrow() {
                self.transition_cancelled(job.id)?;
                return Ok(StepOutcome::Cancelled);
            }

            if provider_name != "local" {
                match self.quota.check_pause_on_exceed(&provider_name, Utc::now()) {
                    Ok(()) => {}
                    Err(SubtitlerError::QuotaPause { window, resume_at, .. }) => {
                        let resume_at: chrono::DateTime<Utc> = resume_at.into();
                        let reason = match window {
                            QuotaWindow::Daily => "daily_quota_exceeded",
                            QuotaWindow::Monthly => "monthly_quota_exceeded",
                        };
                        let job = self.job_store.pause(job.id, reason.to_string(), resume_at, Utc::now())?;
                        self.publish(&job);
                        return Ok(StepOutcome::Paused);
                    }
                    Err(other) => return Err(other),
                }
            }

            let translated_batch = self
                .translate_batch(
                    batch,
                    &job.inputs.source_lang,
                    &target_lang,
                    &model_identifier,
                    provider_name.as_str(),
                    model_name.as_str(),
                    client.as_ref(),
                    job.id,
                )
                .await?;
            translated_cues.extend(translated_batch);

            let progress = (translated_cues.len() as f64 / total.max(1) as f64) * 100.0;
            let patched = self.job_store.update_status(
                job.id,
                StatusPatch {
                    progress: Some(progress),
                    ..Default::default()
                },
                None,
            )?;
            self.publish(&patched);
        }

        let out_path = format!("{}/{}/{}.srt", self.config.output_dir, job.id, target_lang);
        if let Some(parent) = std::path::Path::new(&out_path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        let out_file = SubtitleFile { cues: translated_cues };
        out_file.save_srt(&out_path)?;

        let mut result_paths = job.result_paths.clone();
        result_paths.push(out_path.clone());
        self.job_store.update_status(
            job.id,
            StatusPatch {
                result_paths: Some(result_paths),
                ..Default::default()
            },
            None,
        )?;
        self.job_store
            .append_checkpoint(job.id, Phase::Mt, Some(&target_lang), None, Utc::now())?;

        Ok(StepOutcome::Continue)
    }

    #[allow(clippy::too_many_arguments)]
    async fn translate_batch(
        &self,
        batch: &[Cue],
        source_lang: &str,
        target_lang: &str,
        model_identifier: &str,
        provider_name: &str,
        model_name: &str,
        client: &dyn Provider,
        job_id: JobId,
    ) -> Result<Vec<Cue>> {
        let mut translations: HashMap<usize, String> = HashMap::new();
        let mut to_translate: Vec<&Cue> = Vec::new();

        for cue in batch {
            match self.cache.get(&cue.text, source_lang, target_lang, model_identifier) {
                Some(cached) => {
                    translations.insert(cue.index, cached);
                }
                None => to_translate.push(cue),
            }
        }

        if !to_translate.is_empty() {
            match self
                .generate_batch_with_retry(&to_translate, source_lang, target_lang, model_name, client)
                .await
            {
                Ok((parsed, input_tokens, output_tokens)) => {
                    if provider_name != "local" {
                        self.quota.log_usage(
                            provider_name,
                            model_name,
                            Some(job_id),
                            input_tokens,
                            output_tokens,
                            Utc::now(),
                        );
                    }
                    for cue in &to_translate {
                        if let Some(text) = parsed.get(&cue.index) {
                            translations.insert(cue.index, text.clone());
                        }
                    }
                }
                Err(_) => {
                    // Parse/transport failure: fall back to one call per cue.
                    for cue in &to_translate {
                        let req = GenerateRequest {
                            model: model_name.to_string(),
                            prompt: single_cue_prompt(&cue.text, source_lang, target_lang),
                            system: None,
                            temperature: Some(0.3),
                            max_tokens: None,
                        };
                        let resp = self.call_with_retry(client, &req).await?;
                        if provider_name != "local" {
                            self.quota.log_usage(
                                provider_name,
                                model_name,
                                Some(job_id),
                                resp.input_tokens.unwrap_or(0),
                                resp.output_tokens.unwrap_or(0),
                                Utc::now(),
                            );
                        }
                        translations.insert(cue.index, resp.text);
                    }
                }
            }
        }

        let mut result = Vec::with_capacity(batch.len());
        for cue in batch {
            let raw = translations
                .remove(&cue.index)
                .unwrap_or_else(|| cue.text.clone());
            let (corrected, _applied) = apply_rules(&self.rules, &raw, source_lang, target_lang);
            let wrapped = soft_wrap(&corrected, self.config.translation_max_line_length);

            self.cache.put(&cue.text, source_lang, target_lang, model_identifier, wrapped.clone());

            result.push(Cue {
                index: cue.index,
                start_ms: cue.start_ms,
                end_ms: cue.end_ms,
                text: wrapped,
                style: cue.style.clone(),
            });
        }
        Ok(result)
    }

    /// Returns the per-cue parsed translations alongside the batch call's
    /// token counts, so the caller can log usage once per batch rather than
    /// once per cue (§4.5 "every successful `generate` call appends a
    /// UsageLog row").
    async fn generate_batch_with_retry(
        &self,
        cues: &[&Cue],
        source_lang: &str,
        target_lang: &str,
        model_name: &str,
        client: &dyn Provider,
    ) -> Result<(HashMap<usize, String>, u64, u64)> {
        let prompt = batch_prompt(cues, source_lang, target_lang);
        let req = GenerateRequest {
            model: model_name.to_string(),
            prompt,
            system: None,
            temperature: Some(0.3),
            max_tokens: None,
        };
        let resp = self.call_with_retry(client, &req).await?;
        let parsed = parse_batch_response(&resp.text, cues)?;
        Ok((parsed, resp.input_tokens.unwrap_or(0), resp.output_tokens.unwrap_or(0)))
    }

    async fn call_with_retry(&self, client: &dyn Provider, req: &GenerateRequest) -> Result<crate::provider::GenerateResponse> {
        let mut attempt = 0;
        let mut delay = self.config.retry_base_delay;
        loop {
            match client.generate(req).await {
                Ok(resp) => return Ok(resp),
                Err(err) if err.is_retriable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.config.retry_max_delay);
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn run_post(&self, job: &Job) -> Result<StepOutcome> {
        for path in &job.result_paths {
            let file = SubtitleFile::parse_srt_file(path)?;
            let source_path = self.source_subtitle_path(job)?;
            let source = SubtitleFile::parse_srt_file(&source_path)?;
            file.validate(source.cues.len(), 10_000)?;
        }
        self.advance_phase(job.id, Phase::Writeback)?;
        Ok(StepOutcome::Continue)
    }

    async fn run_writeback(&self, job: &Job) -> Result<StepOutcome> {
        for (lang, path) in job.inputs.target_langs.iter().zip(job.result_paths.iter()) {
            match job.inputs.writeback_mode {
                WritebackMode::Sidecar => {
                    if let Some(source) = &job.inputs.source_path {
                        let source_path = std::path::Path::new(source);
                        let stem = source_path.file_stem().and_then(|s| s.to_str()).unwrap_or("output");
                        let dir = source_path.parent().unwrap_or_else(|| std::path::Path::new("."));
                        let sidecar = dir.join(format!("{stem}.{lang}.srt"));
                        std::fs::copy(path, &sidecar)?;
                    }
                }
                WritebackMode::Upload => {
                    let host = self
                        .media_host
                        .as_ref()
                        .ok_or_else(|| SubtitlerError::Internal("no media host configured for upload".into()))?;
                    let item_id = job
                        .inputs
                        .source_path
                        .clone()
                        .ok_or_else(|| SubtitlerError::BadInput("upload requires source item id".into()))?;
                    host.upload_subtitle(&item_id, lang, path).await?;
                }
            }
        }
        self.advance_phase(job.id, Phase::Done)?;
        self.finish_success(job.id)?;
        Ok(StepOutcome::Done)
    }

    fn finish_success(&self, job_id: JobId) -> Result<()> {
        let job = self.job_store.update_status(
            job_id,
            StatusPatch {
                status: Some(JobStatus::Success),
                progress: Some(100.0),
                finished_at: Some(Utc::now()),
                ..Default::default()
            },
            None,
        )?;
        self.publish(&job);
        Ok(())
    }
}

fn single_cue_prompt(text: &str, source_lang: &str, target_lang: &str) -> String {
    format!("Translate from {source_lang} to {target_lang}, output only the translation:\n{text}")
}

fn batch_prompt(cues: &[&Cue], source_lang: &str, target_lang: &str) -> String {
    let mut prompt = format!(
        "Translate each numbered line from {source_lang} to {target_lang}. \
         Reply with the same numbering, one translation per line.\n"
    );
    for cue in cues {
        prompt.push_str(&format!("[{}] {}\n", cue.index, cue.text));
    }
    prompt
}

/// Parses a `[n] text` per line response keyed by stable ordering markers
/// (§4.6 step 2c); returns `Err` (triggering the per-cue fallback) if any
/// requested cue index is missing from the response.
fn parse_batch_response(text: &str, cues: &[&Cue]) -> Result<HashMap<usize, String>> {
    let mut parsed = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix('[')
            && let Some((index_str, content)) = rest.split_once(']')
                && let Ok(index) = index_str.trim().parse::<usize>() {
                    parsed.insert(index, content.trim().to_string());
                }
    }

    for cue in cues {
        if !parsed.contains_key(&cue.index) {
            return Err(SubtitlerError::ProviderFailed {
                provider: "unknown".to_string(),
                message: "batch response missing marker for cue".to_string(),
            });
        }
    }
    Ok(parsed)
}
