use std::sync::Arc;

use clap::Parser;
use subtitler_core::dispatcher::Dispatcher;
use subtitler_core::engine::EngineConfig;
use subtitler_core::provider::{OpenAiCompatibleProvider, Provider, ProviderEntry, ProviderRegistry};
use subtitler_core::quota::{ProviderConfig, Quota, QuotaLedger};
use subtitler_core::{EngineSettings, EventBus, JobStore, TranslationEngine};
use subtitler_server::state::AppState;
use subtitler_server::worker;

#[derive(Parser, Debug)]
#[command(name = "subtitler-server", about = "Subtitle translation job server")]
struct Args {
    /// Address to bind the HTTP ingress API to.
    #[arg(long, default_value = "0.0.0.0:8088")]
    bind_addr: String,

    /// Optional TOML config file layered under env vars (SUBTITLER_*).
    #[arg(long)]
    config: Option<String>,

    /// Number of worker tasks draining the translate queue.
    #[arg(long, default_value_t = 4)]
    workers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let settings = EngineSettings::load(args.config.as_deref())?;

    let job_store = JobStore::new();
    let event_bus = EventBus::new();
    let dispatcher = Arc::new(Dispatcher::new());
    let quota = Arc::new(QuotaLedger::new(settings.quota_cache_size, settings.quota_cache_ttl()));

    let mut providers = ProviderRegistry::new();
    let mut known_providers = Vec::new();

    if let Ok(api_key) = std::env::var("OPENAI_API_KEY") {
        let client: Arc<dyn Provider> = Arc::new(OpenAiCompatibleProvider::new(
            "openai",
            "https://api.openai.com/v1",
            Some(api_key),
            std::time::Duration::from_secs(60),
        ));
        providers.register(
            ProviderEntry {
                provider_name: "openai".to_string(),
                priority: 0,
                enabled: true,
            },
            client,
        );
        quota.register_provider(
            ProviderConfig {
                provider_name: "openai".to_string(),
                display_name: "OpenAI".to_string(),
                enabled: true,
                default_model: Some("gpt-4o-mini".to_string()),
                priority: 0,
            },
            Quota::new("openai", 50.0, 500.0, chrono::Utc::now()),
        );
        known_providers.push("openai".to_string());
    }

    if std::env::var("SUBTITLER_ENABLE_LOCAL").map(|v| v == "1").unwrap_or(true) {
        let base_url = std::env::var("SUBTITLER_LOCAL_BASE_URL").unwrap_or_else(|_| "http://127.0.0.1:11434".to_string());
        let client: Arc<dyn Provider> = Arc::new(subtitler_core::provider::LocalHostProvider::new(
            base_url,
            std::time::Duration::from_secs(120),
        ));
        providers.register(
            ProviderEntry {
                provider_name: "local".to_string(),
                priority: 10,
                enabled: true,
            },
            client,
        );
        quota.register_provider(
            ProviderConfig {
                provider_name: "local".to_string(),
                display_name: "Local".to_string(),
                enabled: true,
                default_model: None,
                priority: 10,
            },
            Quota::new("local", f64::MAX, f64::MAX, chrono::Utc::now()),
        );
        known_providers.push("local".to_string());
    }

    let providers = Arc::new(providers);

    let engine = Arc::new(TranslationEngine {
        job_store: job_store.clone(),
        event_bus: event_bus.clone(),
        cache: subtitler_core::TranslationCache::new(),
        providers: providers.clone(),
        quota: quota.clone(),
        rules: Vec::new(),
        model_owners: std::collections::HashMap::new(),
        asr: None,
        media_host: None,
        config: EngineConfig {
            translation_batch_size: settings.translation_batch_size,
            translation_max_line_length: settings.translation_max_line_length,
            asr_auto_segment_threshold_ms: settings.asr_auto_segment_threshold_ms(),
            asr_segment_overlap_ms: settings.asr_segment_overlap_ms(),
            output_dir: settings.output_dir.clone(),
            ..EngineConfig::default()
        },
    });

    let state = AppState::new(
        job_store,
        event_bus,
        dispatcher.clone(),
        quota,
        providers,
        engine,
        known_providers,
    );

    for worker_idx in 0..args.workers.max(1) {
        let worker_state = state.clone();
        tokio::spawn(worker::run_worker_loop(worker_state, format!("worker-{worker_idx}")));
    }
    tokio::spawn(worker::run_resume_loop(
        state.clone(),
        settings.resume_interval(),
        settings.provider_sweep_interval(),
    ));

    let app = subtitler_server::build_app(state);

    log::info!("subtitler-server listening on {}", args.bind_addr);
    let listener = tokio::net::TcpListener::bind(&args.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
