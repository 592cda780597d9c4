//! Layered configuration (env + optional TOML file), the engine's ambient
//! tunables collected in one place so the server binary can load them once
//! at startup.

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use subtitler_common::{Result, SubtitlerError};

fn default_output_dir() -> String {
    "./output".to_string()
}

fn default_batch_size() -> usize {
    10
}

fn default_max_line_length() -> usize {
    42
}

fn default_asr_threshold_secs() -> u64 {
    600
}

fn default_asr_overlap_secs() -> u64 {
    10
}

fn default_quota_cache_ttl_secs() -> u64 {
    60
}

fn default_quota_cache_size() -> usize {
    100
}

fn default_resume_interval_secs() -> u64 {
    3600
}

fn default_provider_sweep_interval_secs() -> u64 {
    7200
}

/// The translation engine's ambient tunables (§4.5, §4.6, §4.7 defaults),
/// layered env-over-file the way the teacher's repo layers its own config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    #[serde(default = "default_batch_size")]
    pub translation_batch_size: usize,
    #[serde(default = "default_max_line_length")]
    pub translation_max_line_length: usize,
    #[serde(default = "default_asr_threshold_secs")]
    pub asr_auto_segment_threshold_secs: u64,
    #[serde(default = "default_asr_overlap_secs")]
    pub asr_segment_overlap_secs: u64,
    #[serde(default = "default_quota_cache_ttl_secs")]
    pub quota_cache_ttl_secs: u64,
    #[serde(default = "default_quota_cache_size")]
    pub quota_cache_size: usize,
    #[serde(default = "default_resume_interval_secs")]
    pub resume_interval_secs: u64,
    #[serde(default = "default_provider_sweep_interval_secs")]
    pub provider_sweep_interval_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            translation_batch_size: default_batch_size(),
            translation_max_line_length: default_max_line_length(),
            asr_auto_segment_threshold_secs: default_asr_threshold_secs(),
            asr_segment_overlap_secs: default_asr_overlap_secs(),
            quota_cache_ttl_secs: default_quota_cache_ttl_secs(),
            quota_cache_size: default_quota_cache_size(),
            resume_interval_secs: default_resume_interval_secs(),
            provider_sweep_interval_secs: default_provider_sweep_interval_secs(),
        }
    }
}

impl EngineSettings {
    /// Loads defaults, then an optional `config.toml` at `path` (if it
    /// exists), then `SUBTITLER_`-prefixed environment variables, each layer
    /// overriding the last.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut figment = Figment::from(figment::providers::Serialized::defaults(EngineSettings::default()));
        if let Some(path) = path
            && std::path::Path::new(path).exists() {
                figment = figment.merge(Toml::file(path));
            }
        figment = figment.merge(Env::prefixed("SUBTITLER_"));
        figment
            .extract()
            .map_err(|e| SubtitlerError::BadInput(format!("invalid configuration: {e}")))
    }

    pub fn asr_auto_segment_threshold_ms(&self) -> u64 {
        self.asr_auto_segment_threshold_secs * 1000
    }

    pub fn asr_segment_overlap_ms(&self) -> u64 {
        self.asr_segment_overlap_secs * 1000
    }

    pub fn quota_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.quota_cache_ttl_secs)
    }

    pub fn resume_interval(&self) -> Duration {
        Duration::from_secs(self.resume_interval_secs)
    }

    pub fn provider_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.provider_sweep_interval_secs)
    }
}
