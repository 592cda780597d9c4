//! Job data model (§3) and event-bus wire payload (§4.2), shared between
//! the engine (`subtitler-core`) and the ingress server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use subtitler_common::{Result, SubtitlerError};
use uuid::Uuid;

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Subtitle,
    Audio,
    Media,
    HostItem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritebackMode {
    Upload,
    Sidecar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Paused,
    Success,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Pull,
    Asr,
    Mt,
    Post,
    Writeback,
    Done,
}

/// Case-sensitive `{provider}:{model}` identifier, parsed per §4.4.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
    pub provider: Option<String>,
    pub model: String,
}

impl ModelRef {
    pub fn parse(raw: &str) -> Self {
        match raw.split_once(':') {
            Some((provider, model)) => Self {
                provider: Some(provider.to_string()),
                model: model.to_string(),
            },
            None => Self {
                provider: None,
                model: raw.to_string(),
            },
        }
    }
}

/// The producer-supplied inputs for a new job (§3, §6 `CreateJob`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInputs {
    pub source_type: SourceType,
    pub source_path: Option<String>,
    #[serde(default = "default_source_lang")]
    pub source_lang: String,
    pub target_langs: Vec<String>,
    pub model: String,
    pub provider: Option<String>,
    #[serde(default = "default_writeback_mode")]
    pub writeback_mode: WritebackMode,
    #[serde(default = "default_priority")]
    pub priority: u8,
}

fn default_source_lang() -> String {
    "auto".to_string()
}

fn default_writeback_mode() -> WritebackMode {
    WritebackMode::Sidecar
}

fn default_priority() -> u8 {
    5
}

impl JobInputs {
    /// `CreateJob` rejects empty `target_langs` and ill-formed models (§6); `priority`
    /// outside `[1,10]` is clamped rather than rejected (§8 boundary behavior).
    pub fn validate_and_clamp(mut self, known_providers: &[&str]) -> Result<Self> {
        if self.target_langs.is_empty() {
            return Err(SubtitlerError::BadInput(
                "target_langs must not be empty".to_string(),
            ));
        }
        if self.target_langs.iter().any(|l| l.trim().is_empty()) {
            return Err(SubtitlerError::BadInput(
                "target_langs must not contain empty language tags".to_string(),
            ));
        }

        let model_ref = ModelRef::parse(&self.model);
        if model_ref.model.trim().is_empty() {
            return Err(SubtitlerError::BadInput(format!(
                "ill-formed model identifier: {}",
                self.model
            )));
        }
        if let Some(provider) = &model_ref.provider
            && !known_providers.is_empty() && !known_providers.contains(&provider.as_str()) {
                return Err(SubtitlerError::BadInput(format!(
                    "unknown provider in model identifier: {provider}"
                )));
            }

        self.priority = self.priority.clamp(1, 10);
        Ok(self)
    }
}

/// The minimal durable checkpoint (§3 Checkpoint, GLOSSARY).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    pub asr_output_path: Option<String>,
    pub completed_phases: HashSet<Phase>,
    pub completed_target_langs: HashSet<String>,
    pub last_checkpoint_at: Option<DateTime<Utc>>,
}

/// Pause metadata (§3 Pause).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PauseInfo {
    pub pause_reason: Option<String>,
    pub paused_at: Option<DateTime<Utc>>,
    pub resume_at: Option<DateTime<Utc>>,
}

/// A translation job (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub inputs: JobInputs,
    pub status: JobStatus,
    pub current_phase: Phase,
    pub progress: f64,
    pub error: Option<String>,
    pub checkpoint: Checkpoint,
    pub pause: PauseInfo,
    pub result_paths: Vec<String>,
    pub metrics: HashMap<String, f64>,
    pub worker_task_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: JobId, inputs: JobInputs, now: DateTime<Utc>) -> Self {
        Self {
            id,
            inputs,
            status: JobStatus::Queued,
            current_phase: Phase::Init,
            progress: 0.0,
            error: None,
            checkpoint: Checkpoint::default(),
            pause: PauseInfo::default(),
            result_paths: Vec::new(),
            metrics: HashMap::new(),
            worker_task_id: None,
            created_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    /// Checks the data-model invariants from §3 hold for the current state.
    pub fn check_invariants(&self) -> Result<()> {
        if self.status == JobStatus::Running && self.started_at.is_none() {
            return Err(SubtitlerError::Internal(
                "running job missing started_at".to_string(),
            ));
        }
        if self.status.is_terminal() && self.finished_at.is_none() {
            return Err(SubtitlerError::Internal(
                "terminal job missing finished_at".to_string(),
            ));
        }
        if self.status == JobStatus::Paused
            && (self.pause.resume_at.is_none() || self.pause.pause_reason.is_none())
        {
            return Err(SubtitlerError::Internal(
                "paused job missing resume_at/pause_reason".to_string(),
            ));
        }
        if !self
            .checkpoint
            .completed_target_langs
            .iter()
            .all(|l| self.inputs.target_langs.contains(l))
        {
            return Err(SubtitlerError::Internal(
                "completed_target_langs not a subset of target_langs".to_string(),
            ));
        }
        Ok(())
    }
}

/// §4.2 event-bus payload, topic `job:{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPayload {
    pub job_id: JobId,
    pub phase: Phase,
    pub status: JobStatus,
    pub progress: f64,
    pub completed: Option<u64>,
    pub total: Option<u64>,
    pub error: Option<String>,
}

impl EventPayload {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            phase: job.current_phase,
            status: job.status,
            progress: job.progress,
            completed: None,
            total: None,
            error: job.error.clone(),
        }
    }
}
