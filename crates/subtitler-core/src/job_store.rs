//! C1 — durable record of every translation job (§4.1).
//!
//! The reference engine backs this with relational tables; persistence DDL
//! is out of scope here (§1), so this store holds the same row shape and
//! the same compare-and-set transition discipline in memory, behind a
//! `parking_lot::RwLock` so every worker sees a consistent snapshot.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use subtitler_common::{Result, SubtitlerError};
use subtitler_protocol::{Job, JobId, JobInputs, JobStatus, Phase};

/// Filter accepted by `list`; `None` fields match anything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub phase: Option<Phase>,
}

impl JobFilter {
    fn matches(&self, job: &Job) -> bool {
        self.status.map(|s| s == job.status).unwrap_or(true)
            && self.phase.map(|p| p == job.current_phase).unwrap_or(true)
    }
}

/// A page of `list` results plus the total matching count, for cursor-free
/// pagination by callers of the Ingress API.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}

/// A patch applied via `update_status`; only non-`None` fields are written.
#[derive(Debug, Clone, Default)]
pub struct StatusPatch {
    pub status: Option<JobStatus>,
    pub current_phase: Option<Phase>,
    pub progress: Option<f64>,
    pub error: Option<Option<String>>,
    pub result_paths: Option<Vec<String>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
}

/// In-memory Job Store. Cheaply clonable; all clones share the same table.
#[derive(Clone, Default)]
pub struct JobStore {
    inner: std::sync::Arc<RwLock<Inner>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, inputs: JobInputs, now: DateTime<Utc>) -> Job {
        let job = Job::new(uuid::Uuid::new_v4(), inputs, now);
        self.inner.write().jobs.insert(job.id, job.clone());
        job
    }

    pub fn get(&self, id: JobId) -> Option<Job> {
        self.inner.read().jobs.get(&id).cloned()
    }

    pub fn list(&self, filter: &JobFilter, offset: usize, limit: usize) -> Page<Job> {
        let guard = self.inner.read();
        let mut matching: Vec<&Job> = guard.jobs.values().filter(|j| filter.matches(j)).collect();
        matching.sort_by_key(|j| std::cmp::Reverse(j.created_at));
        let total = matching.len();
        let items = matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        Page { items, total }
    }

    /// Compare-and-set on `status`: applies `patch` only if the job's current
    /// status matches `expected_status` (when given), guarding against double
    /// dispatch by two workers racing the same lease (§4.1).
    pub fn update_status(
        &self,
        id: JobId,
        patch: StatusPatch,
        expected_status: Option<JobStatus>,
    ) -> Result<Job> {
        let mut guard = self.inner.write();
        let job = guard
            .jobs
            .get_mut(&id)
            .ok_or_else(|| SubtitlerError::NotFound(format!("job {id}")))?;

        if let Some(expected) = expected_status
            && job.status != expected {
                return Err(SubtitlerError::Internal(format!(
                    "cas failed: job {id} status is {:?}, expected {:?}",
                    job.status, expected
                )));
            }

        if let Some(status) = patch.status {
            job.status = status;
        }
        if let Some(phase) = patch.current_phase {
            job.current_phase = phase;
        }
        if let Some(progress) = patch.progress {
            job.progress = progress;
        }
        if let Some(error) = patch.error {
            job.error = error;
        }
        if let Some(paths) = patch.result_paths {
            job.result_paths = paths;
        }
        if let Some(started_at) = patch.started_at {
            job.started_at = Some(started_at);
        }
        if let Some(finished_at) = patch.finished_at {
            job.finished_at = Some(finished_at);
        }

        job.check_invariants()?;
        Ok(job.clone())
    }

    /// Records that `phase` completed (and, for `mt`, that `lang` finished)
    /// with an optional output path, atomically with the checkpoint write.
    pub fn append_checkpoint(
        &self,
        id: JobId,
        phase: Phase,
        lang: Option<&str>,
        path: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let mut guard = self.inner.write();
        let job = guard
            .jobs
            .get_mut(&id)
            .ok_or_else(|| SubtitlerError::NotFound(format!("job {id}")))?;

        job.checkpoint.completed_phases.insert(phase);
        if let Some(lang) = lang {
            job.checkpoint.completed_target_langs.insert(lang.to_string());
        }
        if phase == Phase::Asr {
            job.checkpoint.asr_output_path = path;
        }
        job.checkpoint.last_checkpoint_at = Some(now);

        job.check_invariants()?;
        Ok(job.clone())
    }

    pub fn pause(
        &self,
        id: JobId,
        reason: impl Into<String>,
        resume_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let mut guard = self.inner.write();
        let job = guard
            .jobs
            .get_mut(&id)
            .ok_or_else(|| SubtitlerError::NotFound(format!("job {id}")))?;

        job.status = JobStatus::Paused;
        job.pause.pause_reason = Some(reason.into());
        job.pause.paused_at = Some(now);
        job.pause.resume_at = Some(resume_at);

        job.check_invariants()?;
        Ok(job.clone())
    }

    /// Claims `id` for `worker_id`, recording the lease on the Job row.
    pub fn lease(&self, id: JobId, worker_id: impl Into<String>) -> Result<Job> {
        let mut guard = self.inner.write();
        let job = guard
            .jobs
            .get_mut(&id)
            .ok_or_else(|| SubtitlerError::NotFound(format!("job {id}")))?;
        job.worker_task_id = Some(worker_id.into());
        Ok(job.clone())
    }

    pub fn clear_lease(&self, id: JobId) -> Result<Job> {
        let mut guard = self.inner.write();
        let job = guard
            .jobs
            .get_mut(&id)
            .ok_or_else(|| SubtitlerError::NotFound(format!("job {id}")))?;
        job.worker_task_id = None;
        Ok(job.clone())
    }

    /// Cancel is allowed from `{queued, running, paused}` (§4.1) — any other
    /// starting status is a no-op error, since the job is already terminal.
    pub fn cancel(&self, id: JobId, now: DateTime<Utc>) -> Result<Job> {
        let mut guard = self.inner.write();
        let job = guard
            .jobs
            .get_mut(&id)
            .ok_or_else(|| SubtitlerError::NotFound(format!("job {id}")))?;

        if !matches!(
            job.status,
            JobStatus::Queued | JobStatus::Running | JobStatus::Paused
        ) {
            return Err(SubtitlerError::BadInput(format!(
                "cannot cancel job {id} in status {:?}",
                job.status
            )));
        }

        job.status = JobStatus::Cancelled;
        job.finished_at = Some(now);
        Ok(job.clone())
    }

    /// Retry only accepts terminal `{failed, cancelled}` (§4.1, §8 scenario 3)
    /// and clones the inputs into a fresh job with an empty checkpoint.
    pub fn retry(&self, id: JobId, now: DateTime<Utc>) -> Result<Job> {
        let mut guard = self.inner.write();
        let source = guard
            .jobs
            .get(&id)
            .ok_or_else(|| SubtitlerError::NotFound(format!("job {id}")))?;

        if !matches!(source.status, JobStatus::Failed | JobStatus::Cancelled) {
            return Err(SubtitlerError::BadInput(format!(
                "cannot retry job {id} in status {:?}",
                source.status
            )));
        }

        let fresh = Job::new(uuid::Uuid::new_v4(), source.inputs.clone(), now);
        guard.jobs.insert(fresh.id, fresh.clone());
        Ok(fresh)
    }

    /// Rows eligible for the resume scheduler (§4.7): paused with an elapsed
    /// `resume_at`.
    pub fn find_resumable(&self, now: DateTime<Utc>) -> Vec<Job> {
        self.inner
            .read()
            .jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Paused
                    && j.pause.resume_at.map(|r| r <= now).unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    pub fn delete_terminal(&self, kinds: &[JobStatus]) -> usize {
        let mut guard = self.inner.write();
        let before = guard.jobs.len();
        guard.jobs.retain(|_, j| !kinds.contains(&j.status));
        before - guard.jobs.len()
    }
}
