//! C7 — periodically wakes paused jobs whose quota window has elapsed and
//! re-enqueues them (§4.7), plus the secondary provider reset sweep.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use subtitler_common::SubtitlerError;
use subtitler_protocol::JobStatus;

use crate::dispatcher::{Dispatcher, QueueName};
use crate::job_store::{JobStore, StatusPatch};
use crate::quota::QuotaLedger;

pub struct ResumeScheduler {
    pub job_store: JobStore,
    pub quota: Arc<QuotaLedger>,
    pub dispatcher: Arc<Dispatcher>,
    pub resume_interval: Duration,
    pub provider_sweep_interval: Duration,
}

impl ResumeScheduler {
    /// One sweep of step 1-3 (§4.7): for every paused job whose `resume_at`
    /// has elapsed, re-run the strict check; on success re-dispatch, on
    /// failure push `resume_at` to the next boundary.
    pub fn sweep_resumable(&self, now: DateTime<Utc>) -> Vec<uuid::Uuid> {
        let mut resumed = Vec::new();
        for job in self.job_store.find_resumable(now) {
            let provider = job
                .inputs
                .provider
                .clone()
                .or_else(|| job.inputs.model.split_once(':').map(|(p, _)| p.to_string()));
            let Some(provider) = provider else { continue };

            match self.quota.check_strict(&provider, now) {
                Ok(()) => {
                    let result = self.job_store.update_status(
                        job.id,
                        StatusPatch {
                            status: Some(JobStatus::Queued),
                            ..Default::default()
                        },
                        Some(JobStatus::Paused),
                    );
                    if result.is_ok() {
                        self.dispatcher
                            .queue(QueueName::Translate)
                            .enqueue(job.id, job.inputs.priority);
                        resumed.push(job.id);
                    }
                }
                Err(SubtitlerError::QuotaExceeded { window, .. }) => {
                    if let Some(snapshot) = self.quota.quota_snapshot(&provider) {
                        let next_boundary = match window {
                            subtitler_common::QuotaWindow::Daily => snapshot.daily_reset_at + chrono::Duration::days(1),
                            subtitler_common::QuotaWindow::Monthly => next_month_start(snapshot.monthly_reset_at),
                        };
                        let _ = self.job_store.pause(job.id, format!("{provider}_quota_exceeded"), next_boundary, now);
                    }
                }
                Err(_) => {}
            }
        }
        resumed
    }

    /// Second periodic job (§4.7): forces a reset-logic re-evaluation on
    /// every provider even if no job has checked recently.
    pub fn sweep_provider_resets(&self, providers: &[&str], now: DateTime<Utc>) {
        for provider in providers {
            let _ = self.quota.check_strict(provider, now);
        }
    }
}

fn next_month_start(reset_at: DateTime<Utc>) -> DateTime<Utc> {
    use chrono::Datelike;
    let (year, month) = if reset_at.month() == 12 {
        (reset_at.year() + 1, 1)
    } else {
        (reset_at.year(), reset_at.month() + 1)
    };
    chrono::Utc
        .with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(reset_at + chrono::Duration::days(30))
}

use chrono::TimeZone;
