//! Background worker loop: pulls job ids off the translate queue, leases
//! them, and drives `TranslationEngine::run` to completion.

use std::sync::Arc;

use subtitler_core::dispatcher::QueueName;
use tokio::sync::watch;

use crate::state::AppState;

pub async fn run_worker_loop(state: AppState, worker_id: String) {
    loop {
        let Some((job_id, _permit)) = state.dispatcher.queue(QueueName::Translate).acquire_next().await
        else {
            continue;
        };

        let cancel_rx = state
            .take_cancel_receiver(job_id)
            .unwrap_or_else(|| watch::channel(false).1);

        if state.job_store.lease(job_id, worker_id.clone()).is_err() {
            state.drop_cancel_receiver(job_id);
            continue;
        }

        let engine: Arc<subtitler_core::TranslationEngine> = state.engine.clone();
        let result = engine.run(job_id, &cancel_rx).await;

        let _ = state.job_store.clear_lease(job_id);
        state.drop_cancel_receiver(job_id);
        state.dispatcher.queue(QueueName::Translate).clear_cancel(job_id);

        if let Err(err) = result {
            log::warn!("job {job_id} exited with error: {err}");
        }
    }
}

pub async fn run_resume_loop(state: AppState, resume_interval: std::time::Duration, provider_sweep_interval: std::time::Duration) {
    let scheduler = subtitler_core::ResumeScheduler {
        job_store: state.job_store.clone(),
        quota: state.quota.clone(),
        dispatcher: state.dispatcher.clone(),
        resume_interval,
        provider_sweep_interval,
    };

    let mut resume_tick = tokio::time::interval(scheduler.resume_interval);
    let mut sweep_tick = tokio::time::interval(scheduler.provider_sweep_interval);
    loop {
        tokio::select! {
            _ = resume_tick.tick() => {
                let resumed = scheduler.sweep_resumable(chrono::Utc::now());
                for job_id in resumed {
                    if let Some(job) = state.job_store.get(job_id) {
                        state.event_bus.publish(
                            subtitler_protocol::EventPayload::from_job(&job),
                            chrono::Utc::now(),
                        );
                    }
                }
            }
            _ = sweep_tick.tick() => {
                let providers: Vec<&str> = state.known_providers.iter().map(String::as_str).collect();
                scheduler.sweep_provider_resets(&providers, chrono::Utc::now());
            }
        }
    }
}
