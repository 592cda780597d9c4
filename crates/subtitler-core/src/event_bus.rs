//! C2 — publish/subscribe progress fabric over topic `job:{id}` (§4.2).
//!
//! Delivery is at-most-once; durability comes from the mirrored TaskLog
//! write alongside every publish, not from the channel itself.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use subtitler_protocol::{EventPayload, JobId};
use tokio::sync::broadcast;
use futures::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::Stream;

const CHANNEL_CAPACITY: usize = 256;

/// One append-only row mirroring a published event, keyed by job and
/// insertion order (§3 TaskLog).
#[derive(Debug, Clone)]
pub struct TaskLogRow {
    pub job_id: JobId,
    pub payload: EventPayload,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    topics: HashMap<JobId, broadcast::Sender<EventPayload>>,
    task_log: Vec<TaskLogRow>,
}

/// In-process event bus. A real deployment backs this with a pub/sub broker
/// (Redis, NATS, ...); the broker is out of scope (§6) so this bus implements
/// the same publish/subscribe/synthesize-initial-state contract in-process.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: std::sync::Arc<RwLock<Inner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, payload: EventPayload, now: DateTime<Utc>) {
        let mut guard = self.inner.write();
        let sender = guard
            .topics
            .entry(payload.job_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();
        // No active subscribers is not an error: the TaskLog mirror still
        // durably records the event for late subscribers to backfill from.
        let _ = sender.send(payload.clone());
        guard.task_log.push(TaskLogRow {
            job_id: payload.job_id,
            payload,
            recorded_at: now,
        });
    }

    /// Subscribes to `job_id`, seeding the stream with `initial` (the Job
    /// row synthesized into an event) so a late subscriber never sees an
    /// empty stream for an existing job (§4.2).
    pub fn subscribe(
        &self,
        job_id: JobId,
        initial: Option<EventPayload>,
    ) -> impl Stream<Item = EventPayload> + Send + 'static + use<> {
        let receiver = {
            let mut guard = self.inner.write();
            guard
                .topics
                .entry(job_id)
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe()
        };

        let live = BroadcastStream::new(receiver).filter_map(|item| async move { item.ok() });
        futures::stream::iter(initial).chain(live)
    }

    pub fn task_log_for(&self, job_id: JobId) -> Vec<TaskLogRow> {
        self.inner
            .read()
            .task_log
            .iter()
            .filter(|row| row.job_id == job_id)
            .cloned()
            .collect()
    }
}
