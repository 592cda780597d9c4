//! C3 — routes jobs to one of three named queues with independent worker
//! pools and per-queue concurrency caps, priority, and timeouts (§4.3).
//! Grounded on the teacher's worker-pool shape (a bounded channel drained
//! by N spawned tasks) generalized from one queue to three.

use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;
use subtitler_protocol::JobId;
use tokio::sync::{watch, Semaphore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    Scan,
    Asr,
    Translate,
}

impl QueueName {
    pub fn default_cap(self) -> usize {
        match self {
            QueueName::Scan => 2,
            QueueName::Asr => 2,
            QueueName::Translate => 5,
        }
    }

    pub fn default_timeout(self) -> Duration {
        match self {
            QueueName::Scan => Duration::from_secs(300),
            QueueName::Translate => Duration::from_secs(1800),
            QueueName::Asr => Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
struct QueuedItem {
    priority: u8,
    seq: u64,
    job_id: JobId,
}

impl Ord for QueuedItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Higher priority first; ties broken FIFO (lower seq first) — §4.3.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A single named queue: a priority-ordered backlog plus a semaphore
/// bounding how many jobs run concurrently from it.
pub struct Queue {
    name: QueueName,
    cap: Arc<Semaphore>,
    timeout: Duration,
    backlog: parking_lot::Mutex<BinaryHeap<QueuedItem>>,
    next_seq: std::sync::atomic::AtomicU64,
    cancels: parking_lot::Mutex<std::collections::HashMap<JobId, watch::Sender<bool>>>,
    notify: Arc<tokio::sync::Notify>,
}

impl Queue {
    pub fn new(name: QueueName, cap: usize, timeout: Duration) -> Self {
        Self {
            name,
            cap: Arc::new(Semaphore::new(cap)),
            timeout,
            backlog: parking_lot::Mutex::new(BinaryHeap::new()),
            next_seq: std::sync::atomic::AtomicU64::new(0),
            cancels: parking_lot::Mutex::new(std::collections::HashMap::new()),
            notify: Arc::new(tokio::sync::Notify::new()),
        }
    }

    pub fn name(&self) -> QueueName {
        self.name
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn enqueue(&self, job_id: JobId, priority: u8) -> watch::Receiver<bool> {
        let seq = self.next_seq.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.backlog.lock().push(QueuedItem { priority, seq, job_id });
        let (tx, rx) = watch::channel(false);
        self.cancels.lock().insert(job_id, tx);
        self.notify.notify_one();
        rx
    }

    /// Signals cancellation for `job_id` if it is queued or running here.
    pub fn cancel(&self, job_id: JobId) -> bool {
        if let Some(tx) = self.cancels.lock().get(&job_id) {
            let _ = tx.send(true);
            return true;
        }
        false
    }

    /// Waits for capacity, then pops the highest-priority queued job. The
    /// returned permit must be held for the lifetime of the job's execution.
    pub async fn acquire_next(&self) -> Option<(JobId, tokio::sync::OwnedSemaphorePermit)> {
        loop {
            {
                let mut backlog = self.backlog.lock();
                if let Some(item) = backlog.peek().cloned()
                    && let Ok(permit) = Arc::clone(&self.cap).try_acquire_owned() {
                        backlog.pop();
                        return Some((item.job_id, permit));
                    }
            }
            self.notify.notified().await;
        }
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.lock().len()
    }

    pub fn clear_cancel(&self, job_id: JobId) {
        self.cancels.lock().remove(&job_id);
    }
}

/// The three named queues (§4.3 table), each independently capped.
pub struct Dispatcher {
    pub scan: Queue,
    pub asr: Queue,
    pub translate: Queue,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            scan: Queue::new(QueueName::Scan, QueueName::Scan.default_cap(), QueueName::Scan.default_timeout()),
            asr: Queue::new(QueueName::Asr, QueueName::Asr.default_cap(), QueueName::Asr.default_timeout()),
            translate: Queue::new(
                QueueName::Translate,
                QueueName::Translate.default_cap(),
                QueueName::Translate.default_timeout(),
            ),
        }
    }

    pub fn queue(&self, name: QueueName) -> &Queue {
        match name {
            QueueName::Scan => &self.scan,
            QueueName::Asr => &self.asr,
            QueueName::Translate => &self.translate,
        }
    }

    pub fn cancel(&self, job_id: JobId) -> bool {
        self.scan.cancel(job_id) || self.asr.cancel(job_id) || self.translate.cancel(job_id)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs `task` against the queue's timeout; on expiry returns a `timeout`
/// error per §4.3 ("exceeding them fails the job with error `timeout`").
pub async fn run_with_timeout<F, T>(queue: &Queue, task: F) -> subtitler_common::Result<T>
where
    F: std::future::Future<Output = subtitler_common::Result<T>>,
{
    match tokio::time::timeout(queue.timeout(), task).await {
        Ok(result) => result,
        Err(_) => Err(subtitler_common::SubtitlerError::Timeout(format!(
            "{:?} queue timeout after {:?}",
            queue.name(),
            queue.timeout()
        ))),
    }
}
