use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use subtitler_core::{Dispatcher, EventBus, JobStore, ProviderRegistry, QuotaLedger, TranslationEngine};
use subtitler_protocol::JobId;
use tokio::sync::watch;

/// Everything the ingress routes and the background worker loop share,
/// mirroring the teacher's `AppState` shape (state grouped behind one
/// `Clone` handle passed to axum via `with_state`).
#[derive(Clone)]
pub struct AppState {
    pub job_store: JobStore,
    pub event_bus: EventBus,
    pub dispatcher: Arc<Dispatcher>,
    pub quota: Arc<QuotaLedger>,
    pub providers: Arc<ProviderRegistry>,
    pub engine: Arc<TranslationEngine>,
    pub known_providers: Vec<String>,
    cancels: Arc<Mutex<HashMap<JobId, watch::Receiver<bool>>>>,
}

impl AppState {
    pub fn new(
        job_store: JobStore,
        event_bus: EventBus,
        dispatcher: Arc<Dispatcher>,
        quota: Arc<QuotaLedger>,
        providers: Arc<ProviderRegistry>,
        engine: Arc<TranslationEngine>,
        known_providers: Vec<String>,
    ) -> Self {
        Self {
            job_store,
            event_bus,
            dispatcher,
            quota,
            providers,
            engine,
            known_providers,
            cancels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store_cancel_receiver(&self, job_id: JobId, rx: watch::Receiver<bool>) {
        self.cancels.lock().insert(job_id, rx);
    }

    pub fn take_cancel_receiver(&self, job_id: JobId) -> Option<watch::Receiver<bool>> {
        self.cancels.lock().get(&job_id).cloned()
    }

    pub fn drop_cancel_receiver(&self, job_id: JobId) {
        self.cancels.lock().remove(&job_id);
    }
}
