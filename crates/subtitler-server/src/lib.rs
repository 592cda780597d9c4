//! The Ingress API (§6) as a reusable axum `Router`, split out of the
//! binary so it can be driven directly by integration tests without
//! binding a real socket.

pub mod routes;
pub mod state;
pub mod worker;

use axum::routing::{get, post};
use axum::Router;

use state::AppState;

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/jobs", post(routes::create_job).get(routes::list_jobs))
        .route("/jobs/:id", get(routes::get_job))
        .route("/jobs/:id/cancel", post(routes::cancel_job))
        .route("/jobs/:id/retry", post(routes::retry_job))
        .route("/jobs/:id/events", get(routes::stream_job_progress))
        .route("/jobs/:id/results/:index", get(routes::download_result))
        .route("/providers/health", get(routes::providers_health))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
