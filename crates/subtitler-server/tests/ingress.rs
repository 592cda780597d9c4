//! End-to-end exercise of the Ingress API (§6): `CreateJob`, `GetJob`,
//! `ListJobs`, `CancelJob`, `RetryJob`, `StreamJobProgress`, driven against
//! the real `axum::Router` through `tower::ServiceExt::oneshot`, backed by
//! an in-memory job store (no worker loop running, no live providers).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use subtitler_core::dispatcher::Dispatcher;
use subtitler_core::engine::EngineConfig;
use subtitler_core::provider::ProviderRegistry;
use subtitler_core::{EventBus, JobStore, QuotaLedger, TranslationCache, TranslationEngine};
use subtitler_protocol::{Job, JobStatus};
use subtitler_server::state::AppState;
use tower::ServiceExt;

fn test_state() -> AppState {
    let job_store = JobStore::new();
    let event_bus = EventBus::new();
    let providers = Arc::new(ProviderRegistry::new());
    let engine = Arc::new(TranslationEngine {
        job_store: job_store.clone(),
        event_bus: event_bus.clone(),
        cache: TranslationCache::new(),
        providers: providers.clone(),
        quota: Arc::new(QuotaLedger::new(10, Duration::from_secs(60))),
        rules: Vec::new(),
        model_owners: HashMap::new(),
        asr: None,
        media_host: None,
        config: EngineConfig::default(),
    });

    AppState::new(
        job_store,
        event_bus,
        Arc::new(Dispatcher::new()),
        Arc::new(QuotaLedger::new(10, Duration::from_secs(60))),
        providers,
        engine,
        Vec::new(),
    )
}

fn create_job_body() -> Body {
    Body::from(
        serde_json::json!({
            "source_type": "subtitle",
            "source_path": "/media/movie.srt",
            "source_lang": "en",
            "target_langs": ["zh-CN"],
            "model": "local:qwen2.5",
            "writeback_mode": "sidecar",
            "priority": 5,
        })
        .to_string(),
    )
}

async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn full_job_lifecycle_through_the_ingress_api() {
    let app = subtitler_server::build_app(test_state());

    let create_resp = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/jobs")
                .header("content-type", "application/json")
                .body(create_job_body())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(create_resp.status(), StatusCode::CREATED);
    let job: Job = body_json(create_resp).await;
    assert_eq!(job.status, JobStatus::Queued);

    let get_resp = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/jobs/{}", job.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(get_resp.status(), StatusCode::OK);
    let fetched: Job = body_json(get_resp).await;
    assert_eq!(fetched.id, job.id);

    let list_resp = app
        .clone()
        .oneshot(Request::builder().uri("/jobs").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(list_resp.status(), StatusCode::OK);
    let listed: serde_json::Value = body_json(list_resp).await;
    assert_eq!(listed["total"], 1);

    let cancel_resp = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/jobs/{}/cancel", job.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(cancel_resp.status(), StatusCode::OK);
    let cancelled: Job = body_json(cancel_resp).await;
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    let retry_resp = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/jobs/{}/retry", job.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(retry_resp.status(), StatusCode::CREATED);
    let retried: Job = body_json(retry_resp).await;
    assert_ne!(retried.id, job.id);
    assert_eq!(retried.status, JobStatus::Queued);
}

#[tokio::test]
async fn get_unknown_job_is_not_found() {
    let app = subtitler_server::build_app(test_state());
    let resp = app
        .oneshot(
            Request::builder()
                .uri(format!("/jobs/{}", uuid::Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn create_job_rejects_empty_target_langs() {
    let app = subtitler_server::build_app(test_state());
    let body = Body::from(
        serde_json::json!({
            "source_type": "subtitle",
            "source_path": "/media/movie.srt",
            "source_lang": "en",
            "target_langs": [],
            "model": "local:qwen2.5",
        })
        .to_string(),
    );
    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/jobs")
                .header("content-type", "application/json")
                .body(body)
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cancel_is_idempotent_only_while_nonterminal() {
    let app = subtitler_server::build_app(test_state());
    let create_resp = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/jobs")
                .header("content-type", "application/json")
                .body(create_job_body())
                .unwrap(),
        )
        .await
        .unwrap();
    let job: Job = body_json(create_resp).await;

    let first_cancel = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/jobs/{}/cancel", job.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(first_cancel.status(), StatusCode::OK);

    let second_cancel = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/jobs/{}/cancel", job.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(second_cancel.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn providers_health_lists_registered_providers() {
    let app = subtitler_server::build_app(test_state());
    let resp = app
        .oneshot(Request::builder().uri("/providers/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let health: HashMap<String, bool> = body_json(resp).await;
    assert!(health.is_empty());
}
