//! The Ingress API (§6): `CreateJob`, `GetJob`, `ListJobs`, `CancelJob`,
//! `RetryJob`, `StreamJobProgress`, `DownloadResult`. HTTP shape is our
//! own choice (the spec leaves it out of scope) but the semantics below
//! — rejections, terminal-only retry, never-empty progress stream — follow
//! §6 exactly.

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::{http::StatusCode, Json};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use subtitler_core::{dispatcher::QueueName, JobFilter};
use subtitler_protocol::{EventPayload, Job, JobId, JobInputs, JobStatus};

use crate::state::AppState;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorBody { error: message.into() })).into_response()
}

fn status_for_error(err: &subtitler_common::SubtitlerError) -> StatusCode {
    use subtitler_common::SubtitlerError::*;
    match err {
        BadInput(_) => StatusCode::BAD_REQUEST,
        NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub async fn create_job(State(state): State<AppState>, Json(inputs): Json<JobInputs>) -> Response {
    let known: Vec<&str> = state.known_providers.iter().map(String::as_str).collect();
    let inputs = match inputs.validate_and_clamp(&known) {
        Ok(inputs) => inputs,
        Err(err) => return error_response(status_for_error(&err), err.to_string()),
    };

    let job = state.job_store.create(inputs, chrono::Utc::now());
    let rx = state
        .dispatcher
        .queue(QueueName::Translate)
        .enqueue(job.id, job.inputs.priority);
    state.store_cancel_receiver(job.id, rx);

    (StatusCode::CREATED, Json(job)).into_response()
}

pub async fn get_job(State(state): State<AppState>, Path(id): Path<JobId>) -> Response {
    match state.job_store.get(id) {
        Some(job) => Json(job).into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("job {id} not found")),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub offset: usize,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub items: Vec<Job>,
    pub total: usize,
}

pub async fn list_jobs(State(state): State<AppState>, Query(query): Query<ListQuery>) -> Response {
    let filter = JobFilter {
        status: query.status,
        phase: None,
    };
    let page = state
        .job_store
        .list(&filter, query.offset, query.limit.unwrap_or(50));
    Json(ListResponse {
        items: page.items,
        total: page.total,
    })
    .into_response()
}

pub async fn cancel_job(State(state): State<AppState>, Path(id): Path<JobId>) -> Response {
    state.dispatcher.cancel(id);
    match state.job_store.cancel(id, chrono::Utc::now()) {
        Ok(job) => {
            state.event_bus.publish(EventPayload::from_job(&job), chrono::Utc::now());
            state.drop_cancel_receiver(id);
            Json(job).into_response()
        }
        Err(err) => error_response(status_for_error(&err), err.to_string()),
    }
}

pub async fn retry_job(State(state): State<AppState>, Path(id): Path<JobId>) -> Response {
    match state.job_store.retry(id, chrono::Utc::now()) {
        Ok(job) => {
            let rx = state
                .dispatcher
                .queue(QueueName::Translate)
                .enqueue(job.id, job.inputs.priority);
            state.store_cancel_receiver(job.id, rx);
            (StatusCode::CREATED, Json(job)).into_response()
        }
        Err(err) => error_response(status_for_error(&err), err.to_string()),
    }
}

pub async fn stream_job_progress(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, Infallible>>>, Response> {
    let job = state
        .job_store
        .get(id)
        .ok_or_else(|| error_response(StatusCode::NOT_FOUND, format!("job {id} not found")))?;

    let initial = EventPayload::from_job(&job);
    let stream = state.event_bus.subscribe(id, Some(initial));

    let events = stream.map(|payload: EventPayload| {
        Ok(Event::default().json_data(payload).unwrap_or_else(|_| Event::default()))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Deserialize)]
pub struct DownloadPath {
    pub id: JobId,
    pub index: usize,
}

pub async fn providers_health(State(state): State<AppState>) -> Response {
    Json(state.providers.health_check_all().await).into_response()
}

pub async fn download_result(State(state): State<AppState>, Path(params): Path<DownloadPath>) -> Response {
    let job = match state.job_store.get(params.id) {
        Some(job) => job,
        None => return error_response(StatusCode::NOT_FOUND, format!("job {} not found", params.id)),
    };

    let Some(path) = job.result_paths.get(params.index) else {
        return error_response(StatusCode::NOT_FOUND, "result index out of range");
    };

    match std::fs::read(path) {
        Ok(bytes) => {
            let filename = std::path::Path::new(path)
                .file_name()
                .and_then(|f| f.to_str())
                .unwrap_or("result")
                .to_string();
            (
                StatusCode::OK,
                [("content-disposition", format!("attachment; filename=\"{filename}\""))],
                bytes,
            )
                .into_response()
        }
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}
