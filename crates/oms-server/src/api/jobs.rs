//! Job CRUD, lifecycle, run history and log tailing

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use oms_core::models::{Job, NewJob, Page, PageData, TaskInstance};
use serde::{Deserialize, Serialize};

use super::{ApiResult, Envelope};
use crate::error::ServerError;
use crate::scheduler::tail;
use crate::state::AppState;

pub async fn list(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Job>> {
    Ok(Envelope::ok(state.scheduler.list_jobs()?))
}

pub async fn create(State(state): State<Arc<AppState>>, Json(new): Json<NewJob>) -> ApiResult<Job> {
    Ok(Envelope::ok(state.scheduler.create_job(&new)?))
}

pub async fn get(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResult<Job> {
    Ok(Envelope::ok(state.scheduler.get_job(id)?))
}

pub async fn update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(new): Json<NewJob>,
) -> ApiResult<Job> {
    Ok(Envelope::ok(state.scheduler.update_job(id, &new)?))
}

pub async fn remove(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResult<()> {
    state.scheduler.remove_job(id).await?;
    Ok(Envelope::ok(()))
}

pub async fn start(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResult<Job> {
    Ok(Envelope::ok(state.scheduler.start_job(id)?))
}

pub async fn stop(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResult<()> {
    state.scheduler.stop_job(id)?;
    Ok(Envelope::ok(()))
}

/// Chunked plain-text tail of the job's log
pub async fn log(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Result<Response, ServerError> {
    let job = state.scheduler.get_job(id)?;
    let path = state.scheduler.log_path(&job);
    let stream = match tail::follow(path, tail::POLL_INTERVAL).await {
        Ok(stream) => stream,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ServerError::NotFound(format!("log of job {id}")));
        }
        Err(e) => return Err(e.into()),
    };
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(stream),
    )
        .into_response())
}

pub async fn instances(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(page): Query<Page>,
) -> ApiResult<PageData<TaskInstance>> {
    state.scheduler.get_job(id)?;
    Ok(Envelope::ok(state.scheduler.list_instances(Some(id), page)?))
}

#[derive(Debug, Deserialize)]
pub struct ClearQuery {
    #[serde(default)]
    pub job_id: Option<i64>,
    /// Defaults to now minus the configured retention
    #[serde(default)]
    pub before: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct Cleared {
    pub removed: usize,
}

pub async fn clear_instances(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ClearQuery>,
) -> ApiResult<Cleared> {
    let removed = state.scheduler.clear_instances(q.before, q.job_id)?;
    Ok(Envelope::ok(Cleared { removed }))
}
