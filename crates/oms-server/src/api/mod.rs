//! HTTP surface under `/api/v1`
//!
//! Every JSON response is wrapped in an [`Envelope`]. Errors come back
//! through [`ServerError`]'s `IntoResponse`, which uses the same shape.

mod exec;
mod jobs;
mod playbooks;
mod tunnels;
mod upload;
mod ws;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::error::ServerError;
use crate::state::AppState;

pub use upload::{parse_x_files, X_FILES};
pub use ws::WsMessage;

/// `{code, msg, data}` response body
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub code: u16,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            code: StatusCode::OK.as_u16(),
            msg: "success".to_string(),
            data: Some(data),
        }
    }

    pub fn error(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            code: status.as_u16(),
            msg: msg.into(),
            data: None,
        }
    }
}

impl<T: Serialize> IntoResponse for Envelope<T> {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

pub type ApiResult<T> = Result<Envelope<T>, ServerError>;

/// Build the router
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/run", post(exec::run))
        .route("/player/run", post(exec::player_run))
        .route("/host/:id/status", get(exec::host_status))
        .route("/host/:id/stats", get(exec::host_stats))
        .route("/command/history", get(exec::search_history))
        .route("/job", get(jobs::list).post(jobs::create))
        .route("/job/instances", delete(jobs::clear_instances))
        .route("/job/:id", get(jobs::get).put(jobs::update).delete(jobs::remove))
        .route("/job/:id/start", post(jobs::start))
        .route("/job/:id/stop", post(jobs::stop))
        .route("/job/:id/log", get(jobs::log))
        .route("/job/:id/instances", get(jobs::instances))
        .route("/tunnel", get(tunnels::list).post(tunnels::create))
        .route("/tunnel/:id", get(tunnels::get).delete(tunnels::remove))
        .route("/playbook", get(playbooks::list).post(playbooks::create))
        .route(
            "/playbook/:id",
            get(playbooks::get).put(playbooks::update).delete(playbooks::remove),
        )
        .route("/steps", get(playbooks::steps))
        .route(
            "/cache/upload",
            post(playbooks::cache_upload).layer(DefaultBodyLimit::disable()),
        )
        .route("/upload", post(upload::upload).layer(DefaultBodyLimit::disable()))
        .route("/ws", get(ws::handler));

    Router::new().nest("/api/v1", api).with_state(state)
}
