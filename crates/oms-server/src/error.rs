//! Server error type and its HTTP mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use oms_core::{ConfigError, StoreError, ValidationError};
use oms_transport::TransportError;
use thiserror::Error;

use crate::api::Envelope;

/// Errors surfaced by the managers and the HTTP layer
#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Cron expression the scheduler cannot parse
    #[error("invalid cron spec {spec:?}: {reason}")]
    CronSpecInvalid { spec: String, reason: String },

    /// Playbook step could not be built or failed to run
    #[error("step error: {0}")]
    Step(String),

    /// External plugin misbehaved
    #[error("plugin error: {0}")]
    Plugin(String),

    /// Upload could not be accepted or streamed
    #[error("upload error: {0}")]
    Upload(String),

    #[error("tunnel error: {0}")]
    Tunnel(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;

impl ServerError {
    /// HTTP status this error is reported with
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServerError::Validation(_)
            | ServerError::CronSpecInvalid { .. }
            | ServerError::BadRequest(_)
            | ServerError::Json(_)
            | ServerError::Store(StoreError::Invalid(_))
            | ServerError::Store(StoreError::Pattern(_))
            | ServerError::Store(StoreError::Conflict(_))
            | ServerError::Transport(TransportError::Auth { .. })
            | ServerError::Transport(TransportError::Key(_)) => StatusCode::BAD_REQUEST,
            ServerError::NotFound(_) | ServerError::Store(StoreError::NotFound { .. }) => {
                StatusCode::NOT_FOUND
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("request failed: {}", self);
        } else {
            tracing::debug!("request rejected: {}", self);
        }
        Envelope::<()>::error(status, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cron = ServerError::CronSpecInvalid {
            spec: "* *".into(),
            reason: "too few fields".into(),
        };
        assert_eq!(cron.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ServerError::Validation(ValidationError::Port(0)).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServerError::Store(StoreError::not_found("host", 7)).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServerError::Transport(TransportError::Closed).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ServerError::Transport(TransportError::Auth {
                methods: "password".into(),
                reason: "denied".into()
            })
            .status_code(),
            StatusCode::BAD_REQUEST
        );
    }
}
