//! Error types for the sync server.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use edgesync_engine::SyncError;
use edgesync_protocol::ProtocolError;
use serde::Serialize;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request format.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Webhook signature or timestamp rejected.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// No such run.
    #[error("not found: {0}")]
    NotFound(String),

    /// A store or the run queue cannot take the request.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidRequest(_)
                | ServerError::AuthenticationFailed(_)
                | ServerError::NotFound(_)
        )
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }

    /// HTTP status the error is reported with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::AuthenticationFailed(_) => StatusCode::UNAUTHORIZED,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::Internal(_) | ServerError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<SyncError> for ServerError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Validation(_) | SyncError::Protocol(_) | SyncError::Json(_) => {
                ServerError::InvalidRequest(err.to_string())
            }
            SyncError::Authentication(_) => ServerError::AuthenticationFailed(err.to_string()),
            SyncError::RunNotFound(_) => ServerError::NotFound(err.to_string()),
            SyncError::QueueClosed => ServerError::Unavailable(err.to_string()),
            ref e if e.is_unavailable() => ServerError::Unavailable(err.to_string()),
            _ => ServerError::Internal(err.to_string()),
        }
    }
}

impl From<ProtocolError> for ServerError {
    fn from(err: ProtocolError) -> Self {
        ServerError::InvalidRequest(err.to_string())
    }
}

impl From<JsonRejection> for ServerError {
    fn from(rejection: JsonRejection) -> Self {
        ServerError::InvalidRequest(rejection.body_text())
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if self.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn error_classification() {
        assert!(ServerError::InvalidRequest("bad".into()).is_client_error());
        assert!(ServerError::Internal("oops".into()).is_server_error());
        assert!(!ServerError::InvalidRequest("bad".into()).is_server_error());
        assert!(ServerError::Unavailable("replica".into()).is_server_error());
    }

    #[test]
    fn sync_errors_map_to_statuses() {
        let status = |e: SyncError| ServerError::from(e).status_code();
        assert_eq!(
            status(SyncError::Validation("interval".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(SyncError::RunNotFound(Uuid::new_v4())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status(SyncError::connectivity_retryable("replica", "reset")),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status(SyncError::QueueClosed), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status(SyncError::Fatal("both down".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn unknown_direction_is_a_bad_request() {
        let err = ServerError::from(ProtocolError::UnknownDirection("sideways".into()));
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(err.to_string().contains("sideways"));
    }
}
