//! Unified server error type.
//!
//! Handlers on OpenAI-shaped routes return `Result<T, ServerError>`; the
//! [`axum::response::IntoResponse`] impl renders the OpenAI error envelope
//! with the status code the core taxonomy dictates.  The Ollama and
//! Anthropic dialects own their envelope shapes and wrap the same
//! [`RunnerError`] through their own factories (see `routes/ollama.rs` and
//! `routes/anthropic.rs`).

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use berth_core::RunnerError;
use serde_json::json;
use thiserror::Error;

/// All errors that can occur in the berth-server request lifecycle.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Propagated from the scheduler core.
    #[error(transparent)]
    Runner(#[from] RunnerError),

    /// The caller sent an invalid or malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// An unclassified internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::Runner(e) => e.http_status(),
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// OpenAI error `type` string for this error's status class.
    pub fn openai_type(&self) -> &'static str {
        match self.status() {
            StatusCode::BAD_REQUEST | StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
                "invalid_request_error"
            }
            StatusCode::NOT_FOUND => "not_found_error",
            StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY => "service_unavailable",
            _ => "api_error",
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({
            "error": {
                "message": self.to_string(),
                "type": self.openai_type(),
                "code": status.as_u16(),
            }
        });
        (status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ServerError {
    fn from(e: anyhow::Error) -> Self {
        ServerError::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runner_errors_keep_their_taxonomy_status() {
        let err = ServerError::from(RunnerError::RunnerAlreadyActive);
        assert_eq!(err.status(), StatusCode::CONFLICT);

        let err = ServerError::from(RunnerError::BackendUnavailable {
            backend: "gguf".into(),
            message: "child died".into(),
            stderr_tail: String::new(),
        });
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn openai_type_tracks_status_class() {
        assert_eq!(
            ServerError::BadRequest("x".into()).openai_type(),
            "invalid_request_error"
        );
        assert_eq!(
            ServerError::from(RunnerError::ModelNotFound {
                reference: "m".into()
            })
            .openai_type(),
            "not_found_error"
        );
    }
}
