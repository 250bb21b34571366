//! Scheduler error taxonomy.
//!
//! Every error that crosses the core boundary is a [`RunnerError`].  The
//! mapping to HTTP status codes is table-driven via [`RunnerError::http_status`];
//! dialect translators own the envelope shape, the core owns the kind.

use http::StatusCode;
use thiserror::Error;

/// Errors surfaced by the scheduler core to the HTTP layer.
#[derive(Debug, Clone, Error)]
pub enum RunnerError {
    /// Malformed body, missing `model`, oversize body.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// The model reference is not present in the store.
    #[error("model not found: {reference}")]
    ModelNotFound { reference: String },

    /// Unknown backend path segment.
    #[error("backend not found: {name}")]
    BackendNotFound { name: String },

    /// Backend present but refused (e.g. platform not supported).
    #[error("backend '{backend}' unavailable on this platform: {reason}")]
    PreconditionFailed { backend: String, reason: String },

    /// `configure` raced an already-active runner.
    #[error("runner already active for this configuration")]
    RunnerAlreadyActive,

    /// Admission failure: the model does not fit in remaining memory.
    #[error("insufficient resources: {message}")]
    InsufficientResources { message: String },

    /// Installer not started, or the gate wait was cancelled.
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String },

    /// The backend's one-shot install reached a terminal failure.
    #[error("backend '{backend}' install failed: {message}")]
    BackendInstallFailed { backend: String, message: String },

    /// The engine child died mid-request.  `stderr_tail` carries the last
    /// ~1 KiB of child output and is the only place raw child stderr may
    /// reach a caller.
    #[error("backend '{backend}' unavailable: {message}")]
    BackendUnavailable {
        backend: String,
        message: String,
        stderr_tail: String,
    },

    /// Anything else.
    #[error("internal error: {message}")]
    InternalError { message: String },
}

impl RunnerError {
    /// HTTP status for this error kind.
    pub fn http_status(&self) -> StatusCode {
        match self {
            RunnerError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            RunnerError::ModelNotFound { .. } => StatusCode::NOT_FOUND,
            RunnerError::BackendNotFound { .. } => StatusCode::NOT_FOUND,
            RunnerError::PreconditionFailed { .. } => StatusCode::PRECONDITION_FAILED,
            RunnerError::RunnerAlreadyActive => StatusCode::CONFLICT,
            RunnerError::InsufficientResources { .. } => StatusCode::SERVICE_UNAVAILABLE,
            RunnerError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            RunnerError::BackendInstallFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
            RunnerError::BackendUnavailable { .. } => StatusCode::BAD_GATEWAY,
            RunnerError::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Shorthand for an [`RunnerError::InvalidRequest`].
    pub fn invalid(message: impl Into<String>) -> Self {
        RunnerError::InvalidRequest {
            message: message.into(),
        }
    }

    /// Shorthand for an [`RunnerError::InternalError`].
    pub fn internal(message: impl Into<String>) -> Self {
        RunnerError::InternalError {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for RunnerError {
    fn from(e: std::io::Error) -> Self {
        RunnerError::InternalError {
            message: e.to_string(),
        }
    }
}
