//! Anthropic Messages dialect (`/anthropic/v1/*`).
//!
//! The GGUF engine accepts the Messages format natively, so this
//! translator does no payload rewriting: it validates the body (10 MiB
//! cap, non-empty `model`, model present locally), stamps the origin
//! header, and forwards.  Streaming SSE passes straight through.  Only the
//! error envelope is dialect-specific.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use berth_core::Mode;
use bytes::Bytes;
use http::StatusCode;
use serde_json::{Value, json};

use crate::error::ServerError;
use crate::routes::openai::{MAX_BODY_BYTES, into_axum, upstream_request};
use crate::state::AppState;

/// Header marking requests forwarded from the Anthropic surface.
pub const ORIGIN_HEADER: &str = "x-request-origin";
pub const ORIGIN_VALUE: &str = "anthropic";

/// Anthropic's error envelope: `{type:"error", error:{type, message}}`.
pub struct AnthropicError(ServerError);

impl From<ServerError> for AnthropicError {
    fn from(e: ServerError) -> Self {
        AnthropicError(e)
    }
}

impl From<berth_core::RunnerError> for AnthropicError {
    fn from(e: berth_core::RunnerError) -> Self {
        AnthropicError(ServerError::Runner(e))
    }
}

impl IntoResponse for AnthropicError {
    fn into_response(self) -> Response {
        let status = self.0.status();
        let kind = match status {
            StatusCode::BAD_REQUEST
            | StatusCode::CONFLICT
            | StatusCode::PRECONDITION_FAILED => "invalid_request_error",
            StatusCode::NOT_FOUND => "not_found_error",
            StatusCode::SERVICE_UNAVAILABLE => "overloaded_error",
            _ => "api_error",
        };
        let body = json!({
            "type": "error",
            "error": { "type": kind, "message": self.0.to_string() },
        });
        (status, axum::Json(body)).into_response()
    }
}

/// `POST /anthropic/v1/messages`.
pub async fn messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AnthropicError> {
    forward(state, headers, body, "/v1/messages").await
}

/// `POST /anthropic/v1/messages/count_tokens`.
pub async fn count_tokens(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AnthropicError> {
    forward(state, headers, body, "/v1/messages/count_tokens").await
}

async fn forward(
    state: AppState,
    headers: HeaderMap,
    body: Bytes,
    upstream_path: &str,
) -> Result<Response, AnthropicError> {
    let model = validate(&state, &body).await?;

    let ticket = state
        .scheduler
        .dispatch(None, &model, Mode::Completion)
        .await?;
    let mut upstream = upstream_request(upstream_path, &headers, body)?;
    upstream.headers_mut().insert(
        http::HeaderName::from_static(ORIGIN_HEADER),
        http::HeaderValue::from_static(ORIGIN_VALUE),
    );
    let resp = ticket.forward(upstream).await?;
    Ok(into_axum(resp))
}

/// Validate the Messages body and return the model reference.
async fn validate(state: &AppState, body: &Bytes) -> Result<String, AnthropicError> {
    if body.len() > MAX_BODY_BYTES {
        return Err(ServerError::BadRequest(format!(
            "request body exceeds {MAX_BODY_BYTES} bytes"
        ))
        .into());
    }
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| ServerError::BadRequest(format!("invalid JSON body: {e}")))?;
    let model = value
        .get("model")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| ServerError::BadRequest("missing model".into()))?;

    // The model must already be local; this surface never pulls.
    state.scheduler.store().get_local(model).await?;
    Ok(model.to_owned())
}
