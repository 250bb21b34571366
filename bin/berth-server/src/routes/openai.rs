//! OpenAI-native routes: pass-through dispatch.
//!
//! Bodies are forwarded to the engine untouched; only `model` is read for
//! routing.  Responses stream straight through the per-slot reverse proxy,
//! so `stream: true` SSE reaches the client frame-timely.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use berth_core::{GuardedBody, Mode};
use bytes::Bytes;
use chrono::Utc;
use http::Request;
use http_body_util::Full;
use serde_json::Value;

use crate::error::ServerError;
use crate::schemas::openai::{ModelInfo, ModelListResponse};
use crate::state::AppState;

/// Request-body cap shared by all dialects.
pub const MAX_BODY_BYTES: usize = 10 << 20;

/// `POST /engines/v1/chat/completions` (and the `/v1` alias).
pub async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServerError> {
    proxy(state, None, "/v1/chat/completions", Mode::Completion, headers, body).await
}

/// `POST /engines/{backend}/v1/chat/completions`.
pub async fn chat_for(
    State(state): State<AppState>,
    Path(backend): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServerError> {
    proxy(
        state,
        Some(backend),
        "/v1/chat/completions",
        Mode::Completion,
        headers,
        body,
    )
    .await
}

/// `POST /engines/v1/completions`.
pub async fn completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServerError> {
    proxy(state, None, "/v1/completions", Mode::Completion, headers, body).await
}

/// `POST /engines/{backend}/v1/completions`.
pub async fn completions_for(
    State(state): State<AppState>,
    Path(backend): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServerError> {
    proxy(
        state,
        Some(backend),
        "/v1/completions",
        Mode::Completion,
        headers,
        body,
    )
    .await
}

/// `POST /engines/v1/embeddings`.
pub async fn embeddings(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServerError> {
    proxy(state, None, "/v1/embeddings", Mode::Embedding, headers, body).await
}

/// `POST /engines/{backend}/v1/embeddings`.
pub async fn embeddings_for(
    State(state): State<AppState>,
    Path(backend): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServerError> {
    proxy(
        state,
        Some(backend),
        "/v1/embeddings",
        Mode::Embedding,
        headers,
        body,
    )
    .await
}

/// `POST /engines/rerank` (and the root alias).
pub async fn rerank(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServerError> {
    proxy(state, None, "/rerank", Mode::Reranking, headers, body).await
}

/// `POST /engines/{backend}/rerank`.
pub async fn rerank_for(
    State(state): State<AppState>,
    Path(backend): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServerError> {
    proxy(state, Some(backend), "/rerank", Mode::Reranking, headers, body).await
}

/// `POST /engines/score` (and the root alias).
pub async fn score(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServerError> {
    proxy(state, None, "/score", Mode::Reranking, headers, body).await
}

/// `POST /engines/{backend}/score`.
pub async fn score_for(
    State(state): State<AppState>,
    Path(backend): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServerError> {
    proxy(state, Some(backend), "/score", Mode::Reranking, headers, body).await
}

// ── Model listing (delegated to the store, OpenAI shape) ─────────────────────

/// `GET /engines/{backend?}/v1/models` and the `/v1/models` alias.
pub async fn list_models(
    State(state): State<AppState>,
) -> Result<axum::Json<ModelListResponse>, ServerError> {
    let models = state.scheduler.store().list().await?;
    Ok(axum::Json(ModelListResponse {
        object: "list".into(),
        data: models
            .into_iter()
            .map(|m| ModelInfo {
                id: m.reference,
                object: "model".into(),
                created: Utc::now().timestamp(),
                owned_by: "library".into(),
            })
            .collect(),
    }))
}

/// `GET /v1/models/{name}`.
pub async fn show_model(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<axum::Json<ModelInfo>, ServerError> {
    let handle = state.scheduler.store().get_local(&name).await?;
    Ok(axum::Json(ModelInfo {
        id: handle.reference,
        object: "model".into(),
        created: Utc::now().timestamp(),
        owned_by: "library".into(),
    }))
}

/// `GET /engines/{backend}/v1/models/{name}`.
pub async fn show_model_for(
    State(state): State<AppState>,
    Path((_backend, name)): Path<(String, String)>,
) -> Result<axum::Json<ModelInfo>, ServerError> {
    show_model(State(state), Path(name)).await
}

// ── Shared dispatch helpers ──────────────────────────────────────────────────

/// Validate the body, extract `model`, dispatch and reverse-proxy.
pub(crate) async fn proxy(
    state: AppState,
    backend: Option<String>,
    upstream_path: &str,
    mode: Mode,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServerError> {
    let model = extract_model(&body)?;
    let ticket = state
        .scheduler
        .dispatch(backend.as_deref(), &model, mode)
        .await?;
    let upstream = upstream_request(upstream_path, &headers, body)?;
    let resp = ticket.forward(upstream).await?;
    Ok(into_axum(resp))
}

/// Extract a non-empty `model` from a JSON body, enforcing the size cap.
pub(crate) fn extract_model(body: &Bytes) -> Result<String, ServerError> {
    if body.len() > MAX_BODY_BYTES {
        return Err(ServerError::Runner(berth_core::RunnerError::invalid(
            format!("request body exceeds {} bytes", MAX_BODY_BYTES),
        )));
    }
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| ServerError::BadRequest(format!("invalid JSON body: {e}")))?;
    value
        .get("model")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| ServerError::BadRequest("missing model".into()))
}

/// Build the upstream request: POST, origin-form path, pass-through of the
/// content-negotiation headers, buffered JSON body.
pub(crate) fn upstream_request(
    path: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Request<Full<Bytes>>, ServerError> {
    let mut builder = Request::builder().method(http::Method::POST).uri(path);
    for name in [
        http::header::CONTENT_TYPE,
        http::header::ACCEPT,
        http::header::AUTHORIZATION,
    ] {
        if let Some(value) = headers.get(&name) {
            builder = builder.header(name, value);
        }
    }
    builder
        .body(Full::new(body))
        .map_err(|e| ServerError::Internal(e.to_string()))
}

/// Convert a proxied response into an Axum response without buffering.
pub(crate) fn into_axum(resp: http::Response<GuardedBody>) -> Response {
    resp.map(Body::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::{build, test_support};
    use http::{Request as HttpRequest, StatusCode};
    use tower::ServiceExt;

    #[test]
    fn extract_model_requires_a_nonempty_string() {
        let ok = extract_model(&Bytes::from_static(b"{\"model\":\"ai/smollm2\"}")).expect("model");
        assert_eq!(ok, "ai/smollm2");

        assert!(extract_model(&Bytes::from_static(b"{}")).is_err());
        assert!(extract_model(&Bytes::from_static(b"{\"model\":\"\"}")).is_err());
        assert!(extract_model(&Bytes::from_static(b"not json")).is_err());
    }

    #[test]
    fn extract_model_enforces_the_body_cap() {
        let huge = format!(
            "{{\"model\":\"m\",\"pad\":\"{}\"}}",
            "x".repeat(MAX_BODY_BYTES + 1)
        );
        let err = extract_model(&Bytes::from(huge)).unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_model_is_rejected_with_openai_envelope() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let app = build(test_support::empty_state(tmp.path()));
        let resp = app
            .oneshot(
                HttpRequest::post("/v1/chat/completions")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from("{\"messages\":[]}"))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.expect("body");
        let v: Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(v["error"]["type"], "invalid_request_error");
        assert!(v["error"]["message"].as_str().expect("msg").contains("model"));
    }

    #[tokio::test]
    async fn unknown_backend_segment_is_404() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let app = build(test_support::empty_state(tmp.path()));
        let resp = app
            .oneshot(
                HttpRequest::post("/engines/tensorrt/v1/chat/completions")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from("{\"model\":\"ai/x\",\"messages\":[]}"))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
