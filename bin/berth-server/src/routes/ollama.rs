//! Ollama dialect (`/api/*`).
//!
//! `/api/chat` and `/api/generate` are rewritten into the OpenAI chat
//! shape, dispatched, and the engine's SSE stream is reframed into
//! Ollama's line-delimited JSON with `done` flags.  Tool calls convert
//! between Ollama's object-typed `arguments` and OpenAI's string-typed
//! ones in both directions.  `keep_alive: "0"` is an eviction request.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use berth_core::{GuardedBody, Mode, RunnerConfig, RunnerError, SlotState};
use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use futures::StreamExt;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tracing::warn;

use crate::error::ServerError;
use crate::schemas::ollama::{
    ChatRequest, ChatResponse, GenerateRequest, GenerateResponse, Message, ModelRequest, Options,
    PsModel, PsResponse, PullRequest, PullStatus, TagModel, TagsResponse, ToolCall,
    ToolCallFunction, VersionResponse,
};
use crate::schemas::openai::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage,
    ToolCall as OpenAiToolCall, ToolFunction,
};
use crate::state::AppState;
use crate::stream::{FrameSource, Framing, SSE_DONE, ndjson_frame, sse_data};

// ── Error envelope ────────────────────────────────────────────────────────────

/// Ollama's error shape: `{"error":"…"}` on a single line.
pub struct OllamaError(ServerError);

impl From<ServerError> for OllamaError {
    fn from(e: ServerError) -> Self {
        OllamaError(e)
    }
}

impl From<RunnerError> for OllamaError {
    fn from(e: RunnerError) -> Self {
        OllamaError(ServerError::Runner(e))
    }
}

impl IntoResponse for OllamaError {
    fn into_response(self) -> Response {
        let status = self.0.status();
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

// ── Version / model management ────────────────────────────────────────────────

/// `GET /api/version`.
pub async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION").to_owned(),
    })
}

/// `GET /api/tags` – local models.
pub async fn tags(State(state): State<AppState>) -> Result<Json<TagsResponse>, OllamaError> {
    let models = state.scheduler.store().list().await?;
    Ok(Json(TagsResponse {
        models: models
            .into_iter()
            .map(|m| TagModel {
                name: m.reference.clone(),
                model: m.reference,
                size: m.size_bytes,
                digest: m.id,
            })
            .collect(),
    }))
}

/// `GET /api/ps` – running models.
pub async fn ps(State(state): State<AppState>) -> Json<PsResponse> {
    let models = state
        .scheduler
        .ps()
        .into_iter()
        .filter(|slot| slot.state == SlotState::Ready)
        .filter_map(|slot| {
            let reference = slot.model_ref?;
            Some(PsModel {
                name: reference.clone(),
                model: reference,
                size: 0,
                digest: slot.model_id.unwrap_or_default(),
            })
        })
        .collect();
    Json(PsResponse { models })
}

/// `POST /api/show`.
pub async fn show(
    State(state): State<AppState>,
    Json(req): Json<ModelRequest>,
) -> Result<Json<Value>, OllamaError> {
    let handle = state.scheduler.store().get_local(&req.model).await?;
    Ok(Json(json!({
        "details": {
            "format": handle.format.to_string(),
            "family": handle.hints.architecture,
            "quantization_level": handle.hints.quantization,
        },
        "model_info": {
            "general.size": handle.size_bytes,
        },
    })))
}

/// `DELETE /api/delete`.
pub async fn delete(
    State(state): State<AppState>,
    Json(req): Json<ModelRequest>,
) -> Result<Json<Value>, OllamaError> {
    state.scheduler.store().delete(&req.model).await?;
    Ok(Json(json!({})))
}

/// `POST /api/pull` – pull progress reframed into Ollama's
/// `{status,digest,total,completed}` lines.
pub async fn pull(
    State(state): State<AppState>,
    Json(req): Json<PullRequest>,
) -> Result<Response, OllamaError> {
    let progress = state.scheduler.store().pull(&req.model).await?;

    if req.stream == Some(false) {
        let mut last = PullStatus {
            status: "success".into(),
            digest: None,
            total: None,
            completed: None,
        };
        let mut progress = progress;
        while let Some(event) = progress.next().await {
            last = pull_status(event?);
        }
        return Ok(Json(last).into_response());
    }

    let lines = progress.map(|event| match event {
        Ok(event) => {
            let status = pull_status(event);
            Ok::<Bytes, axum::Error>(ndjson_frame(
                &serde_json::to_value(&status).unwrap_or_else(|_| json!({})),
            ))
        }
        Err(e) => Ok(ndjson_frame(&json!({ "error": e.to_string() }))),
    });
    Ok(ndjson_response(Body::from_stream(lines)))
}

fn pull_status(event: berth_core::store::PullProgress) -> PullStatus {
    let status = if event.message.is_empty() {
        event.kind
    } else {
        event.message
    };
    match event.layer {
        Some(layer) => PullStatus {
            status,
            digest: Some(layer.id),
            total: Some(layer.size),
            completed: Some(layer.current),
        },
        None => PullStatus {
            status,
            digest: None,
            total: Some(event.total),
            completed: Some(event.pulled),
        },
    }
}

// ── Chat / generate ───────────────────────────────────────────────────────────

/// `POST /api/chat`.
pub async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, OllamaError> {
    let req: ChatRequest = parse_body(&body)?;

    // `keep_alive: 0` with no messages is an eviction request.
    if req.messages.is_empty() && keep_alive_is_zero(req.keep_alive.as_ref()) {
        state.scheduler.unload(&[req.model.clone()]).await?;
        return Ok(Json(json!({})).into_response());
    }

    configure_num_ctx(&state, &req.model, req.options.as_ref()).await;

    let stream = req.stream.unwrap_or(true);
    let model = req.model.clone();
    let payload = chat_payload(req);
    let upstream = dispatch_chat(&state, &model, &payload, stream, &headers).await?;

    if stream {
        if !upstream.status().is_success() {
            // Surfaces the engine's error body in the Ollama envelope.
            collect_json::<Value>(upstream).await?;
            return Err(ServerError::Internal("engine rejected the request".into()).into());
        }
        Ok(ndjson_response(translate_chat_stream(
            upstream.into_body(),
            model,
        )))
    } else {
        let resp: ChatCompletionResponse = collect_json(upstream).await?;
        Ok(Json(chat_from_openai(&resp, &model)).into_response())
    }
}

/// `POST /api/generate`.
pub async fn generate(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, OllamaError> {
    let req: GenerateRequest = parse_body(&body)?;

    if req.prompt.is_empty() && keep_alive_is_zero(req.keep_alive.as_ref()) {
        state.scheduler.unload(&[req.model.clone()]).await?;
        return Ok(Json(json!({})).into_response());
    }

    configure_num_ctx(&state, &req.model, req.options.as_ref()).await;

    let stream = req.stream.unwrap_or(true);
    let model = req.model.clone();
    let payload = generate_payload(req);
    let upstream = dispatch_chat(&state, &model, &payload, stream, &headers).await?;

    if stream {
        if !upstream.status().is_success() {
            collect_json::<Value>(upstream).await?;
            return Err(ServerError::Internal("engine rejected the request".into()).into());
        }
        Ok(ndjson_response(translate_generate_stream(
            upstream.into_body(),
            model,
        )))
    } else {
        let resp: ChatCompletionResponse = collect_json(upstream).await?;
        let content = resp
            .choices
            .first()
            .and_then(|c| c.message.content_text())
            .unwrap_or_default()
            .to_owned();
        Ok(Json(GenerateResponse {
            model,
            created_at: now_stamp(),
            response: content,
            done: true,
            done_reason: resp.choices.first().and_then(|c| c.finish_reason.clone()),
        })
        .into_response())
    }
}

// ── Translation ──────────────────────────────────────────────────────────────

/// Build the OpenAI chat payload from an Ollama chat request.
fn chat_payload(req: ChatRequest) -> ChatCompletionRequest {
    let messages = req.messages.into_iter().map(to_openai_message).collect();
    let mut payload = ChatCompletionRequest::new(req.model, messages);
    payload.tools = req.tools;
    apply_options(&mut payload, req.options);
    payload
}

/// Build the OpenAI chat payload from an Ollama generate request.
fn generate_payload(req: GenerateRequest) -> ChatCompletionRequest {
    let mut messages = Vec::new();
    if let Some(system) = req.system {
        messages.push(ChatMessage::text("system", system));
    }
    messages.push(ChatMessage::text("user", req.prompt));
    let mut payload = ChatCompletionRequest::new(req.model, messages);
    apply_options(&mut payload, req.options);
    payload
}

fn to_openai_message(msg: Message) -> ChatMessage {
    let content = match &msg.images {
        Some(images) if !images.is_empty() => {
            let mut parts = vec![json!({ "type": "text", "text": msg.content })];
            for image in images {
                parts.push(json!({
                    "type": "image_url",
                    "image_url": { "url": format!("data:image/jpeg;base64,{image}") },
                }));
            }
            Some(Value::Array(parts))
        }
        _ => Some(Value::String(msg.content)),
    };
    ChatMessage {
        role: msg.role,
        content,
        tool_calls: msg.tool_calls.map(|calls| {
            calls
                .into_iter()
                .map(|c| OpenAiToolCall {
                    id: None,
                    kind: "function".into(),
                    function: ToolFunction {
                        name: c.function.name,
                        // Object-typed arguments become a JSON string.
                        arguments: c.function.arguments.to_string(),
                    },
                })
                .collect()
        }),
    }
}

fn to_ollama_tool_calls(calls: &[OpenAiToolCall]) -> Vec<ToolCall> {
    calls
        .iter()
        .map(|c| ToolCall {
            function: ToolCallFunction {
                name: c.function.name.clone(),
                // String-typed arguments become an object again; anything
                // unparseable is preserved as a string.
                arguments: serde_json::from_str(&c.function.arguments)
                    .unwrap_or(Value::String(c.function.arguments.clone())),
            },
        })
        .collect()
}

fn apply_options(payload: &mut ChatCompletionRequest, options: Option<Options>) {
    let Some(options) = options else { return };
    payload.temperature = options.temperature;
    payload.top_p = options.top_p;
    payload.max_tokens = options.num_predict;
    payload.stop = options.stop;
    payload.seed = options.seed;
    payload.presence_penalty = options.presence_penalty;
    payload.frequency_penalty = options.frequency_penalty;
    // num_ctx is handled out of band via the scheduler configuration.
}

/// Map a completed OpenAI response onto the Ollama chat shape.
fn chat_from_openai(resp: &ChatCompletionResponse, model: &str) -> ChatResponse {
    let choice = resp.choices.first();
    ChatResponse {
        model: model.to_owned(),
        created_at: now_stamp(),
        message: Message {
            role: "assistant".into(),
            content: choice
                .and_then(|c| c.message.content_text())
                .unwrap_or_default()
                .to_owned(),
            images: None,
            tool_calls: choice
                .and_then(|c| c.message.tool_calls.as_deref())
                .map(to_ollama_tool_calls),
        },
        done: true,
        done_reason: choice.and_then(|c| c.finish_reason.clone()),
        eval_count: resp.usage.as_ref().map(|u| u.completion_tokens),
        prompt_eval_count: resp.usage.as_ref().map(|u| u.prompt_tokens),
    }
}

/// Translate one OpenAI SSE payload into an Ollama chat NDJSON line.
/// Returns `None` for frames with nothing to forward.
fn chat_line_for_data(data: &str, model: &str, sent_done: &AtomicBool) -> Option<Bytes> {
    if data == SSE_DONE {
        if sent_done.swap(true, Ordering::SeqCst) {
            return None;
        }
        return Some(done_chat_line(model, Some("stop".to_owned())));
    }
    let chunk: ChatCompletionChunk = serde_json::from_str(data).ok()?;
    let choice = chunk.choices.first()?;
    if let Some(reason) = &choice.finish_reason {
        sent_done.store(true, Ordering::SeqCst);
        return Some(done_chat_line(model, Some(reason.clone())));
    }
    let message = Message {
        role: choice.delta.role.clone().unwrap_or_else(|| "assistant".into()),
        content: choice.delta.content.clone().unwrap_or_default(),
        images: None,
        tool_calls: choice.delta.tool_calls.as_deref().map(to_ollama_tool_calls),
    };
    let line = ChatResponse {
        model: model.to_owned(),
        created_at: now_stamp(),
        message,
        done: false,
        done_reason: None,
        eval_count: None,
        prompt_eval_count: None,
    };
    Some(ndjson_frame(&serde_json::to_value(&line).ok()?))
}

fn done_chat_line(model: &str, reason: Option<String>) -> Bytes {
    let line = ChatResponse {
        model: model.to_owned(),
        created_at: now_stamp(),
        message: Message {
            role: "assistant".into(),
            content: String::new(),
            images: None,
            tool_calls: None,
        },
        done: true,
        done_reason: reason,
        eval_count: None,
        prompt_eval_count: None,
    };
    ndjson_frame(&serde_json::to_value(&line).unwrap_or_else(|_| json!({"done": true})))
}

/// Reframe the engine's SSE stream into Ollama chat NDJSON.
fn translate_chat_stream(body: GuardedBody, model: String) -> Body {
    let sent_done = Arc::new(AtomicBool::new(false));
    let frames = FrameSource::new(body.into_data_stream(), Framing::Sse);

    let done_flag = Arc::clone(&sent_done);
    let lines = frames.filter_map(move |frame| {
        let out = match frame {
            Ok(frame) => sse_data(&frame)
                .and_then(|data| chat_line_for_data(&data, &model, &done_flag))
                .map(Ok),
            Err(e) => Some(Err(axum::Error::new(e))),
        };
        futures::future::ready(out)
    });

    Body::from_stream(lines)
}

/// Reframe the engine's SSE stream into Ollama generate NDJSON.
fn translate_generate_stream(body: GuardedBody, model: String) -> Body {
    let sent_done = Arc::new(AtomicBool::new(false));
    let frames = FrameSource::new(body.into_data_stream(), Framing::Sse);

    let lines = frames.filter_map(move |frame| {
        let out = match frame {
            Ok(frame) => sse_data(&frame)
                .and_then(|data| generate_line_for_data(&data, &model, &sent_done))
                .map(Ok),
            Err(e) => Some(Err(axum::Error::new(e))),
        };
        futures::future::ready(out)
    });

    Body::from_stream(lines)
}

fn generate_line_for_data(data: &str, model: &str, sent_done: &AtomicBool) -> Option<Bytes> {
    let line = |response: String, done: bool, done_reason: Option<String>| {
        let value = serde_json::to_value(GenerateResponse {
            model: model.to_owned(),
            created_at: now_stamp(),
            response,
            done,
            done_reason,
        })
        .ok()?;
        Some(ndjson_frame(&value))
    };

    if data == SSE_DONE {
        if sent_done.swap(true, Ordering::SeqCst) {
            return None;
        }
        return line(String::new(), true, Some("stop".to_owned()));
    }
    let chunk: ChatCompletionChunk = serde_json::from_str(data).ok()?;
    let choice = chunk.choices.first()?;
    if let Some(reason) = &choice.finish_reason {
        sent_done.store(true, Ordering::SeqCst);
        return line(String::new(), true, Some(reason.clone()));
    }
    line(choice.delta.content.clone().unwrap_or_default(), false, None)
}

// ── Shared plumbing ──────────────────────────────────────────────────────────

fn parse_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, OllamaError> {
    if body.len() > crate::routes::openai::MAX_BODY_BYTES {
        return Err(ServerError::Runner(RunnerError::invalid("request body too large")).into());
    }
    serde_json::from_slice(body)
        .map_err(|e| ServerError::BadRequest(format!("invalid request: {e}")).into())
}

/// `keep_alive` values requesting immediate eviction.
fn keep_alive_is_zero(value: Option<&Value>) -> bool {
    match value {
        Some(Value::String(s)) => matches!(s.as_str(), "0" | "0s" | "0m"),
        Some(Value::Number(n)) => n.as_f64() == Some(0.0),
        _ => false,
    }
}

/// Route `num_ctx` to the per-runner configuration.  A runner that is
/// already active keeps its context size; the hint is dropped with a
/// warning.
async fn configure_num_ctx(state: &AppState, model: &str, options: Option<&Options>) {
    let Some(num_ctx) = options.and_then(|o| o.num_ctx) else {
        return;
    };
    let config = RunnerConfig {
        context_size: Some(num_ctx),
        ..RunnerConfig::default()
    };
    match state
        .scheduler
        .configure(None, model, Mode::Completion, config)
        .await
    {
        Ok(()) => {}
        Err(RunnerError::RunnerAlreadyActive) => {
            warn!(
                model = %berth_core::sanitize::sanitize_for_log(model),
                num_ctx,
                "num_ctx ignored: runner already active with its own context size"
            );
        }
        Err(e) => {
            warn!(
                model = %berth_core::sanitize::sanitize_for_log(model),
                error = %e,
                "num_ctx hint could not be recorded"
            );
        }
    }
}

/// Dispatch an OpenAI chat payload built by a translator.
async fn dispatch_chat(
    state: &AppState,
    model: &str,
    payload: &ChatCompletionRequest,
    stream: bool,
    headers: &HeaderMap,
) -> Result<http::Response<GuardedBody>, OllamaError> {
    let mut body = serde_json::to_value(payload)
        .map_err(|e| ServerError::Internal(e.to_string()))?;
    body["stream"] = Value::Bool(stream);
    let bytes = Bytes::from(body.to_string());

    let ticket = state
        .scheduler
        .dispatch(None, model, Mode::Completion)
        .await?;
    let upstream =
        crate::routes::openai::upstream_request("/v1/chat/completions", headers, bytes)?;
    Ok(ticket.forward(upstream).await?)
}

/// Collect a non-streaming upstream response, surfacing engine errors in
/// the Ollama envelope.
async fn collect_json<T: serde::de::DeserializeOwned>(
    resp: http::Response<GuardedBody>,
) -> Result<T, OllamaError> {
    let status = resp.status();
    let bytes = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| ServerError::Internal(e.to_string()))?
        .to_bytes();
    if !status.is_success() {
        let message = String::from_utf8_lossy(&bytes).into_owned();
        return Err(ServerError::Runner(RunnerError::BackendUnavailable {
            backend: "engine".into(),
            message,
            stderr_tail: String::new(),
        })
        .into());
    }
    serde_json::from_slice(&bytes)
        .map_err(|e| ServerError::Internal(format!("engine returned invalid JSON: {e}")).into())
}

fn ndjson_response(body: Body) -> Response {
    (
        [(http::header::CONTENT_TYPE, "application/x-ndjson")],
        body,
    )
        .into_response()
}

fn now_stamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
