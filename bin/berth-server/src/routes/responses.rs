//! OpenAI Responses dialect (`/responses`).
//!
//! Adapts the Responses shape onto chat completions: `instructions` +
//! `input` become messages, the chat result becomes a `response` object.
//! Streaming emits `response.output_text.delta` events followed by
//! `response.completed`.

use std::sync::{Arc, Mutex};

use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use berth_core::{GuardedBody, Mode};
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::ServerError;
use crate::schemas::openai::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage};
use crate::schemas::responses::{
    OutputMessage, OutputText, ResponseObject, ResponseUsage, ResponsesRequest,
};
use crate::state::AppState;
use crate::stream::{FrameSource, Framing, SSE_DONE, sse_data, sse_event_frame};

/// `POST /responses` (also under `/v1` and `/engines`).
pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServerError> {
    if body.len() > crate::routes::openai::MAX_BODY_BYTES {
        return Err(ServerError::BadRequest("request body too large".into()));
    }
    let req: ResponsesRequest = serde_json::from_slice(&body)
        .map_err(|e| ServerError::BadRequest(format!("invalid request: {e}")))?;

    let stream = req.stream;
    let model = req.model.clone();
    let payload = chat_payload(req)?;
    let mut body = serde_json::to_value(&payload)
        .map_err(|e| ServerError::Internal(e.to_string()))?;
    body["stream"] = Value::Bool(stream);

    let ticket = state
        .scheduler
        .dispatch(None, &model, Mode::Completion)
        .await?;
    let upstream = crate::routes::openai::upstream_request(
        "/v1/chat/completions",
        &headers,
        Bytes::from(body.to_string()),
    )?;
    let resp = ticket.forward(upstream).await?;

    if stream {
        if !resp.status().is_success() {
            collect_json::<Value>(resp).await?;
            return Err(ServerError::Internal("engine rejected the request".into()));
        }
        Ok((
            [(http::header::CONTENT_TYPE, "text/event-stream")],
            translate_stream(resp.into_body(), model),
        )
            .into_response())
    } else {
        let chat: ChatCompletionResponse = collect_json(resp).await?;
        Ok(Json(response_object(&chat, &model)).into_response())
    }
}

/// Build the chat payload from a Responses request.
fn chat_payload(req: ResponsesRequest) -> Result<ChatCompletionRequest, ServerError> {
    let mut messages = Vec::new();
    if let Some(instructions) = req.instructions {
        messages.push(ChatMessage::text("system", instructions));
    }
    match req.input {
        Value::String(text) => messages.push(ChatMessage::text("user", text)),
        Value::Array(items) => {
            for item in items {
                let role = item
                    .get("role")
                    .and_then(Value::as_str)
                    .unwrap_or("user")
                    .to_owned();
                let content = item.get("content").cloned().unwrap_or(Value::Null);
                messages.push(ChatMessage {
                    role,
                    content: Some(normalize_content(content)),
                    tool_calls: None,
                });
            }
        }
        other => {
            return Err(ServerError::BadRequest(format!(
                "unsupported input type: {}",
                type_name(&other)
            )));
        }
    }

    let mut payload = ChatCompletionRequest::new(req.model, messages);
    payload.max_tokens = req.max_output_tokens;
    payload.temperature = req.temperature;
    payload.top_p = req.top_p;
    Ok(payload)
}

/// Responses input parts use `input_text`; chat wants plain text or
/// `text` parts.  Flatten the common case.
fn normalize_content(content: Value) -> Value {
    match content {
        Value::Array(parts) => {
            let mut texts = Vec::with_capacity(parts.len());
            let mut all_text = true;
            for part in &parts {
                let kind = part.get("type").and_then(Value::as_str);
                let text = part.get("text").and_then(Value::as_str);
                match (kind, text) {
                    (Some("input_text"), Some(text)) => texts.push(text.to_owned()),
                    _ => {
                        all_text = false;
                        break;
                    }
                }
            }
            if all_text {
                Value::String(texts.concat())
            } else {
                Value::Array(parts)
            }
        }
        other => other,
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Map a completed chat response onto a `response` object.
fn response_object(chat: &ChatCompletionResponse, model: &str) -> ResponseObject {
    let text = chat
        .choices
        .first()
        .and_then(|c| c.message.content_text())
        .unwrap_or_default()
        .to_owned();
    ResponseObject {
        id: format!("resp_{}", Uuid::new_v4().simple()),
        object: "response".into(),
        created_at: Utc::now().timestamp(),
        status: "completed".into(),
        model: model.to_owned(),
        output: vec![OutputMessage {
            kind: "message".into(),
            role: "assistant".into(),
            content: vec![OutputText {
                kind: "output_text".into(),
                text,
            }],
        }],
        usage: chat.usage.as_ref().map(|u| ResponseUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }),
    }
}

/// Reframe the chat SSE stream into Responses events.
fn translate_stream(body: GuardedBody, model: String) -> Body {
    let accumulated = Arc::new(Mutex::new(Some(String::new())));
    let frames = FrameSource::new(body.into_data_stream(), Framing::Sse);

    let events = frames.filter_map(move |frame| {
        let out = match frame {
            Ok(frame) => sse_data(&frame)
                .and_then(|data| event_for_data(&data, &model, &accumulated))
                .map(Ok),
            Err(e) => Some(Err(axum::Error::new(e))),
        };
        futures::future::ready(out)
    });
    Body::from_stream(events)
}

/// Translate one chat SSE payload into a Responses event frame.
fn event_for_data(
    data: &str,
    model: &str,
    accumulated: &Mutex<Option<String>>,
) -> Option<Bytes> {
    if data == SSE_DONE {
        let text = accumulated.lock().expect("accumulator poisoned").take()?;
        let completed = json!({
            "type": "response.completed",
            "response": {
                "id": format!("resp_{}", Uuid::new_v4().simple()),
                "object": "response",
                "status": "completed",
                "model": model,
                "output": [{
                    "type": "message",
                    "role": "assistant",
                    "content": [{ "type": "output_text", "text": text }],
                }],
            },
        });
        return Some(sse_event_frame("response.completed", &completed.to_string()));
    }

    let chunk: ChatCompletionChunk = serde_json::from_str(data).ok()?;
    let delta = chunk.choices.first()?.delta.content.clone()?;
    if delta.is_empty() {
        return None;
    }
    if let Some(acc) = accumulated.lock().expect("accumulator poisoned").as_mut() {
        acc.push_str(&delta);
    }
    let event = json!({ "type": "response.output_text.delta", "delta": delta });
    Some(sse_event_frame(
        "response.output_text.delta",
        &event.to_string(),
    ))
}

async fn collect_json<T: serde::de::DeserializeOwned>(
    resp: http::Response<GuardedBody>,
) -> Result<T, ServerError> {
    let status = resp.status();
    let bytes = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| ServerError::Internal(e.to_string()))?
        .to_bytes();
    if !status.is_success() {
        return Err(ServerError::Runner(berth_core::RunnerError::BackendUnavailable {
            backend: "engine".into(),
            message: String::from_utf8_lossy(&bytes).into_owned(),
            stderr_tail: String::new(),
        }));
    }
    serde_json::from_slice(&bytes)
        .map_err(|e| ServerError::Internal(format!("engine returned invalid JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(json: Value) -> ResponsesRequest {
        serde_json::from_value(json).expect("responses request")
    }

    #[test]
    fn string_input_becomes_a_user_message() {
        let payload = chat_payload(request(json!({
            "model": "ai/smollm2",
            "input": "hello",
            "instructions": "be brief",
        })))
        .expect("payload");
        assert_eq!(payload.messages.len(), 2);
        assert_eq!(payload.messages[0].role, "system");
        assert_eq!(payload.messages[1].role, "user");
        assert_eq!(payload.messages[1].content_text(), Some("hello"));
    }

    #[test]
    fn item_list_input_flattens_input_text_parts() {
        let payload = chat_payload(request(json!({
            "model": "m",
            "input": [
                {"role": "user", "content": [
                    {"type": "input_text", "text": "part one, "},
                    {"type": "input_text", "text": "part two"},
                ]},
            ],
        })))
        .expect("payload");
        assert_eq!(
            payload.messages[0].content_text(),
            Some("part one, part two")
        );
    }

    #[test]
    fn numeric_input_is_rejected() {
        let err = chat_payload(request(json!({"model": "m", "input": 42}))).unwrap_err();
        assert!(err.to_string().contains("number"));
    }

    #[test]
    fn sampling_fields_carry_over() {
        let payload = chat_payload(request(json!({
            "model": "m",
            "input": "x",
            "max_output_tokens": 64,
            "temperature": 0.1,
        })))
        .expect("payload");
        assert_eq!(payload.max_tokens, Some(64));
        assert_eq!(payload.temperature, Some(0.1));
    }

    #[test]
    fn stream_deltas_accumulate_into_the_completed_event() {
        let accumulated = Mutex::new(Some(String::new()));
        let chunk = json!({
            "choices": [{"index": 0, "delta": {"content": "hi "}}],
        })
        .to_string();
        let frame = event_for_data(&chunk, "m", &accumulated).expect("delta frame");
        let text = String::from_utf8(frame.to_vec()).expect("utf8");
        assert!(text.starts_with("event: response.output_text.delta\n"));

        let chunk2 = json!({
            "choices": [{"index": 0, "delta": {"content": "there"}}],
        })
        .to_string();
        event_for_data(&chunk2, "m", &accumulated).expect("second delta");

        let done = event_for_data(SSE_DONE, "m", &accumulated).expect("completed frame");
        let text = String::from_utf8(done.to_vec()).expect("utf8");
        assert!(text.contains("response.completed"));
        assert!(text.contains("hi there"));

        // A duplicate [DONE] produces nothing.
        assert!(event_for_data(SSE_DONE, "m", &accumulated).is_none());
    }
}
