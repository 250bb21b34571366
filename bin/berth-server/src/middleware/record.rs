//! Request/response recording middleware.
//!
//! Buffers each request body (inference bodies are JSON and already capped
//! at 10 MiB by the dialect handlers), extracts the model reference for the
//! record, and wraps the response body with a counting pass-through so that
//! streamed responses are measured without being buffered.  The completed
//! record lands in the recorder ring when the response body finishes — or
//! when the client goes away and the body is dropped.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::extract::Request;
use axum::http::Response;
use axum::response::IntoResponse;
use berth_core::recorder::{Recorder, RequestRecord};
use bytes::Bytes;
use futures::future::BoxFuture;
use std::sync::Arc;
use tower::{Layer, Service};
use uuid::Uuid;

use crate::error::ServerError;

/// Request headers worth keeping in a record.
const HEADER_ALLOWLIST: &[&str] = &["content-type", "accept", "user-agent"];

/// Paths that would only record themselves.
const SKIPPED_PATHS: &[&str] = &["/engines/requests", "/metrics", "/"];

/// Upper bound on buffered request bodies; dialect handlers enforce their
/// own caps below this.
const MAX_REQUEST_BYTES: usize = 16 << 20;

/// [`tower::Layer`] that records request/response pairs into the ring.
#[derive(Clone)]
pub struct RecordLayer {
    recorder: Arc<Recorder>,
}

impl RecordLayer {
    pub fn new(recorder: Arc<Recorder>) -> Self {
        Self { recorder }
    }
}

impl<S> Layer<S> for RecordLayer {
    type Service = RecordMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RecordMiddleware {
            inner,
            recorder: Arc::clone(&self.recorder),
        }
    }
}

/// The middleware service produced by [`RecordLayer`].
#[derive(Clone)]
pub struct RecordMiddleware<S> {
    inner: S,
    recorder: Arc<Recorder>,
}

impl<S> Service<Request> for RecordMiddleware<S>
where
    S: Service<Request, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let path = req.uri().path().to_owned();
        if SKIPPED_PATHS.contains(&path.as_str()) {
            let fut = self.inner.call(req);
            return Box::pin(fut);
        }

        let recorder = Arc::clone(&self.recorder);
        let mut inner = self.inner.clone();
        Box::pin(async move {
            let started = Instant::now();
            let (parts, body) = req.into_parts();

            let bytes = match axum::body::to_bytes(body, MAX_REQUEST_BYTES).await {
                Ok(bytes) => bytes,
                Err(_) => {
                    return Ok(
                        ServerError::BadRequest("request body too large".into()).into_response()
                    );
                }
            };

            let model = serde_json::from_slice::<serde_json::Value>(&bytes)
                .ok()
                .and_then(|v| v.get("model").and_then(|m| m.as_str()).map(str::to_owned));
            let headers = parts
                .headers
                .iter()
                .filter(|(name, _)| HEADER_ALLOWLIST.contains(&name.as_str()))
                .filter_map(|(name, value)| {
                    Some((name.to_string(), value.to_str().ok()?.to_owned()))
                })
                .collect();

            let excerpt_cap = recorder.body_excerpt_cap();
            let record = RequestRecord {
                id: Uuid::new_v4(),
                at: chrono::Utc::now(),
                method: parts.method.to_string(),
                path,
                model,
                headers,
                status: None,
                bytes_in: bytes.len() as u64,
                bytes_out: 0,
                latency_ms: None,
                request_body: String::from_utf8_lossy(&bytes[..bytes.len().min(excerpt_cap)])
                    .into_owned(),
                response_body: String::new(),
            };

            let req = Request::from_parts(parts, Body::from(bytes));
            let response = inner.call(req).await?;

            let status = response.status().as_u16();
            Ok(response.map(|body| {
                Body::new(RecordingBody {
                    inner: body,
                    pending: Some(Pending {
                        recorder,
                        record,
                        status,
                        started,
                        excerpt_cap,
                    }),
                })
            }))
        })
    }
}

struct Pending {
    recorder: Arc<Recorder>,
    record: RequestRecord,
    status: u16,
    started: Instant,
    excerpt_cap: usize,
}

impl Pending {
    fn commit(mut self) {
        self.record.status = Some(self.status);
        self.record.latency_ms = Some(self.started.elapsed().as_millis() as u64);
        self.recorder.record(self.record);
    }
}

/// Pass-through body that counts bytes and captures a leading excerpt,
/// committing the record once the stream ends (or is dropped).
struct RecordingBody {
    inner: Body,
    pending: Option<Pending>,
}

impl http_body::Body for RecordingBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
        let polled = Pin::new(&mut self.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    if let Some(pending) = self.pending.as_mut() {
                        pending.record.bytes_out += data.len() as u64;
                        let room = pending
                            .excerpt_cap
                            .saturating_sub(pending.record.response_body.len());
                        if room > 0 {
                            let take = data.len().min(room);
                            pending
                                .record
                                .response_body
                                .push_str(&String::from_utf8_lossy(&data[..take]));
                        }
                    }
                }
            }
            Poll::Ready(Some(Err(_))) | Poll::Ready(None) => {
                if let Some(pending) = self.pending.take() {
                    pending.commit();
                }
            }
            Poll::Pending => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for RecordingBody {
    fn drop(&mut self) {
        // Client disconnected mid-stream; commit what was seen.
        if let Some(pending) = self.pending.take() {
            pending.commit();
        }
    }
}
