//! Per-slot HTTP reverse proxy.
//!
//! Each Ready slot is fronted by a [`ProxyClient`] bound to the slot's
//! endpoint.  Forwarding is a plain HTTP/1.1 reverse proxy: headers pass
//! through, bodies stream in both directions, and response frames are
//! surfaced as the child produces them — SSE translation downstream depends
//! on line-timely delivery, so nothing here buffers a whole response.
//!
//! The probe/metrics path reuses the same connection machinery with an
//! empty request body.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::uri::PathAndQuery;
use http::{HeaderValue, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tracing::debug;

use crate::error::RunnerError;
use crate::loader::Reservation;
use crate::runner::Endpoint;

/// Reverse-proxy handle bound to one slot endpoint.
#[derive(Debug, Clone)]
pub struct ProxyClient {
    endpoint: Endpoint,
}

impl ProxyClient {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Forward `req` to the slot, streaming both bodies.
    ///
    /// The request URI is rewritten to origin form; the `Host` header is
    /// set to the endpoint authority; everything else passes through.
    pub async fn forward<B>(&self, mut req: Request<B>) -> Result<Response<Incoming>, RunnerError>
    where
        B: http_body::Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let path_and_query = req
            .uri()
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        *req.uri_mut() = Uri::builder()
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| RunnerError::internal(e.to_string()))?;
        if let Ok(host) = HeaderValue::from_str(&self.endpoint.authority()) {
            req.headers_mut().insert(http::header::HOST, host);
        }

        let stream = self
            .endpoint
            .connect()
            .await
            .map_err(|e| RunnerError::internal(format!("connect {}: {e}", self.endpoint)))?;
        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| RunnerError::internal(format!("handshake {}: {e}", self.endpoint)))?;
        let endpoint = self.endpoint.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(endpoint = %endpoint, error = %e, "proxy connection closed");
            }
        });

        sender
            .send_request(req)
            .await
            .map_err(|e| RunnerError::internal(format!("proxy to {}: {e}", self.endpoint)))
    }

    /// `GET path` against the slot with an empty body, collecting the
    /// response.  Used by the readiness probe and the metrics scrape.
    pub async fn get(&self, path: &str) -> Result<(StatusCode, Bytes), RunnerError> {
        let req = Request::builder()
            .method(http::Method::GET)
            .uri(path)
            .body(Empty::<Bytes>::new())
            .map_err(|e| RunnerError::internal(e.to_string()))?;
        let resp = self.forward(req).await?;
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| RunnerError::internal(e.to_string()))?
            .to_bytes();
        Ok((status, body))
    }
}

/// Proxied response body that pins its slot reservation.
///
/// The reservation must outlive the streamed body, not just the response
/// head: refcount returns to 0 only once the last byte is written (or the
/// client goes away and the body is dropped).
pub struct GuardedBody {
    inner: Pin<Box<Incoming>>,
    _reservation: Option<Reservation>,
}

impl std::fmt::Debug for GuardedBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedBody").finish()
    }
}

impl GuardedBody {
    pub fn new(inner: Incoming, reservation: Reservation) -> Self {
        Self {
            inner: Box::pin(inner),
            _reservation: Some(reservation),
        }
    }
}

impl http_body::Body for GuardedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
        self.inner.as_mut().poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}
