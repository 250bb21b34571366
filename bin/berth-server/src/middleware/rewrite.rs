//! Experimental path-prefix rewriting.
//!
//! Clients of the experimental surface prefix paths with `/exp/<version>`.
//! Routing must see the canonical path, so this middleware wraps the whole
//! router (applied around it in `main`, not via `Router::layer`, which runs
//! after route matching).  It only touches the URI and is generic over the
//! body, so it serves both the plain and the TLS listener.

use std::task::{Context, Poll};

use axum::http::{Request, Uri};
use tower::{Layer, Service};

/// [`tower::Layer`] stripping the `/exp/<version>` prefix.
#[derive(Debug, Clone, Copy)]
pub struct RewriteExperimentalLayer;

impl<S> Layer<S> for RewriteExperimentalLayer {
    type Service = RewriteExperimental<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RewriteExperimental { inner }
    }
}

/// The middleware service produced by [`RewriteExperimentalLayer`].
#[derive(Debug, Clone)]
pub struct RewriteExperimental<S> {
    inner: S,
}

impl<S, B> Service<Request<B>> for RewriteExperimental<S>
where
    S: Service<Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        if let Some(rewritten) = strip_prefix(req.uri()) {
            *req.uri_mut() = rewritten;
        }
        self.inner.call(req)
    }
}

/// `/exp/<version>/rest` → `/rest`, preserving the query.  `None` when the
/// path is not under the experimental prefix.
fn strip_prefix(uri: &Uri) -> Option<Uri> {
    let rest = uri.path().strip_prefix("/exp/")?;
    let slash = rest.find('/')?;
    let stripped = &rest[slash..];
    let rewritten = match uri.query() {
        Some(query) => format!("{stripped}?{query}"),
        None => stripped.to_owned(),
    };
    rewritten.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_the_versioned_prefix() {
        let uri: Uri = "/exp/vDD4.40/engines/v1/chat/completions".parse().expect("uri");
        assert_eq!(
            strip_prefix(&uri).expect("stripped").path(),
            "/engines/v1/chat/completions"
        );
    }

    #[test]
    fn preserves_the_query_string() {
        let uri: Uri = "/exp/v1/engines/ps?verbose=1".parse().expect("uri");
        assert_eq!(
            strip_prefix(&uri).expect("stripped").to_string(),
            "/engines/ps?verbose=1"
        );
    }

    #[test]
    fn leaves_canonical_paths_alone() {
        let uri: Uri = "/engines/ps".parse().expect("uri");
        assert!(strip_prefix(&uri).is_none());
        let uri: Uri = "/exp/".parse().expect("uri");
        assert!(strip_prefix(&uri).is_none());
    }
}
