//! Aggregated runner metrics.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::state::AppState;

/// `GET /metrics` – concatenated `/metrics` of every Ready runner, each
/// under a `# runner …` banner.  Disabled via `DISABLE_METRICS`.
pub async fn scrape(State(state): State<AppState>) -> Response {
    if state.config.disable_metrics {
        return StatusCode::NOT_FOUND.into_response();
    }
    let body = state.scheduler.aggregate_metrics().await;
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use crate::routes::{build, test_support};
    use axum::body::Body;
    use http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn metrics_respect_the_disable_toggle() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut state = test_support::empty_state(tmp.path());
        let mut config = (*state.config).clone();
        config.disable_metrics = true;
        state.config = std::sync::Arc::new(config);

        let app = build(state);
        let resp = app
            .oneshot(Request::get("/metrics").body(Body::empty()).expect("req"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_with_no_runners_is_empty_200() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let app = build(test_support::empty_state(tmp.path()));
        let resp = app
            .oneshot(Request::get("/metrics").body(Body::empty()).expect("req"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
