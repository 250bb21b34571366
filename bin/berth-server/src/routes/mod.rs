//! Axum router construction.
//!
//! [`build`] assembles the complete application router:
//! - OpenAI-native dispatch under `/engines/{backend?}/v1/*`, with `/v1/*`
//!   and `/rerank`/`/score` aliases
//! - control routes (`/engines/{status,ps,df,unload,_configure,requests}`)
//! - the Ollama (`/api/*`), Anthropic (`/anthropic/v1/*`) and Responses
//!   (`/responses`) dialects
//! - model-store delegation (`/models*`), `/metrics`, and the liveness root
//! - CORS from `DMR_ORIGINS` (localhost defaults in TCP mode) and the
//!   request recorder layer

mod anthropic;
mod engines;
mod health;
mod metrics;
mod models;
mod ollama;
mod openai;
mod responses;

use axum::Router;
use axum::http::HeaderValue;
use axum::routing::{delete, get, post};
use tower_http::cors::{Any, CorsLayer};

use crate::middleware::RecordLayer;
use crate::state::AppState;

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: AppState) -> Router {
    let cors = cors_layer(&state);
    let recorder = RecordLayer::new(std::sync::Arc::clone(&state.recorder));

    let engines = Router::new()
        // OpenAI-native inference, with and without a backend segment.
        .route("/engines/v1/chat/completions", post(openai::chat))
        .route("/engines/{backend}/v1/chat/completions", post(openai::chat_for))
        .route("/engines/v1/completions", post(openai::completions))
        .route("/engines/{backend}/v1/completions", post(openai::completions_for))
        .route("/engines/v1/embeddings", post(openai::embeddings))
        .route("/engines/{backend}/v1/embeddings", post(openai::embeddings_for))
        .route("/engines/rerank", post(openai::rerank))
        .route("/engines/{backend}/rerank", post(openai::rerank_for))
        .route("/engines/score", post(openai::score))
        .route("/engines/{backend}/score", post(openai::score_for))
        .route("/engines/v1/models", get(openai::list_models))
        .route("/engines/{backend}/v1/models", get(openai::list_models))
        .route("/engines/v1/models/{*name}", get(openai::show_model))
        .route("/engines/{backend}/v1/models/{*name}", get(openai::show_model_for))
        // Control surface.
        .route("/engines/status", get(engines::status))
        .route("/engines/ps", get(engines::ps))
        .route("/engines/df", get(engines::disk_usage))
        .route("/engines/unload", post(engines::unload))
        .route("/engines/_configure", post(engines::configure))
        .route("/engines/{backend}/_configure", post(engines::configure_for))
        .route("/engines/requests", get(engines::requests))
        .route("/engines/responses", post(responses::create));

    let aliases = Router::new()
        .route("/v1/chat/completions", post(openai::chat))
        .route("/v1/completions", post(openai::completions))
        .route("/v1/embeddings", post(openai::embeddings))
        .route("/v1/models", get(openai::list_models))
        .route("/v1/models/{*name}", get(openai::show_model))
        .route("/v1/responses", post(responses::create))
        .route("/rerank", post(openai::rerank))
        .route("/score", post(openai::score));

    let ollama = Router::new()
        .route("/api/version", get(ollama::version))
        .route("/api/tags", get(ollama::tags))
        .route("/api/ps", get(ollama::ps))
        .route("/api/show", post(ollama::show))
        .route("/api/chat", post(ollama::chat))
        .route("/api/generate", post(ollama::generate))
        .route("/api/pull", post(ollama::pull))
        .route("/api/delete", delete(ollama::delete));

    let anthropic = Router::new()
        .route("/anthropic/v1/messages", post(anthropic::messages))
        .route(
            "/anthropic/v1/messages/count_tokens",
            post(anthropic::count_tokens),
        );

    let models = Router::new()
        .route("/models", get(models::list))
        .route("/models/{*name}", get(models::show).delete(models::remove));

    Router::new()
        .merge(engines)
        .merge(aliases)
        .merge(ollama)
        .merge(anthropic)
        .merge(models)
        .route("/responses", post(responses::create))
        .route("/metrics", get(metrics::scrape))
        .route("/", get(health::liveness))
        .layer(recorder)
        .layer(cors)
        .with_state(state)
}

/// CORS policy per the environment contract: explicit `DMR_ORIGINS` wins;
/// otherwise localhost-only over TCP and unrestricted over the socket.
fn cors_layer(state: &AppState) -> CorsLayer {
    match state.config.effective_origins() {
        Some(origins) => {
            let parsed: Vec<HeaderValue> = origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(parsed)
                .allow_headers(Any)
                .allow_methods(Any)
        }
        None => CorsLayer::new()
            .allow_origin(Any)
            .allow_headers(Any)
            .allow_methods(Any),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use berth_core::recorder::{Recorder, RecorderConfig};
    use berth_core::store::DiskModelStore;
    use berth_core::{BackendSet, IdleTimeout, LoaderConfig, SchedulerBuilder};

    use crate::config::Config;
    use crate::state::AppState;

    /// State with no registered backends and an empty disk store: every
    /// route up to dispatch works, nothing can spawn.
    pub(crate) fn empty_state(models_dir: &std::path::Path) -> AppState {
        let scheduler = SchedulerBuilder::new(
            BackendSet::new(Vec::new()),
            Arc::new(DiskModelStore::new(models_dir)),
        )
        .loader_config(LoaderConfig {
            idle_timeout: IdleTimeout::never(),
            ..LoaderConfig::default()
        })
        .build();
        AppState {
            config: Arc::new(Config {
                socket_path: "/tmp/model-runner-test.sock".into(),
                tcp_port: None,
                tls_port: None,
                models_path: models_dir.to_path_buf(),
                idle_timeout: IdleTimeout::never(),
                slot_count: 2,
                disable_metrics: false,
                origins: None,
                log_level: "info".into(),
                log_json: false,
                scratch_dir: std::env::temp_dir().join("berth-route-tests"),
                gguf_bin: None,
                safetensors_bin: None,
                mlx_bin: None,
                diffusion_bin: None,
            }),
            scheduler,
            recorder: Arc::new(Recorder::new(RecorderConfig::default())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http::{Request as HttpRequest, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn liveness_answers_at_the_root() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let app = build(test_support::empty_state(tmp.path()));
        let resp = app
            .oneshot(
                HttpRequest::get("/")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn experimental_prefix_is_stripped_before_routing() {
        use tower::Layer;

        let tmp = tempfile::tempdir().expect("tempdir");
        let app = crate::middleware::RewriteExperimentalLayer
            .layer(build(test_support::empty_state(tmp.path())));
        let resp = app
            .oneshot(
                HttpRequest::get("/exp/vDD4.40/engines/status")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let app = build(test_support::empty_state(tmp.path()));
        let resp = app
            .oneshot(
                HttpRequest::get("/no/such/route")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
