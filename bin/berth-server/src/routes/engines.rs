//! Control surface: introspection, eviction and per-runner configuration.

use axum::Json;
use axum::extract::{Path, State};
use berth_core::{Mode, RunnerConfig};
use serde::Deserialize;
use serde_json::json;

use crate::error::ServerError;
use crate::state::AppState;

/// `GET /engines/status` – backend install states.
pub async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "backends": state.scheduler.status() }))
}

/// `GET /engines/ps` – slot table snapshot.
pub async fn ps(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "slots": state.scheduler.ps() }))
}

/// `GET /engines/df` – disk usage of the model store and backends.
pub async fn disk_usage(
    State(state): State<AppState>,
) -> Result<Json<berth_core::DiskUsage>, ServerError> {
    Ok(Json(state.scheduler.disk_usage().await?))
}

#[derive(Debug, Deserialize)]
pub struct UnloadRequest {
    #[serde(default)]
    pub models: Vec<String>,
}

/// `POST /engines/unload` – request eviction of the listed models.
pub async fn unload(
    State(state): State<AppState>,
    Json(req): Json<UnloadRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    if req.models.is_empty() {
        return Err(ServerError::BadRequest("no models listed".into()));
    }
    let unloaded = state.scheduler.unload(&req.models).await?;
    Ok(Json(json!({ "unloaded": unloaded })))
}

#[derive(Debug, Deserialize)]
pub struct ConfigureRequest {
    pub model: String,
    #[serde(default)]
    pub mode: Option<Mode>,
    #[serde(default)]
    pub context_size: Option<u32>,
    #[serde(default)]
    pub draft_model: Option<String>,
    #[serde(default)]
    pub runtime_flags: Vec<String>,
}

/// `POST /engines/_configure` – record per-runner configuration for the
/// default (or format-selected) backend.
pub async fn configure(
    State(state): State<AppState>,
    Json(req): Json<ConfigureRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    configure_inner(state, None, req).await
}

/// `POST /engines/{backend}/_configure`.
pub async fn configure_for(
    State(state): State<AppState>,
    Path(backend): Path<String>,
    Json(req): Json<ConfigureRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    configure_inner(state, Some(backend), req).await
}

async fn configure_inner(
    state: AppState,
    backend: Option<String>,
    req: ConfigureRequest,
) -> Result<Json<serde_json::Value>, ServerError> {
    if req.model.trim().is_empty() {
        return Err(ServerError::BadRequest("missing model".into()));
    }
    state
        .scheduler
        .configure(
            backend.as_deref(),
            &req.model,
            req.mode.unwrap_or(Mode::Completion),
            RunnerConfig {
                context_size: req.context_size,
                draft_model: req.draft_model,
                runtime_flags: req.runtime_flags,
            },
        )
        .await?;
    Ok(Json(json!({})))
}

/// `GET /engines/requests` – recorder dump.
pub async fn requests(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "requests": state.recorder.dump() }))
}
