//! Model-store delegation (`/models*`).

use axum::Json;
use axum::extract::{Path, State};
use serde_json::json;

use crate::error::ServerError;
use crate::state::AppState;

/// `GET /models` – list local models.
pub async fn list(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ServerError> {
    let models = state.scheduler.store().list().await?;
    Ok(Json(json!({ "models": models })))
}

/// `GET /models/{name}` – resolve one model.
pub async fn show(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let handle = state.scheduler.store().get_local(&name).await?;
    Ok(Json(serde_json::to_value(handle).map_err(|e| {
        ServerError::Internal(e.to_string())
    })?))
}

/// `DELETE /models/{name}` – remove a local model.
pub async fn remove(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state.scheduler.store().delete(&name).await?;
    Ok(Json(json!({})))
}

#[cfg(test)]
mod tests {
    use crate::routes::{build, test_support};
    use axum::body::Body;
    use http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn listing_an_empty_store_succeeds() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let app = build(test_support::empty_state(tmp.path()));
        let resp = app
            .oneshot(Request::get("/models").body(Body::empty()).expect("req"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_model_is_404() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let app = build(test_support::empty_state(tmp.path()));
        let resp = app
            .oneshot(
                Request::get("/models/ai/absent")
                    .body(Body::empty())
                    .expect("req"),
            )
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
