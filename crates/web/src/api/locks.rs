//! Lock introspection and administration endpoints.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::warn;

use concord_core::lock::LockStatus;

use crate::api::status::{AppError, RootQuery};
use crate::AppState;

#[derive(Deserialize)]
pub struct ClearStaleRequest {
    pub root: Option<String>,
    pub max_age_ms: u64,
}

#[derive(Deserialize)]
pub struct ForceReleaseRequest {
    pub root: Option<String>,
    pub path: String,
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/locks", get(list_locks))
        .route("/api/locks/clear-stale", post(clear_stale))
        .route("/api/locks/force-release", post(force_release))
}

async fn list_locks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RootQuery>,
) -> Result<Json<Vec<LockStatus>>, AppError> {
    let detector = state.detector(query.root.as_deref())?;
    Ok(Json(detector.locks().all_locks()))
}

async fn clear_stale(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ClearStaleRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let detector = state.detector(body.root.as_deref())?;
    let released = detector
        .locks()
        .clear_stale(Duration::from_millis(body.max_age_ms));

    Ok(Json(serde_json::json!({
        "ok": true,
        "released": released,
    })))
}

async fn force_release(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ForceReleaseRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let detector = state.detector(body.root.as_deref())?;
    let abs = detector.resolve(Path::new(&body.path));
    let previous = detector.locks().force_release(&abs.to_string_lossy());
    if let Some(holder) = &previous {
        warn!(path = %abs.display(), holder = %holder, "lock force-released via API");
    }

    Ok(Json(serde_json::json!({
        "ok": true,
        "released": previous.is_some(),
        "previous_holder": previous,
    })))
}
