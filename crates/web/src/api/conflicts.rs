//! Conflict management API endpoints.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use concord_core::conflict::{Conflict, ConflictDetail, Resolution, ResolveOutcome};
use concord_core::tracker::FileVersion;

use crate::api::status::{AppError, RootQuery};
use crate::AppState;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ConflictListResponse {
    count: usize,
    conflicts: Vec<Conflict>,
}

#[derive(Serialize)]
struct ConflictDetailResponse {
    #[serde(flatten)]
    detail: ConflictDetail,
    history: Vec<FileVersion>,
}

#[derive(Deserialize)]
pub struct ResolveConflictRequest {
    pub root: Option<String>,
    /// `auto-merged`, `keep-ours`, `keep-theirs` or `manual`.
    pub strategy: String,
    /// Required for `manual`.
    pub content: Option<String>,
    #[serde(default = "default_resolver")]
    pub session_id: String,
}

fn default_resolver() -> String {
    "api".to_string()
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/conflicts", get(list_conflicts))
        .route("/api/conflicts/:id", get(get_conflict))
        .route("/api/conflicts/:id/resolve", post(resolve_conflict))
}

async fn list_conflicts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RootQuery>,
) -> Result<Json<ConflictListResponse>, AppError> {
    let detector = state.detector(query.root.as_deref())?;
    let conflicts = detector.active_conflicts();
    Ok(Json(ConflictListResponse {
        count: conflicts.len(),
        conflicts,
    }))
}

async fn get_conflict(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<RootQuery>,
) -> Result<Json<ConflictDetailResponse>, AppError> {
    let detector = state.detector(query.root.as_deref())?;
    let detail = detector
        .conflict_detail(&id)
        .ok_or_else(|| AppError::NotFound(format!("conflict '{}' not found", id)))?;
    let history = detector.tracker().history(&detail.conflict.absolute_path);

    Ok(Json(ConflictDetailResponse { detail, history }))
}

async fn resolve_conflict(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ResolveConflictRequest>,
) -> Result<Json<ResolveOutcome>, AppError> {
    let detector = state.detector(body.root.as_deref())?;
    let resolution = Resolution::parse(&id, &body.strategy, body.content)?;

    info!(conflict_id = %id, strategy = %resolution, session_id = %body.session_id, "resolving conflict via API");
    let outcome = detector
        .resolve_conflict(&id, resolution, &body.session_id)
        .await?;
    Ok(Json(outcome))
}
