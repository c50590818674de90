//! Health, stats and reset endpoints, plus the shared API error type.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use concord_core::errors::{ConflictError, LockError};
use concord_core::models::WorkspaceStats;

use crate::AppState;

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: String,
    roots: Vec<String>,
}

/// Query or body field selecting a non-default workspace root.
#[derive(Debug, Default, Deserialize)]
pub struct RootQuery {
    pub root: Option<String>,
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/status/health", get(health_check))
        .route("/api/stats", get(get_stats))
        .route("/api/reset", post(reset))
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
        roots: state
            .registry
            .roots()
            .iter()
            .map(|root| root.display().to_string())
            .collect(),
    })
}

async fn get_stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RootQuery>,
) -> Result<Json<WorkspaceStats>, AppError> {
    let detector = state.detector(query.root.as_deref())?;
    Ok(Json(detector.stats()))
}

async fn reset(
    State(state): State<Arc<AppState>>,
    body: Option<Json<RootQuery>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let root = body.and_then(|Json(b)| b.root);
    let detector = state.detector(root.as_deref())?;
    detector.clear();
    info!(root = %detector.root().display(), "workspace state reset via API");

    Ok(Json(serde_json::json!({
        "ok": true,
        "message": format!("state for {} cleared", detector.root().display()),
    })))
}

// ---------------------------------------------------------------------------
// Shared error type for API handlers
// ---------------------------------------------------------------------------

/// API error type that converts to a JSON Axum response.
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Timeout(String),
    Internal(String),
}

impl From<ConflictError> for AppError {
    fn from(err: ConflictError) -> Self {
        let message = err.to_string();
        match err {
            ConflictError::NotFound(_) => Self::NotFound(message),
            ConflictError::AlreadyResolved(_) => Self::Conflict(message),
            ConflictError::InvalidResolution { .. } => Self::BadRequest(message),
            ConflictError::Lock(lock) => lock.into(),
            ConflictError::MergeFailed(_) | ConflictError::Io { .. } => Self::Internal(message),
        }
    }
}

impl From<LockError> for AppError {
    fn from(err: LockError) -> Self {
        let message = err.to_string();
        match err {
            LockError::Timeout { .. } => Self::Timeout(message),
            LockError::OwnershipViolation { .. } | LockError::NotHeld(_) => Self::Conflict(message),
        }
    }
}

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Timeout(msg) => (StatusCode::REQUEST_TIMEOUT, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = serde_json::json!({ "error": message });
        (status, Json(body)).into_response()
    }
}
