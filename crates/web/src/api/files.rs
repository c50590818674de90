//! File registration and history endpoints.

use std::path::Path;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use concord_core::conflict::{Conflict, WriteResult};
use concord_core::tracker::{FileVersion, TrackedFile};

use crate::api::status::{AppError, RootQuery};
use crate::AppState;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RegisterMode {
    Read,
    Write,
}

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub root: Option<String>,
    pub path: String,
    pub session_id: String,
    #[serde(default = "default_instance")]
    pub instance_id: String,
    pub mode: RegisterMode,
    /// Required for writes.
    pub content: Option<String>,
    pub expected_hash: Option<String>,
}

fn default_instance() -> String {
    "default".to_string()
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub root: Option<String>,
    pub path: String,
}

#[derive(Serialize)]
struct FilesResponse {
    root: String,
    files: Vec<TrackedFile>,
    active_conflicts: Vec<Conflict>,
}

#[derive(Serialize)]
struct HistoryResponse {
    path: String,
    file: Option<TrackedFile>,
    history: Vec<FileVersion>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/files", get(list_files))
        .route("/api/files/history", get(file_history))
        .route("/api/files/register", post(register))
}

async fn list_files(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RootQuery>,
) -> Result<Json<FilesResponse>, AppError> {
    let detector = state.detector(query.root.as_deref())?;
    Ok(Json(FilesResponse {
        root: detector.root().display().to_string(),
        files: detector.tracker().all_files(),
        active_conflicts: detector.active_conflicts(),
    }))
}

async fn file_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, AppError> {
    let detector = state.detector(query.root.as_deref())?;
    let abs = detector.resolve(Path::new(&query.path));
    Ok(Json(HistoryResponse {
        path: query.path,
        file: detector.tracker().file(&abs),
        history: detector.tracker().history(&abs),
    }))
}

async fn register(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    if body.session_id.trim().is_empty() {
        return Err(AppError::BadRequest("session_id must not be empty".into()));
    }
    let detector = state.detector(body.root.as_deref())?;
    let path = Path::new(&body.path);

    match body.mode {
        RegisterMode::Read => {
            let read = detector
                .register_read(path, &body.session_id, &body.instance_id)
                .await?;
            Ok(Json(serde_json::json!({
                "success": true,
                "mode": "read",
                "file_path": read.file_path,
                "hash": read.hash,
                "size": read.size,
                "is_binary": read.is_binary,
            })))
        }
        RegisterMode::Write => {
            let content = body
                .content
                .as_deref()
                .ok_or_else(|| AppError::BadRequest("write requires content".into()))?;
            let result = detector
                .register_write(
                    path,
                    &body.session_id,
                    &body.instance_id,
                    content,
                    body.expected_hash.as_deref(),
                )
                .await?;

            Ok(Json(match result {
                WriteResult::Committed { hash } => serde_json::json!({
                    "success": true,
                    "mode": "write",
                    "hash": hash,
                }),
                WriteResult::Conflicted {
                    conflict,
                    can_auto_merge,
                } => serde_json::json!({
                    "success": false,
                    "mode": "write",
                    "conflict_id": conflict.conflict_id,
                    "can_auto_merge": can_auto_merge,
                    "conflict": conflict,
                }),
            }))
        }
    }
}
