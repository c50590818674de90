//! Stateless merge preview.

use std::sync::Arc;

use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use concord_core::conflict::{MergeRequest, MergeResult, Merger};

use crate::AppState;

#[derive(Deserialize)]
pub struct MergePreviewRequest {
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub base: String,
    pub ours: String,
    pub theirs: String,
}

#[derive(Serialize)]
struct MergePreviewResponse {
    #[serde(flatten)]
    result: MergeResult,
    can_auto_merge: bool,
    ours_diff: String,
    theirs_diff: String,
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/api/merge/preview", post(preview))
}

async fn preview(Json(body): Json<MergePreviewRequest>) -> Json<MergePreviewResponse> {
    let ours_diff = Merger::unified_diff(&body.base, &body.ours);
    let theirs_diff = Merger::unified_diff(&body.base, &body.theirs);
    let result = Merger::merge(&MergeRequest {
        file_path: body.file_path,
        base: body.base,
        ours: body.ours,
        theirs: body.theirs,
    });

    Json(MergePreviewResponse {
        can_auto_merge: result.can_auto_merge(),
        result,
        ours_diff,
        theirs_diff,
    })
}
