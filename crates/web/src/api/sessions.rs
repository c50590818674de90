//! Session lifecycle endpoint.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};

use crate::api::status::{AppError, RootQuery};
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/api/sessions/:id/unregister", post(unregister))
}

async fn unregister(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<RootQuery>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let root = body.and_then(|Json(b)| b.root);
    let detector = state.detector(root.as_deref())?;
    let files = detector.unregister_session(&id);

    Ok(Json(serde_json::json!({
        "ok": true,
        "session_id": id,
        "files": files,
    })))
}

#[cfg(test)]
mod tests {
    use crate::test_support::TestServer;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_unregister_session() {
        let server = TestServer::new();
        std::fs::write(server.dir.path().join("a.txt"), "a").unwrap();
        server
            .post(
                "/api/files/register",
                json!({"path": "a.txt", "session_id": "s1", "mode": "read"}),
            )
            .await;

        let (status, body) = server.post("/api/sessions/s1/unregister", json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["files"], 1);

        let (_, files) = server.get("/api/files").await;
        assert!(files["files"][0]["readers"].as_array().unwrap().is_empty());
    }
}
