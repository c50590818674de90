//! WebSocket endpoint for live detector events.
//!
//! Clients connect to `/ws` and receive a JSON message for every conflict
//! detected or resolved and every committed write. Pass `?root=<path>` to
//! only receive events for one workspace root.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use concord_core::conflict::ConflictDetector;

use crate::AppState;

/// A serialized detector event tagged with its workspace root.
#[derive(Debug, Clone)]
pub struct LiveEvent {
    pub root: PathBuf,
    pub json: String,
}

#[derive(Deserialize)]
struct WsQuery {
    root: Option<PathBuf>,
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/ws", get(ws_handler))
}

/// Relay `detector`'s events onto `tx` until the detector goes away.
pub fn spawn_event_forwarder(
    detector: &Arc<ConflictDetector>,
    tx: broadcast::Sender<LiveEvent>,
) -> tokio::task::JoinHandle<()> {
    let mut rx = detector.subscribe();
    let root = detector.root().to_path_buf();

    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let mut value = match serde_json::to_value(&event) {
                        Ok(value) => value,
                        Err(e) => {
                            warn!("failed to serialize detector event: {}", e);
                            continue;
                        }
                    };
                    value["root"] = serde_json::Value::String(root.display().to_string());
                    // No connected clients is not an error.
                    let _ = tx.send(LiveEvent {
                        root: root.clone(),
                        json: value.to_string(),
                    });
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(root = %root.display(), "event forwarder lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!(root = %root.display(), "detector event channel closed");
                    break;
                }
            }
        }
    })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let rx = state.ws_broadcast.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, rx, query.root))
}

async fn handle_socket(
    mut socket: WebSocket,
    mut rx: broadcast::Receiver<LiveEvent>,
    root: Option<PathBuf>,
) {
    debug!(root = ?root, "WebSocket client connected");

    let welcome = serde_json::json!({
        "type": "connected",
        "message": "concord live updates",
        "root": root,
    });
    if let Err(e) = socket.send(Message::Text(welcome.to_string())).await {
        warn!("failed to send welcome message: {}", e);
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if root.as_ref().is_some_and(|r| *r != event.root) {
                            continue;
                        }
                        if let Err(e) = socket.send(Message::Text(event.json)).await {
                            debug!("WebSocket send error (client disconnected?): {}", e);
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("WebSocket client lagged by {} messages", n);
                        let lag_msg = serde_json::json!({
                            "type": "warning",
                            "message": format!("lagged by {} messages", n),
                        });
                        let _ = socket.send(Message::Text(lag_msg.to_string())).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("broadcast channel closed, disconnecting WebSocket");
                        break;
                    }
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("WebSocket client disconnected");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = socket.send(Message::Pong(data)).await {
                            debug!("WebSocket pong error: {}", e);
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("WebSocket receive error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    debug!("WebSocket connection closed");
}
