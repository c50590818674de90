//! Concord web server and REST API.
//!
//! Provides an Axum-based HTTP server with:
//! - Health, stats and reset endpoints
//! - File registration (read / write) and history
//! - Conflict listing, detail and resolution
//! - Stateless merge preview
//! - Lock introspection and administration
//! - WebSocket endpoint for live detector events

pub mod api;
pub mod ws;

use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{header, Method};
use axum::Router;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use concord_core::conflict::{ConflictDetector, DetectorRegistry};

use crate::api::status::AppError;
use crate::ws::LiveEvent;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub registry: Arc<DetectorRegistry>,
    /// Root addressed when a request names none.
    pub default_root: PathBuf,
    /// Broadcast channel for live WebSocket updates.
    pub ws_broadcast: broadcast::Sender<LiveEvent>,
}

impl AppState {
    /// The detector for `root`, or for the default root when `None`.
    /// Only roots registered at start-up are addressable.
    pub fn detector(&self, root: Option<&str>) -> Result<Arc<ConflictDetector>, AppError> {
        let root = root.map(Path::new).unwrap_or(self.default_root.as_path());
        self.registry.get(root).ok_or_else(|| {
            AppError::NotFound(format!("workspace root '{}' is not registered", root.display()))
        })
    }
}

/// The web server.
pub struct WebServer {
    state: Arc<AppState>,
}

impl WebServer {
    /// Create a web server over `registry`. `default_root` must already be
    /// registered.
    pub fn new(registry: Arc<DetectorRegistry>, default_root: PathBuf) -> Self {
        let (ws_tx, _) = broadcast::channel(256);
        let state = Arc::new(AppState {
            registry,
            default_root,
            ws_broadcast: ws_tx,
        });
        Self { state }
    }

    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Get a clone of the broadcast sender for pushing events.
    pub fn broadcast_sender(&self) -> broadcast::Sender<LiveEvent> {
        self.state.ws_broadcast.clone()
    }

    /// Forward every registered detector's events to WebSocket clients.
    pub fn forward_detector_events(&self) -> Vec<tokio::task::JoinHandle<()>> {
        self.state
            .registry
            .all()
            .iter()
            .map(|detector| ws::spawn_event_forwarder(detector, self.state.ws_broadcast.clone()))
            .collect()
    }

    /// Build the router with all routes and middleware.
    pub fn router(&self) -> Router {
        // CORS: allow local tooling and browser dashboards.
        let cors = CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE]);

        Router::new()
            // API routes
            .merge(api::status::routes())
            .merge(api::files::routes())
            .merge(api::sessions::routes())
            .merge(api::conflicts::routes())
            .merge(api::merge::routes())
            .merge(api::locks::routes())
            // WebSocket
            .merge(ws::routes())
            // Middleware
            .layer(DefaultBodyLimit::max(16 * 1024 * 1024)) // 16 MB max request body
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .with_state(Arc::clone(&self.state))
    }

    /// Serve on `listen_addr` until `shutdown` completes.
    pub async fn start<F>(self, listen_addr: &str, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr: SocketAddr = listen_addr.parse()?;
        let app = self.router();

        info!(addr = %addr, "starting web server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("web server stopped");
        Ok(())
    }
}
