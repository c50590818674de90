//! Concord daemon entry point.
//!
//! Loads configuration, initializes logging, registers a conflict detector
//! per workspace root, starts the watchers and the web server, and handles
//! graceful shutdown.

mod logging;
mod signals;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use concord_core::config::AppConfig;
use concord_core::conflict::DetectorRegistry;
use concord_web::WebServer;

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// Concord workspace conflict-tracking daemon.
#[derive(Parser, Debug)]
#[command(
    name = "concord-daemon",
    version,
    about = "Tracks concurrent edits to workspace files and detects conflicting writes"
)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Override the log level from the config file (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Override the web listen address from the config file.
    #[arg(long)]
    listen: Option<String>,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config =
        AppConfig::load_from_file(&args.config).context("failed to load configuration file")?;
    if let Some(listen) = &args.listen {
        config.web.listen = listen.clone();
    }
    config
        .validate()
        .context("configuration validation failed")?;

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.daemon.log_level.clone());
    let _log_guard = logging::init(&log_level, config.daemon.log_dir.as_deref())
        .context("failed to initialize logging")?;

    // Startup banner
    info!("========================================");
    info!("  Concord Daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    info!("Config file   : {}", args.config.display());
    info!("Web listen    : {}", config.web.listen);
    info!("Roots         : {}", config.workspace.roots.len());
    info!("Lock timeout  : {}ms", config.workspace.lock_timeout_ms);
    info!("Watch         : {}", config.workspace.watch);
    info!("Log level     : {}", log_level);
    info!("========================================");

    // One detector per configured root.
    let registry = Arc::new(DetectorRegistry::new(config.workspace.clone()));
    for root in &config.workspace.roots {
        let detector = registry.get_or_create(root);
        if !root.is_dir() {
            warn!(root = %root.display(), "workspace root does not exist yet");
        }
        if config.workspace.watch {
            // Watcher failures are recorded in the watcher status; the
            // detector keeps serving sessions without one.
            if let Err(e) = detector.start_watching() {
                warn!(root = %root.display(), error = %e, "continuing without a watcher");
            }
        }
        info!(root = %root.display(), "workspace root ready");
    }

    let default_root = config
        .workspace
        .roots
        .first()
        .cloned()
        .context("no workspace roots configured")?;

    let web_server = WebServer::new(Arc::clone(&registry), default_root);
    let forwarders = web_server.forward_detector_events();
    let listen_addr = config.web.listen.clone();

    let shutdown = Arc::new(tokio::sync::Notify::new());
    let web_shutdown = Arc::clone(&shutdown);
    let web_handle = tokio::spawn(async move {
        let signal = async move { web_shutdown.notified().await };
        if let Err(e) = web_server.start(&listen_addr, signal).await {
            error!("Web server error: {}", e);
        }
    });

    signals::wait_for_shutdown().await;
    info!("Shutdown signal received, stopping...");

    shutdown.notify_one();
    match tokio::time::timeout(Duration::from_secs(10), web_handle).await {
        Ok(Ok(())) => info!("web server stopped gracefully"),
        Ok(Err(e)) => warn!("web server task error: {}", e),
        Err(_) => warn!("web server did not stop within 10s, forcing shutdown"),
    }

    registry.shutdown();
    for forwarder in forwarders {
        forwarder.abort();
    }

    info!("Concord daemon stopped.");
    Ok(())
}
