//! Filesystem watcher for changes made outside any tracked session.
//!
//! A `notify` watcher runs recursively on the workspace root and forwards
//! events through a tokio channel to a spawned task, which filters them and
//! hands each relevant path to a [`WatchHandler`]. Watcher failures are
//! recorded in [`WatcherStatus`] and logged; they never take the detector
//! down.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::errors::WatcherError;
use crate::fs::TEMP_SUFFIX;

/// Kind of change reported for a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
}

/// A filtered filesystem event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

/// Observable watcher state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WatcherStatus {
    pub active: bool,
    pub root: Option<PathBuf>,
    pub events_seen: u64,
    pub last_error: Option<String>,
}

/// Receives filtered watcher events.
pub trait WatchHandler: Send + Sync + 'static {
    fn on_change(&self, event: WatchEvent) -> impl Future<Output = ()> + Send;

    fn on_error(&self, error: String) -> impl Future<Output = ()> + Send;
}

/// Recursive watcher over one workspace root.
pub struct WorkspaceWatcher {
    handle: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    status: Arc<Mutex<WatcherStatus>>,
}

impl WorkspaceWatcher {
    pub fn new() -> Self {
        Self {
            handle: None,
            shutdown_tx: None,
            status: Arc::new(Mutex::new(WatcherStatus::default())),
        }
    }

    fn lock_status(status: &Mutex<WatcherStatus>) -> MutexGuard<'_, WatcherStatus> {
        status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> WatcherStatus {
        Self::lock_status(&self.status).clone()
    }

    pub fn is_watching(&self) -> bool {
        self.status().active
    }

    /// Start watching `root`. Must be called from within a tokio runtime.
    /// An existing watch is stopped first. Failures are also recorded in the
    /// status so callers may choose to continue without a watcher.
    pub fn start<H: WatchHandler>(
        &mut self,
        root: &Path,
        ignore_patterns: Vec<String>,
        handler: H,
    ) -> Result<(), WatcherError> {
        self.stop();

        let result = self.spawn(root, ignore_patterns, handler);
        let mut status = Self::lock_status(&self.status);
        status.root = Some(root.to_path_buf());
        match &result {
            Ok(()) => {
                status.active = true;
                status.last_error = None;
                info!(root = %root.display(), "watching workspace root");
            }
            Err(e) => {
                status.active = false;
                status.last_error = Some(e.to_string());
                error!(root = %root.display(), error = %e, "failed to start watcher");
            }
        }
        result
    }

    fn spawn<H: WatchHandler>(
        &mut self,
        root: &Path,
        ignore_patterns: Vec<String>,
        handler: H,
    ) -> Result<(), WatcherError> {
        if !root.is_dir() {
            return Err(WatcherError::RootNotFound(root.display().to_string()));
        }
        // Backends report canonical paths; events are mapped back onto the
        // root as configured.
        let canonical_root = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        let root = root.to_path_buf();

        let (tx, mut rx) = mpsc::channel::<Result<Event, notify::Error>>(256);
        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| {
                if let Err(e) = tx.blocking_send(result) {
                    warn!("dropping file watch event: {}", e);
                }
            },
            notify::Config::default(),
        )?;
        watcher.watch(&canonical_root, RecursiveMode::Recursive)?;

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let status = Arc::clone(&self.status);
        let filter = EventFilter {
            root,
            canonical_root,
            ignore_patterns,
        };

        let handle = tokio::spawn(async move {
            // Keep the watcher alive for the duration of this task.
            let _watcher = watcher;

            loop {
                tokio::select! {
                    received = rx.recv() => {
                        match received {
                            Some(Ok(event)) => {
                                for watch_event in filter.apply(&event) {
                                    Self::lock_status(&status).events_seen += 1;
                                    debug!(path = %watch_event.path.display(), kind = ?watch_event.kind, "external change");
                                    handler.on_change(watch_event).await;
                                }
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "watcher backend error");
                                Self::lock_status(&status).last_error = Some(e.to_string());
                                handler.on_error(e.to_string()).await;
                            }
                            None => {
                                debug!("watch channel closed, stopping watcher");
                                break;
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        debug!("watcher shutdown requested");
                        break;
                    }
                }
            }
            Self::lock_status(&status).active = false;
        });

        self.handle = Some(handle);
        self.shutdown_tx = Some(shutdown_tx);
        Ok(())
    }

    /// Stop watching. Safe to call when not started.
    pub fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
            debug!("watcher task aborted");
        }
        Self::lock_status(&self.status).active = false;
    }
}

impl Default for WorkspaceWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WorkspaceWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Maps raw `notify` events to [`WatchEvent`]s under the configured root.
struct EventFilter {
    root: PathBuf,
    canonical_root: PathBuf,
    ignore_patterns: Vec<String>,
}

impl EventFilter {
    fn apply(&self, event: &Event) -> Vec<WatchEvent> {
        let kind = match event.kind {
            EventKind::Create(_) => ChangeKind::Created,
            EventKind::Modify(_) => ChangeKind::Modified,
            EventKind::Remove(_) => ChangeKind::Removed,
            _ => return Vec::new(),
        };

        event
            .paths
            .iter()
            .filter_map(|path| self.map_path(path))
            .filter(|(_, rel)| !self.is_ignored(rel))
            .map(|(path, _)| WatchEvent { path, kind })
            .collect()
    }

    /// Path under the configured root plus its `/`-separated relative form.
    fn map_path(&self, path: &Path) -> Option<(PathBuf, String)> {
        if path.to_string_lossy().ends_with(TEMP_SUFFIX) {
            return None;
        }
        let rel = path
            .strip_prefix(&self.canonical_root)
            .or_else(|_| path.strip_prefix(&self.root))
            .ok()?;
        let rel_str = rel.to_string_lossy().replace('\\', "/");
        if rel_str.is_empty() {
            return None;
        }
        Some((self.root.join(rel), rel_str))
    }

    fn is_ignored(&self, rel: &str) -> bool {
        self.ignore_patterns
            .iter()
            .any(|pattern| glob_match::glob_match(pattern, rel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind, RemoveKind};

    fn filter() -> EventFilter {
        EventFilter {
            root: PathBuf::from("/w"),
            canonical_root: PathBuf::from("/private/w"),
            ignore_patterns: vec![".git/**".into(), "*.log".into()],
        }
    }

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn test_filter_maps_canonical_paths_onto_root() {
        let events = filter().apply(&event(
            EventKind::Modify(ModifyKind::Any),
            "/private/w/src/a.txt",
        ));
        assert_eq!(
            events,
            vec![WatchEvent {
                path: PathBuf::from("/w/src/a.txt"),
                kind: ChangeKind::Modified
            }]
        );
    }

    #[test]
    fn test_filter_kinds() {
        let f = filter();
        assert_eq!(
            f.apply(&event(EventKind::Create(CreateKind::File), "/w/new.txt"))[0].kind,
            ChangeKind::Created
        );
        assert_eq!(
            f.apply(&event(EventKind::Remove(RemoveKind::File), "/w/old.txt"))[0].kind,
            ChangeKind::Removed
        );
        assert!(f
            .apply(&event(EventKind::Access(notify::event::AccessKind::Any), "/w/a.txt"))
            .is_empty());
    }

    #[test]
    fn test_filter_ignores_patterns_scratch_files_and_outside_paths() {
        let f = filter();
        assert!(f.apply(&event(EventKind::Modify(ModifyKind::Any), "/w/.git/index")).is_empty());
        assert!(f.apply(&event(EventKind::Modify(ModifyKind::Any), "/w/debug.log")).is_empty());
        assert!(f
            .apply(&event(
                EventKind::Create(CreateKind::File),
                &format!("/w/.a.txt.abc{}", TEMP_SUFFIX)
            ))
            .is_empty());
        assert!(f.apply(&event(EventKind::Modify(ModifyKind::Any), "/elsewhere/a.txt")).is_empty());
    }

    #[tokio::test]
    async fn test_start_on_missing_root_records_error() {
        struct Noop;
        impl WatchHandler for Noop {
            async fn on_change(&self, _event: WatchEvent) {}
            async fn on_error(&self, _error: String) {}
        }

        let mut watcher = WorkspaceWatcher::new();
        let result = watcher.start(Path::new("/definitely/missing/root"), Vec::new(), Noop);
        assert!(matches!(result, Err(WatcherError::RootNotFound(_))));
        let status = watcher.status();
        assert!(!status.active);
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        struct Noop;
        impl WatchHandler for Noop {
            async fn on_change(&self, _event: WatchEvent) {}
            async fn on_error(&self, _error: String) {}
        }

        let dir = tempfile::tempdir().unwrap();
        let mut watcher = WorkspaceWatcher::new();
        watcher.start(dir.path(), Vec::new(), Noop).unwrap();
        assert!(watcher.is_watching());
        watcher.stop();
        assert!(!watcher.is_watching());
    }
}
