//! Error types for the concord core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Watcher(#[from] WatcherError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Lock errors
// ---------------------------------------------------------------------------

/// Errors from the per-path lock manager.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    /// The lock could not be acquired before the timeout elapsed.
    /// Callers may retry.
    #[error("timed out after {waited_ms}ms waiting for lock on '{path}' (held by {holder})")]
    Timeout {
        path: String,
        holder: String,
        waited_ms: u64,
    },

    /// A session tried to release a lock it does not hold.
    #[error("session '{requested_by}' cannot release lock on '{path}' held by '{holder}'")]
    OwnershipViolation {
        path: String,
        requested_by: String,
        holder: String,
    },

    /// The lock is not currently held by anyone.
    #[error("lock on '{0}' is not held")]
    NotHeld(String),
}

// ---------------------------------------------------------------------------
// Tracker errors
// ---------------------------------------------------------------------------

/// Errors from the hash and change trackers.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// Reading the file from disk failed for a reason other than NotFound.
    #[error("tracker I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Conflict errors
// ---------------------------------------------------------------------------

/// Errors from the conflict detection / resolution subsystem.
#[derive(Debug, Error)]
pub enum ConflictError {
    /// The requested conflict ID was not found.
    #[error("conflict not found: {0}")]
    NotFound(String),

    /// Attempted to resolve a conflict that is already resolved.
    #[error("conflict {0} is already resolved")]
    AlreadyResolved(String),

    /// The provided resolution is invalid for this conflict.
    #[error("invalid resolution for conflict {id}: {detail}")]
    InvalidResolution { id: String, detail: String },

    /// Three-way merge failed.
    #[error("three-way merge failed: {0}")]
    MergeFailed(String),

    /// The path lock could not be taken for the commit.
    #[error("conflict lock error: {0}")]
    Lock(#[from] LockError),

    /// Persisting content to disk failed.
    #[error("conflict I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<TrackerError> for ConflictError {
    fn from(err: TrackerError) -> Self {
        match err {
            TrackerError::Io { path, source } => Self::Io { path, source },
        }
    }
}

// ---------------------------------------------------------------------------
// Watcher errors
// ---------------------------------------------------------------------------

/// Errors from the filesystem watcher. These are logged and recorded in the
/// watcher status; they never stop the detector from serving sessions.
#[derive(Debug, Error)]
pub enum WatcherError {
    /// The workspace root does not exist.
    #[error("watch root not found: {0}")]
    RootNotFound(String),

    /// The underlying `notify` backend failed.
    #[error("watcher backend error: {0}")]
    Notify(String),
}

impl From<notify::Error> for WatcherError {
    fn from(err: notify::Error) -> Self {
        Self::Notify(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
