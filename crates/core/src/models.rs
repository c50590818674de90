//! Shared model types used by the detector and the web API.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::conflict::ConflictType;
use crate::tracker::TrackerStats;
use crate::watcher::WatcherStatus;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Notifications broadcast by a detector as its state changes.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DetectorEvent {
    ConflictDetected {
        conflict_id: String,
        file_path: String,
        conflict_type: ConflictType,
        timestamp: DateTime<Utc>,
    },
    ConflictResolved {
        conflict_id: String,
        file_path: String,
        resolution: String,
        new_hash: String,
        timestamp: DateTime<Utc>,
    },
    FileWritten {
        file_path: String,
        session_id: String,
        hash: String,
        timestamp: DateTime<Utc>,
    },
    ExternalChange {
        file_path: String,
        hash: String,
        timestamp: DateTime<Utc>,
    },
}

impl DetectorEvent {
    pub fn file_path(&self) -> &str {
        match self {
            Self::ConflictDetected { file_path, .. }
            | Self::ConflictResolved { file_path, .. }
            | Self::FileWritten { file_path, .. }
            | Self::ExternalChange { file_path, .. } => file_path,
        }
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Summary of one workspace root.
#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceStats {
    pub root: PathBuf,
    #[serde(flatten)]
    pub tracker: TrackerStats,
    pub active_conflicts: usize,
    pub resolved_conflicts: usize,
    pub locks_held: usize,
    pub tracked_hashes: usize,
    pub watcher: WatcherStatus,
}
