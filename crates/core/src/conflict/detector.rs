//! Conflict detection for one workspace root.
//!
//! The [`ConflictDetector`] owns the per-root collaborators (lock manager,
//! hash tracker, change tracker, watcher) and runs the read/write pipeline:
//!
//! 1. **Read** -- record the fingerprint a session observed.
//! 2. **Write** -- take the path lock, re-check the session's expected
//!    fingerprint inside it, then either commit or open a [`Conflict`] with a
//!    three-way merge proposal. A commit retires the conflicts it supersedes.
//! 3. **Resolve** -- commit the content chosen by a [`Resolution`] under the
//!    same lock and retire the conflict.
//!
//! External edits reported by the watcher are folded into the trackers under
//! the path lock, so they are never confused with writes made through the
//! detector.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::WorkspaceConfig;
use crate::conflict::merger::{MergeRequest, MergeResult, Merger};
use crate::conflict::resolver::{ConflictResolver, ConflictSides, Resolution, ResolvedContent};
use crate::errors::{ConflictError, WatcherError};
use crate::fs::{FileContent, WorkspaceFs};
use crate::hash::{content_hash, HashTracker, DISK_BASELINE_SESSION};
use crate::lock::LockManager;
use crate::models::{DetectorEvent, WorkspaceStats};
use crate::path::{resolve_in_root, PathNormalizer};
use crate::tracker::{
    ChangeTracker, FileVersion, Observation, VersionKind, EXTERNAL_SESSION, WATCHER_INSTANCE,
};
use crate::watcher::{ChangeKind, WatchEvent, WatchHandler, WatcherStatus, WorkspaceWatcher};
use crate::writer::SafeFileWriter;

/// Instance id reported when the origin of a change is unknown.
const UNKNOWN_INSTANCE: &str = "unknown";

/// Number of resolved conflict ids remembered for duplicate detection.
const RESOLVED_HISTORY: usize = 1024;

const EVENT_CAPACITY: usize = 256;

/// Resolution label for conflicts retired by a later commit.
pub const SUPERSEDED: &str = "superseded";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Categorisation of a conflict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Another session committed a write the writer had not seen.
    ConcurrentWrite,
    /// The file changed outside any tracked session.
    ExternalModification,
}

impl std::fmt::Display for ConflictType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConcurrentWrite => write!(f, "concurrent_write"),
            Self::ExternalModification => write!(f, "external_modification"),
        }
    }
}

/// Lifecycle status of an unresolved conflict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Active,
    /// A resolution is being committed.
    Resolving,
}

impl std::fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Resolving => write!(f, "resolving"),
        }
    }
}

/// A party to a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvolvedSession {
    pub session_id: String,
    pub instance_id: String,
    /// Fingerprint of the content this party produced.
    pub hash: String,
    pub timestamp: DateTime<Utc>,
}

/// A detected conflict awaiting resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub conflict_id: String,
    /// Workspace-relative path.
    pub file_path: String,
    pub absolute_path: PathBuf,
    pub conflict_type: ConflictType,
    /// The rejected writer first, then the party that produced the current
    /// content.
    pub involved_sessions: Vec<InvolvedSession>,
    pub merge_result: MergeResult,
    pub expected_hash: String,
    pub current_hash: String,
    pub status: ConflictStatus,
    pub is_binary: bool,
    pub timestamp: DateTime<Utc>,
}

/// A conflict plus its merge inputs and per-side diffs.
#[derive(Debug, Clone, Serialize)]
pub struct ConflictDetail {
    #[serde(flatten)]
    pub conflict: Conflict,
    pub base: String,
    pub ours: String,
    pub theirs: Option<String>,
    pub ours_diff: String,
    pub theirs_diff: Option<String>,
}

/// Result of [`ConflictDetector::register_read`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadOutcome {
    pub file_path: String,
    /// `None` when the file does not exist.
    pub hash: Option<String>,
    pub size: u64,
    pub is_binary: bool,
}

/// Result of [`ConflictDetector::register_write`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WriteResult {
    Committed {
        hash: String,
    },
    Conflicted {
        conflict: Box<Conflict>,
        can_auto_merge: bool,
    },
}

impl WriteResult {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }

    pub fn hash(&self) -> Option<&str> {
        match self {
            Self::Committed { hash } => Some(hash.as_str()),
            Self::Conflicted { .. } => None,
        }
    }

    pub fn conflict(&self) -> Option<&Conflict> {
        match self {
            Self::Committed { .. } => None,
            Self::Conflicted { conflict, .. } => Some(conflict.as_ref()),
        }
    }
}

/// Result of [`ConflictDetector::resolve_conflict`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolveOutcome {
    pub conflict_id: String,
    pub file_path: String,
    pub resolution: String,
    pub new_hash: String,
}

#[derive(Debug, Clone)]
struct ConflictRecord {
    conflict: Conflict,
    sides: ConflictSides,
}

#[derive(Default)]
struct ConflictBook {
    active: HashMap<String, ConflictRecord>,
    resolved_order: VecDeque<String>,
    resolved: HashSet<String>,
}

impl ConflictBook {
    fn mark_resolved(&mut self, conflict_id: &str) {
        if self.resolved.insert(conflict_id.to_string()) {
            self.resolved_order.push_back(conflict_id.to_string());
        }
        while self.resolved_order.len() > RESOLVED_HISTORY {
            if let Some(evicted) = self.resolved_order.pop_front() {
                self.resolved.remove(&evicted);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// Conflict detection service for one workspace root.
pub struct ConflictDetector {
    root: PathBuf,
    config: WorkspaceConfig,
    normalizer: PathNormalizer,
    fs: WorkspaceFs,
    locks: Arc<LockManager>,
    hashes: Arc<HashTracker>,
    tracker: Arc<ChangeTracker>,
    writer: SafeFileWriter,
    book: Mutex<ConflictBook>,
    watcher: Mutex<WorkspaceWatcher>,
    events: broadcast::Sender<DetectorEvent>,
}

impl ConflictDetector {
    /// Create a detector with fresh collaborators built from `config`.
    pub fn new(root: impl Into<PathBuf>, config: WorkspaceConfig) -> Arc<Self> {
        let root = root.into();
        let normalizer = PathNormalizer::new(config.case_insensitive);
        let fs = WorkspaceFs::new(config.binary_sniff_bytes);
        let locks = LockManager::new(normalizer, config.lock_timeout());
        let hashes = Arc::new(HashTracker::new(normalizer, fs.clone()));
        let tracker = Arc::new(ChangeTracker::new(
            root.clone(),
            normalizer,
            config.max_history,
        ));
        Self::with_components(root, config, locks, hashes, tracker)
    }

    /// Create a detector around existing collaborators.
    pub fn with_components(
        root: impl Into<PathBuf>,
        config: WorkspaceConfig,
        locks: Arc<LockManager>,
        hashes: Arc<HashTracker>,
        tracker: Arc<ChangeTracker>,
    ) -> Arc<Self> {
        let root = root.into();
        let normalizer = PathNormalizer::new(config.case_insensitive);
        let fs = WorkspaceFs::new(config.binary_sniff_bytes);
        let writer = SafeFileWriter::new(Arc::clone(&locks), Arc::clone(&hashes), fs.clone());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        info!(root = %root.display(), "conflict detector created");
        Arc::new(Self {
            root,
            config,
            normalizer,
            fs,
            locks,
            hashes,
            tracker,
            writer,
            book: Mutex::new(ConflictBook::default()),
            watcher: Mutex::new(WorkspaceWatcher::new()),
            events,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn hash_tracker(&self) -> &Arc<HashTracker> {
        &self.hashes
    }

    pub fn tracker(&self) -> &Arc<ChangeTracker> {
        &self.tracker
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DetectorEvent> {
        self.events.subscribe()
    }

    /// Absolute form of `path`; relative paths are taken from the root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        resolve_in_root(&self.root, path)
    }

    fn relative(&self, abs: &Path) -> String {
        self.normalizer.relative_to(&self.root, abs)
    }

    fn book(&self) -> MutexGuard<'_, ConflictBook> {
        self.book.lock().unwrap_or_else(|poisoned| {
            warn!("conflict book mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn watcher(&self) -> MutexGuard<'_, WorkspaceWatcher> {
        self.watcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: DetectorEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    // -----------------------------------------------------------------------
    // Read / write pipeline
    // -----------------------------------------------------------------------

    /// Record that `session_id` read `path` and return the fingerprint it saw.
    ///
    /// Reads do not take the path lock; writes re-validate the expected
    /// fingerprint under it. The hash record is only updated when no other
    /// record landed while the disk was being read.
    pub async fn register_read(
        &self,
        path: &Path,
        session_id: &str,
        instance_id: &str,
    ) -> Result<ReadOutcome, ConflictError> {
        let abs = self.resolve(path);
        let observed = self.hashes.get(&abs);

        let content = self.fs.read_content(&abs).await?;
        let hash = content.as_ref().map(|c| content_hash(c.as_bytes()));
        let size = content.as_ref().map_or(0, FileContent::len);
        let is_binary = content.as_ref().is_some_and(FileContent::is_binary);

        if let Some(hash) = &hash {
            match &observed {
                Some(record) if record.hash == *hash => {}
                _ => {
                    let recorded_by = if observed.is_some() {
                        debug!(path = %abs.display(), "read observed an unrecorded change");
                        EXTERNAL_SESSION
                    } else {
                        DISK_BASELINE_SESSION
                    };
                    let revision = observed.as_ref().map(|r| r.revision);
                    if !self
                        .hashes
                        .record_hash_if_unchanged(&abs, hash, recorded_by, revision)
                    {
                        debug!(path = %abs.display(), "hash moved during read, keeping newer record");
                    }
                }
            }
        }

        self.tracker.record_read(Observation {
            absolute_path: &abs,
            session_id,
            instance_id,
            hash: hash.as_deref(),
            size,
            is_binary,
            content: content.as_ref().and_then(FileContent::text),
        });

        let file_path = self.relative(&abs);
        info!(path = %file_path, session_id, instance_id, hash = ?hash, "read registered");
        Ok(ReadOutcome {
            file_path,
            hash,
            size,
            is_binary,
        })
    }

    /// Write `content` to `path` for `session_id`.
    ///
    /// With `expected_hash` set, the write only commits if the file is still
    /// at that fingerprint (or already holds exactly `content`); otherwise a
    /// [`Conflict`] is recorded and nothing is written.
    pub async fn register_write(
        &self,
        path: &Path,
        session_id: &str,
        instance_id: &str,
        content: &str,
        expected_hash: Option<&str>,
    ) -> Result<WriteResult, ConflictError> {
        let abs = self.resolve(path);
        let lock = self
            .locks
            .acquire(&abs.to_string_lossy(), session_id, None)
            .await?;
        let new_hash = content_hash(content);

        if let Some(expected) = expected_hash {
            let check = self.hashes.detect_conflict(&abs, expected).await?;
            let diverged = check
                .current_hash
                .as_deref()
                .filter(|current| check.has_conflict && *current != new_hash);
            if let Some(current) = diverged {
                let conflict = self
                    .open_conflict(&abs, session_id, instance_id, content, expected, current)
                    .await?;
                drop(lock);
                let can_auto_merge = conflict.merge_result.can_auto_merge();
                return Ok(WriteResult::Conflicted {
                    conflict: Box::new(conflict),
                    can_auto_merge,
                });
            }
        }

        let hash = self.writer.commit(&lock, &abs, content.as_bytes()).await?;
        self.tracker.record_write(Observation {
            absolute_path: &abs,
            session_id,
            instance_id,
            hash: Some(&hash),
            size: content.len() as u64,
            is_binary: self.fs.is_binary(content.as_bytes()),
            content: Some(content),
        });
        self.retire_superseded(&abs, session_id, &hash, None);
        lock.release();

        let file_path = self.relative(&abs);
        info!(path = %file_path, session_id, instance_id, hash = %hash, "write committed");
        self.emit(DetectorEvent::FileWritten {
            file_path,
            session_id: session_id.to_string(),
            hash: hash.clone(),
            timestamp: Utc::now(),
        });
        Ok(WriteResult::Committed { hash })
    }

    /// Record a conflict for a rejected write. Called with the path lock held.
    async fn open_conflict(
        &self,
        abs: &Path,
        session_id: &str,
        instance_id: &str,
        ours: &str,
        expected_hash: &str,
        current_hash: &str,
    ) -> Result<Conflict, ConflictError> {
        let disk = self.fs.read_content(abs).await?;
        let is_binary =
            self.fs.is_binary(ours.as_bytes()) || disk.as_ref().is_some_and(FileContent::is_binary);
        let theirs = disk
            .as_ref()
            .and_then(FileContent::text)
            .map(str::to_string);
        let base = self
            .tracker
            .content_for(abs, expected_hash)
            .unwrap_or_else(|| {
                debug!(path = %abs.display(), "base content unknown, merging against empty base");
                String::new()
            });
        let file_path = self.relative(abs);

        let merge_result = if is_binary {
            MergeResult::failure("binary files cannot be merged automatically")
        } else {
            Merger::merge(&MergeRequest {
                file_path: file_path.clone(),
                base: base.clone(),
                ours: ours.to_string(),
                theirs: theirs.clone().unwrap_or_default(),
            })
        };

        let now = Utc::now();
        let diverging = self.tracker.last_change_with_hash(abs, current_hash);
        let conflict_type = match &diverging {
            Some(version) if version.kind == VersionKind::Write => ConflictType::ConcurrentWrite,
            _ => ConflictType::ExternalModification,
        };
        let theirs_party = match diverging {
            Some(FileVersion {
                session_id,
                instance_id,
                timestamp,
                ..
            }) => InvolvedSession {
                session_id,
                instance_id,
                hash: current_hash.to_string(),
                timestamp,
            },
            None => InvolvedSession {
                session_id: EXTERNAL_SESSION.to_string(),
                instance_id: UNKNOWN_INSTANCE.to_string(),
                hash: current_hash.to_string(),
                timestamp: self.hashes.get(abs).map_or(now, |r| r.timestamp),
            },
        };

        let conflict = Conflict {
            conflict_id: Uuid::new_v4().to_string(),
            file_path,
            absolute_path: abs.to_path_buf(),
            conflict_type,
            involved_sessions: vec![
                InvolvedSession {
                    session_id: session_id.to_string(),
                    instance_id: instance_id.to_string(),
                    hash: content_hash(ours),
                    timestamp: now,
                },
                theirs_party,
            ],
            merge_result,
            expected_hash: expected_hash.to_string(),
            current_hash: current_hash.to_string(),
            status: ConflictStatus::Active,
            is_binary,
            timestamp: now,
        };

        warn!(
            conflict_id = %conflict.conflict_id,
            path = %conflict.file_path,
            conflict_type = %conflict.conflict_type,
            session_id,
            expected_hash,
            current_hash,
            can_auto_merge = conflict.merge_result.can_auto_merge(),
            "write conflict detected"
        );

        self.book().active.insert(
            conflict.conflict_id.clone(),
            ConflictRecord {
                conflict: conflict.clone(),
                sides: ConflictSides {
                    base,
                    ours: ours.to_string(),
                    theirs,
                    is_binary,
                },
            },
        );
        self.emit(DetectorEvent::ConflictDetected {
            conflict_id: conflict.conflict_id.clone(),
            file_path: conflict.file_path.clone(),
            conflict_type,
            timestamp: now,
        });
        Ok(conflict)
    }

    // -----------------------------------------------------------------------
    // Resolution
    // -----------------------------------------------------------------------

    /// Commit `resolution` for `conflict_id` on behalf of `session_id`.
    ///
    /// A conflict resolves at most once: a second attempt, concurrent or
    /// later, fails with [`ConflictError::AlreadyResolved`].
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        resolution: Resolution,
        session_id: &str,
    ) -> Result<ResolveOutcome, ConflictError> {
        let record = {
            let mut book = self.book();
            if book.resolved.contains(conflict_id) {
                return Err(ConflictError::AlreadyResolved(conflict_id.to_string()));
            }
            let record = book
                .active
                .get_mut(conflict_id)
                .ok_or_else(|| ConflictError::NotFound(conflict_id.to_string()))?;
            if record.conflict.status == ConflictStatus::Resolving {
                return Err(ConflictError::AlreadyResolved(conflict_id.to_string()));
            }
            record.conflict.status = ConflictStatus::Resolving;
            record.clone()
        };

        match self.apply_resolution(&record, &resolution, session_id).await {
            Ok(new_hash) => {
                {
                    let mut book = self.book();
                    book.active.remove(conflict_id);
                    book.mark_resolved(conflict_id);
                }
                info!(
                    conflict_id,
                    path = %record.conflict.file_path,
                    resolution = %resolution,
                    session_id,
                    new_hash = %new_hash,
                    "conflict resolved"
                );
                self.emit(DetectorEvent::ConflictResolved {
                    conflict_id: conflict_id.to_string(),
                    file_path: record.conflict.file_path.clone(),
                    resolution: resolution.to_string(),
                    new_hash: new_hash.clone(),
                    timestamp: Utc::now(),
                });
                Ok(ResolveOutcome {
                    conflict_id: conflict_id.to_string(),
                    file_path: record.conflict.file_path,
                    resolution: resolution.to_string(),
                    new_hash,
                })
            }
            Err(e) => {
                if let Some(record) = self.book().active.get_mut(conflict_id) {
                    record.conflict.status = ConflictStatus::Active;
                }
                warn!(conflict_id, error = %e, "conflict resolution failed");
                Err(e)
            }
        }
    }

    async fn apply_resolution(
        &self,
        record: &ConflictRecord,
        resolution: &Resolution,
        session_id: &str,
    ) -> Result<String, ConflictError> {
        let conflict = &record.conflict;
        let content = ConflictResolver::select(
            &conflict.conflict_id,
            resolution,
            &record.sides,
            &conflict.merge_result,
        )?;
        let abs = &conflict.absolute_path;
        let lock = self
            .locks
            .acquire(&abs.to_string_lossy(), session_id, None)
            .await?;

        let hash = match content {
            ResolvedContent::Text(text) => {
                let hash = self.writer.commit(&lock, abs, text.as_bytes()).await?;
                self.tracker.record_write(Observation {
                    absolute_path: abs,
                    session_id,
                    instance_id: UNKNOWN_INSTANCE,
                    hash: Some(&hash),
                    size: text.len() as u64,
                    is_binary: self.fs.is_binary(text.as_bytes()),
                    content: Some(&text),
                });
                hash
            }
            ResolvedContent::KeepDisk => {
                let disk = self.fs.read_content(abs).await?;
                let bytes = disk.as_ref().map_or(&[][..], FileContent::as_bytes);
                let hash = self.hashes.record(abs, bytes, session_id);
                self.tracker.record_write(Observation {
                    absolute_path: abs,
                    session_id,
                    instance_id: UNKNOWN_INSTANCE,
                    hash: Some(&hash),
                    size: bytes.len() as u64,
                    is_binary: disk.as_ref().is_some_and(FileContent::is_binary),
                    content: disk.as_ref().and_then(FileContent::text),
                });
                hash
            }
        };
        self.retire_superseded(abs, session_id, &hash, Some(conflict.conflict_id.as_str()));
        lock.release();
        Ok(hash)
    }

    /// Retire active conflicts on `abs` made moot by a commit of `hash` by
    /// `session_id`: those opened by the same session, and those raised
    /// against content the file no longer holds. Called with the path lock
    /// held. Retired ids count as resolved.
    fn retire_superseded(
        &self,
        abs: &Path,
        session_id: &str,
        hash: &str,
        except: Option<&str>,
    ) -> Vec<String> {
        let key = self.normalizer.normalize_path(abs);
        let retired: Vec<ConflictRecord> = {
            let mut book = self.book();
            let ids: Vec<String> = book
                .active
                .values()
                .filter(|record| {
                    let conflict = &record.conflict;
                    conflict.status == ConflictStatus::Active
                        && except != Some(conflict.conflict_id.as_str())
                        && self.normalizer.normalize_path(&conflict.absolute_path) == key
                        && (conflict
                            .involved_sessions
                            .first()
                            .is_some_and(|s| s.session_id == session_id)
                            || conflict.current_hash != hash)
                })
                .map(|record| record.conflict.conflict_id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| {
                    let record = book.active.remove(id)?;
                    book.mark_resolved(id);
                    Some(record)
                })
                .collect()
        };

        for record in &retired {
            info!(
                conflict_id = %record.conflict.conflict_id,
                path = %record.conflict.file_path,
                session_id,
                new_hash = hash,
                "conflict superseded by a later commit"
            );
            self.emit(DetectorEvent::ConflictResolved {
                conflict_id: record.conflict.conflict_id.clone(),
                file_path: record.conflict.file_path.clone(),
                resolution: SUPERSEDED.to_string(),
                new_hash: hash.to_string(),
                timestamp: Utc::now(),
            });
        }
        retired
            .into_iter()
            .map(|record| record.conflict.conflict_id)
            .collect()
    }

    // -----------------------------------------------------------------------
    // External changes
    // -----------------------------------------------------------------------

    /// Fold a change made outside the detector into the trackers. Returns the
    /// new fingerprint, or `None` when the path is untracked or the content
    /// is already known.
    pub async fn handle_external_change(
        &self,
        path: &Path,
        kind: ChangeKind,
    ) -> Result<Option<String>, ConflictError> {
        let abs = self.resolve(path);
        if !self.tracker.is_tracked(&abs) {
            debug!(path = %abs.display(), "ignoring change to untracked file");
            return Ok(None);
        }

        let lock = self
            .locks
            .acquire(&abs.to_string_lossy(), EXTERNAL_SESSION, None)
            .await?;
        let content = self.fs.read_content(&abs).await?;
        let disk_hash = content.as_ref().map(|c| content_hash(c.as_bytes()));
        // A removed file is tracked with the fingerprint of empty content.
        let effective = disk_hash.clone().unwrap_or_else(|| content_hash(b""));

        let known = self.hashes.get(&abs).is_some_and(|r| r.hash == effective)
            && self.tracker.current_hash(&abs) == disk_hash;
        if known {
            debug!(path = %abs.display(), kind = ?kind, "change matches recorded state");
            return Ok(None);
        }

        self.tracker.record_external(Observation {
            absolute_path: &abs,
            session_id: EXTERNAL_SESSION,
            instance_id: WATCHER_INSTANCE,
            hash: disk_hash.as_deref(),
            size: content.as_ref().map_or(0, FileContent::len),
            is_binary: content.as_ref().is_some_and(FileContent::is_binary),
            content: content.as_ref().and_then(FileContent::text),
        });
        self.hashes.record_hash(&abs, &effective, EXTERNAL_SESSION);
        drop(lock);

        let file_path = self.relative(&abs);
        info!(path = %file_path, kind = ?kind, hash = %effective, "external change recorded");
        self.emit(DetectorEvent::ExternalChange {
            file_path,
            hash: effective.clone(),
            timestamp: Utc::now(),
        });
        Ok(Some(effective))
    }

    /// Start the filesystem watcher on the root. Must be called from within a
    /// tokio runtime.
    pub fn start_watching(self: &Arc<Self>) -> Result<(), WatcherError> {
        let handler = DetectorWatchHandler {
            detector: Arc::downgrade(self),
        };
        self.watcher()
            .start(&self.root, self.config.ignore_patterns.clone(), handler)
    }

    pub fn stop_watching(&self) {
        self.watcher().stop();
    }

    pub fn watcher_status(&self) -> WatcherStatus {
        self.watcher().status()
    }

    // -----------------------------------------------------------------------
    // Queries and housekeeping
    // -----------------------------------------------------------------------

    /// Drop `session_id` from every reader and writer set.
    pub fn unregister_session(&self, session_id: &str) -> usize {
        let touched = self.tracker.remove_session(session_id);
        info!(session_id, files = touched, "session unregistered");
        touched
    }

    /// Unresolved conflicts, oldest first.
    pub fn active_conflicts(&self) -> Vec<Conflict> {
        let mut conflicts: Vec<Conflict> = self
            .book()
            .active
            .values()
            .map(|record| record.conflict.clone())
            .collect();
        conflicts.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        conflicts
    }

    pub fn get_conflict(&self, conflict_id: &str) -> Option<Conflict> {
        self.book()
            .active
            .get(conflict_id)
            .map(|record| record.conflict.clone())
    }

    pub fn conflict_detail(&self, conflict_id: &str) -> Option<ConflictDetail> {
        let record = self.book().active.get(conflict_id).cloned()?;
        let sides = record.sides;
        let ours_diff = Merger::unified_diff(&sides.base, &sides.ours);
        let theirs_diff = sides
            .theirs
            .as_deref()
            .map(|theirs| Merger::unified_diff(&sides.base, theirs));
        Some(ConflictDetail {
            conflict: record.conflict,
            base: sides.base,
            ours: sides.ours,
            theirs: sides.theirs,
            ours_diff,
            theirs_diff,
        })
    }

    pub fn is_resolved(&self, conflict_id: &str) -> bool {
        self.book().resolved.contains(conflict_id)
    }

    pub fn stats(&self) -> WorkspaceStats {
        let (active_conflicts, resolved_conflicts) = {
            let book = self.book();
            (book.active.len(), book.resolved.len())
        };
        WorkspaceStats {
            root: self.root.clone(),
            tracker: self.tracker.stats(),
            active_conflicts,
            resolved_conflicts,
            locks_held: self.locks.all_locks().len(),
            tracked_hashes: self.hashes.len(),
            watcher: self.watcher_status(),
        }
    }

    /// Forget all tracked state and conflicts. Held locks are left alone.
    pub fn clear(&self) {
        {
            let mut book = self.book();
            book.active.clear();
            book.resolved.clear();
            book.resolved_order.clear();
        }
        self.tracker.clear();
        self.hashes.clear_all();
        self.locks.prune_idle();
        info!(root = %self.root.display(), "detector state cleared");
    }
}

/// Watcher callback holding only a weak reference to its detector.
struct DetectorWatchHandler {
    detector: Weak<ConflictDetector>,
}

impl WatchHandler for DetectorWatchHandler {
    async fn on_change(&self, event: WatchEvent) {
        let Some(detector) = self.detector.upgrade() else {
            return;
        };
        if let Err(e) = detector
            .handle_external_change(&event.path, event.kind)
            .await
        {
            warn!(path = %event.path.display(), error = %e, "failed to record external change");
        }
    }

    async fn on_error(&self, error: String) {
        warn!(error = %error, "file watcher reported an error");
    }
}
