//! Per-file version history and live session sets.
//!
//! The [`ChangeTracker`] keeps, for every tracked file, its current
//! fingerprint, the sessions reading and writing it, and a bounded history of
//! [`FileVersion`]s (oldest evicted first). Write and external versions keep
//! their content so merge inputs can be reconstructed later; read versions do
//! not, but the text seen by a read is kept in a small per-file content cache
//! for the same purpose.
//!
//! Lookups on unknown paths return empty results rather than errors.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::path::{PathKey, PathNormalizer};

/// Session id used for changes made outside any tracked session.
pub const EXTERNAL_SESSION: &str = "external";
/// Instance id paired with [`EXTERNAL_SESSION`].
pub const WATCHER_INSTANCE: &str = "watcher";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// How a version entered the history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VersionKind {
    Read,
    Write,
    External,
}

/// One observed state of a file.
#[derive(Debug, Clone, Serialize)]
pub struct FileVersion {
    pub hash: String,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub instance_id: String,
    pub kind: VersionKind,
    /// Text content; kept for writes and external changes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Live state of a tracked file.
#[derive(Debug, Clone, Serialize)]
pub struct TrackedFile {
    /// Workspace-relative path.
    pub path: String,
    pub absolute_path: PathBuf,
    /// `None` once the file has been removed from disk.
    pub current_hash: Option<String>,
    pub is_binary: bool,
    pub size: u64,
    pub readers: BTreeSet<String>,
    pub writers: BTreeSet<String>,
    pub last_modified: DateTime<Utc>,
}

/// Aggregate counters over the whole tracker.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct TrackerStats {
    pub tracked_files: usize,
    pub total_versions: usize,
    pub active_sessions: usize,
}

/// What the caller observed when recording a version.
#[derive(Debug, Clone)]
pub struct Observation<'a> {
    pub absolute_path: &'a Path,
    pub session_id: &'a str,
    pub instance_id: &'a str,
    /// `None` when the file is missing.
    pub hash: Option<&'a str>,
    pub size: u64,
    pub is_binary: bool,
    /// Text content, if the file is text.
    pub content: Option<&'a str>,
}

struct FileEntry {
    file: TrackedFile,
    history: VecDeque<FileVersion>,
    /// (hash, text) pairs seen by reads, newest last.
    content_cache: VecDeque<(String, String)>,
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Bounded version history and session sets for one workspace root.
pub struct ChangeTracker {
    root: PathBuf,
    normalizer: PathNormalizer,
    max_history: usize,
    files: Mutex<HashMap<PathKey, FileEntry>>,
}

impl ChangeTracker {
    pub fn new(root: impl Into<PathBuf>, normalizer: PathNormalizer, max_history: usize) -> Self {
        Self {
            root: root.into(),
            normalizer,
            max_history: max_history.max(1),
            files: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    fn files(&self) -> MutexGuard<'_, HashMap<PathKey, FileEntry>> {
        self.files.lock().unwrap_or_else(|poisoned| {
            warn!("change tracker mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Record a read: appends a content-less version and adds the session to
    /// the reader set.
    pub fn record_read(&self, obs: Observation<'_>) {
        self.record(obs, VersionKind::Read);
    }

    /// Record a committed write: appends a content-bearing version and adds
    /// the session to the writer set.
    pub fn record_write(&self, obs: Observation<'_>) {
        self.record(obs, VersionKind::Write);
    }

    /// Record a change made outside any tracked session.
    pub fn record_external(&self, obs: Observation<'_>) {
        self.record(obs, VersionKind::External);
    }

    fn record(&self, obs: Observation<'_>, kind: VersionKind) {
        let key = self.normalizer.normalize_path(obs.absolute_path);
        let now = Utc::now();
        let max = self.max_history;
        let relative = self.normalizer.relative_to(&self.root, obs.absolute_path);

        let mut files = self.files();
        let entry = files.entry(key).or_insert_with(|| FileEntry {
            file: TrackedFile {
                path: relative,
                absolute_path: obs.absolute_path.to_path_buf(),
                current_hash: None,
                is_binary: obs.is_binary,
                size: 0,
                readers: BTreeSet::new(),
                writers: BTreeSet::new(),
                last_modified: now,
            },
            history: VecDeque::new(),
            content_cache: VecDeque::new(),
        });

        // Missing files are recorded with the fingerprint of empty content.
        let hash = obs
            .hash
            .map(str::to_string)
            .unwrap_or_else(|| crate::hash::content_hash(b""));

        let changed = entry.file.current_hash.as_deref() != obs.hash;
        entry.file.current_hash = obs.hash.map(str::to_string);
        entry.file.size = obs.size;
        entry.file.is_binary = obs.is_binary;
        if changed || kind != VersionKind::Read {
            entry.file.last_modified = now;
        }

        match kind {
            VersionKind::Read => {
                entry.file.readers.insert(obs.session_id.to_string());
            }
            VersionKind::Write => {
                entry.file.writers.insert(obs.session_id.to_string());
            }
            VersionKind::External => {}
        }

        let content = match kind {
            VersionKind::Read => {
                if let Some(text) = obs.content {
                    cache_content(&mut entry.content_cache, &hash, text, max);
                }
                None
            }
            VersionKind::Write | VersionKind::External => obs.content.map(str::to_string),
        };

        entry.history.push_back(FileVersion {
            hash,
            timestamp: now,
            session_id: obs.session_id.to_string(),
            instance_id: obs.instance_id.to_string(),
            kind,
            content,
        });
        while entry.history.len() > max {
            entry.history.pop_front();
        }

        debug!(
            path = %entry.file.path,
            session_id = obs.session_id,
            kind = ?kind,
            versions = entry.history.len(),
            "version recorded"
        );
    }

    pub fn current_hash(&self, absolute_path: &Path) -> Option<String> {
        let key = self.normalizer.normalize_path(absolute_path);
        self.files()
            .get(&key)
            .and_then(|entry| entry.file.current_hash.clone())
    }

    pub fn is_tracked(&self, absolute_path: &Path) -> bool {
        let key = self.normalizer.normalize_path(absolute_path);
        self.files().contains_key(&key)
    }

    pub fn file(&self, absolute_path: &Path) -> Option<TrackedFile> {
        let key = self.normalizer.normalize_path(absolute_path);
        self.files().get(&key).map(|entry| entry.file.clone())
    }

    /// All tracked files, sorted by path.
    pub fn all_files(&self) -> Vec<TrackedFile> {
        let mut files: Vec<TrackedFile> =
            self.files().values().map(|entry| entry.file.clone()).collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        files
    }

    /// Version history, oldest first. Empty for unknown paths.
    pub fn history(&self, absolute_path: &Path) -> Vec<FileVersion> {
        let key = self.normalizer.normalize_path(absolute_path);
        self.files()
            .get(&key)
            .map(|entry| entry.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The most recent write or external version that produced `hash`.
    pub fn last_change_with_hash(&self, absolute_path: &Path, hash: &str) -> Option<FileVersion> {
        let key = self.normalizer.normalize_path(absolute_path);
        self.files().get(&key).and_then(|entry| {
            entry
                .history
                .iter()
                .rev()
                .find(|v| v.hash == hash && v.kind != VersionKind::Read)
                .cloned()
        })
    }

    /// Text content known for `hash`, from history or the read cache.
    pub fn content_for(&self, absolute_path: &Path, hash: &str) -> Option<String> {
        let key = self.normalizer.normalize_path(absolute_path);
        let files = self.files();
        let entry = files.get(&key)?;

        entry
            .history
            .iter()
            .rev()
            .find(|v| v.hash == hash && v.content.is_some())
            .and_then(|v| v.content.clone())
            .or_else(|| {
                entry
                    .content_cache
                    .iter()
                    .rev()
                    .find(|(h, _)| h == hash)
                    .map(|(_, text)| text.clone())
            })
    }

    /// Remove `session_id` from every reader and writer set. History is kept.
    /// Returns the number of files the session was attached to.
    pub fn remove_session(&self, session_id: &str) -> usize {
        let mut touched = 0;
        for entry in self.files().values_mut() {
            let was_reader = entry.file.readers.remove(session_id);
            let was_writer = entry.file.writers.remove(session_id);
            if was_reader || was_writer {
                touched += 1;
            }
        }
        debug!(session_id, files = touched, "session removed from tracker");
        touched
    }

    pub fn stats(&self) -> TrackerStats {
        let files = self.files();
        let mut sessions: HashSet<&str> = HashSet::new();
        let mut total_versions = 0;
        for entry in files.values() {
            total_versions += entry.history.len();
            sessions.extend(entry.file.readers.iter().map(String::as_str));
            sessions.extend(entry.file.writers.iter().map(String::as_str));
        }
        TrackerStats {
            tracked_files: files.len(),
            total_versions,
            active_sessions: sessions.len(),
        }
    }

    pub fn clear(&self) {
        self.files().clear();
    }
}

fn cache_content(cache: &mut VecDeque<(String, String)>, hash: &str, text: &str, max: usize) {
    if cache.iter().any(|(h, _)| h == hash) {
        return;
    }
    cache.push_back((hash.to_string(), text.to_string()));
    while cache.len() > max {
        cache.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::content_hash;

    fn tracker(max: usize) -> ChangeTracker {
        ChangeTracker::new("/w", PathNormalizer::new(true), max)
    }

    fn obs<'a>(path: &'a Path, session: &'a str, hash: &'a str, content: Option<&'a str>) -> Observation<'a> {
        Observation {
            absolute_path: path,
            session_id: session,
            instance_id: "i1",
            hash: Some(hash),
            size: content.map(|c| c.len() as u64).unwrap_or(0),
            is_binary: false,
            content,
        }
    }

    #[test]
    fn test_read_then_write_history() {
        let t = tracker(10);
        let path = Path::new("/w/src/a.txt");
        let h0 = content_hash("v0");
        let h1 = content_hash("v1");

        t.record_read(obs(path, "s1", &h0, Some("v0")));
        t.record_write(obs(path, "s2", &h1, Some("v1")));

        let history = t.history(path);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].kind, VersionKind::Read);
        assert!(history[0].content.is_none());
        assert_eq!(history[1].content.as_deref(), Some("v1"));

        let file = t.file(path).unwrap();
        assert_eq!(file.path, "src/a.txt");
        assert_eq!(file.current_hash.as_deref(), Some(h1.as_str()));
        assert!(file.readers.contains("s1"));
        assert!(file.writers.contains("s2"));

        // Read content is still recoverable for merges.
        assert_eq!(t.content_for(path, &h0).as_deref(), Some("v0"));
        assert_eq!(t.content_for(path, &h1).as_deref(), Some("v1"));
        assert_eq!(t.last_change_with_hash(path, &h1).unwrap().session_id, "s2");
        assert!(t.last_change_with_hash(path, &h0).is_none());
    }

    #[test]
    fn test_history_is_bounded() {
        let t = tracker(3);
        let path = Path::new("/w/a.txt");
        for i in 0..5 {
            let content = format!("v{i}");
            let hash = content_hash(&content);
            t.record_write(obs(path, "s1", &hash, Some(content.as_str())));
        }
        let history = t.history(path);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].content.as_deref(), Some("v2"));
        assert_eq!(history[2].content.as_deref(), Some("v4"));
    }

    #[test]
    fn test_case_folded_paths_share_one_entry() {
        let t = tracker(10);
        let h = content_hash("x");
        t.record_write(obs(Path::new("/w/A/b.txt"), "s1", &h, Some("x")));
        t.record_write(obs(Path::new("/w/a/B.TXT"), "s2", &h, Some("x")));
        assert_eq!(t.all_files().len(), 1);
        assert_eq!(t.history(Path::new("/W/a/b.txt")).len(), 2);
    }

    #[test]
    fn test_unknown_path_is_empty() {
        let t = tracker(10);
        let path = Path::new("/w/nope");
        assert!(t.history(path).is_empty());
        assert!(t.file(path).is_none());
        assert!(t.current_hash(path).is_none());
        assert!(t.content_for(path, "abc").is_none());
    }

    #[test]
    fn test_remove_session_and_stats() {
        let t = tracker(10);
        let h = content_hash("x");
        t.record_read(obs(Path::new("/w/a"), "s1", &h, Some("x")));
        t.record_read(obs(Path::new("/w/b"), "s1", &h, Some("x")));
        t.record_write(obs(Path::new("/w/b"), "s2", &h, Some("x")));

        assert_eq!(
            t.stats(),
            TrackerStats {
                tracked_files: 2,
                total_versions: 3,
                active_sessions: 2
            }
        );

        assert_eq!(t.remove_session("s1"), 2);
        let stats = t.stats();
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(stats.total_versions, 3);

        t.clear();
        assert_eq!(t.stats(), TrackerStats::default());
    }

    #[test]
    fn test_external_change_of_missing_file() {
        let t = tracker(10);
        let path = Path::new("/w/gone.txt");
        t.record_external(Observation {
            absolute_path: path,
            session_id: EXTERNAL_SESSION,
            instance_id: WATCHER_INSTANCE,
            hash: None,
            size: 0,
            is_binary: false,
            content: None,
        });
        assert!(t.current_hash(path).is_none());
        let history = t.history(path);
        assert_eq!(history[0].hash, content_hash(b""));
        assert_eq!(history[0].kind, VersionKind::External);
    }
}
