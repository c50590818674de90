//! Content fingerprints for optimistic concurrency.
//!
//! The [`HashTracker`] remembers the last fingerprint observed per path and
//! answers "has this file changed since I last saw hash H?". Tracked paths are
//! answered from memory; the first check on an untracked path reads the disk
//! and records the result as a new baseline.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::errors::TrackerError;
use crate::fs::WorkspaceFs;
use crate::path::{PathKey, PathNormalizer};

/// Session id recorded for baselines read straight from disk.
pub const DISK_BASELINE_SESSION: &str = "disk";

/// Number of digest bytes kept in a fingerprint (16 hex characters).
const FINGERPRINT_BYTES: usize = 8;

/// Fingerprint `content`: a truncated SHA-256, hex encoded.
pub fn content_hash(content: impl AsRef<[u8]>) -> String {
    let digest = Sha256::digest(content.as_ref());
    hex::encode(&digest[..FINGERPRINT_BYTES])
}

/// Last fingerprint seen for a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HashRecord {
    pub hash: String,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    /// Monotonic per-tracker counter; a later record always has a larger
    /// revision regardless of wall-clock adjustments.
    pub revision: u64,
}

/// Outcome of [`HashTracker::detect_conflict`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HashCheck {
    pub has_conflict: bool,
    /// `None` when the file is neither tracked nor present on disk.
    pub current_hash: Option<String>,
    pub expected_hash: String,
    pub last_modified_by: Option<String>,
    pub last_modified_at: Option<DateTime<Utc>>,
}

/// Registry of the most recent fingerprint per path.
pub struct HashTracker {
    normalizer: PathNormalizer,
    fs: WorkspaceFs,
    records: Mutex<HashMap<PathKey, HashRecord>>,
    next_revision: AtomicU64,
}

impl HashTracker {
    pub fn new(normalizer: PathNormalizer, fs: WorkspaceFs) -> Self {
        Self {
            normalizer,
            fs,
            records: Mutex::new(HashMap::new()),
            next_revision: AtomicU64::new(1),
        }
    }

    fn records(&self) -> MutexGuard<'_, HashMap<PathKey, HashRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| {
            warn!("hash registry mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Fingerprint and record `content` as the latest state of `path`.
    pub fn record(&self, path: &Path, content: impl AsRef<[u8]>, session_id: &str) -> String {
        let hash = content_hash(content);
        self.record_hash(path, &hash, session_id);
        hash
    }

    /// Record an already computed fingerprint, replacing any existing entry.
    pub fn record_hash(&self, path: &Path, hash: &str, session_id: &str) {
        let key = self.normalizer.normalize_path(path);
        let record = self.new_record(hash, session_id);
        debug!(path = %path.display(), hash, session_id, "hash recorded");
        self.records().insert(key, record);
    }

    /// Record `hash` only if the entry for `path` is still the one observed
    /// at `observed_revision` (`None` meaning no entry). Returns whether the
    /// record was stored.
    pub fn record_hash_if_unchanged(
        &self,
        path: &Path,
        hash: &str,
        session_id: &str,
        observed_revision: Option<u64>,
    ) -> bool {
        let key = self.normalizer.normalize_path(path);
        let mut records = self.records();
        if records.get(&key).map(|r| r.revision) != observed_revision {
            debug!(path = %path.display(), hash, "hash changed concurrently, not recording");
            return false;
        }
        let record = self.new_record(hash, session_id);
        debug!(path = %path.display(), hash, session_id, "hash recorded");
        records.insert(key, record);
        true
    }

    fn new_record(&self, hash: &str, session_id: &str) -> HashRecord {
        HashRecord {
            hash: hash.to_string(),
            timestamp: Utc::now(),
            session_id: session_id.to_string(),
            revision: self.next_revision.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn get(&self, path: &Path) -> Option<HashRecord> {
        let key = self.normalizer.normalize_path(path);
        self.records().get(&key).cloned()
    }

    /// Compare `expected_hash` against the latest known fingerprint of `path`.
    ///
    /// Tracked paths are compared in memory. An untracked path is read from
    /// disk and recorded as a baseline; a missing file never conflicts.
    pub async fn detect_conflict(
        &self,
        path: &Path,
        expected_hash: &str,
    ) -> Result<HashCheck, TrackerError> {
        if let Some(record) = self.get(path) {
            return Ok(HashCheck {
                has_conflict: record.hash != expected_hash,
                current_hash: Some(record.hash),
                expected_hash: expected_hash.to_string(),
                last_modified_by: Some(record.session_id),
                last_modified_at: Some(record.timestamp),
            });
        }

        let Some(bytes) = self.fs.read(path).await? else {
            debug!(path = %path.display(), "untracked file missing on disk, no conflict");
            return Ok(HashCheck {
                has_conflict: false,
                current_hash: None,
                expected_hash: expected_hash.to_string(),
                last_modified_by: None,
                last_modified_at: None,
            });
        };

        let disk_hash = self.record(path, &bytes, DISK_BASELINE_SESSION);
        let record = self.get(path);
        Ok(HashCheck {
            has_conflict: disk_hash != expected_hash,
            current_hash: Some(disk_hash),
            expected_hash: expected_hash.to_string(),
            last_modified_by: record.as_ref().map(|r| r.session_id.clone()),
            last_modified_at: record.map(|r| r.timestamp),
        })
    }

    pub fn invalidate(&self, path: &Path) -> bool {
        let key = self.normalizer.normalize_path(path);
        self.records().remove(&key).is_some()
    }

    pub fn clear_all(&self) {
        self.records().clear();
    }

    /// Drop records older than `max_age`. Returns how many were removed.
    pub fn cleanup_older_than(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());
        let mut records = self.records();
        let before = records.len();
        records.retain(|_, record| record.timestamp >= cutoff);
        before - records.len()
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_tracker() -> HashTracker {
        HashTracker::new(PathNormalizer::new(true), WorkspaceFs::default())
    }

    #[test]
    fn test_content_hash_is_short_and_stable() {
        let h = content_hash("hello");
        assert_eq!(h.len(), 16);
        assert_eq!(h, content_hash(b"hello".to_vec()));
        assert_ne!(h, content_hash("hello!"));
    }

    #[test]
    fn test_record_overwrites_and_folds_case() {
        let tracker = new_tracker();
        tracker.record(Path::new("/w/A.txt"), "one", "s1");
        let h2 = tracker.record(Path::new("/w/a.TXT"), "two", "s2");

        assert_eq!(tracker.len(), 1);
        let record = tracker.get(Path::new("/w/a.txt")).unwrap();
        assert_eq!(record.hash, h2);
        assert_eq!(record.session_id, "s2");
    }

    #[tokio::test]
    async fn test_detect_conflict_tracked_path_uses_memory() {
        let tracker = new_tracker();
        let path = Path::new("/definitely/not/on/disk.txt");
        let h = tracker.record(path, "content", "s1");

        assert!(!tracker.detect_conflict(path, &h).await.unwrap().has_conflict);
        let check = tracker.detect_conflict(path, "0000").await.unwrap();
        assert!(check.has_conflict);
        assert_eq!(check.current_hash.as_deref(), Some(h.as_str()));
        assert_eq!(check.last_modified_by.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_detect_conflict_untracked_reads_disk_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, "on disk").unwrap();
        let tracker = new_tracker();

        let check = tracker.detect_conflict(&path, &content_hash("stale")).await.unwrap();
        assert!(check.has_conflict);
        assert_eq!(check.current_hash, Some(content_hash("on disk")));
        assert_eq!(
            tracker.get(&path).unwrap().session_id,
            DISK_BASELINE_SESSION
        );

        let tracker = new_tracker();
        let check = tracker
            .detect_conflict(&path, &content_hash("on disk"))
            .await
            .unwrap();
        assert!(!check.has_conflict);
    }

    #[tokio::test]
    async fn test_detect_conflict_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = new_tracker();
        let check = tracker
            .detect_conflict(&dir.path().join("missing.txt"), "abc")
            .await
            .unwrap();
        assert!(!check.has_conflict);
        assert!(check.current_hash.is_none());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_invalidate_and_cleanup() {
        let tracker = new_tracker();
        tracker.record(Path::new("/w/a"), "a", "s1");
        tracker.record(Path::new("/w/b"), "b", "s1");

        assert!(tracker.invalidate(Path::new("/w/a")));
        assert!(!tracker.invalidate(Path::new("/w/a")));
        assert_eq!(tracker.cleanup_older_than(Duration::from_secs(3600)), 0);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(tracker.cleanup_older_than(Duration::ZERO), 1);
        assert!(tracker.is_empty());

        tracker.record(Path::new("/w/c"), "c", "s1");
        tracker.clear_all();
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_record_always_replaces_with_higher_revision() {
        let tracker = new_tracker();
        let path = Path::new("/w/f.txt");
        tracker.record(path, "one", "s1");
        let first = tracker.get(path).unwrap();
        let h2 = tracker.record(path, "two", "s2");
        let second = tracker.get(path).unwrap();

        assert_eq!(second.hash, h2);
        assert!(second.revision > first.revision);
    }

    #[test]
    fn test_record_hash_if_unchanged() {
        let tracker = new_tracker();
        let path = Path::new("/w/f.txt");

        assert!(tracker.record_hash_if_unchanged(path, "aaaa", "reader", None));
        let seen = tracker.get(path).unwrap().revision;
        assert!(!tracker.record_hash_if_unchanged(path, "bbbb", "reader", None));

        tracker.record_hash(path, "cccc", "writer");
        assert!(!tracker.record_hash_if_unchanged(path, "aaaa", "reader", Some(seen)));
        assert_eq!(tracker.get(path).unwrap().hash, "cccc");

        let current = tracker.get(path).unwrap().revision;
        assert!(tracker.record_hash_if_unchanged(path, "dddd", "reader", Some(current)));
        assert_eq!(tracker.get(path).unwrap().hash, "dddd");
    }
}
