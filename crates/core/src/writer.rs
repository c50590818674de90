//! Lock-guarded, hash-checked file writes.
//!
//! [`SafeFileWriter::write`] is the standalone form of the write pipeline:
//! take the path lock, compare the caller's expected fingerprint, then apply
//! a [`ConflictPolicy`]. [`SafeFileWriter::commit`] is the final step on its
//! own, used by callers that already hold the lock.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::conflict::merger::{MergeResult, Merger};
use crate::errors::ConflictError;
use crate::fs::{FileContent, WorkspaceFs};
use crate::hash::HashTracker;
use crate::lock::{LockHandle, LockManager};

/// What to do when the expected fingerprint no longer matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Leave the file untouched.
    Reject,
    /// Write anyway.
    Overwrite,
    /// Three-way merge against `base`; write only if the merge is clean.
    Merge { base: String },
}

/// Result of [`SafeFileWriter::write`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WriteOutcome {
    Written { hash: String, merged: bool },
    Rejected { current_hash: Option<String> },
    Conflicted {
        current_hash: Option<String>,
        merge: MergeResult,
    },
}

pub struct SafeFileWriter {
    locks: Arc<LockManager>,
    hashes: Arc<HashTracker>,
    fs: WorkspaceFs,
}

impl SafeFileWriter {
    pub fn new(locks: Arc<LockManager>, hashes: Arc<HashTracker>, fs: WorkspaceFs) -> Self {
        Self { locks, hashes, fs }
    }

    /// Persist `bytes` atomically and record their fingerprint for the lock
    /// holder. The caller must hold the lock on `path`.
    pub async fn commit(
        &self,
        lock: &LockHandle,
        path: &Path,
        bytes: &[u8],
    ) -> Result<String, ConflictError> {
        self.fs
            .write(path, bytes)
            .await
            .map_err(|source| ConflictError::Io {
                path: path.display().to_string(),
                source,
            })?;
        let hash = self.hashes.record(path, bytes, lock.session_id());
        debug!(path = %path.display(), hash = %hash, session_id = lock.session_id(), "content committed");
        Ok(hash)
    }

    /// Write `content` to `path` on behalf of `session_id`.
    pub async fn write(
        &self,
        path: &Path,
        content: &str,
        session_id: &str,
        expected_hash: Option<&str>,
        policy: &ConflictPolicy,
    ) -> Result<WriteOutcome, ConflictError> {
        let lock = self
            .locks
            .acquire(&path.to_string_lossy(), session_id, None)
            .await?;

        if let Some(expected) = expected_hash {
            let check = self.hashes.detect_conflict(path, expected).await?;
            if check.has_conflict {
                match policy {
                    ConflictPolicy::Reject => {
                        info!(path = %path.display(), session_id, "stale write rejected");
                        return Ok(WriteOutcome::Rejected {
                            current_hash: check.current_hash,
                        });
                    }
                    ConflictPolicy::Overwrite => {
                        warn!(path = %path.display(), session_id, "overwriting a newer version");
                    }
                    ConflictPolicy::Merge { base } => {
                        let merge = match self.fs.read_content(path).await? {
                            Some(FileContent::Text(theirs)) => {
                                Merger::three_way_merge(base, content, &theirs)
                            }
                            Some(FileContent::Binary(_)) => {
                                MergeResult::failure("binary content cannot be merged")
                            }
                            None => Merger::three_way_merge(base, content, ""),
                        };
                        if let (true, Some(merged)) = (merge.can_auto_merge(), &merge.merged) {
                            let hash = self.commit(&lock, path, merged.as_bytes()).await?;
                            lock.release();
                            info!(path = %path.display(), session_id, "write merged cleanly");
                            return Ok(WriteOutcome::Written { hash, merged: true });
                        }
                        return Ok(WriteOutcome::Conflicted {
                            current_hash: check.current_hash,
                            merge,
                        });
                    }
                }
            }
        }

        let hash = self.commit(&lock, path, content.as_bytes()).await?;
        lock.release();
        Ok(WriteOutcome::Written {
            hash,
            merged: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::content_hash;
    use crate::lock::DEFAULT_LOCK_TIMEOUT;
    use crate::path::PathNormalizer;

    fn writer() -> (SafeFileWriter, Arc<LockManager>, Arc<HashTracker>) {
        let normalizer = PathNormalizer::new(false);
        let locks = LockManager::new(normalizer.clone(), DEFAULT_LOCK_TIMEOUT);
        let hashes = Arc::new(HashTracker::new(normalizer, WorkspaceFs::default()));
        (
            SafeFileWriter::new(Arc::clone(&locks), Arc::clone(&hashes), WorkspaceFs::default()),
            locks,
            hashes,
        )
    }

    #[tokio::test]
    async fn test_write_without_expectation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/a.txt");
        let (writer, locks, hashes) = writer();

        let outcome = writer
            .write(&path, "hello", "s1", None, &ConflictPolicy::Reject)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            WriteOutcome::Written {
                hash: content_hash("hello"),
                merged: false
            }
        );
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
        assert_eq!(hashes.get(&path).unwrap().session_id, "s1");
        assert!(!locks.is_locked(&path.to_string_lossy()));
    }

    #[tokio::test]
    async fn test_stale_write_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "current").unwrap();
        let (writer, locks, _) = writer();

        let outcome = writer
            .write(&path, "mine", "s1", Some(&content_hash("old")), &ConflictPolicy::Reject)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            WriteOutcome::Rejected {
                current_hash: Some(content_hash("current"))
            }
        );
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "current");
        assert!(!locks.is_locked(&path.to_string_lossy()));
    }

    #[tokio::test]
    async fn test_overwrite_policy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "current").unwrap();
        let (writer, _, _) = writer();

        let outcome = writer
            .write(&path, "mine", "s1", Some("0000"), &ConflictPolicy::Overwrite)
            .await
            .unwrap();
        assert!(matches!(outcome, WriteOutcome::Written { merged: false, .. }));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "mine");
    }

    #[tokio::test]
    async fn test_merge_policy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        let base = "one\ntwo\nthree\n";
        std::fs::write(&path, "one\ntwo\nTHREE\n").unwrap();
        let (writer, _, _) = writer();

        let policy = ConflictPolicy::Merge { base: base.into() };
        let outcome = writer
            .write(&path, "ONE\ntwo\nthree\n", "s1", Some(&content_hash(base)), &policy)
            .await
            .unwrap();
        assert!(matches!(outcome, WriteOutcome::Written { merged: true, .. }));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "ONE\ntwo\nTHREE\n");

        let outcome = writer
            .write(&path, "one\nmine\nthree\n", "s2", Some(&content_hash(base)), &ConflictPolicy::Merge {
                base: "one\ntwo\nthree\n".into(),
            })
            .await
            .unwrap();
        assert!(matches!(outcome, WriteOutcome::Written { merged: true, .. }));

        let outcome = writer
            .write(&path, "one\nyours\nthree\n", "s3", Some(&content_hash(base)), &policy)
            .await
            .unwrap();
        match outcome {
            WriteOutcome::Conflicted { merge, .. } => assert!(merge.has_conflicts),
            other => panic!("expected conflict, got {:?}", other),
        }
    }
}
