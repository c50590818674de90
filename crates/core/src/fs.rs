//! Filesystem access used by the trackers and the conflict detector.
//!
//! A missing file is never an error here: reads return `None` so callers can
//! treat "not found" as "no conflict" / empty history.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::errors::TrackerError;

/// Suffix of the scratch files used for atomic writes. The watcher ignores
/// paths ending with it.
pub const TEMP_SUFFIX: &str = ".concord.tmp";

/// Content read from disk, classified as text or binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContent {
    Text(String),
    Binary(Vec<u8>),
}

impl FileContent {
    /// Classify raw bytes. A NUL byte within the first `sniff_len` bytes, or
    /// invalid UTF-8 anywhere, makes the content binary.
    pub fn classify(bytes: Vec<u8>, sniff_len: usize) -> Self {
        if has_nul_within(&bytes, sniff_len) {
            return Self::Binary(bytes);
        }
        match String::from_utf8(bytes) {
            Ok(text) => Self::Text(text),
            Err(e) => Self::Binary(e.into_bytes()),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(s) => s.as_bytes(),
            Self::Binary(b) => b,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Binary(_) => None,
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }

    pub fn len(&self) -> u64 {
        self.as_bytes().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

/// Async filesystem collaborator backed by `tokio::fs`.
#[derive(Debug, Clone)]
pub struct WorkspaceFs {
    binary_sniff_bytes: usize,
}

impl Default for WorkspaceFs {
    fn default() -> Self {
        Self::new(8000)
    }
}

impl WorkspaceFs {
    pub fn new(binary_sniff_bytes: usize) -> Self {
        Self { binary_sniff_bytes }
    }

    /// Read raw bytes; `Ok(None)` when the file does not exist.
    pub async fn read(&self, path: &Path) -> Result<Option<Vec<u8>>, TrackerError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(TrackerError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    /// Read and classify content; `Ok(None)` when the file does not exist.
    pub async fn read_content(&self, path: &Path) -> Result<Option<FileContent>, TrackerError> {
        Ok(self
            .read(path)
            .await?
            .map(|bytes| FileContent::classify(bytes, self.binary_sniff_bytes)))
    }

    /// Write `bytes` to `path`, creating parent directories. The data goes to
    /// a sibling scratch file first and is renamed into place.
    pub async fn write(&self, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = temp_path_for(path);
        tokio::fs::write(&tmp, bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }

        debug!(path = %path.display(), bytes = bytes.len(), "file written");
        Ok(())
    }

    pub async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    pub fn classify(&self, bytes: Vec<u8>) -> FileContent {
        FileContent::classify(bytes, self.binary_sniff_bytes)
    }

    /// Whether `bytes` would be classified as [`FileContent::Binary`].
    pub fn is_binary(&self, bytes: &[u8]) -> bool {
        has_nul_within(bytes, self.binary_sniff_bytes) || std::str::from_utf8(bytes).is_err()
    }
}

fn has_nul_within(bytes: &[u8], sniff_len: usize) -> bool {
    bytes[..bytes.len().min(sniff_len)].contains(&0)
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}{}", name, uuid::Uuid::new_v4().simple(), TEMP_SUFFIX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(
            FileContent::classify(b"hello\n".to_vec(), 8000),
            FileContent::Text("hello\n".into())
        );
        assert!(FileContent::classify(vec![b'a', 0, b'b'], 8000).is_binary());
        assert!(FileContent::classify(vec![0xff, 0xfe, 0xfd], 8000).is_binary());
        // NUL beyond the sniff window is still valid UTF-8 text.
        let mut late_nul = vec![b'a'; 16];
        late_nul.push(0);
        assert!(!FileContent::classify(late_nul, 8).is_binary());
    }

    #[test]
    fn test_is_binary_agrees_with_classify() {
        let fs = WorkspaceFs::new(8);
        let mut late_nul = vec![b'a'; 16];
        late_nul.push(0);
        let samples: [&[u8]; 4] = [b"plain text\n", &[b'a', 0, b'b'], &[0xff, 0xfe], &late_nul];
        for bytes in samples {
            assert_eq!(
                fs.is_binary(bytes),
                fs.classify(bytes.to_vec()).is_binary(),
                "disagreement on {:?}",
                bytes
            );
        }
        assert!(!fs.is_binary(&late_nul));
    }

    #[tokio::test]
    async fn test_read_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let fs = WorkspaceFs::default();
        assert!(fs.read(&dir.path().join("nope.txt")).await.unwrap().is_none());
        assert!(!fs.exists(&dir.path().join("nope.txt")).await);
    }

    #[tokio::test]
    async fn test_write_creates_parents_and_leaves_no_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let fs = WorkspaceFs::default();
        let path = dir.path().join("nested/deeper/file.txt");

        fs.write(&path, b"content").await.unwrap();

        assert_eq!(fs.read(&path).await.unwrap(), Some(b"content".to_vec()));
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(TEMP_SUFFIX))
            .collect();
        assert!(leftovers.is_empty());
    }
}
