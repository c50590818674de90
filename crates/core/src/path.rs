//! Path canonicalization for tracker keys.
//!
//! Every map in the core (locks, hashes, tracked files) is keyed by a
//! [`PathKey`] so that `/A/b.txt`, `/a/B.TXT` and `\a\b.txt` land on the same
//! entry when case folding is enabled. Normalization is purely lexical; it
//! never touches the filesystem.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// A normalized, comparable path key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PathKey(String);

impl PathKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PathKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lexical path normalizer: separator unification, `.`/`..` folding and
/// optional case folding.
#[derive(Debug, Clone, Copy)]
pub struct PathNormalizer {
    case_insensitive: bool,
}

impl Default for PathNormalizer {
    fn default() -> Self {
        Self::new(true)
    }
}

impl PathNormalizer {
    pub fn new(case_insensitive: bool) -> Self {
        Self { case_insensitive }
    }

    pub fn is_case_insensitive(&self) -> bool {
        self.case_insensitive
    }

    /// Normalize a raw path string into a [`PathKey`].
    pub fn normalize(&self, raw: &str) -> PathKey {
        let unified = raw.replace('\\', "/");
        let absolute = unified.starts_with('/');

        let mut segments: Vec<&str> = Vec::new();
        for segment in unified.split('/') {
            match segment {
                "" | "." => {}
                ".." => match segments.last() {
                    // A drive prefix such as `c:` is a root.
                    Some(last) if is_drive(last) => {}
                    Some(last) if *last != ".." => {
                        segments.pop();
                    }
                    _ if absolute => {}
                    _ => segments.push(".."),
                },
                other => segments.push(other),
            }
        }

        let mut key = segments.join("/");
        if absolute {
            key.insert(0, '/');
        }
        if self.case_insensitive {
            key = key.to_lowercase();
        }
        PathKey(key)
    }

    /// Normalize a [`Path`].
    pub fn normalize_path(&self, path: &Path) -> PathKey {
        self.normalize(&path.to_string_lossy())
    }

    /// Workspace-relative display path for `abs` under `root`, using `/`
    /// separators. Falls back to the normalized key when `abs` is outside
    /// the root.
    pub fn relative_to(&self, root: &Path, abs: &Path) -> String {
        if let Ok(rel) = abs.strip_prefix(root) {
            return rel.to_string_lossy().replace('\\', "/");
        }

        let root_key = self.normalize_path(root);
        let abs_key = self.normalize_path(abs);
        let prefix = format!("{}/", root_key.as_str().trim_end_matches('/'));
        match abs_key.as_str().strip_prefix(&prefix) {
            Some(rel) => rel.to_string(),
            None => abs_key.0,
        }
    }
}

/// Resolve `path` against `root` when it is relative.
pub fn resolve_in_root(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

fn is_drive(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    bytes.len() == 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_and_separator_folding() {
        let n = PathNormalizer::new(true);
        assert_eq!(n.normalize("/A/b.txt"), n.normalize("/a/B.TXT"));
        assert_eq!(n.normalize("\\a\\b.txt"), n.normalize("/a/b.txt"));
        assert_eq!(n.normalize("/a/b.txt").as_str(), "/a/b.txt");
    }

    #[test]
    fn test_case_sensitive_keeps_case() {
        let n = PathNormalizer::new(false);
        assert_ne!(n.normalize("/A/b.txt"), n.normalize("/a/B.TXT"));
        assert_eq!(n.normalize("/A//b.txt/").as_str(), "/A/b.txt");
    }

    #[test]
    fn test_dot_segments() {
        let n = PathNormalizer::new(false);
        assert_eq!(n.normalize("/a/./b/../c.txt").as_str(), "/a/c.txt");
        assert_eq!(n.normalize("/../a").as_str(), "/a");
        assert_eq!(n.normalize("../a/b").as_str(), "../a/b");
        assert_eq!(n.normalize("c:\\dir\\..\\..\\x").as_str(), "c:/x");
    }

    #[test]
    fn test_relative_to() {
        let n = PathNormalizer::new(true);
        let root = Path::new("/srv/work");
        assert_eq!(n.relative_to(root, Path::new("/srv/work/src/lib.rs")), "src/lib.rs");
        assert_eq!(n.relative_to(root, Path::new("/SRV/Work/README.md")), "readme.md");
        assert_eq!(n.relative_to(root, Path::new("/elsewhere/x")), "/elsewhere/x");
    }

    #[test]
    fn test_resolve_in_root() {
        let root = Path::new("/srv/work");
        assert_eq!(
            resolve_in_root(root, Path::new("a.txt")),
            PathBuf::from("/srv/work/a.txt")
        );
        assert_eq!(
            resolve_in_root(root, Path::new("/tmp/a.txt")),
            PathBuf::from("/tmp/a.txt")
        );
    }
}
