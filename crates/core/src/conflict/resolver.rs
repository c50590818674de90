//! Conflict resolution strategies.
//!
//! A [`Resolution`] names how a conflict should be settled; the
//! [`ConflictResolver`] turns it into the content that gets committed.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::conflict::merger::MergeResult;
use crate::errors::ConflictError;

/// How a conflict is settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", content = "content", rename_all = "kebab-case")]
pub enum Resolution {
    /// Commit the clean three-way merge.
    AutoMerged,
    /// Commit the content the conflicting session tried to write.
    KeepOurs,
    /// Keep the content the other party produced.
    KeepTheirs,
    /// Commit caller-provided content.
    Manual(String),
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AutoMerged => write!(f, "auto-merged"),
            Self::KeepOurs => write!(f, "keep-ours"),
            Self::KeepTheirs => write!(f, "keep-theirs"),
            Self::Manual(_) => write!(f, "manual"),
        }
    }
}

impl Resolution {
    /// Build a resolution from its wire name and optional manual content.
    pub fn parse(
        conflict_id: &str,
        strategy: &str,
        content: Option<String>,
    ) -> Result<Self, ConflictError> {
        match strategy {
            "auto-merged" | "auto_merged" | "auto" => Ok(Self::AutoMerged),
            "keep-ours" | "keep_ours" | "ours" => Ok(Self::KeepOurs),
            "keep-theirs" | "keep_theirs" | "theirs" => Ok(Self::KeepTheirs),
            "manual" => content.map(Self::Manual).ok_or_else(|| {
                ConflictError::InvalidResolution {
                    id: conflict_id.to_string(),
                    detail: "manual resolution requires content".into(),
                }
            }),
            other => Err(ConflictError::InvalidResolution {
                id: conflict_id.to_string(),
                detail: format!("unknown strategy '{}'", other),
            }),
        }
    }
}

/// The three inputs captured when a conflict was detected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictSides {
    pub base: String,
    pub ours: String,
    /// `None` when the on-disk side is binary or was removed.
    pub theirs: Option<String>,
    pub is_binary: bool,
}

/// Content a resolution commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedContent {
    Text(String),
    /// Keep whatever is on disk; only its fingerprint is recorded.
    KeepDisk,
}

/// Stateless mapping from a [`Resolution`] to committed content.
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn select(
        conflict_id: &str,
        resolution: &Resolution,
        sides: &ConflictSides,
        merge: &MergeResult,
    ) -> Result<ResolvedContent, ConflictError> {
        debug!(conflict_id, resolution = %resolution, "selecting resolved content");

        match resolution {
            Resolution::AutoMerged => {
                if sides.is_binary {
                    return Err(ConflictError::InvalidResolution {
                        id: conflict_id.to_string(),
                        detail: "binary conflicts cannot be auto-merged".into(),
                    });
                }
                if !merge.can_auto_merge() {
                    return Err(ConflictError::InvalidResolution {
                        id: conflict_id.to_string(),
                        detail: format!(
                            "automatic merge is not clean ({} conflicting regions)",
                            merge.conflicts.len()
                        ),
                    });
                }
                merge
                    .merged
                    .clone()
                    .map(ResolvedContent::Text)
                    .ok_or_else(|| ConflictError::MergeFailed("merge produced no content".into()))
            }
            Resolution::KeepOurs => Ok(ResolvedContent::Text(sides.ours.clone())),
            Resolution::KeepTheirs => Ok(match &sides.theirs {
                Some(text) if !sides.is_binary => ResolvedContent::Text(text.clone()),
                _ => ResolvedContent::KeepDisk,
            }),
            Resolution::Manual(content) => Ok(ResolvedContent::Text(content.clone())),
        }
    }
}
