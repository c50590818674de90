//! Conflict detection, three-way merging, and resolution management.
//!
//! The conflict subsystem is responsible for:
//! 1. **Detection** -- validating each write's expected fingerprint under the
//!    path lock and recording a conflict when it is stale.
//! 2. **Merging** -- proposing a line-based three-way merge for every
//!    text conflict.
//! 3. **Resolution** -- committing the chosen content exactly once.

pub mod detector;
pub mod merger;
pub mod registry;
pub mod resolver;

pub use detector::{
    Conflict, ConflictDetail, ConflictDetector, ConflictStatus, ConflictType, InvolvedSession,
    ReadOutcome, ResolveOutcome, WriteResult,
};
pub use merger::{MergeConflict, MergeRequest, MergeResult, MergeStats, Merger};
pub use registry::DetectorRegistry;
pub use resolver::{ConflictResolver, Resolution};
