//! Concord core library.
//!
//! This crate provides the foundational components for coordinating
//! concurrent edits to workspace files: path normalization, per-path locks,
//! content fingerprints, version history, conflict detection, three-way
//! merging, and the filesystem watcher.

pub mod config;
pub mod conflict;
pub mod errors;
pub mod fs;
pub mod hash;
pub mod lock;
pub mod models;
pub mod path;
pub mod tracker;
pub mod watcher;
pub mod writer;

// Re-exports for convenience.
pub use config::AppConfig;
pub use conflict::{ConflictDetector, DetectorRegistry};
pub use hash::HashTracker;
pub use lock::LockManager;
pub use tracker::ChangeTracker;
