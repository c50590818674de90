//! REST API endpoint modules.

pub mod conflicts;
pub mod files;
pub mod locks;
pub mod merge;
pub mod sessions;
pub mod status;
