//! One [`ConflictDetector`] per workspace root.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{info, warn};

use crate::config::WorkspaceConfig;
use crate::conflict::detector::ConflictDetector;
use crate::path::{PathKey, PathNormalizer};

/// Explicit registry of detectors keyed by normalized root path.
pub struct DetectorRegistry {
    config: WorkspaceConfig,
    normalizer: PathNormalizer,
    detectors: Mutex<HashMap<PathKey, Arc<ConflictDetector>>>,
}

impl DetectorRegistry {
    pub fn new(config: WorkspaceConfig) -> Self {
        Self {
            normalizer: PathNormalizer::new(config.case_insensitive),
            config,
            detectors: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    fn detectors(&self) -> MutexGuard<'_, HashMap<PathKey, Arc<ConflictDetector>>> {
        self.detectors.lock().unwrap_or_else(|poisoned| {
            warn!("detector registry mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// The detector for `root`, created on first use.
    pub fn get_or_create(&self, root: &Path) -> Arc<ConflictDetector> {
        let key = self.normalizer.normalize_path(root);
        let mut detectors = self.detectors();
        Arc::clone(detectors.entry(key).or_insert_with(|| {
            info!(root = %root.display(), "registering workspace root");
            ConflictDetector::new(root, self.config.clone())
        }))
    }

    pub fn get(&self, root: &Path) -> Option<Arc<ConflictDetector>> {
        let key = self.normalizer.normalize_path(root);
        self.detectors().get(&key).cloned()
    }

    /// Registered roots, sorted.
    pub fn roots(&self) -> Vec<PathBuf> {
        let mut roots: Vec<PathBuf> = self
            .detectors()
            .values()
            .map(|detector| detector.root().to_path_buf())
            .collect();
        roots.sort();
        roots
    }

    pub fn all(&self) -> Vec<Arc<ConflictDetector>> {
        let mut detectors: Vec<Arc<ConflictDetector>> =
            self.detectors().values().cloned().collect();
        detectors.sort_by(|a, b| a.root().cmp(b.root()));
        detectors
    }

    /// Unregister `root`, stopping its watcher.
    pub fn remove(&self, root: &Path) -> bool {
        let key = self.normalizer.normalize_path(root);
        let removed = self.detectors().remove(&key);
        match removed {
            Some(detector) => {
                detector.stop_watching();
                info!(root = %root.display(), "workspace root removed");
                true
            }
            None => false,
        }
    }

    /// Stop every watcher and drop all detectors.
    pub fn shutdown(&self) {
        let detectors: Vec<Arc<ConflictDetector>> =
            self.detectors().drain().map(|(_, detector)| detector).collect();
        for detector in &detectors {
            detector.stop_watching();
        }
        info!(count = detectors.len(), "detector registry shut down");
    }
}
