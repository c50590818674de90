//! TOML-based configuration system for concord.
//!
//! The daemon loads one [`AppConfig`] at start-up; the `[workspace]` section is
//! handed by value to every conflict detector it creates.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Daemon / logging settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// HTTP API settings.
    #[serde(default)]
    pub web: WebConfig,

    /// Workspace tracking settings.
    pub workspace: WorkspaceConfig,
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional directory for a daily rolling log file.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_dir: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Web
// ---------------------------------------------------------------------------

/// HTTP API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    /// Listen address (default `127.0.0.1:4870`).
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "127.0.0.1:4870".into()
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

// ---------------------------------------------------------------------------
// Workspace
// ---------------------------------------------------------------------------

/// Settings shared by every tracked workspace root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Workspace roots to track. The first one is the API default.
    #[serde(default)]
    pub roots: Vec<PathBuf>,

    /// Fold path case when building tracker keys.
    #[serde(default = "default_true")]
    pub case_insensitive: bool,

    /// Maximum number of versions retained per file.
    #[serde(default = "default_max_history")]
    pub max_history: usize,

    /// Default lock acquisition timeout in milliseconds.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Start a filesystem watcher for each root.
    #[serde(default = "default_true")]
    pub watch: bool,

    /// Glob patterns (relative to the root) the watcher ignores.
    #[serde(default = "default_ignore_patterns")]
    pub ignore_patterns: Vec<String>,

    /// How many leading bytes are inspected for a NUL when classifying binary files.
    #[serde(default = "default_binary_sniff_bytes")]
    pub binary_sniff_bytes: usize,
}

fn default_true() -> bool {
    true
}
fn default_max_history() -> usize {
    50
}
fn default_lock_timeout_ms() -> u64 {
    5000
}
fn default_ignore_patterns() -> Vec<String> {
    vec![".git/**".into(), "target/**".into(), "node_modules/**".into()]
}
fn default_binary_sniff_bytes() -> usize {
    8000
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            case_insensitive: true,
            max_history: default_max_history(),
            lock_timeout_ms: default_lock_timeout_ms(),
            watch: true,
            ignore_patterns: default_ignore_patterns(),
            binary_sniff_bytes: default_binary_sniff_bytes(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & validation
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.web.listen.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidValue {
                field: "web.listen".into(),
                detail: format!("'{}' is not a socket address", self.web.listen),
            });
        }
        self.workspace.validate()
    }

    /// Convenience: load and validate in one call.
    pub fn load_and_validate<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load_from_file(path)?;
        config.validate()?;
        Ok(config)
    }
}

impl WorkspaceConfig {
    /// Validate the workspace section on its own.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.roots.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "workspace.roots".into(),
                detail: "at least one workspace root is required".into(),
            });
        }
        if self.max_history == 0 {
            return Err(ConfigError::InvalidValue {
                field: "workspace.max_history".into(),
                detail: "history cap must be > 0".into(),
            });
        }
        if self.lock_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "workspace.lock_timeout_ms".into(),
                detail: "lock timeout must be > 0".into(),
            });
        }
        Ok(())
    }

    /// Default lock timeout as a [`std::time::Duration`].
    pub fn lock_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.lock_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_toml() -> &'static str {
        r#"
[daemon]
log_level = "debug"
log_dir = "/tmp/concord-logs"

[web]
listen = "0.0.0.0:8080"

[workspace]
roots = ["/srv/project", "/srv/other"]
case_insensitive = false
max_history = 10
lock_timeout_ms = 250
watch = false
ignore_patterns = ["*.tmp"]
"#
    }

    #[test]
    fn test_parse_full_config() {
        let config: AppConfig = toml::from_str(sample_toml()).expect("failed to parse toml");
        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.web.listen, "0.0.0.0:8080");
        assert_eq!(config.workspace.roots.len(), 2);
        assert!(!config.workspace.case_insensitive);
        assert_eq!(config.workspace.max_history, 10);
        assert_eq!(
            config.workspace.lock_timeout(),
            std::time::Duration::from_millis(250)
        );
        assert_eq!(config.workspace.ignore_patterns, vec!["*.tmp"]);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("concord.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(sample_toml().as_bytes()).unwrap();

        let config = AppConfig::load_and_validate(&path).expect("load failed");
        assert_eq!(config.daemon.log_dir, Some(PathBuf::from("/tmp/concord-logs")));
    }

    #[test]
    fn test_file_not_found() {
        let result = AppConfig::load_from_file("/nonexistent/concord.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_validate_rejects_missing_roots() {
        let config: AppConfig = toml::from_str("[workspace]\n").unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "workspace.roots"
        ));
    }

    #[test]
    fn test_validate_rejects_bad_listen() {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.web.listen = "not-an-address".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "web.listen"
        ));
    }

    #[test]
    fn test_defaults() {
        let config: AppConfig = toml::from_str("[workspace]\nroots = [\"/srv\"]\n").unwrap();
        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.web.listen, "127.0.0.1:4870");
        assert!(config.workspace.case_insensitive);
        assert_eq!(config.workspace.max_history, 50);
        assert_eq!(config.workspace.lock_timeout_ms, 5000);
        assert!(config.workspace.watch);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_example_config_is_valid() {
        let config: AppConfig =
            toml::from_str(include_str!("../../../concord.example.toml")).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.workspace.roots, vec![PathBuf::from("/srv/project")]);
        assert_eq!(config.workspace.ignore_patterns.len(), 3);
    }
}
