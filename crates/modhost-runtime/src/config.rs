//! Host configuration.
//!
//! Every field has a default, so an empty file (or none at all) is valid.
//! Values are layered as: optional config file, then `MODHOST_*`
//! environment variables (`MODHOST_DEBOUNCE_MS=200`,
//! `MODHOST_LOGGING__FILTER=debug`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use error_stack::{Report, ResultExt};
use modhost_kernel::config::ConfigLayers;
use serde::{Deserialize, Serialize};

use crate::error::{HostError, HostResult};
use crate::watcher::{WatchConfig, default_ignore_patterns};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "MODHOST";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Directory holding the module tree.
    pub root: PathBuf,
    /// Settle window for change bursts, in milliseconds.
    pub debounce_ms: u64,
    pub watch: WatchSection,
    pub modules: ModulesConfig,
    pub logging: LoggingConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            debounce_ms: 400,
            watch: WatchSection::default(),
            modules: ModulesConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchSection {
    /// Extensions treated as modules; empty accepts every file.
    pub extensions: Vec<String>,
    pub ignore: Vec<String>,
}

impl Default for WatchSection {
    fn default() -> Self {
        Self {
            extensions: Vec::new(),
            ignore: default_ignore_patterns(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModulesConfig {
    /// Paths, relative to `root`, of modules that start disabled.
    pub disabled: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives used when `RUST_LOG` is unset.
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

impl HostConfig {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Load from an optional file plus environment overrides.
    ///
    /// An explicitly named file must exist.
    pub fn load(path: Option<&Path>) -> HostResult<Self> {
        let mut layers = ConfigLayers::new();
        if let Some(path) = path {
            layers = layers.file(path);
        }
        layers
            .env(ENV_PREFIX)
            .load()
            .map_err(|e| Report::new(HostError::from(e)))
            .attach(format!("loading host config from {path:?}"))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn watch_config(&self) -> WatchConfig {
        WatchConfig {
            extensions: self
                .watch
                .extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_string())
                .collect(),
            ignore_patterns: self.watch.ignore.clone(),
            ..WatchConfig::default()
        }
    }

    /// Absolute paths of the modules configured as disabled.
    pub fn disabled_paths(&self, root: &Path) -> Vec<PathBuf> {
        self.modules
            .disabled
            .iter()
            .map(|relative| root.join(relative))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = HostConfig::default();

        assert_eq!(config.debounce(), Duration::from_millis(400));
        assert_eq!(config.logging.filter, "info");
        assert!(config.modules.disabled.is_empty());
        assert!(config.watch.ignore.contains(&"*.swp".to_string()));
    }

    #[test]
    fn test_load_partial_toml() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
root = "/srv/modules"
debounce_ms = 150

[watch]
extensions = [".rhai", "lua"]

[modules]
disabled = ["experimental", "tools/slow.rhai"]
"#
        )
        .unwrap();

        let config = HostConfig::load(Some(file.path())).unwrap();

        assert_eq!(config.root, PathBuf::from("/srv/modules"));
        assert_eq!(config.debounce(), Duration::from_millis(150));
        assert_eq!(config.logging, LoggingConfig::default());
        assert_eq!(config.watch_config().extensions, vec!["rhai", "lua"]);
        assert_eq!(
            config.disabled_paths(Path::new("/srv/modules")),
            vec![
                PathBuf::from("/srv/modules/experimental"),
                PathBuf::from("/srv/modules/tools/slow.rhai"),
            ]
        );
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let result = HostConfig::load(Some(Path::new("/definitely/not/here.toml")));

        let report = result.unwrap_err();
        assert!(matches!(report.current_context(), HostError::Config(_)));
        assert!(format!("{report:?}").contains("here.toml"));
    }
}
