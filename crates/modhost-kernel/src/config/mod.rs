//! Configuration loading
//!
//! Loads typed configuration from any format the `config` crate understands
//! (YAML, TOML, JSON, INI, RON, JSON5), layering several sources where later
//! layers override earlier ones:
//!
//! ```rust,ignore
//! use modhost_kernel::config::ConfigLayers;
//!
//! let host: HostConfig = ConfigLayers::new()
//!     .file("modhost.toml")
//!     .optional_file("modhost.local.toml")
//!     .env("MODHOST")
//!     .load()?;
//! ```
//!
//! `${VAR}` and `$VAR` references in file contents are replaced by the
//! environment variable's value; unknown variables are left untouched.
//! Environment overrides use `PREFIX_KEY`, with `__` between nested keys
//! (`MODHOST_LOGGING__FILTER`).

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use config::{Config, Environment, File};
use regex::{Captures, Regex};
use serde::de::DeserializeOwned;

pub use config::FileFormat;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error reading {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Config parsing error: {0}")]
    Parse(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Config does not match the expected shape: {0}")]
    Deserialize(String),
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

static ENV_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*)\b)")
        .expect("environment reference pattern is valid")
});

/// Format implied by a file's extension.
pub fn detect_format(path: impl AsRef<Path>) -> ConfigResult<FileFormat> {
    let ext = path
        .as_ref()
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat("no file extension".to_string()))?;

    match ext.to_ascii_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        "ini" => Ok(FileFormat::Ini),
        "ron" => Ok(FileFormat::Ron),
        "json5" => Ok(FileFormat::Json5),
        _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
    }
}

/// Replace `${VAR}` and `$VAR` with the variable's value, leaving unknown
/// variables as written.
pub fn substitute_env_vars(content: &str) -> String {
    ENV_REFERENCE
        .replace_all(content, |caps: &Captures| {
            let name = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
            std::env::var(name).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

#[derive(Debug, Clone)]
enum Layer {
    File { path: PathBuf, required: bool },
    Content { content: String, format: FileFormat },
    Env { prefix: String },
}

/// An ordered stack of configuration sources.
#[derive(Debug, Clone, Default)]
pub struct ConfigLayers {
    layers: Vec<Layer>,
}

impl ConfigLayers {
    pub fn new() -> Self {
        Self::default()
    }

    /// A file that must exist.
    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.layers.push(Layer::File {
            path: path.into(),
            required: true,
        });
        self
    }

    /// A file that is skipped when missing.
    pub fn optional_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.layers.push(Layer::File {
            path: path.into(),
            required: false,
        });
        self
    }

    /// Inline content in an explicit format.
    pub fn content(mut self, content: impl Into<String>, format: FileFormat) -> Self {
        self.layers.push(Layer::Content {
            content: content.into(),
            format,
        });
        self
    }

    /// Environment variables starting with `prefix`.
    pub fn env(mut self, prefix: impl Into<String>) -> Self {
        self.layers.push(Layer::Env {
            prefix: prefix.into(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Merge every layer and deserialize the result.
    pub fn load<T>(&self) -> ConfigResult<T>
    where
        T: DeserializeOwned,
    {
        let mut builder = Config::builder();
        for layer in &self.layers {
            match layer {
                Layer::File { path, required } => {
                    if !required && !path.exists() {
                        continue;
                    }
                    let format = detect_format(path)?;
                    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                        path: path.clone(),
                        source,
                    })?;
                    builder = builder.add_source(File::from_str(&substitute_env_vars(&content), format));
                }
                Layer::Content { content, format } => {
                    builder = builder.add_source(File::from_str(&substitute_env_vars(content), *format));
                }
                Layer::Env { prefix } => {
                    builder = builder.add_source(
                        Environment::with_prefix(prefix)
                            .prefix_separator("_")
                            .separator("__")
                            .try_parsing(true),
                    );
                }
            }
        }

        builder
            .build()
            .map_err(|e| ConfigError::Parse(e.to_string()))?
            .try_deserialize()
            .map_err(|e| ConfigError::Deserialize(e.to_string()))
    }
}

/// Load one file, format taken from its extension.
pub fn load_config<T: DeserializeOwned>(path: impl AsRef<Path>) -> ConfigResult<T> {
    ConfigLayers::new().file(path.as_ref()).load()
}

/// Parse configuration from a string in an explicit format.
pub fn from_str<T: DeserializeOwned>(content: &str, format: FileFormat) -> ConfigResult<T> {
    ConfigLayers::new().content(content, format).load()
}

/// Merge inline sources; later sources win.
pub fn merge_configs<T: DeserializeOwned>(sources: &[(&str, FileFormat)]) -> ConfigResult<T> {
    sources
        .iter()
        .fold(ConfigLayers::new(), |layers, (content, format)| {
            layers.content(*content, *format)
        })
        .load()
}

/// Merge files; later files win.
pub fn load_merged<T, P>(paths: &[P]) -> ConfigResult<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    paths
        .iter()
        .fold(ConfigLayers::new(), |layers, path| layers.file(path.as_ref()))
        .load()
}

/// Load a file, then apply `PREFIX_`-style environment overrides.
pub fn load_with_env<T: DeserializeOwned>(path: impl AsRef<Path>, env_prefix: &str) -> ConfigResult<T> {
    ConfigLayers::new().file(path.as_ref()).env(env_prefix).load()
}
