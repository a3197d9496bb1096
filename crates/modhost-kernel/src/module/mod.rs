//! Module graph and reload engine
//!
//! Modules mirror a folder hierarchy: every file or directory below the
//! host root is a module whose parent is the directory containing it.
//! Modules also depend on each other (and on external plugins) through
//! edges reported by a [`DependencyExtractor`]. The [`ReloadEngine`] keeps
//! the invariant that an active module has an active parent and active
//! dependencies, and publishes each module's status into the
//! [`ObservableStore`](crate::store::ObservableStore).

mod engine;
mod error;
mod graph;
mod status;

#[cfg(test)]
mod tests;

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub use engine::{ReloadEngine, ReloadEngineBuilder};
pub use error::{ModuleError, ModuleResult};
pub use graph::{Blocked, Module, ModuleGraph};
pub use status::{MODULES_KEY, ModuleStatus};

/// Canonical identifier of a module: its path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleId(String);

impl ModuleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn from_path(path: &Path) -> Self {
        Self(path.to_string_lossy().into_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_path(&self) -> &Path {
        Path::new(&self.0)
    }

    /// Last path component, used as the key under the parent module.
    pub fn name(&self) -> &str {
        self.as_path()
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.0)
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModuleId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ModuleId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&Path> for ModuleId {
    fn from(path: &Path) -> Self {
        Self::from_path(path)
    }
}

impl From<PathBuf> for ModuleId {
    fn from(path: PathBuf) -> Self {
        Self::from_path(&path)
    }
}

/// Whether a module is backed by a file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    File,
    Directory,
}

/// Per-module configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl ModuleConfig {
    pub fn disabled() -> Self {
        Self { enabled: false }
    }
}

/// Opaque value produced by a [`ContentLoader`] for a loaded module.
pub type ContentHandle = Box<dyn Any + Send + Sync>;

/// Reports which modules or plugins a module depends on.
///
/// Called on every load; the result replaces the module's previous
/// dependencies. Ids that are not registered modules are treated as
/// external plugins.
pub trait DependencyExtractor: Send + Sync {
    fn dependencies(&self, module: &ModuleId) -> Vec<ModuleId>;
}

/// Extractor for modules without dependencies.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDependencies;

impl DependencyExtractor for NoDependencies {
    fn dependencies(&self, _module: &ModuleId) -> Vec<ModuleId> {
        Vec::new()
    }
}

/// Runs a module's code.
///
/// Both hooks run inside the module's execution context (see
/// [`crate::context`]), so resources acquired there are bound to the module.
/// Hooks must not call back into the [`ReloadEngine`].
#[async_trait]
pub trait ContentLoader: Send + Sync {
    /// Load the module and return its content handle.
    async fn load(&self, module: &ModuleId) -> anyhow::Result<ContentHandle>;

    /// Undo a load. `handle` is `None` when the load itself failed.
    async fn unload(&self, module: &ModuleId, handle: Option<ContentHandle>) -> anyhow::Result<()>;
}

/// Decides whether an external dependency is currently unavailable.
pub trait PluginAvailability: Send + Sync {
    fn is_blocked(&self, dependency: &ModuleId) -> bool;
}

/// [`PluginAvailability`] backed by availability notifications.
///
/// Every dependency is available until reported otherwise.
#[derive(Debug, Default)]
pub struct PluginGate {
    unavailable: RwLock<HashSet<ModuleId>>,
}

impl PluginGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a plugin's availability. Returns `true` if it changed.
    pub fn notify(&self, plugin: &ModuleId, available: bool) -> bool {
        let mut unavailable = self.unavailable.write();
        if available {
            unavailable.remove(plugin)
        } else {
            unavailable.insert(plugin.clone())
        }
    }
}

impl PluginAvailability for PluginGate {
    fn is_blocked(&self, dependency: &ModuleId) -> bool {
        self.unavailable.read().contains(dependency)
    }
}

/// Lifecycle notifications broadcast by the [`ReloadEngine`].
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ModuleEvent {
    Discovered(ModuleId),
    Loaded(ModuleId),
    LoadFailed { module: ModuleId, error: ModuleError },
    Blocked { module: ModuleId, reason: Blocked },
    Unloaded(ModuleId),
    Removed(ModuleId),
}

impl ModuleEvent {
    pub fn module(&self) -> &ModuleId {
        match self {
            ModuleEvent::Discovered(id)
            | ModuleEvent::Loaded(id)
            | ModuleEvent::Unloaded(id)
            | ModuleEvent::Removed(id) => id,
            ModuleEvent::LoadFailed { module, .. } | ModuleEvent::Blocked { module, .. } => module,
        }
    }
}
