//! Typed errors for the module graph and reload engine.

use thiserror::Error;

use super::ModuleId;

/// Errors raised while managing modules.
///
/// Load and unload failures never escape the engine's public operations;
/// they are recorded on the module, logged, and broadcast as events.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ModuleError {
    /// The content loader's load hook failed or panicked.
    #[error("Module load failed for {module}: {message}")]
    Load { module: ModuleId, message: String },

    /// The content loader's unload hook failed or panicked.
    #[error("Module unload failed for {module}: {message}")]
    Unload { module: ModuleId, message: String },

    /// No module with this id is registered.
    #[error("Module not found: {0}")]
    NotFound(ModuleId),

    /// A module with this id is already registered.
    #[error("Module already registered: {0}")]
    AlreadyRegistered(ModuleId),

    /// The declared parent of a new module is not registered.
    #[error("Parent {parent} of module {module} is not registered")]
    UnknownParent { module: ModuleId, parent: ModuleId },
}

/// Result type for module graph operations.
pub type ModuleResult<T> = Result<T, ModuleError>;
