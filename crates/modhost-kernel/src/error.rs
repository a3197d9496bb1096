//! Crate-level error types for `modhost-kernel`.
//!
//! Provides a unified [`KernelError`] that composes the errors of every
//! sub-module (store, module graph, config) together with
//! [`error_stack::Report`] for context-carrying propagation.
//!
//! # Usage
//!
//! ```rust,ignore
//! use modhost_kernel::error::{KernelError, KernelResult};
//! use error_stack::ResultExt;
//!
//! fn publish(store: &ObservableStore, root: NodeRef) -> KernelResult<()> {
//!     store
//!         .apply(root, Some(serde_json::json!(true)), "flags.ready")
//!         .map_err(KernelError::from)
//!         .map_err(error_stack::Report::new)
//!         .attach("publishing readiness flag")?;
//!     Ok(())
//! }
//! ```

use crate::module::ModuleError;
use crate::store::StoreError;
use thiserror::Error;

/// Crate-level error type for `modhost-kernel`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KernelError {
    /// An error originating from the observable store.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// An error originating from the module graph or reload engine.
    #[error("Module error: {0}")]
    Module(#[from] ModuleError),

    /// A configuration-related error (requires the `config` feature).
    #[cfg(feature = "config")]
    #[error("Config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// A low-level I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON (de)serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An internal error described by a message string.
    #[error("{0}")]
    Internal(String),
}

/// Convenience result alias using [`error_stack::Report`].
pub type KernelResult<T> = Result<T, error_stack::Report<KernelError>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleId;
    use error_stack::Report;

    #[test]
    fn store_error_converts_via_from() {
        let err = StoreError::InvalidArgument("bad".to_string());
        let kernel_err: KernelError = err.into();

        assert!(matches!(kernel_err, KernelError::Store(_)));
        assert!(kernel_err.to_string().contains("bad"));
    }

    #[test]
    fn module_error_converts_via_from() {
        let err = ModuleError::NotFound(ModuleId::new("/mods/a"));
        let kernel_err: KernelError = err.into();

        assert!(matches!(kernel_err, KernelError::Module(_)));
        assert!(kernel_err.to_string().contains("/mods/a"));
    }

    #[test]
    fn report_renders_context() {
        let report: KernelResult<()> = Err(Report::new(KernelError::Internal("boom".into())))
            .map_err(|r| r.attach("while testing"));

        let rendered = format!("{:?}", report.unwrap_err());
        assert!(rendered.contains("boom"));
    }
}
