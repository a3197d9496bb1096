//! Error types for the module host.

use std::path::PathBuf;

use modhost_kernel::config::ConfigError;
use modhost_kernel::{ModuleError, StoreError};
use thiserror::Error;

/// Errors raised while starting or driving a [`crate::ModuleHost`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HostError {
    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Module error: {0}")]
    Module(#[from] ModuleError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Path {0:?} is outside the module root")]
    OutsideRoot(PathBuf),

    #[error("Telemetry error: {0}")]
    Telemetry(String),

    #[error("Module host is shut down")]
    Closed,
}

/// Result alias carrying an [`error_stack::Report`].
pub type HostResult<T> = Result<T, error_stack::Report<HostError>>;

#[cfg(test)]
mod tests {
    use super::*;
    use error_stack::{Report, ResultExt};
    use modhost_kernel::ModuleId;

    #[test]
    fn module_error_converts() {
        let err: HostError = ModuleError::NotFound(ModuleId::new("/m/a.rs")).into();
        assert!(matches!(err, HostError::Module(_)));
        assert!(err.to_string().contains("/m/a.rs"));
    }

    #[test]
    fn report_keeps_attachments() {
        let result: HostResult<()> =
            Err(Report::new(HostError::Closed)).attach("sending reload for /m/a.rs");

        let rendered = format!("{:?}", result.unwrap_err());
        assert!(rendered.contains("shut down"));
        assert!(rendered.contains("/m/a.rs"));
    }
}
