//! modhost runtime
//!
//! Drives a [`modhost_kernel::ReloadEngine`] from a directory tree:
//!
//! - [`watcher`]: recursive file-system watching and initial enumeration
//! - [`debounce`]: per-path settle windows for change bursts
//! - [`host`]: the controller loop tying watcher, debouncer and commands
//!   to the engine
//! - [`config`]: host configuration (file + `MODHOST_*` environment)
//! - [`telemetry`]: tracing subscriber set-up

pub mod config;
pub mod debounce;
pub mod error;
pub mod host;
pub mod telemetry;
pub mod watcher;

pub use config::{HostConfig, LoggingConfig, ModulesConfig, WatchSection};
pub use debounce::Debouncer;
pub use error::{HostError, HostResult};
pub use host::{HostCommand, HostHandle, ModuleHost};
pub use watcher::{FsEvent, FsEventKind, ModuleWatcher, WatchConfig};
