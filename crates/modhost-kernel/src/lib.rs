//! modhost kernel
//!
//! The kernel hosts independently loadable modules discovered from a folder
//! hierarchy and keeps their lifecycle consistent:
//!
//! - [`store`]: a reactive, path-addressed state tree with aliasing-aware
//!   change propagation
//! - [`binder`]: ties disposable resources to the module that acquired them
//! - [`context`]: the ambient "current module" of the running task
//! - [`module`]: the module graph and the load/unload/reload engine
//! - [`config`]: multi-format configuration loading (feature `config`)

// context module
pub mod context;

// store module
pub mod store;
pub use store::{
    Change, Item, ListenerHandle, ListenerOptions, NodeRef, ObservableStore, Route, StoreError,
    StorePath, StoreResult, WriteOptions,
};

// binder module
pub mod binder;
pub use binder::{BindingId, ReleaseReport, ResourceBinder};

// module graph and reload engine
pub mod module;
pub use module::{
    Blocked, ContentHandle, ContentLoader, DependencyExtractor, MODULES_KEY, ModuleConfig,
    ModuleError, ModuleEvent, ModuleGraph, ModuleId, ModuleKind, ModuleResult, ModuleStatus,
    NoDependencies, PluginAvailability, PluginGate, ReloadEngine, ReloadEngineBuilder,
};

// error module
pub mod error;
pub use error::{KernelError, KernelResult};

// config module
#[cfg(feature = "config")]
pub mod config;
