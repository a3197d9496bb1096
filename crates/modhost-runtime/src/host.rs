//! Module host
//!
//! Single controller over a [`ReloadEngine`]: registers and loads the tree
//! found under the root, then reacts to file-system events, debounced
//! changes and [`HostCommand`]s one at a time.
//!
//! ```rust,ignore
//! let config = HostConfig::load(Some(Path::new("modhost.toml")))?;
//! let host = ModuleHost::new(config, Arc::new(MyLoader), Arc::new(MyExtractor))?;
//! let handle = host.handle();
//! tokio::spawn(host.run());
//! handle.set_enabled("/srv/modules/tools", false)?;
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use error_stack::{Report, ResultExt};
use modhost_kernel::{
    Change, ContentLoader, DependencyExtractor, ListenerHandle, ListenerOptions, MODULES_KEY,
    ModuleConfig, ModuleId, ModuleKind, NodeRef, ObservableStore, PluginGate, ReloadEngine,
    ResourceBinder,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::config::HostConfig;
use crate::debounce::Debouncer;
use crate::error::{HostError, HostResult};
use crate::watcher::{FsEvent, FsEventKind, ModuleWatcher};

/// Requests processed by the host loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCommand {
    SetEnabled { module: ModuleId, enabled: bool },
    PluginAvailability { plugin: ModuleId, available: bool },
    Reload(ModuleId),
    Shutdown,
}

/// Cloneable sender for [`HostCommand`]s.
#[derive(Debug, Clone)]
pub struct HostHandle {
    tx: mpsc::UnboundedSender<HostCommand>,
}

impl HostHandle {
    pub fn send(&self, command: HostCommand) -> Result<(), HostError> {
        self.tx.send(command).map_err(|_| HostError::Closed)
    }

    pub fn set_enabled(&self, module: impl Into<ModuleId>, enabled: bool) -> Result<(), HostError> {
        self.send(HostCommand::SetEnabled {
            module: module.into(),
            enabled,
        })
    }

    pub fn plugin_availability(
        &self,
        plugin: impl Into<ModuleId>,
        available: bool,
    ) -> Result<(), HostError> {
        self.send(HostCommand::PluginAvailability {
            plugin: plugin.into(),
            available,
        })
    }

    pub fn reload(&self, module: impl Into<ModuleId>) -> Result<(), HostError> {
        self.send(HostCommand::Reload(module.into()))
    }

    pub fn shutdown(&self) -> Result<(), HostError> {
        self.send(HostCommand::Shutdown)
    }
}

pub struct ModuleHost {
    root: PathBuf,
    engine: Arc<ReloadEngine>,
    plugins: Arc<PluginGate>,
    watcher: ModuleWatcher,
    debouncer: Debouncer,
    disabled: HashSet<PathBuf>,
    commands_tx: mpsc::UnboundedSender<HostCommand>,
    commands_rx: Option<mpsc::UnboundedReceiver<HostCommand>>,
    dashboard: Vec<ListenerHandle>,
    started: bool,
}

impl std::fmt::Debug for ModuleHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleHost")
            .field("root", &self.root)
            .field("engine", &self.engine)
            .field("pending", &self.debouncer.len())
            .field("started", &self.started)
            .finish()
    }
}

impl ModuleHost {
    /// Build a host with its own store, binder and plugin gate.
    pub fn new(
        config: HostConfig,
        loader: Arc<dyn ContentLoader>,
        extractor: Arc<dyn DependencyExtractor>,
    ) -> HostResult<Self> {
        let plugins = Arc::new(PluginGate::new());
        let binder = Arc::new(ResourceBinder::new());
        let store = ObservableStore::new().with_binder(binder.clone());
        let engine = ReloadEngine::builder(loader)
            .extractor(extractor)
            .plugins(plugins.clone())
            .binder(binder)
            .store(store, None)
            .build()
            .map_err(|e| Report::new(HostError::from(e)))
            .attach("creating the module status root")?;
        Self::with_engine(config, Arc::new(engine), plugins)
    }

    /// Build a host around an existing engine. `plugins` must be the gate
    /// the engine was built with.
    pub fn with_engine(
        config: HostConfig,
        engine: Arc<ReloadEngine>,
        plugins: Arc<PluginGate>,
    ) -> HostResult<Self> {
        let root = std::fs::canonicalize(&config.root)
            .map_err(|e| Report::new(HostError::from(e)))
            .attach(format!("resolving module root {:?}", config.root))?;
        let disabled = config.disabled_paths(&root).into_iter().collect();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        Ok(Self {
            watcher: ModuleWatcher::new(root.clone(), config.watch_config()),
            debouncer: Debouncer::new(config.debounce()),
            root,
            engine,
            plugins,
            disabled,
            commands_tx,
            commands_rx: Some(commands_rx),
            dashboard: Vec::new(),
            started: false,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn engine(&self) -> &Arc<ReloadEngine> {
        &self.engine
    }

    pub fn store(&self) -> &ObservableStore {
        self.engine.store()
    }

    pub fn status_root(&self) -> NodeRef {
        self.engine.status_root()
    }

    pub fn plugins(&self) -> &Arc<PluginGate> {
        &self.plugins
    }

    pub fn handle(&self) -> HostHandle {
        HostHandle {
            tx: self.commands_tx.clone(),
        }
    }

    /// Start watching, register the existing tree and load it.
    pub async fn start(&mut self) -> HostResult<()> {
        if self.started {
            return Ok(());
        }
        self.watcher
            .start()
            .map_err(|e| Report::new(HostError::from(e)))
            .attach(format!("watching {:?}", self.root))?;

        let root = self.root.clone();
        self.ensure_registered(&root, true)
            .await
            .map_err(Report::new)
            .attach("registering the module root")?;
        for entry in self.watcher.scan() {
            self.ensure_registered(&entry.path, entry.is_directory)
                .await
                .map_err(Report::new)
                .attach(format!("registering {:?}", entry.path))?;
        }

        let root_id = ModuleId::from_path(&root);
        let active = self.engine.load_module(&root_id).await;
        self.install_dashboard()?;
        self.started = true;

        info!(
            root = ?self.root,
            modules = self.engine.module_ids().len(),
            active,
            "Module host started"
        );
        Ok(())
    }

    /// Run the controller loop until [`HostCommand::Shutdown`], then stop.
    pub async fn run(mut self) -> HostResult<()> {
        self.start().await?;
        let mut events = self
            .watcher
            .take_event_receiver()
            .ok_or_else(|| Report::new(HostError::Closed))
            .attach("watcher events already taken")?;
        let mut commands = self
            .commands_rx
            .take()
            .ok_or_else(|| Report::new(HostError::Closed))
            .attach("host commands already taken")?;

        loop {
            let deadline = self.debouncer.next_deadline();
            tokio::select! {
                Some(event) = events.recv() => {
                    self.handle_fs_event(event).await;
                }
                Some(command) = commands.recv() => {
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.process_due(Instant::now()).await;
                }
                else => break,
            }
        }

        self.stop().await;
        Ok(())
    }

    /// Unload the whole tree and stop watching.
    pub async fn stop(&mut self) {
        for handle in self.dashboard.drain(..) {
            handle.remove_self();
        }
        self.engine.unload_module(&ModuleId::from_path(&self.root)).await;
        self.watcher.stop().await;
        self.started = false;
        info!(root = ?self.root, "Module host stopped");
    }

    /// React to one watcher event.
    pub async fn handle_fs_event(&mut self, event: FsEvent) {
        debug!(kind = ?event.kind, path = ?event.path, "Handling file event");
        match event.kind {
            FsEventKind::Created => {
                if self.engine.contains(&ModuleId::from_path(&event.path)) {
                    if !event.is_directory {
                        self.debouncer.touch(event.path, Instant::now());
                    }
                } else {
                    self.discover(&event.path, event.is_directory).await;
                }
            }
            FsEventKind::Changed => {
                if event.is_directory {
                    return;
                }
                if self.engine.contains(&ModuleId::from_path(&event.path)) {
                    self.debouncer.touch(event.path, Instant::now());
                } else {
                    self.discover(&event.path, false).await;
                }
            }
            FsEventKind::Removed => {
                self.debouncer.forget_below(&event.path);
                let id = ModuleId::from_path(&event.path);
                if !self.engine.contains(&id) {
                    return;
                }
                if let Err(e) = self.engine.remove_module(&id).await {
                    warn!(module = %id, error = %e, "Failed to remove module");
                }
            }
        }
    }

    /// Reload every path whose settle window elapsed by `now`.
    pub async fn process_due(&mut self, now: Instant) {
        for path in self.debouncer.drain_due(now) {
            let id = ModuleId::from_path(&path);
            if self.engine.contains(&id) {
                self.reload(&id).await;
            }
        }
    }

    /// Apply one command. Returns `false` for [`HostCommand::Shutdown`].
    pub async fn handle_command(&mut self, command: HostCommand) -> bool {
        match command {
            HostCommand::SetEnabled { module, enabled } => {
                if let Err(e) = self.engine.set_enabled(&module, enabled).await {
                    warn!(module = %module, enabled, error = %e, "Cannot change enablement");
                }
            }
            HostCommand::PluginAvailability { plugin, available } => {
                if self.plugins.notify(&plugin, available) {
                    info!(plugin = %plugin, available, "Plugin availability changed");
                    self.engine.reload_dependency(&plugin).await;
                } else {
                    debug!(plugin = %plugin, available, "Plugin availability unchanged");
                }
            }
            HostCommand::Reload(module) => {
                if self.engine.contains(&module) {
                    self.reload(&module).await;
                } else {
                    warn!(module = %module, "Reload requested for unknown module");
                }
            }
            HostCommand::Shutdown => {
                info!("Module host shutdown requested");
                return false;
            }
        }
        true
    }

    async fn reload(&mut self, id: &ModuleId) {
        if let Err(e) = self.engine.clear_errored(id).await {
            warn!(module = %id, error = %e, "Cannot clear module error");
            return;
        }
        let active = self.engine.reload_module(id).await;
        debug!(module = %id, active, "Reloaded after change");
    }

    /// Register a new path (with any missing ancestors) and load it.
    async fn discover(&mut self, path: &Path, is_directory: bool) {
        if let Err(e) = self.ensure_registered(path, is_directory).await {
            warn!(path = ?path, error = %e, "Cannot register module");
            return;
        }
        if is_directory {
            for entry in self.watcher.scan_path(path) {
                if let Err(e) = self.ensure_registered(&entry.path, entry.is_directory).await {
                    warn!(path = ?entry.path, error = %e, "Cannot register module");
                }
            }
        }
        self.engine.load_module(&ModuleId::from_path(path)).await;
    }

    async fn ensure_registered(
        &mut self,
        path: &Path,
        is_directory: bool,
    ) -> Result<(), HostError> {
        if !path.starts_with(&self.root) {
            return Err(HostError::OutsideRoot(path.to_path_buf()));
        }

        let mut missing = Vec::new();
        let mut current = Some(path);
        while let Some(candidate) = current {
            if self.engine.contains(&ModuleId::from_path(candidate)) {
                break;
            }
            missing.push(candidate.to_path_buf());
            if candidate == self.root {
                break;
            }
            current = candidate.parent();
        }

        for candidate in missing.into_iter().rev() {
            let kind = if candidate != path || is_directory {
                ModuleKind::Directory
            } else {
                ModuleKind::File
            };
            let parent = if candidate == self.root {
                None
            } else {
                candidate.parent().map(ModuleId::from_path)
            };
            let config = if self.disabled.contains(&candidate) {
                ModuleConfig::disabled()
            } else {
                ModuleConfig::default()
            };
            self.engine
                .register_module(ModuleId::from_path(&candidate), parent, kind, config)
                .await?;
        }
        Ok(())
    }

    fn install_dashboard(&mut self) -> HostResult<()> {
        let tx = self.commands_tx.clone();
        self.dashboard = self
            .engine
            .store()
            .add_listener(
                self.engine.status_root(),
                MODULES_KEY,
                ListenerOptions::new().activate_if_unchanged(false),
                move |change| {
                    if let Some(command) = enablement_request(change) {
                        // loop gone means shutting down
                        let _ = tx.send(command);
                    }
                },
            )
            .map_err(|e| Report::new(HostError::from(e)))
            .attach("subscribing to module status")?;
        Ok(())
    }
}

/// Turn an observed write to `modules.<id>.enabled` (or a status record
/// whose `enabled` flipped) into a command.
fn enablement_request(change: &Change) -> Option<HostCommand> {
    match change.path.segments() {
        [_, module, field] if field == "enabled" => match change.new {
            Some(Value::Bool(enabled)) => Some(HostCommand::SetEnabled {
                module: ModuleId::new(module.clone()),
                enabled,
            }),
            _ => None,
        },
        [_, module] => {
            let enabled = |record: &Option<Value>| {
                record
                    .as_ref()
                    .and_then(|record| record.get("enabled"))
                    .and_then(Value::as_bool)
            };
            match (enabled(&change.old), enabled(&change.new)) {
                (Some(old), Some(new)) if old != new => Some(HostCommand::SetEnabled {
                    module: ModuleId::new(module.clone()),
                    enabled: new,
                }),
                _ => None,
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modhost_kernel::StorePath;
    use serde_json::json;

    fn change(path: &[&str], old: Option<Value>, new: Option<Value>) -> Change {
        Change {
            root: ObservableStore::new().create_server(json!({})).unwrap(),
            path: StorePath::from_segments(path.iter().copied()).unwrap(),
            old,
            new,
        }
    }

    #[test]
    fn enabled_field_write_becomes_command() {
        let request = enablement_request(&change(
            &["modules", "/m/a.rs", "enabled"],
            Some(json!(true)),
            Some(json!(false)),
        ));

        assert_eq!(
            request,
            Some(HostCommand::SetEnabled {
                module: ModuleId::new("/m/a.rs"),
                enabled: false,
            })
        );
    }

    #[test]
    fn record_write_only_counts_enabled_flips() {
        let flipped = enablement_request(&change(
            &["modules", "/m/a.rs"],
            Some(json!({"enabled": false, "active": false})),
            Some(json!({"enabled": true, "active": false})),
        ));
        assert!(matches!(flipped, Some(HostCommand::SetEnabled { enabled: true, .. })));

        let same = enablement_request(&change(
            &["modules", "/m/a.rs"],
            Some(json!({"enabled": true, "active": false})),
            Some(json!({"enabled": true, "active": true})),
        ));
        assert_eq!(same, None);

        let appeared = enablement_request(&change(
            &["modules", "/m/a.rs"],
            None,
            Some(json!({"enabled": true})),
        ));
        assert_eq!(appeared, None);
    }

    #[test]
    fn unrelated_writes_are_ignored() {
        assert_eq!(enablement_request(&change(&["modules"], None, Some(json!({})))), None);
        assert_eq!(
            enablement_request(&change(
                &["modules", "/m/a.rs", "active"],
                Some(json!(true)),
                Some(json!(false)),
            )),
            None
        );
        assert_eq!(
            enablement_request(&change(
                &["modules", "/m/a.rs", "enabled"],
                None,
                Some(json!("yes")),
            )),
            None
        );
    }

    #[test]
    fn handle_reports_closed_host() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = HostHandle { tx };
        drop(rx);

        assert!(matches!(handle.reload("/m/a.rs"), Err(HostError::Closed)));
    }
}
