//! Reload engine
//!
//! Drives module load, unload and reload over the [`ModuleGraph`], runs the
//! content loader's hooks inside each module's execution context, releases
//! module resources on unload, and publishes status into the store.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::error::{ModuleError, ModuleResult};
use super::graph::ModuleGraph;
use super::status::{MODULES_KEY, ModuleStatus, status_path};
use super::{
    ContentLoader, DependencyExtractor, ModuleConfig, ModuleEvent, ModuleId, ModuleKind,
    NoDependencies, PluginAvailability, PluginGate,
};
use crate::binder::ResourceBinder;
use crate::context;
use crate::store::{NodeRef, ObservableStore, StoreResult};

const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Builder for [`ReloadEngine`].
pub struct ReloadEngineBuilder {
    loader: Arc<dyn ContentLoader>,
    extractor: Arc<dyn DependencyExtractor>,
    plugins: Arc<dyn PluginAvailability>,
    binder: Option<Arc<ResourceBinder>>,
    store: Option<(ObservableStore, Option<NodeRef>)>,
    event_capacity: usize,
}

impl ReloadEngineBuilder {
    pub fn extractor(mut self, extractor: Arc<dyn DependencyExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn plugins(mut self, plugins: Arc<dyn PluginAvailability>) -> Self {
        self.plugins = plugins;
        self
    }

    pub fn binder(mut self, binder: Arc<ResourceBinder>) -> Self {
        self.binder = Some(binder);
        self
    }

    /// Publish into an existing store. With `root == None` a new root is
    /// created in it.
    pub fn store(mut self, store: ObservableStore, root: Option<NodeRef>) -> Self {
        self.store = Some((store, root));
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> StoreResult<ReloadEngine> {
        let binder = self.binder.unwrap_or_default();
        let (store, root) = match self.store {
            Some((store, root)) => (store, root),
            None => (ObservableStore::new().with_binder(binder.clone()), None),
        };
        let status_root = match root {
            Some(root) => {
                if store.get(root, MODULES_KEY)?.is_none() {
                    store.apply(root, Some(json!({})), MODULES_KEY)?;
                }
                root
            }
            None => {
                let mut initial = serde_json::Map::new();
                initial.insert(MODULES_KEY.to_string(), json!({}));
                store.create_server(Value::Object(initial))?
            }
        };
        let (events, _) = broadcast::channel(self.event_capacity);

        Ok(ReloadEngine {
            graph: Mutex::new(ModuleGraph::new()),
            store,
            status_root,
            binder,
            extractor: self.extractor,
            loader: self.loader,
            plugins: self.plugins,
            op_lock: tokio::sync::Mutex::new(()),
            events,
        })
    }
}

/// Load/unload/reload state machine over a [`ModuleGraph`].
///
/// Public operations are serialised; at most one structural change runs at
/// a time. Failures of module code are recorded on the module and never
/// returned to the caller.
pub struct ReloadEngine {
    graph: Mutex<ModuleGraph>,
    store: ObservableStore,
    status_root: NodeRef,
    binder: Arc<ResourceBinder>,
    extractor: Arc<dyn DependencyExtractor>,
    loader: Arc<dyn ContentLoader>,
    plugins: Arc<dyn PluginAvailability>,
    op_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<ModuleEvent>,
}

impl std::fmt::Debug for ReloadEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReloadEngine")
            .field("modules", &self.graph.lock().len())
            .field("status_root", &self.status_root)
            .finish()
    }
}

impl ReloadEngine {
    pub fn builder(loader: Arc<dyn ContentLoader>) -> ReloadEngineBuilder {
        ReloadEngineBuilder {
            loader,
            extractor: Arc::new(NoDependencies),
            plugins: Arc::new(PluginGate::new()),
            binder: None,
            store: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    pub fn store(&self) -> &ObservableStore {
        &self.store
    }

    /// Root under which `modules.<id>` status records are published.
    pub fn status_root(&self) -> NodeRef {
        self.status_root
    }

    pub fn binder(&self) -> &Arc<ResourceBinder> {
        &self.binder
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ModuleEvent> {
        self.events.subscribe()
    }

    pub fn status(&self, id: &ModuleId) -> Option<ModuleStatus> {
        self.graph.lock().get(id).map(ModuleStatus::from)
    }

    pub fn module_ids(&self) -> Vec<ModuleId> {
        self.graph.lock().ids()
    }

    pub fn contains(&self, id: &ModuleId) -> bool {
        self.graph.lock().contains(id)
    }

    pub fn is_active(&self, id: &ModuleId) -> bool {
        self.graph.lock().get(id).is_some_and(|m| m.active)
    }

    pub fn dependers_of(&self, id: &ModuleId) -> Vec<ModuleId> {
        self.graph.lock().dependers_of(id)
    }

    /// Run `f` against the graph. `f` must not call back into the engine.
    pub fn inspect<R>(&self, f: impl FnOnce(&ModuleGraph) -> R) -> R {
        f(&self.graph.lock())
    }

    /// Add a module discovered below `parent` (or a root module).
    pub async fn register_module(
        &self,
        id: ModuleId,
        parent: Option<ModuleId>,
        kind: ModuleKind,
        config: ModuleConfig,
    ) -> ModuleResult<()> {
        let _op = self.op_lock.lock().await;
        self.graph.lock().insert(id.clone(), parent, kind, config)?;
        debug!(module = %id, ?kind, "Registered module");
        self.publish(&id);
        self.emit(ModuleEvent::Discovered(id));
        Ok(())
    }

    /// Remove a module and its subtree, unloading it first.
    pub async fn remove_module(&self, id: &ModuleId) -> ModuleResult<()> {
        let _op = self.op_lock.lock().await;
        if !self.graph.lock().contains(id) {
            return Err(ModuleError::NotFound(id.clone()));
        }
        self.unload_inner(id).await;

        let removed = self.graph.lock().remove(id)?;
        for module in removed {
            self.binder.release_owner(&module.id);
            self.unpublish(&module.id);
            info!("Removed module {}", module.id);
            self.emit(ModuleEvent::Removed(module.id));
        }
        Ok(())
    }

    /// Load a module. Returns whether it is active afterwards.
    pub async fn load_module(&self, id: &ModuleId) -> bool {
        let _op = self.op_lock.lock().await;
        self.load_inner(id).await
    }

    pub async fn unload_module(&self, id: &ModuleId) {
        let _op = self.op_lock.lock().await;
        self.unload_inner(id).await;
    }

    /// Unload then load. Returns whether the module is active afterwards.
    pub async fn reload_module(&self, id: &ModuleId) -> bool {
        let _op = self.op_lock.lock().await;
        info!("Reloading module {}", id);
        self.unload_inner(id).await;
        self.load_inner(id).await
    }

    /// Reload every module depending on `dependency`, clearing their
    /// errored flag first. Used when an external plugin changes.
    pub async fn reload_dependency(&self, dependency: &ModuleId) {
        let _op = self.op_lock.lock().await;
        let dependers = self.graph.lock().dependers_of(dependency);
        debug!(dependency = %dependency, count = dependers.len(), "Reloading dependers");
        for depender in dependers {
            self.unload_inner(&depender).await;
            self.reset_errored(&depender);
            self.load_inner(&depender).await;
        }
    }

    /// Enable or disable a module. Enabling loads it, disabling unloads it.
    pub async fn set_enabled(&self, id: &ModuleId, enabled: bool) -> ModuleResult<()> {
        let _op = self.op_lock.lock().await;
        {
            let mut graph = self.graph.lock();
            let module = graph
                .get_mut(id)
                .ok_or_else(|| ModuleError::NotFound(id.clone()))?;
            if module.config.enabled == enabled {
                return Ok(());
            }
            module.config.enabled = enabled;
        }
        info!(module = %id, enabled, "Module enablement changed");

        if enabled {
            self.publish(id);
            self.load_inner(id).await;
        } else {
            self.unload_inner(id).await;
            self.publish(id);
        }
        Ok(())
    }

    /// Forget a previous load failure so the module may be retried.
    pub async fn clear_errored(&self, id: &ModuleId) -> ModuleResult<()> {
        let _op = self.op_lock.lock().await;
        if !self.graph.lock().contains(id) {
            return Err(ModuleError::NotFound(id.clone()));
        }
        self.reset_errored(id);
        Ok(())
    }

    fn reset_errored(&self, id: &ModuleId) {
        let changed = {
            let mut graph = self.graph.lock();
            match graph.get_mut(id) {
                Some(module) if module.errored => {
                    module.errored = false;
                    module.last_error = None;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.publish(id);
        }
    }

    fn load_inner<'a>(&'a self, id: &'a ModuleId) -> BoxFuture<'a, bool> {
        async move {
            {
                let graph = self.graph.lock();
                match graph.get(id) {
                    None => return false,
                    Some(module) if module.active => return true,
                    Some(_) => {}
                }
            }

            let dependencies = self.extractor.dependencies(id);
            let (check, parent_inactive) = {
                let mut graph = self.graph.lock();
                if graph.set_dependencies(id, dependencies).is_err() {
                    return false;
                }
                let check = graph.check_activatable(id, self.plugins.as_ref());
                let parent_inactive = graph
                    .get(id)
                    .and_then(|m| m.parent.clone())
                    .filter(|p| !graph.get(p).is_some_and(|m| m.active));
                if let Some(module) = graph.get_mut(id) {
                    module.blocked = check.clone().err();
                }
                (check, parent_inactive)
            };

            if let Err(reason) = check {
                debug!(module = %id, reason = %reason, "Module is blocked");
                self.publish(id);
                self.emit(ModuleEvent::Blocked {
                    module: id.clone(),
                    reason,
                });
                return false;
            }

            // an inactive parent brings this module up with its children
            if let Some(parent) = parent_inactive {
                self.load_inner(&parent).await;
                return self.is_active(id);
            }

            let dependencies = {
                let mut graph = self.graph.lock();
                match graph.get_mut(id) {
                    Some(module) => module.active = true,
                    None => return false,
                }
                graph.present_dependencies(id)
            };

            let mut satisfied = true;
            for dependency in dependencies {
                if !self.load_inner(&dependency).await {
                    satisfied = false;
                    break;
                }
            }
            if !satisfied || !self.is_active(id) {
                debug!(module = %id, "Dependencies did not load; aborting");
                self.deactivate(id).await;
                return false;
            }

            info!("Loading module {}", id);
            let outcome = context::scope(
                id.clone(),
                AssertUnwindSafe(self.loader.load(id)).catch_unwind(),
            )
            .await;

            let failure = match outcome {
                Ok(Ok(handle)) => {
                    let mut graph = self.graph.lock();
                    if let Some(module) = graph.get_mut(id) {
                        module.content = Some(handle);
                        module.loads += 1;
                    }
                    None
                }
                Ok(Err(e)) => Some(format!("{e:#}")),
                Err(panic) => Some(format!("load hook panicked: {}", panic_message(&*panic))),
            };

            if let Some(message) = failure {
                self.fail_load(id, message).await;
                return false;
            }

            let children = self.graph.lock().children_of(id);
            for child in children {
                if !self.is_active(id) {
                    break;
                }
                self.load_inner(&child).await;
            }
            let dependers = self.graph.lock().dependers_of(id);
            for depender in dependers {
                if !self.is_active(id) {
                    break;
                }
                self.load_inner(&depender).await;
            }

            let active = self.is_active(id);
            self.publish(id);
            if active {
                self.emit(ModuleEvent::Loaded(id.clone()));
            }
            active
        }
        .boxed()
    }

    /// Record a failed load hook and undo what it may have acquired.
    async fn fail_load(&self, id: &ModuleId, message: String) {
        let error = ModuleError::Load {
            module: id.clone(),
            message: message.clone(),
        };
        warn!("{}", error);
        {
            let mut graph = self.graph.lock();
            if let Some(module) = graph.get_mut(id) {
                module.errored = true;
                module.active = false;
                module.last_error = Some(message);
            }
        }

        self.run_unload_hook(id, None).await;
        self.binder.release_owner(id);
        self.cascade_down(id).await;
        self.publish(id);
        self.emit(ModuleEvent::LoadFailed {
            module: id.clone(),
            error,
        });
    }

    /// Mark inactive without running hooks, taking down anything that was
    /// brought up on the assumption that `id` would load.
    async fn deactivate(&self, id: &ModuleId) {
        if let Some(module) = self.graph.lock().get_mut(id) {
            module.active = false;
        }
        self.cascade_down(id).await;
        self.publish(id);
    }

    async fn cascade_down(&self, id: &ModuleId) {
        let dependers = self.graph.lock().dependers_of(id);
        for depender in dependers {
            self.unload_inner(&depender).await;
        }
        let children = self.graph.lock().children_of(id);
        for child in children {
            self.unload_inner(&child).await;
        }
    }

    fn unload_inner<'a>(&'a self, id: &'a ModuleId) -> BoxFuture<'a, ()> {
        async move {
            // Only a module whose load hook completed counts as unloaded; one
            // that was merely marked active ahead of its hook is just reset.
            let loaded = {
                let mut graph = self.graph.lock();
                match graph.get_mut(id) {
                    Some(module) if module.active => {
                        module.active = false;
                        let loaded = module.content.is_some();
                        if loaded {
                            module.unloads += 1;
                        }
                        loaded
                    }
                    _ => return,
                }
            };
            if loaded {
                info!("Unloading module {}", id);
            } else {
                debug!("Deactivating module {} before its load hook ran", id);
            }
            self.publish(id);

            self.cascade_down(id).await;

            let handle = self
                .graph
                .lock()
                .get_mut(id)
                .and_then(|module| module.content.take());
            if let Some(handle) = handle {
                self.run_unload_hook(id, Some(handle)).await;
            }
            self.binder.release_owner(id);
            if loaded {
                self.emit(ModuleEvent::Unloaded(id.clone()));
            }
        }
        .boxed()
    }

    async fn run_unload_hook(&self, id: &ModuleId, handle: Option<super::ContentHandle>) {
        let outcome = context::scope(
            id.clone(),
            AssertUnwindSafe(self.loader.unload(id, handle)).catch_unwind(),
        )
        .await;
        let message = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => format!("{e:#}"),
            Err(panic) => format!("unload hook panicked: {}", panic_message(&*panic)),
        };
        let error = ModuleError::Unload {
            module: id.clone(),
            message,
        };
        error!("{}", error);
    }

    fn publish(&self, id: &ModuleId) {
        let status = match self.graph.lock().get(id) {
            Some(module) => ModuleStatus::from(module),
            None => return,
        };
        let value = match serde_json::to_value(&status) {
            Ok(value) => value,
            Err(e) => {
                warn!(module = %id, error = %e, "Failed to serialize module status");
                return;
            }
        };
        self.write_status(id, Some(value));
    }

    fn unpublish(&self, id: &ModuleId) {
        self.write_status(id, None);
    }

    fn write_status(&self, id: &ModuleId, value: Option<Value>) {
        if let Err(e) = self.store.apply(self.status_root, value, status_path(id)) {
            warn!(module = %id, error = %e, "Failed to publish module status");
        }
    }

    fn emit(&self, event: ModuleEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
