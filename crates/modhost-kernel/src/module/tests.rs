use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use super::*;
use crate::binder::ResourceBinder;
use crate::store::{ListenerOptions, StorePath};

fn id(raw: &str) -> ModuleId {
    ModuleId::new(raw)
}

#[derive(Default)]
struct TestLoader {
    log: Mutex<Vec<String>>,
    failing: Mutex<HashSet<ModuleId>>,
    panicking: Mutex<HashSet<ModuleId>>,
    binder: Option<Arc<ResourceBinder>>,
    released: Arc<Mutex<Vec<ModuleId>>>,
}

impl TestLoader {
    fn take_log(&self) -> Vec<String> {
        std::mem::take(&mut *self.log.lock())
    }

    fn fail(&self, module: &str, failing: bool) {
        let mut set = self.failing.lock();
        if failing {
            set.insert(id(module));
        } else {
            set.remove(&id(module));
        }
    }
}

#[async_trait]
impl ContentLoader for TestLoader {
    async fn load(&self, module: &ModuleId) -> anyhow::Result<ContentHandle> {
        self.log.lock().push(format!("load {module}"));
        if let Some(binder) = &self.binder {
            let released = self.released.clone();
            let owner = module.clone();
            binder.bind(format!("resource of {module}"), move || {
                released.lock().push(owner);
                Ok(())
            });
        }
        if self.panicking.lock().contains(module) {
            panic!("hook exploded");
        }
        if self.failing.lock().contains(module) {
            anyhow::bail!("syntax error in {module}");
        }
        Ok(Box::new(module.to_string()))
    }

    async fn unload(&self, module: &ModuleId, handle: Option<ContentHandle>) -> anyhow::Result<()> {
        let tag = match handle {
            Some(_) => "handle",
            None => "none",
        };
        self.log.lock().push(format!("unload {module} {tag}"));
        Ok(())
    }
}

#[derive(Default)]
struct MapExtractor {
    deps: Mutex<HashMap<ModuleId, Vec<ModuleId>>>,
}

impl MapExtractor {
    fn set(&self, module: &str, deps: &[&str]) {
        self.deps
            .lock()
            .insert(id(module), deps.iter().map(|d| id(d)).collect());
    }
}

impl DependencyExtractor for MapExtractor {
    fn dependencies(&self, module: &ModuleId) -> Vec<ModuleId> {
        self.deps.lock().get(module).cloned().unwrap_or_default()
    }
}

struct Fixture {
    engine: ReloadEngine,
    loader: Arc<TestLoader>,
    extractor: Arc<MapExtractor>,
    gate: Arc<PluginGate>,
    binder: Arc<ResourceBinder>,
}

impl Fixture {
    fn new() -> Self {
        let binder = Arc::new(ResourceBinder::new());
        let loader = Arc::new(TestLoader {
            binder: Some(binder.clone()),
            ..TestLoader::default()
        });
        let extractor = Arc::new(MapExtractor::default());
        let gate = Arc::new(PluginGate::new());
        let engine = ReloadEngine::builder(loader.clone())
            .extractor(extractor.clone())
            .plugins(gate.clone())
            .binder(binder.clone())
            .build()
            .unwrap();
        Self {
            engine,
            loader,
            extractor,
            gate,
            binder,
        }
    }

    /// Register `/m` with file children.
    async fn tree(&self, files: &[&str]) {
        self.dir("/m", None).await;
        for file in files {
            self.file(file, "/m").await;
        }
    }

    async fn dir(&self, module: &str, parent: Option<&str>) {
        self.engine
            .register_module(id(module), parent.map(id), ModuleKind::Directory, ModuleConfig::default())
            .await
            .unwrap();
    }

    async fn file(&self, module: &str, parent: &str) {
        self.engine
            .register_module(id(module), Some(id(parent)), ModuleKind::File, ModuleConfig::default())
            .await
            .unwrap();
    }

    fn active(&self, module: &str) -> bool {
        self.engine.is_active(&id(module))
    }

    fn status(&self, module: &str) -> ModuleStatus {
        self.engine.status(&id(module)).unwrap()
    }

    fn assert_invariant(&self) {
        self.engine.inspect(|graph| {
            for module_id in graph.ids() {
                let module = graph.get(&module_id).unwrap();
                if !module.is_active() {
                    continue;
                }
                if let Some(parent) = module.parent() {
                    assert!(
                        graph.get(parent).unwrap().is_active(),
                        "{module_id} is active but its parent {parent} is not"
                    );
                }
                for dependency in graph.present_dependencies(&module_id) {
                    assert!(
                        graph.get(&dependency).unwrap().is_active(),
                        "{module_id} is active but its dependency {dependency} is not"
                    );
                }
            }
        });
    }
}

#[tokio::test]
async fn loading_a_folder_loads_its_children() {
    let fx = Fixture::new();
    fx.tree(&["/m/a", "/m/b"]).await;

    assert!(fx.engine.load_module(&id("/m")).await);
    assert!(fx.active("/m") && fx.active("/m/a") && fx.active("/m/b"));
    assert_eq!(fx.loader.take_log(), vec!["load /m", "load /m/a", "load /m/b"]);

    fx.engine.unload_module(&id("/m")).await;
    assert!(!fx.active("/m") && !fx.active("/m/a") && !fx.active("/m/b"));
    assert_eq!(
        fx.loader.take_log(),
        vec!["unload /m/a handle", "unload /m/b handle", "unload /m handle"]
    );
}

#[tokio::test]
async fn loading_a_child_brings_up_its_parent() {
    let fx = Fixture::new();
    fx.tree(&["/m/a"]).await;

    assert!(fx.engine.load_module(&id("/m/a")).await);
    assert!(fx.active("/m"));
    fx.assert_invariant();
}

#[tokio::test]
async fn dependencies_load_before_dependers() {
    let fx = Fixture::new();
    fx.extractor.set("/m/a", &["/m/b"]);
    fx.tree(&["/m/a", "/m/b"]).await;

    fx.engine.load_module(&id("/m")).await;

    assert!(fx.active("/m/a") && fx.active("/m/b"));
    assert_eq!(fx.loader.take_log(), vec!["load /m", "load /m/b", "load /m/a"]);
    assert_eq!(fx.engine.dependers_of(&id("/m/b")), vec![id("/m/a")]);
    assert_eq!(fx.status("/m/a").dependencies, vec![id("/m/b")]);
}

#[tokio::test]
async fn unloading_a_dependency_deactivates_its_dependers() {
    let fx = Fixture::new();
    fx.extractor.set("/m/a", &["/m/b"]);
    fx.tree(&["/m/a", "/m/b"]).await;
    fx.engine.load_module(&id("/m")).await;
    fx.loader.take_log();

    fx.engine.unload_module(&id("/m/b")).await;

    assert!(!fx.active("/m/a"));
    assert!(!fx.active("/m/b"));
    assert!(fx.active("/m"));
    assert_eq!(
        fx.loader.take_log(),
        vec!["unload /m/a handle", "unload /m/b handle"]
    );
    fx.assert_invariant();
}

#[tokio::test]
async fn reload_runs_one_unload_then_one_load() {
    let fx = Fixture::new();
    fx.tree(&["/m/a"]).await;
    fx.engine.load_module(&id("/m")).await;
    fx.loader.take_log();

    assert!(fx.engine.reload_module(&id("/m/a")).await);

    assert_eq!(fx.loader.take_log(), vec!["unload /m/a handle", "load /m/a"]);
    let status = fx.status("/m/a");
    assert!(status.active);
    assert_eq!((status.loads, status.unloads), (2, 1));
}

#[tokio::test]
async fn failed_dependency_recovers_after_fix() {
    let fx = Fixture::new();
    fx.extractor.set("/m/a", &["/m/b"]);
    fx.loader.fail("/m/b", true);
    fx.tree(&["/m/a", "/m/b"]).await;

    fx.engine.load_module(&id("/m")).await;

    let b = fx.status("/m/b");
    assert!(b.errored);
    assert!(!b.active);
    assert!(b.error.as_deref().unwrap().contains("syntax error in /m/b"));
    assert!(!fx.active("/m/a"));
    assert!(fx.active("/m"));
    fx.assert_invariant();

    fx.loader.fail("/m/b", false);
    fx.loader.take_log();
    fx.engine.clear_errored(&id("/m/b")).await.unwrap();
    assert!(fx.engine.reload_module(&id("/m/b")).await);

    assert!(fx.active("/m/b"));
    assert!(fx.active("/m/a"));
    assert_eq!(fx.loader.take_log(), vec!["load /m/b", "load /m/a"]);
    assert!(!fx.status("/m/b").errored);
}

#[tokio::test]
async fn depender_that_never_loaded_is_not_counted_as_unloaded() {
    let fx = Fixture::new();
    let mut events = fx.engine.subscribe();
    fx.extractor.set("/m/a", &["/m/b"]);
    fx.loader.fail("/m/b", true);
    fx.tree(&["/m/a", "/m/b"]).await;

    fx.engine.load_module(&id("/m")).await;

    let a = fx.status("/m/a");
    assert!(!a.active);
    assert_eq!((a.loads, a.unloads), (0, 0));
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(!seen.contains(&ModuleEvent::Unloaded(id("/m/a"))));
    fx.assert_invariant();

    fx.loader.fail("/m/b", false);
    fx.engine.clear_errored(&id("/m/b")).await.unwrap();
    assert!(fx.engine.reload_module(&id("/m/b")).await);
    while events.try_recv().is_ok() {}
    fx.engine.unload_module(&id("/m/b")).await;

    let a = fx.status("/m/a");
    assert_eq!((a.loads, a.unloads), (1, 1));
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.contains(&ModuleEvent::Unloaded(id("/m/a"))));
}

#[tokio::test]
async fn errored_module_stays_blocked_until_cleared() {
    let fx = Fixture::new();
    fx.loader.fail("/m/a", true);
    fx.tree(&["/m/a"]).await;
    fx.engine.load_module(&id("/m")).await;

    fx.loader.fail("/m/a", false);
    assert!(!fx.engine.load_module(&id("/m/a")).await);
    assert_eq!(fx.status("/m/a").blocked.as_deref(), Some("errored: /m/a"));

    fx.engine.clear_errored(&id("/m/a")).await.unwrap();
    assert!(fx.engine.load_module(&id("/m/a")).await);
    assert_eq!(fx.status("/m/a").blocked, None);
}

#[tokio::test]
async fn resources_are_released_exactly_once() {
    let fx = Fixture::new();
    fx.tree(&["/m/a"]).await;
    fx.engine.load_module(&id("/m")).await;
    assert_eq!(fx.binder.bindings_of(&id("/m/a")), vec!["resource of /m/a"]);

    fx.engine.unload_module(&id("/m/a")).await;
    fx.engine.unload_module(&id("/m/a")).await;

    let released = fx.loader.released.lock().clone();
    assert_eq!(released, vec![id("/m/a")]);
    assert!(fx.binder.bindings_of(&id("/m/a")).is_empty());
}

#[tokio::test]
async fn failed_load_releases_partial_resources() {
    let fx = Fixture::new();
    fx.loader.fail("/m/a", true);
    fx.tree(&["/m/a"]).await;

    fx.engine.load_module(&id("/m")).await;

    assert_eq!(*fx.loader.released.lock(), vec![id("/m/a")]);
    assert!(fx.binder.bindings_of(&id("/m/a")).is_empty());
    assert!(fx.loader.take_log().contains(&"unload /m/a none".to_string()));
}

#[tokio::test]
async fn panicking_load_hook_is_isolated() {
    let fx = Fixture::new();
    fx.loader.panicking.lock().insert(id("/m/a"));
    fx.tree(&["/m/a", "/m/b"]).await;

    fx.engine.load_module(&id("/m")).await;

    let a = fx.status("/m/a");
    assert!(a.errored);
    assert!(a.error.unwrap().contains("hook exploded"));
    assert!(fx.active("/m/b"));
}

#[tokio::test]
async fn disabled_modules_are_blocked_until_enabled() {
    let fx = Fixture::new();
    fx.dir("/m", None).await;
    fx.engine
        .register_module(id("/m/a"), Some(id("/m")), ModuleKind::File, ModuleConfig::disabled())
        .await
        .unwrap();

    fx.engine.load_module(&id("/m")).await;
    assert!(!fx.active("/m/a"));
    assert_eq!(fx.status("/m/a").blocked.as_deref(), Some("disabled: /m/a"));

    fx.engine.set_enabled(&id("/m/a"), true).await.unwrap();
    assert!(fx.active("/m/a"));

    fx.engine.set_enabled(&id("/m/a"), false).await.unwrap();
    assert!(!fx.active("/m/a"));
    assert!(!fx.status("/m/a").enabled);

    assert!(matches!(
        fx.engine.set_enabled(&id("/m/missing"), true).await,
        Err(ModuleError::NotFound(_))
    ));
}

#[tokio::test]
async fn disabling_a_folder_unloads_its_subtree() {
    let fx = Fixture::new();
    fx.tree(&["/m/a"]).await;
    fx.engine.load_module(&id("/m")).await;

    fx.engine.set_enabled(&id("/m"), false).await.unwrap();
    assert!(!fx.active("/m/a"));
    assert!(!fx.engine.load_module(&id("/m/a")).await);
    assert_eq!(fx.status("/m/a").blocked.as_deref(), Some("disabled: /m"));

    fx.engine.set_enabled(&id("/m"), true).await.unwrap();
    assert!(fx.active("/m/a"));
}

#[tokio::test]
async fn pure_dependency_cycle_is_blocked() {
    let fx = Fixture::new();
    fx.extractor.set("/m/a", &["/m/b"]);
    fx.extractor.set("/m/b", &["/m/a"]);
    fx.tree(&["/m/a", "/m/b"]).await;

    fx.engine.load_module(&id("/m")).await;

    assert!(!fx.active("/m/a"));
    assert!(!fx.active("/m/b"));
    // `/m/b` closes the cycle once both dependency sets are known
    let blocked = fx.status("/m/b").blocked.unwrap();
    assert!(blocked.starts_with("dependency cycle"), "{blocked}");
    fx.assert_invariant();
}

#[tokio::test]
async fn folder_may_depend_on_its_own_child() {
    let fx = Fixture::new();
    fx.dir("/m", None).await;
    fx.dir("/m/f", Some("/m")).await;
    fx.file("/m/f/c", "/m/f").await;
    fx.extractor.set("/m/f", &["/m/f/c"]);

    fx.engine.load_module(&id("/m")).await;

    assert!(fx.active("/m/f"));
    assert!(fx.active("/m/f/c"));
    fx.assert_invariant();
}

#[tokio::test]
async fn unavailable_plugin_blocks_until_reloaded() {
    let fx = Fixture::new();
    let db = id("plugin:db");
    fx.extractor.set("/m/a", &["plugin:db"]);
    fx.gate.notify(&db, false);
    fx.tree(&["/m/a"]).await;

    fx.engine.load_module(&id("/m")).await;
    assert!(!fx.active("/m/a"));
    assert_eq!(
        fx.status("/m/a").blocked.as_deref(),
        Some("plugin unavailable: plugin:db")
    );
    assert_eq!(fx.engine.dependers_of(&db), vec![id("/m/a")]);

    assert!(fx.gate.notify(&db, true));
    fx.engine.reload_dependency(&db).await;
    assert!(fx.active("/m/a"));
}

#[tokio::test]
async fn status_is_published_to_the_store() {
    let fx = Fixture::new();
    fx.tree(&["/m/a"]).await;
    let store = fx.engine.store().clone();
    let root = fx.engine.status_root();

    let changes = Arc::new(Mutex::new(Vec::new()));
    let sink = changes.clone();
    store
        .add_listener(
            root,
            ["modules", "/m/a", "active"],
            ListenerOptions::new().activate_if_unchanged(false),
            move |change| sink.lock().push(change.new.clone()),
        )
        .unwrap();

    fx.engine.load_module(&id("/m")).await;

    assert_eq!(
        store.get(root, ["modules", "/m/a", "active"]).unwrap(),
        Some(json!(true))
    );
    assert_eq!(
        store.get(root, ["modules", "/m/a", "kind"]).unwrap(),
        Some(json!("file"))
    );
    assert_eq!(*changes.lock(), vec![Some(json!(true))]);

    fx.engine.remove_module(&id("/m/a")).await.unwrap();
    assert_eq!(store.get(root, ["modules", "/m/a"]).unwrap(), None);
    assert_eq!(changes.lock().last(), Some(&None));
}

#[tokio::test]
async fn removing_a_folder_unloads_and_unpublishes_its_subtree() {
    let fx = Fixture::new();
    fx.dir("/m", None).await;
    fx.dir("/m/d", Some("/m")).await;
    fx.file("/m/d/x", "/m/d").await;
    fx.file("/m/user", "/m").await;
    fx.extractor.set("/m/user", &["/m/d/x"]);
    fx.engine.load_module(&id("/m")).await;
    assert!(fx.active("/m/user"));
    fx.loader.take_log();

    let mut events = fx.engine.subscribe();
    fx.engine.remove_module(&id("/m/d")).await.unwrap();

    assert!(!fx.engine.contains(&id("/m/d")));
    assert!(!fx.engine.contains(&id("/m/d/x")));
    assert!(!fx.active("/m/user"));
    assert_eq!(
        fx.loader.take_log(),
        vec!["unload /m/user handle", "unload /m/d/x handle", "unload /m/d handle"]
    );

    let mut removed = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ModuleEvent::Removed(module) = event {
            removed.push(module);
        }
    }
    assert_eq!(removed, vec![id("/m/d"), id("/m/d/x")]);
    fx.assert_invariant();

    // a returning dependency brings its depender back
    fx.dir("/m/d", Some("/m")).await;
    fx.file("/m/d/x", "/m/d").await;
    fx.engine.load_module(&id("/m/d")).await;
    assert!(fx.active("/m/user"));
}

#[tokio::test]
async fn invariant_holds_across_operations() {
    let fx = Fixture::new();
    fx.extractor.set("/m/a", &["/m/b"]);
    fx.extractor.set("/m/c", &["/m/a", "plugin:x"]);
    fx.tree(&["/m/a", "/m/b", "/m/c"]).await;

    fx.engine.load_module(&id("/m")).await;
    fx.assert_invariant();
    assert!(fx.active("/m/c"));

    fx.engine.unload_module(&id("/m/b")).await;
    fx.assert_invariant();
    assert!(!fx.active("/m/c"));

    fx.engine.load_module(&id("/m/b")).await;
    fx.assert_invariant();
    assert!(fx.active("/m/a") && fx.active("/m/c"));

    fx.gate.notify(&id("plugin:x"), false);
    fx.engine.reload_dependency(&id("plugin:x")).await;
    fx.assert_invariant();
    assert!(!fx.active("/m/c"));

    fx.engine.set_enabled(&id("/m/b"), false).await.unwrap();
    fx.assert_invariant();

    fx.loader.fail("/m/b", true);
    fx.engine.set_enabled(&id("/m/b"), true).await.unwrap();
    fx.assert_invariant();
    assert!(!fx.active("/m/a"));

    fx.engine.remove_module(&id("/m/b")).await.unwrap();
    fx.assert_invariant();
}

#[tokio::test]
async fn lifecycle_events_are_broadcast() {
    let fx = Fixture::new();
    let mut events = fx.engine.subscribe();
    fx.loader.fail("/m/bad", true);
    fx.tree(&["/m/bad"]).await;

    fx.engine.load_module(&id("/m")).await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.contains(&ModuleEvent::Discovered(id("/m"))));
    assert!(seen.contains(&ModuleEvent::Loaded(id("/m"))));
    assert!(seen.iter().any(|e| matches!(
        e,
        ModuleEvent::LoadFailed { module, error: ModuleError::Load { .. } } if module == &id("/m/bad")
    )));
}

#[tokio::test]
async fn duplicate_and_orphan_registrations_are_rejected() {
    let fx = Fixture::new();
    fx.dir("/m", None).await;

    let dup = fx
        .engine
        .register_module(id("/m"), None, ModuleKind::Directory, ModuleConfig::default())
        .await;
    assert_eq!(dup, Err(ModuleError::AlreadyRegistered(id("/m"))));

    let orphan = fx
        .engine
        .register_module(id("/x/y"), Some(id("/x")), ModuleKind::File, ModuleConfig::default())
        .await;
    assert!(matches!(orphan, Err(ModuleError::UnknownParent { .. })));
}

#[test]
fn module_id_name_is_last_component() {
    assert_eq!(id("/srv/mods/a.rs").name(), "a.rs");
    assert_eq!(id("plugin:db").name(), "plugin:db");
    assert_eq!(StorePath::from_segments(["modules", id("/a").as_str()]).unwrap().len(), 2);
}
