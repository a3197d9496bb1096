//! Observable store
//!
//! A tree of JSON-like values held in an arena of nodes, with listeners that
//! watch root-relative paths. A compound value may be reachable through more
//! than one `(parent, key)` edge (aliasing); a write then notifies listeners
//! on every route that reaches the written container.
//!
//! Writes go through an explicit API ([`ObservableStore::set`],
//! [`ObservableStore::delete`], [`ObservableStore::apply`]). Notifications
//! are collected while the store lock is held and delivered after it is
//! released, so callbacks may write to the store themselves.

mod error;
mod listener;
mod node;
mod path;


use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::binder::ResourceBinder;
use crate::context;
use crate::module::ModuleId;

pub use error::{StoreError, StoreResult};
pub use listener::{Change, ListenerHandle, ListenerOptions};
pub use node::{Item, NodeRef};
pub use path::{IntoStorePath, StorePath};

use listener::{Callback, ListenerTree, Subscription};
use node::{Arena, Container, Entry, Side, check_index, check_value};

/// A root-relative location at which a node is reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub root: NodeRef,
    pub path: StorePath,
}

/// Options for a single write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// The caller expects the target to be reachable through several routes.
    pub multiple: bool,
}

struct Pending {
    callback: Callback,
    owner: Option<ModuleId>,
    change: Change,
}

pub(crate) struct StoreState {
    arena: Arena,
    listeners: HashMap<NodeRef, ListenerTree>,
    suppressed: usize,
    next_subscription: u64,
}

/// Suppresses notifications for as long as it lives.
struct Suppressed<'a> {
    state: &'a mut StoreState,
}

impl<'a> Suppressed<'a> {
    fn new(state: &'a mut StoreState) -> Self {
        state.suppressed += 1;
        Self { state }
    }
}

impl Deref for Suppressed<'_> {
    type Target = StoreState;

    fn deref(&self) -> &StoreState {
        self.state
    }
}

impl DerefMut for Suppressed<'_> {
    fn deref_mut(&mut self) -> &mut StoreState {
        self.state
    }
}

impl Drop for Suppressed<'_> {
    fn drop(&mut self) {
        self.state.suppressed -= 1;
    }
}

impl StoreState {
    fn new() -> Self {
        Self {
            arena: Arena::default(),
            listeners: HashMap::new(),
            suppressed: 0,
            next_subscription: 0,
        }
    }

    fn routes(&self, node: NodeRef) -> StoreResult<Vec<Route>> {
        Ok(self
            .arena
            .routes(node)?
            .into_iter()
            .map(|(root, segments)| Route {
                root,
                path: StorePath::from_keys(segments),
            })
            .collect())
    }

    pub(crate) fn remove_listener(&mut self, root: NodeRef, path: &StorePath, id: u64) -> bool {
        let Some(tree) = self.listeners.get_mut(&root) else {
            return false;
        };
        let removed = tree.remove(path.segments(), id);
        if tree.is_empty() {
            self.listeners.remove(&root);
        }
        removed
    }

    /// Write or delete `node[key]` and collect the notifications it causes.
    fn write(
        &mut self,
        node: NodeRef,
        key: &str,
        item: Option<Item>,
        options: WriteOptions,
        pending: &mut Vec<Pending>,
    ) -> StoreResult<()> {
        self.arena.check_key(node, key)?;
        match &item {
            Some(Item::Value(value)) => check_value(value)?,
            Some(Item::Node(child)) => self.arena.check_attach(node, *child)?,
            None => {}
        }

        let old = self.arena.side(node, key)?;
        match item {
            Some(Item::Value(value)) => {
                let entry = self.arena.wrap(value);
                self.arena.put(node, key, entry)?;
            }
            Some(Item::Node(child)) => self.arena.put(node, key, Entry::Node(child))?,
            None => {
                if old.is_absent() {
                    return Ok(());
                }
                self.arena.remove(node, key)?;
            }
        }
        let new = self.arena.side(node, key)?;

        if self.suppressed == 0 {
            self.collect_change(node, Some(key), &old, &new, options, pending)?;
        }
        Ok(())
    }

    /// Walk every route to `node[key]` (or `node` itself) and queue the
    /// listeners a change from `old` to `new` activates.
    fn collect_change(
        &self,
        node: NodeRef,
        key: Option<&str>,
        old: &Side,
        new: &Side,
        options: WriteOptions,
        pending: &mut Vec<Pending>,
    ) -> StoreResult<()> {
        if old.is_absent() && new.is_absent() {
            return Ok(());
        }
        let routes = self.routes(node)?;
        if routes.len() > 1 && !options.multiple {
            warn!(
                node = %node,
                routes = routes.len(),
                "Store write reaches several routes without `multiple`"
            );
        }

        let unchanged = old.same(new);
        let initial = old.is_absent();

        for route in routes {
            let Some(tree) = self.listeners.get(&route.root) else {
                continue;
            };
            let path = match key {
                Some(key) => route.path.join(key),
                None => route.path,
            };
            let mut changes = ChangeCache::new(route.root, path.clone(), old, new);

            let mut level = Some(tree);
            for segment in path.segments() {
                let Some(current) = level else { break };
                for subscription in &current.own {
                    if subscription.options.activate_from_parent
                        && subscription.options.admits(unchanged, initial)
                    {
                        pending.push(changes.pending_for(subscription, &self.arena));
                    }
                }
                level = current.children.get(segment);
            }

            if let Some(terminal) = level {
                for subscription in &terminal.own {
                    if subscription.options.admits(unchanged, initial) {
                        pending.push(changes.pending_for(subscription, &self.arena));
                    }
                }
                self.collect_below(terminal, route.root, &path, old, new, pending);
            }
        }
        Ok(())
    }

    fn collect_below(
        &self,
        tree: &ListenerTree,
        root: NodeRef,
        path: &StorePath,
        old: &Side,
        new: &Side,
        pending: &mut Vec<Pending>,
    ) {
        for (segment, child) in &tree.children {
            let old_child = old.child(&self.arena, segment);
            let new_child = new.child(&self.arena, segment);
            if old_child.same(&new_child) {
                continue;
            }
            let child_path = path.join(segment.clone());
            let mut changes = ChangeCache::new(root, child_path.clone(), &old_child, &new_child);
            let initial = old_child.is_absent();
            for subscription in &child.own {
                if subscription.options.admits(false, initial) {
                    pending.push(changes.pending_for(subscription, &self.arena));
                }
            }
            self.collect_below(child, root, &child_path, &old_child, &new_child, pending);
        }
    }
}

/// Materializes the values of one change at most once.
struct ChangeCache<'a> {
    root: NodeRef,
    path: StorePath,
    old: &'a Side,
    new: &'a Side,
    values: Option<(Option<Value>, Option<Value>)>,
}

impl<'a> ChangeCache<'a> {
    fn new(root: NodeRef, path: StorePath, old: &'a Side, new: &'a Side) -> Self {
        Self {
            root,
            path,
            old,
            new,
            values: None,
        }
    }

    fn pending_for(&mut self, subscription: &Subscription, arena: &Arena) -> Pending {
        let (old, new) = self
            .values
            .get_or_insert_with(|| (self.old.materialize(arena), self.new.materialize(arena)))
            .clone();
        Pending {
            callback: subscription.callback.clone(),
            owner: subscription.owner.clone(),
            change: Change {
                root: self.root,
                path: self.path.clone(),
                old,
                new,
            },
        }
    }
}

fn dispatch(pending: Vec<Pending>) {
    for Pending {
        callback,
        owner,
        change,
    } in pending
    {
        let run = || catch_unwind(AssertUnwindSafe(|| callback(&change)));
        let outcome = match owner.clone() {
            Some(owner) => context::sync_scope(owner, run),
            None => run(),
        };
        if outcome.is_err() {
            error!(
                path = %change.path,
                owner = ?owner,
                "Store listener panicked"
            );
        }
    }
}

/// A shared, observable tree of JSON values.
///
/// Cloning the store yields another handle to the same tree.
#[derive(Clone)]
pub struct ObservableStore {
    state: Arc<Mutex<StoreState>>,
    binder: Option<Arc<ResourceBinder>>,
}

impl Default for ObservableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ObservableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ObservableStore")
            .field("nodes", &state.arena.len())
            .field("rooted_listeners", &state.listeners.len())
            .field("owner_bound", &self.binder.is_some())
            .finish()
    }
}

impl ObservableStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::new())),
            binder: None,
        }
    }

    /// Bind subscriptions made inside a module's context to that module,
    /// so they are removed when the module unloads.
    pub fn with_binder(mut self, binder: Arc<ResourceBinder>) -> Self {
        self.binder = Some(binder);
        self
    }

    /// Wrap `initial` (an object or an array) as a new root.
    pub fn create_server(&self, initial: Value) -> StoreResult<NodeRef> {
        let root = self.state.lock().arena.create_root(initial)?;
        debug!(root = %root, "Created store root");
        Ok(root)
    }

    /// Every root of this store.
    pub fn roots(&self) -> Vec<NodeRef> {
        let mut roots: Vec<_> = self.state.lock().arena.roots().collect();
        roots.sort();
        roots
    }

    /// Whether the handle still refers to a live node.
    pub fn contains(&self, node: NodeRef) -> bool {
        self.state.lock().arena.contains(node)
    }

    /// Read the value at `path` below `node`.
    pub fn get(&self, node: NodeRef, path: impl IntoStorePath) -> StoreResult<Option<Value>> {
        let path = path.into_store_path()?;
        let state = self.state.lock();
        let mut current = node;
        let segments = path.segments();
        for (i, segment) in segments.iter().enumerate() {
            match state.arena.entry(current, segment)? {
                None => return Ok(None),
                Some(Entry::Node(next)) => current = *next,
                Some(Entry::Leaf(value)) => {
                    return Ok((i + 1 == segments.len()).then(|| value.clone()));
                }
            }
        }
        Ok(Some(state.arena.materialize_node(current)))
    }

    /// The full value of `node`.
    pub fn snapshot(&self, node: NodeRef) -> StoreResult<Value> {
        let state = self.state.lock();
        state.arena.node(node)?;
        Ok(state.arena.materialize_node(node))
    }

    /// Handle to the compound value at `path` below `node`, if there is one.
    pub fn child(&self, node: NodeRef, path: impl IntoStorePath) -> StoreResult<Option<NodeRef>> {
        let path = path.into_store_path()?;
        let state = self.state.lock();
        let mut current = node;
        state.arena.node(current)?;
        for segment in path.segments() {
            match state.arena.entry(current, segment)? {
                Some(Entry::Node(next)) => current = *next,
                _ => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Every root-relative route reaching `node`.
    pub fn routes(&self, node: NodeRef) -> StoreResult<Vec<Route>> {
        self.state.lock().routes(node)
    }

    /// Number of subscriptions attached to `root`.
    pub fn listener_count(&self, root: NodeRef) -> usize {
        self.state
            .lock()
            .listeners
            .get(&root)
            .map_or(0, ListenerTree::count)
    }

    pub fn set(&self, node: NodeRef, key: &str, item: impl Into<Item>) -> StoreResult<()> {
        self.set_with(node, key, item, WriteOptions::default())
    }

    pub fn set_with(
        &self,
        node: NodeRef,
        key: &str,
        item: impl Into<Item>,
        options: WriteOptions,
    ) -> StoreResult<()> {
        self.mutate(|state, pending| state.write(node, key, Some(item.into()), options, pending))
    }

    /// Remove `node[key]`. Deleting an absent key is a silent no-op.
    pub fn delete(&self, node: NodeRef, key: &str) -> StoreResult<()> {
        self.delete_with(node, key, WriteOptions::default())
    }

    pub fn delete_with(&self, node: NodeRef, key: &str, options: WriteOptions) -> StoreResult<()> {
        self.mutate(|state, pending| state.write(node, key, None, options, pending))
    }

    /// Write `value` at `path` below `node`, creating missing containers.
    ///
    /// With an empty path the whole content of `node` is replaced and
    /// listeners see a single change from the old content to the new one.
    /// `None` deletes the value at `path`.
    pub fn apply(
        &self,
        node: NodeRef,
        value: Option<Value>,
        path: impl IntoStorePath,
    ) -> StoreResult<()> {
        self.apply_with(node, value, path, WriteOptions::default())
    }

    pub fn apply_with(
        &self,
        node: NodeRef,
        value: Option<Value>,
        path: impl IntoStorePath,
        options: WriteOptions,
    ) -> StoreResult<()> {
        let path = path.into_store_path()?;
        if path.is_empty() {
            return self.mutate(|state, pending| replace_content(state, node, value, options, pending));
        }

        self.mutate(|state, pending| {
            let segments = path.segments();
            let (last, parents) = segments
                .split_last()
                .ok_or_else(|| StoreError::InvalidArgument("empty path".to_string()))?;

            let mut current = node;
            for (i, segment) in parents.iter().enumerate() {
                match state.arena.entry(current, segment)? {
                    Some(Entry::Node(next)) => current = *next,
                    Some(Entry::Leaf(_)) => {
                        let prefix = StorePath::from_segments(segments[..=i].iter().cloned())?;
                        return Err(StoreError::NotAContainer(prefix.to_string()));
                    }
                    None => {
                        let Some(value) = value else {
                            return Ok(());
                        };
                        let nested = vivify(&segments[i + 1..], value)?;
                        return state.write(current, segment, Some(Item::Value(nested)), options, pending);
                    }
                }
            }
            state.write(current, last, value.map(Item::Value), options, pending)
        })
    }

    /// Subscribe `callback` to changes at `path` below `node`.
    ///
    /// When called inside a module's context and the store has a binder, the
    /// subscription is removed automatically when that module unloads.
    pub fn add_listener<F>(
        &self,
        node: NodeRef,
        path: impl IntoStorePath,
        options: ListenerOptions,
        callback: F,
    ) -> StoreResult<Vec<ListenerHandle>>
    where
        F: Fn(&Change) + Send + Sync + 'static,
    {
        let path = path.into_store_path()?;
        let callback: Callback = Arc::new(callback);
        let owner = context::current_owner();

        let handles = {
            let mut state = self.state.lock();
            let mut routes = state.routes(node)?;
            if routes.is_empty() {
                return Err(StoreError::Detached(node.0));
            }
            if routes.len() > 1 && !options.multiple {
                warn!(
                    node = %node,
                    path = %path,
                    routes = routes.len(),
                    "Listener target reaches several routes without `multiple`; subscribing on the first"
                );
                routes.truncate(1);
            }

            let mut handles = Vec::with_capacity(routes.len());
            for route in routes {
                state.next_subscription += 1;
                let id = state.next_subscription;
                let full = route.path.concat(&path);
                state.listeners.entry(route.root).or_default().insert(
                    full.segments(),
                    Subscription {
                        id,
                        options,
                        callback: callback.clone(),
                        owner: owner.clone(),
                    },
                );
                handles.push(ListenerHandle {
                    state: Arc::downgrade(&self.state),
                    root: route.root,
                    path: full,
                    id,
                });
            }
            handles
        };

        if let (Some(binder), Some(_)) = (&self.binder, &owner) {
            for handle in &handles {
                let handle = handle.clone();
                binder.bind(format!("listener {}", handle.path), move || {
                    handle.remove_self();
                    Ok(())
                });
            }
        }
        Ok(handles)
    }

    fn mutate<F>(&self, f: F) -> StoreResult<()>
    where
        F: FnOnce(&mut StoreState, &mut Vec<Pending>) -> StoreResult<()>,
    {
        let pending = {
            let mut state = self.state.lock();
            let mut pending = Vec::new();
            let outcome = f(&mut state, &mut pending);
            let freed = state.arena.sweep();
            if freed > 0 {
                debug!(freed, "Collected unreachable store nodes");
            }
            outcome?;
            pending
        };
        dispatch(pending);
        Ok(())
    }
}

/// Replace all content of `node` and report it as one change.
fn replace_content(
    state: &mut StoreState,
    node: NodeRef,
    value: Option<Value>,
    options: WriteOptions,
    pending: &mut Vec<Pending>,
) -> StoreResult<()> {
    let value = value.ok_or_else(|| {
        StoreError::InvalidArgument("cannot delete a node's entire content".to_string())
    })?;
    let template = Container::empty_like(&value).ok_or_else(|| {
        StoreError::InvalidArgument(format!("content must be an object or an array, got {value}"))
    })?;
    let before = state.arena.container(node)?.clone();

    let filled = {
        let mut guard = Suppressed::new(state);
        fill_content(&mut guard, node, &template, value, options, pending)
    };
    if let Err(e) = filled {
        let mut guard = Suppressed::new(state);
        restore_content(&mut guard, node, &before, options, pending)?;
        return Err(e);
    }

    state.collect_change(node, None, &Side::Detached(before), &Side::Node(node), options, pending)
}

/// Empty `node`, switch it to the kind of `template` and write `value`'s
/// entries into it. Notifications must be suppressed by the caller.
fn fill_content(
    state: &mut StoreState,
    node: NodeRef,
    template: &Container,
    value: Value,
    options: WriteOptions,
    pending: &mut Vec<Pending>,
) -> StoreResult<()> {
    clear_content(state, node, options, pending)?;
    state.arena.reset_kind(node, template)?;
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                state.write(node, &key, Some(Item::Value(child)), options, pending)?;
            }
        }
        Value::Array(items) => {
            for (i, child) in items.into_iter().enumerate() {
                state.write(node, &i.to_string(), Some(Item::Value(child)), options, pending)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Put back the entries `node` held before a failed [`fill_content`].
/// Child nodes are re-attached rather than copied, so they keep their
/// identity and listeners.
fn restore_content(
    state: &mut StoreState,
    node: NodeRef,
    before: &Container,
    options: WriteOptions,
    pending: &mut Vec<Pending>,
) -> StoreResult<()> {
    clear_content(state, node, options, pending)?;
    state.arena.reset_kind(node, before)?;
    let entries: Vec<(String, &Entry)> = match before {
        Container::Object(map) => map.iter().map(|(key, entry)| (key.clone(), entry)).collect(),
        Container::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, entry)| (i.to_string(), entry))
            .collect(),
    };
    for (key, entry) in entries {
        let item = match entry {
            Entry::Leaf(value) => Item::Value(value.clone()),
            Entry::Node(child) => Item::Node(*child),
        };
        state.write(node, &key, Some(item), options, pending)?;
    }
    Ok(())
}

/// Delete every entry of `node`, last first so arrays shrink cleanly.
fn clear_content(
    state: &mut StoreState,
    node: NodeRef,
    options: WriteOptions,
    pending: &mut Vec<Pending>,
) -> StoreResult<()> {
    let mut keys = state.arena.container(node)?.keys();
    keys.reverse();
    for key in keys {
        state.write(node, &key, None, options, pending)?;
    }
    Ok(())
}

/// Nest `value` under the remaining path segments, choosing an array for
/// numeric segments and an object otherwise.
fn vivify(segments: &[String], value: Value) -> StoreResult<Value> {
    segments.iter().rev().try_fold(value, |inner, segment| match segment.parse::<usize>() {
        Ok(index) => {
            check_index(0, index)?;
            let mut items = vec![Value::Null; index + 1];
            items[index] = inner;
            Ok(Value::Array(items))
        }
        Err(_) => {
            let mut map = serde_json::Map::new();
            map.insert(segment.clone(), inner);
            Ok(Value::Object(map))
        }
    })
}
