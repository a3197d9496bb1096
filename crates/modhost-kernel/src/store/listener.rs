//! Subscriptions and the per-root listener tree.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;

use super::node::NodeRef;
use super::path::StorePath;
use super::StoreState;
use crate::module::ModuleId;

/// A change delivered to a listener.
///
/// `path` is where the change was observed, relative to `root`; `old` and
/// `new` are the values at that path (`None` when absent).
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub root: NodeRef,
    pub path: StorePath,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

pub(crate) type Callback = Arc<dyn Fn(&Change) + Send + Sync>;

/// Flags controlling when a subscription fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerOptions {
    /// Fire even when the written value is identical to the old one.
    pub activate_if_unchanged: bool,
    /// Fire for writes strictly below the subscribed path.
    pub activate_from_parent: bool,
    /// Skip writes that create the value (old value absent).
    pub suppress_initial_set: bool,
    /// Subscribe on every route to the target node instead of the first.
    pub multiple: bool,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            activate_if_unchanged: true,
            activate_from_parent: true,
            suppress_initial_set: false,
            multiple: false,
        }
    }
}

impl ListenerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activate_if_unchanged(mut self, enabled: bool) -> Self {
        self.activate_if_unchanged = enabled;
        self
    }

    pub fn activate_from_parent(mut self, enabled: bool) -> Self {
        self.activate_from_parent = enabled;
        self
    }

    pub fn suppress_initial_set(mut self, enabled: bool) -> Self {
        self.suppress_initial_set = enabled;
        self
    }

    pub fn multiple(mut self, enabled: bool) -> Self {
        self.multiple = enabled;
        self
    }

    /// Whether a change with the given shape passes these flags.
    pub(crate) fn admits(&self, unchanged: bool, initial: bool) -> bool {
        !(unchanged && !self.activate_if_unchanged) && !(initial && self.suppress_initial_set)
    }
}

pub(crate) struct Subscription {
    pub(crate) id: u64,
    pub(crate) options: ListenerOptions,
    pub(crate) callback: Callback,
    pub(crate) owner: Option<ModuleId>,
}

/// Listeners arranged by the shape of the paths they watch.
#[derive(Default)]
pub(crate) struct ListenerTree {
    pub(crate) own: Vec<Subscription>,
    pub(crate) children: BTreeMap<String, ListenerTree>,
}

impl ListenerTree {
    pub(crate) fn insert(&mut self, path: &[String], subscription: Subscription) {
        let mut level = self;
        for segment in path {
            level = level.children.entry(segment.clone()).or_default();
        }
        level.own.push(subscription);
    }

    /// Remove a subscription, pruning branches left empty.
    pub(crate) fn remove(&mut self, path: &[String], id: u64) -> bool {
        match path.split_first() {
            None => {
                let before = self.own.len();
                self.own.retain(|s| s.id != id);
                before != self.own.len()
            }
            Some((head, rest)) => {
                let Some(child) = self.children.get_mut(head) else {
                    return false;
                };
                let removed = child.remove(rest, id);
                if child.is_empty() {
                    self.children.remove(head);
                }
                removed
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.own.is_empty() && self.children.is_empty()
    }

    pub(crate) fn count(&self) -> usize {
        self.own.len() + self.children.values().map(ListenerTree::count).sum::<usize>()
    }
}

/// Handle to one subscription. Dropping the handle does not unsubscribe;
/// call [`ListenerHandle::remove_self`].
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    pub(crate) state: Weak<Mutex<StoreState>>,
    pub(crate) root: NodeRef,
    pub(crate) path: StorePath,
    pub(crate) id: u64,
}

impl ListenerHandle {
    /// The root this subscription is attached to.
    pub fn root(&self) -> NodeRef {
        self.root
    }

    /// The root-relative path this subscription watches.
    pub fn path(&self) -> &StorePath {
        &self.path
    }

    /// Unsubscribe. Returns `false` if it was already removed.
    pub fn remove_self(&self) -> bool {
        match self.state.upgrade() {
            Some(state) => state.lock().remove_listener(self.root, &self.path, self.id),
            None => false,
        }
    }
}
