//! Node arena backing the observable store.
//!
//! Compound values live in the arena as nodes. A node records every
//! `(parent, key)` edge it is reachable through, so a value written in two
//! places is one node with two edges rather than two copies. Nodes with no
//! edges that are not roots are collected by [`Arena::sweep`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use serde_json::Value;

use super::error::{StoreError, StoreResult};

/// Handle to a compound value held by an [`ObservableStore`](super::ObservableStore).
///
/// Handles stay valid while the node is reachable from a root. Once a node
/// is unreachable it is collected and the handle reports
/// [`StoreError::UnknownNode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeRef(pub(crate) u64);

impl NodeRef {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A value to write into the store.
///
/// `Item::Value` always creates fresh nodes for compound values;
/// `Item::Node` aliases an existing node at the new location.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Value(Value),
    Node(NodeRef),
}

impl From<Value> for Item {
    fn from(value: Value) -> Self {
        Item::Value(value)
    }
}

impl From<NodeRef> for Item {
    fn from(node: NodeRef) -> Self {
        Item::Node(node)
    }
}

impl From<bool> for Item {
    fn from(value: bool) -> Self {
        Item::Value(Value::Bool(value))
    }
}

impl From<&str> for Item {
    fn from(value: &str) -> Self {
        Item::Value(Value::String(value.to_string()))
    }
}

impl From<String> for Item {
    fn from(value: String) -> Self {
        Item::Value(Value::String(value))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Entry {
    Leaf(Value),
    Node(NodeRef),
}

#[derive(Debug, Clone)]
pub(crate) enum Container {
    Object(BTreeMap<String, Entry>),
    Array(Vec<Entry>),
}

impl Container {
    pub(crate) fn empty_like(value: &Value) -> Option<Self> {
        match value {
            Value::Object(_) => Some(Container::Object(BTreeMap::new())),
            Value::Array(_) => Some(Container::Array(Vec::new())),
            _ => None,
        }
    }

    pub(crate) fn get(&self, key: &str) -> Option<&Entry> {
        match self {
            Container::Object(map) => map.get(key),
            Container::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        }
    }

    pub(crate) fn keys(&self) -> Vec<String> {
        match self {
            Container::Object(map) => map.keys().cloned().collect(),
            Container::Array(items) => (0..items.len()).map(|i| i.to_string()).collect(),
        }
    }

    fn child_nodes(&self) -> Vec<(String, NodeRef)> {
        match self {
            Container::Object(map) => map
                .iter()
                .filter_map(|(k, e)| match e {
                    Entry::Node(n) => Some((k.clone(), *n)),
                    Entry::Leaf(_) => None,
                })
                .collect(),
            Container::Array(items) => items
                .iter()
                .enumerate()
                .filter_map(|(i, e)| match e {
                    Entry::Node(n) => Some((i.to_string(), *n)),
                    Entry::Leaf(_) => None,
                })
                .collect(),
        }
    }

    fn same_kind(&self, other: &Container) -> bool {
        matches!(
            (self, other),
            (Container::Object(_), Container::Object(_)) | (Container::Array(_), Container::Array(_))
        )
    }
}

#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) container: Container,
    pub(crate) parents: Vec<(NodeRef, String)>,
}

/// One side of a change, captured before or after a write.
#[derive(Debug, Clone)]
pub(crate) enum Side {
    Absent,
    Leaf(Value),
    Node(NodeRef),
    /// Content that no longer belongs to any node, kept for diffing.
    Detached(Container),
}

impl Side {
    fn from_entry(entry: Option<&Entry>) -> Self {
        match entry {
            None => Side::Absent,
            Some(Entry::Leaf(v)) => Side::Leaf(v.clone()),
            Some(Entry::Node(n)) => Side::Node(*n),
        }
    }

    pub(crate) fn is_absent(&self) -> bool {
        matches!(self, Side::Absent)
    }

    /// Identity for nodes, equality for scalars.
    pub(crate) fn same(&self, other: &Side) -> bool {
        match (self, other) {
            (Side::Absent, Side::Absent) => true,
            (Side::Leaf(a), Side::Leaf(b)) => a == b,
            (Side::Node(a), Side::Node(b)) => a == b,
            _ => false,
        }
    }

    pub(crate) fn child(&self, arena: &Arena, key: &str) -> Side {
        match self {
            Side::Absent | Side::Leaf(_) => Side::Absent,
            Side::Node(n) => Side::from_entry(arena.nodes.get(n).and_then(|n| n.container.get(key))),
            Side::Detached(c) => Side::from_entry(c.get(key)),
        }
    }

    pub(crate) fn materialize(&self, arena: &Arena) -> Option<Value> {
        match self {
            Side::Absent => None,
            Side::Leaf(v) => Some(v.clone()),
            Side::Node(n) => Some(arena.materialize_node(*n)),
            Side::Detached(c) => Some(arena.materialize_container(c)),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Arena {
    nodes: HashMap<NodeRef, Node>,
    roots: HashSet<NodeRef>,
    next_id: u64,
    // nodes that lost an edge or were just allocated
    candidates: Vec<NodeRef>,
}

impl Arena {
    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn roots(&self) -> impl Iterator<Item = NodeRef> + '_ {
        self.roots.iter().copied()
    }

    pub(crate) fn contains(&self, node: NodeRef) -> bool {
        self.nodes.contains_key(&node)
    }

    pub(crate) fn node(&self, node: NodeRef) -> StoreResult<&Node> {
        self.nodes.get(&node).ok_or(StoreError::UnknownNode(node.0))
    }

    fn node_mut(&mut self, node: NodeRef) -> StoreResult<&mut Node> {
        self.nodes.get_mut(&node).ok_or(StoreError::UnknownNode(node.0))
    }

    /// Wrap a compound value as a new root.
    pub(crate) fn create_root(&mut self, value: Value) -> StoreResult<NodeRef> {
        check_value(&value)?;
        match self.wrap(value) {
            Entry::Node(id) => {
                self.roots.insert(id);
                Ok(id)
            }
            Entry::Leaf(v) => Err(StoreError::InvalidArgument(format!(
                "a store root must be an object or an array, got {v}"
            ))),
        }
    }

    /// Convert a value into an entry, allocating fresh nodes for every
    /// compound value inside it.
    pub(crate) fn wrap(&mut self, value: Value) -> Entry {
        match value {
            Value::Object(map) => {
                let id = self.reserve();
                let mut entries = BTreeMap::new();
                for (key, child) in map {
                    let entry = self.wrap(child);
                    if let Entry::Node(c) = &entry {
                        self.add_edge(*c, id, &key);
                    }
                    entries.insert(key, entry);
                }
                self.insert_node(id, Container::Object(entries));
                Entry::Node(id)
            }
            Value::Array(items) => {
                let id = self.reserve();
                let mut entries = Vec::with_capacity(items.len());
                for (i, child) in items.into_iter().enumerate() {
                    let entry = self.wrap(child);
                    if let Entry::Node(c) = &entry {
                        self.add_edge(*c, id, &i.to_string());
                    }
                    entries.push(entry);
                }
                self.insert_node(id, Container::Array(entries));
                Entry::Node(id)
            }
            scalar => Entry::Leaf(scalar),
        }
    }

    fn reserve(&mut self) -> NodeRef {
        self.next_id += 1;
        NodeRef(self.next_id)
    }

    fn insert_node(&mut self, id: NodeRef, container: Container) {
        self.nodes.insert(
            id,
            Node {
                container,
                parents: Vec::new(),
            },
        );
        self.candidates.push(id);
    }

    fn add_edge(&mut self, child: NodeRef, parent: NodeRef, key: &str) {
        if let Some(node) = self.nodes.get_mut(&child) {
            node.parents.push((parent, key.to_string()));
        }
    }

    fn remove_edge(&mut self, child: NodeRef, parent: NodeRef, key: &str) {
        if let Some(node) = self.nodes.get_mut(&child) {
            if let Some(pos) = node.parents.iter().position(|(p, k)| *p == parent && k == key) {
                node.parents.remove(pos);
            }
            if node.parents.is_empty() {
                self.candidates.push(child);
            }
        }
    }

    /// Reject keys the container can never hold.
    pub(crate) fn check_key(&self, node: NodeRef, key: &str) -> StoreResult<()> {
        if key.is_empty() {
            return Err(StoreError::InvalidArgument("empty key".to_string()));
        }
        match &self.node(node)?.container {
            Container::Object(_) => Ok(()),
            Container::Array(_) => parse_index(key).map(|_| ()),
        }
    }

    /// Reject aliasing `child` under `parent` when it would form a cycle.
    pub(crate) fn check_attach(&self, parent: NodeRef, child: NodeRef) -> StoreResult<()> {
        self.node(child)?;
        if self.reaches(parent, child) {
            return Err(StoreError::Cycle {
                node: child.0,
                parent: parent.0,
            });
        }
        Ok(())
    }

    /// Whether `target` is `from` or one of its ancestors.
    fn reaches(&self, from: NodeRef, target: NodeRef) -> bool {
        let mut stack = vec![from];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == target {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(node) = self.nodes.get(&current) {
                stack.extend(node.parents.iter().map(|(p, _)| *p));
            }
        }
        false
    }

    pub(crate) fn side(&self, node: NodeRef, key: &str) -> StoreResult<Side> {
        Ok(Side::from_entry(self.node(node)?.container.get(key)))
    }

    pub(crate) fn entry(&self, node: NodeRef, key: &str) -> StoreResult<Option<&Entry>> {
        Ok(self.node(node)?.container.get(key))
    }

    /// Store `entry` at `node[key]`, moving edges from the old value to the
    /// new one. Arrays are padded with nulls up to the index.
    pub(crate) fn put(&mut self, node: NodeRef, key: &str, entry: Entry) -> StoreResult<()> {
        let old = {
            let target = self.node_mut(node)?;
            match &mut target.container {
                Container::Object(map) => map.insert(key.to_string(), entry.clone()),
                Container::Array(items) => {
                    let index = parse_index(key)?;
                    if index >= items.len() {
                        check_index(items.len(), index)?;
                        items.resize(index + 1, Entry::Leaf(Value::Null));
                        items[index] = entry.clone();
                        None
                    } else {
                        Some(std::mem::replace(&mut items[index], entry.clone()))
                    }
                }
            }
        };
        if let Entry::Node(child) = entry {
            self.add_edge(child, node, key);
        }
        if let Some(Entry::Node(child)) = old {
            self.remove_edge(child, node, key);
        }
        Ok(())
    }

    /// Remove `node[key]`. The last array element is popped; any other index
    /// is left as a null hole.
    pub(crate) fn remove(&mut self, node: NodeRef, key: &str) -> StoreResult<Option<Entry>> {
        let old = {
            let target = self.node_mut(node)?;
            match &mut target.container {
                Container::Object(map) => map.remove(key),
                Container::Array(items) => {
                    let index = parse_index(key)?;
                    if items.len().checked_sub(1) == Some(index) {
                        items.pop()
                    } else if index < items.len() {
                        Some(std::mem::replace(&mut items[index], Entry::Leaf(Value::Null)))
                    } else {
                        None
                    }
                }
            }
        };
        if let Some(Entry::Node(child)) = &old {
            self.remove_edge(*child, node, key);
        }
        Ok(old)
    }

    pub(crate) fn container(&self, node: NodeRef) -> StoreResult<&Container> {
        Ok(&self.node(node)?.container)
    }

    /// Swap a node's container for an empty one of the same kind as
    /// `template`. Only valid once every entry has been removed.
    pub(crate) fn reset_kind(&mut self, node: NodeRef, template: &Container) -> StoreResult<()> {
        let target = self.node_mut(node)?;
        if !target.container.same_kind(template) {
            target.container = match template {
                Container::Object(_) => Container::Object(BTreeMap::new()),
                Container::Array(_) => Container::Array(Vec::new()),
            };
        }
        Ok(())
    }

    /// Every `(root, path)` the node is reachable through.
    pub(crate) fn routes(&self, node: NodeRef) -> StoreResult<Vec<(NodeRef, Vec<String>)>> {
        self.node(node)?;
        let mut out = Vec::new();
        let mut suffix = Vec::new();
        self.collect_routes(node, &mut suffix, &mut out);
        Ok(out)
    }

    fn collect_routes(
        &self,
        node: NodeRef,
        suffix: &mut Vec<String>,
        out: &mut Vec<(NodeRef, Vec<String>)>,
    ) {
        if self.roots.contains(&node) {
            out.push((node, suffix.iter().rev().cloned().collect()));
        }
        if let Some(current) = self.nodes.get(&node) {
            for (parent, key) in &current.parents {
                suffix.push(key.clone());
                self.collect_routes(*parent, suffix, out);
                suffix.pop();
            }
        }
    }

    pub(crate) fn materialize_node(&self, node: NodeRef) -> Value {
        match self.nodes.get(&node) {
            Some(n) => self.materialize_container(&n.container),
            None => Value::Null,
        }
    }

    pub(crate) fn materialize_container(&self, container: &Container) -> Value {
        match container {
            Container::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, e)| (k.clone(), self.materialize_entry(e)))
                    .collect(),
            ),
            Container::Array(items) => {
                Value::Array(items.iter().map(|e| self.materialize_entry(e)).collect())
            }
        }
    }

    pub(crate) fn materialize_entry(&self, entry: &Entry) -> Value {
        match entry {
            Entry::Leaf(v) => v.clone(),
            Entry::Node(n) => self.materialize_node(*n),
        }
    }

    /// Collect every node that lost its last edge and is not a root.
    /// Returns the number of nodes freed.
    pub(crate) fn sweep(&mut self) -> usize {
        let mut freed = 0;
        while let Some(id) = self.candidates.pop() {
            let orphan = self
                .nodes
                .get(&id)
                .is_some_and(|n| n.parents.is_empty() && !self.roots.contains(&id));
            if !orphan {
                continue;
            }
            if let Some(node) = self.nodes.remove(&id) {
                freed += 1;
                for (key, child) in node.container.child_nodes() {
                    self.remove_edge(child, id, &key);
                }
            }
        }
        freed
    }
}

/// How far past the end of an array a write may pad with nulls.
pub(crate) const MAX_ARRAY_GAP: usize = 1024;

/// Reject an index that would pad an array of `len` items by more than
/// [`MAX_ARRAY_GAP`] nulls.
pub(crate) fn check_index(len: usize, index: usize) -> StoreResult<()> {
    if index > len.saturating_add(MAX_ARRAY_GAP) {
        return Err(StoreError::InvalidArgument(format!(
            "array index {index} is too far past the end ({len} items)"
        )));
    }
    Ok(())
}

/// Reject values holding an empty object key at any depth.
pub(crate) fn check_value(value: &Value) -> StoreResult<()> {
    match value {
        Value::Object(map) => map.iter().try_for_each(|(key, child)| {
            if key.is_empty() {
                return Err(StoreError::InvalidArgument("empty key".to_string()));
            }
            check_value(child)
        }),
        Value::Array(items) => items.iter().try_for_each(check_value),
        _ => Ok(()),
    }
}

fn parse_index(key: &str) -> StoreResult<usize> {
    key.parse::<usize>()
        .map_err(|_| StoreError::InvalidArgument(format!("array index must be numeric, got `{key}`")))
}
