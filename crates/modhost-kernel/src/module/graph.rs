//! Module graph: parent/child structure, dependency edges, and the
//! activation check.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::{ModuleError, ModuleResult};
use super::{ContentHandle, ModuleConfig, ModuleId, ModuleKind, PluginAvailability};

/// Why a module cannot be activated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "modules", rename_all = "snake_case")]
pub enum Blocked {
    /// The module is not registered.
    Missing(ModuleId),
    /// The module, or one it needs, is disabled.
    Disabled(ModuleId),
    /// The module, or one it needs, failed to load and has not been retried.
    Errored(ModuleId),
    /// An external dependency is reported unavailable.
    PluginUnavailable(ModuleId),
    /// The modules form a cycle of dependency edges.
    Cycle(Vec<ModuleId>),
}

impl fmt::Display for Blocked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Blocked::Missing(id) => write!(f, "missing: {id}"),
            Blocked::Disabled(id) => write!(f, "disabled: {id}"),
            Blocked::Errored(id) => write!(f, "errored: {id}"),
            Blocked::PluginUnavailable(id) => write!(f, "plugin unavailable: {id}"),
            Blocked::Cycle(ids) => {
                write!(f, "dependency cycle: ")?;
                for (i, id) in ids.iter().enumerate() {
                    if i > 0 {
                        write!(f, " -> ")?;
                    }
                    write!(f, "{id}")?;
                }
                Ok(())
            }
        }
    }
}

/// A registered module.
pub struct Module {
    pub(crate) id: ModuleId,
    pub(crate) parent: Option<ModuleId>,
    pub(crate) children: BTreeMap<String, ModuleId>,
    pub(crate) dependencies: BTreeSet<ModuleId>,
    pub(crate) kind: ModuleKind,
    pub(crate) config: ModuleConfig,
    pub(crate) active: bool,
    pub(crate) errored: bool,
    pub(crate) last_error: Option<String>,
    pub(crate) blocked: Option<Blocked>,
    pub(crate) content: Option<ContentHandle>,
    pub(crate) loads: u64,
    pub(crate) unloads: u64,
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("id", &self.id)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .field("dependencies", &self.dependencies)
            .field("kind", &self.kind)
            .field("config", &self.config)
            .field("active", &self.active)
            .field("errored", &self.errored)
            .field("last_error", &self.last_error)
            .field("blocked", &self.blocked)
            .field("has_content", &self.content.is_some())
            .finish()
    }
}

impl Module {
    fn new(id: ModuleId, parent: Option<ModuleId>, kind: ModuleKind, config: ModuleConfig) -> Self {
        Self {
            id,
            parent,
            children: BTreeMap::new(),
            dependencies: BTreeSet::new(),
            kind,
            config,
            active: false,
            errored: false,
            last_error: None,
            blocked: None,
            content: None,
            loads: 0,
            unloads: 0,
        }
    }

    pub fn id(&self) -> &ModuleId {
        &self.id
    }

    pub fn parent(&self) -> Option<&ModuleId> {
        self.parent.as_ref()
    }

    pub fn children(&self) -> impl Iterator<Item = &ModuleId> {
        self.children.values()
    }

    pub fn dependencies(&self) -> &BTreeSet<ModuleId> {
        &self.dependencies
    }

    pub fn kind(&self) -> ModuleKind {
        self.kind
    }

    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_errored(&self) -> bool {
        self.errored
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn blocked(&self) -> Option<&Blocked> {
        self.blocked.as_ref()
    }
}

/// How the activation check reached a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edge {
    Start,
    Parent,
    Dependency,
}

/// Modules keyed by id plus the reverse dependency index.
#[derive(Debug, Default)]
pub struct ModuleGraph {
    modules: HashMap<ModuleId, Module>,
    // keyed by dependency id, which need not be a registered module
    dependers: HashMap<ModuleId, BTreeSet<ModuleId>>,
}

impl ModuleGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn contains(&self, id: &ModuleId) -> bool {
        self.modules.contains_key(id)
    }

    pub fn get(&self, id: &ModuleId) -> Option<&Module> {
        self.modules.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &ModuleId) -> Option<&mut Module> {
        self.modules.get_mut(id)
    }

    pub fn ids(&self) -> Vec<ModuleId> {
        let mut ids: Vec<_> = self.modules.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Modules without a parent.
    pub fn roots(&self) -> Vec<ModuleId> {
        let mut roots: Vec<_> = self
            .modules
            .values()
            .filter(|m| m.parent.is_none())
            .map(|m| m.id.clone())
            .collect();
        roots.sort();
        roots
    }

    pub fn insert(
        &mut self,
        id: ModuleId,
        parent: Option<ModuleId>,
        kind: ModuleKind,
        config: ModuleConfig,
    ) -> ModuleResult<()> {
        if self.modules.contains_key(&id) {
            return Err(ModuleError::AlreadyRegistered(id));
        }
        if let Some(parent_id) = &parent {
            let name = id.name().to_string();
            let parent_module =
                self.modules
                    .get_mut(parent_id)
                    .ok_or_else(|| ModuleError::UnknownParent {
                        module: id.clone(),
                        parent: parent_id.clone(),
                    })?;
            parent_module.children.insert(name, id.clone());
        }
        self.modules
            .insert(id.clone(), Module::new(id, parent, kind, config));
        Ok(())
    }

    /// Remove a module and its whole subtree. Returns the removed modules,
    /// parents before children.
    ///
    /// Dependers of removed modules keep their index entries so they are
    /// found again if the module is re-registered.
    pub fn remove(&mut self, id: &ModuleId) -> ModuleResult<Vec<Module>> {
        let parent = self
            .modules
            .get(id)
            .ok_or_else(|| ModuleError::NotFound(id.clone()))?
            .parent
            .clone();
        if let Some(parent) = parent.and_then(|p| self.modules.get_mut(&p)) {
            parent.children.retain(|_, child| child != id);
        }

        let mut removed = Vec::new();
        let mut queue = vec![id.clone()];
        while let Some(next) = queue.pop() {
            let Some(module) = self.modules.remove(&next) else {
                continue;
            };
            queue.extend(module.children.values().rev().cloned());
            for dependency in &module.dependencies {
                self.unindex(dependency, &module.id);
            }
            removed.push(module);
        }
        Ok(removed)
    }

    /// Replace a module's dependencies and update the reverse index.
    pub fn set_dependencies(
        &mut self,
        id: &ModuleId,
        dependencies: impl IntoIterator<Item = ModuleId>,
    ) -> ModuleResult<()> {
        let new: BTreeSet<ModuleId> = dependencies.into_iter().filter(|d| d != id).collect();
        let module = self
            .modules
            .get_mut(id)
            .ok_or_else(|| ModuleError::NotFound(id.clone()))?;
        let old = std::mem::replace(&mut module.dependencies, new.clone());

        for gone in old.difference(&new) {
            self.unindex(gone, id);
        }
        for added in new.difference(&old) {
            self.dependers
                .entry(added.clone())
                .or_default()
                .insert(id.clone());
        }
        Ok(())
    }

    fn unindex(&mut self, dependency: &ModuleId, depender: &ModuleId) {
        if let Some(set) = self.dependers.get_mut(dependency) {
            set.remove(depender);
            if set.is_empty() {
                self.dependers.remove(dependency);
            }
        }
    }

    /// Modules that currently depend on `id`, registered or not.
    pub fn dependers_of(&self, id: &ModuleId) -> Vec<ModuleId> {
        self.dependers
            .get(id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn children_of(&self, id: &ModuleId) -> Vec<ModuleId> {
        self.modules
            .get(id)
            .map(|m| m.children.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Dependencies of `id` that are registered modules.
    pub fn present_dependencies(&self, id: &ModuleId) -> Vec<ModuleId> {
        self.modules
            .get(id)
            .map(|m| {
                m.dependencies
                    .iter()
                    .filter(|d| self.modules.contains_key(*d))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether `id` could be activated now.
    ///
    /// A module is activatable when it is enabled, not errored, none of its
    /// dependencies is a blocked plugin, and its parent and every registered
    /// dependency are activatable in turn. Revisiting a module already on
    /// the current path closes a cycle: a cycle made only of dependency edges
    /// blocks, a cycle through a parent edge is satisfied.
    pub fn check_activatable(
        &self,
        id: &ModuleId,
        plugins: &dyn PluginAvailability,
    ) -> Result<(), Blocked> {
        let mut path = Vec::new();
        let mut verified = HashSet::new();
        self.check(id, Edge::Start, plugins, &mut path, &mut verified)
    }

    fn check(
        &self,
        id: &ModuleId,
        via: Edge,
        plugins: &dyn PluginAvailability,
        path: &mut Vec<(ModuleId, Edge)>,
        verified: &mut HashSet<ModuleId>,
    ) -> Result<(), Blocked> {
        if verified.contains(id) {
            return Ok(());
        }
        if let Some(start) = path.iter().position(|(m, _)| m == id) {
            let only_dependencies = via == Edge::Dependency
                && path[start + 1..]
                    .iter()
                    .all(|(_, edge)| *edge == Edge::Dependency);
            if only_dependencies {
                let mut cycle: Vec<ModuleId> = path[start..].iter().map(|(m, _)| m.clone()).collect();
                cycle.push(id.clone());
                return Err(Blocked::Cycle(cycle));
            }
            return Ok(());
        }

        let module = self
            .modules
            .get(id)
            .ok_or_else(|| Blocked::Missing(id.clone()))?;
        if !module.config.enabled {
            return Err(Blocked::Disabled(id.clone()));
        }
        if module.errored {
            return Err(Blocked::Errored(id.clone()));
        }
        if let Some(plugin) = module.dependencies.iter().find(|d| plugins.is_blocked(d)) {
            return Err(Blocked::PluginUnavailable(plugin.clone()));
        }

        path.push((id.clone(), via));
        let result = self.check_edges(module, plugins, path, verified);
        path.pop();

        if result.is_ok() {
            verified.insert(id.clone());
        }
        result
    }

    fn check_edges(
        &self,
        module: &Module,
        plugins: &dyn PluginAvailability,
        path: &mut Vec<(ModuleId, Edge)>,
        verified: &mut HashSet<ModuleId>,
    ) -> Result<(), Blocked> {
        if let Some(parent) = &module.parent {
            self.check(parent, Edge::Parent, plugins, path, verified)?;
        }
        for dependency in &module.dependencies {
            if self.modules.contains_key(dependency) {
                self.check(dependency, Edge::Dependency, plugins, path, verified)?;
            }
        }
        Ok(())
    }
}
