//! Status record published for each module under `modules.<id>`.

use serde::{Deserialize, Serialize};

use super::graph::Module;
use super::{ModuleId, ModuleKind};

/// Key under the status root holding one record per module.
pub const MODULES_KEY: &str = "modules";

/// Observable state of one module.
///
/// `loads` counts successful load hooks; `unloads` counts transitions from
/// active to inactive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleStatus {
    pub kind: ModuleKind,
    pub enabled: bool,
    pub active: bool,
    pub errored: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub blocked: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<ModuleId>,
    #[serde(default)]
    pub loads: u64,
    #[serde(default)]
    pub unloads: u64,
}

impl From<&Module> for ModuleStatus {
    fn from(module: &Module) -> Self {
        Self {
            kind: module.kind,
            enabled: module.config.enabled,
            active: module.active,
            errored: module.errored,
            error: module.last_error.clone(),
            blocked: module.blocked.as_ref().map(ToString::to_string),
            dependencies: module.dependencies.iter().cloned().collect(),
            loads: module.loads,
            unloads: module.unloads,
        }
    }
}

/// Store path of a module's status record.
pub(crate) fn status_path(id: &ModuleId) -> Vec<String> {
    vec![MODULES_KEY.to_string(), id.to_string()]
}
