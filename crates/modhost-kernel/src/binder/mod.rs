//! Resource binder
//!
//! Records which module acquired which disposable resource and releases them
//! when that module unloads. Attribution comes from the ambient owner set by
//! [`crate::context`]; code running outside any module scope acquires
//! unbound resources.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::context;
use crate::module::ModuleId;

/// Identifier of one recorded binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingId(u64);

impl fmt::Display for BindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "binding-{}", self.0)
    }
}

type Release = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

struct Binding {
    id: BindingId,
    label: String,
    release: Release,
}

/// Outcome of releasing an owner's bindings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseReport {
    pub released: usize,
    pub failed: usize,
}

#[derive(Default)]
struct BinderState {
    next_id: u64,
    owners: HashMap<ModuleId, Vec<Binding>>,
}

/// Owner-scoped registry of release functions.
#[derive(Default)]
pub struct ResourceBinder {
    state: Mutex<BinderState>,
}

impl fmt::Debug for ResourceBinder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ResourceBinder")
            .field("owners", &state.owners.len())
            .field(
                "bindings",
                &state.owners.values().map(Vec::len).sum::<usize>(),
            )
            .finish()
    }
}

impl ResourceBinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a release function to the current module.
    ///
    /// Returns `None` when no module is current; the resource is then the
    /// caller's to release.
    pub fn bind<F>(&self, label: impl Into<String>, release: F) -> Option<BindingId>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let label = label.into();
        match context::current_owner() {
            Some(owner) => Some(self.bind_to(owner, label, release)),
            None => {
                if cfg!(debug_assertions) {
                    warn!(label = %label, "Resource acquired outside any module; it will not be released automatically");
                }
                None
            }
        }
    }

    /// Bind a release function to an explicit owner.
    pub fn bind_to<F>(&self, owner: ModuleId, label: impl Into<String>, release: F) -> BindingId
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let label = label.into();
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = BindingId(state.next_id);
        debug!(module = %owner, binding = %id, label = %label, "Bound resource");
        state.owners.entry(owner).or_default().push(Binding {
            id,
            label,
            release: Box::new(release),
        });
        id
    }

    /// Keep `value` alive until the current module unloads, then drop it.
    pub fn bind_value<T>(&self, label: impl Into<String>, value: T) -> Option<BindingId>
    where
        T: Send + 'static,
    {
        self.bind(label, move || {
            drop(value);
            Ok(())
        })
    }

    /// Release one binding now. It will not be released again with its owner.
    pub fn release_binding(&self, id: BindingId) -> anyhow::Result<bool> {
        let Some(binding) = self.take(id) else {
            return Ok(false);
        };
        (binding.release)()?;
        Ok(true)
    }

    /// Deregister a binding without running its release function.
    pub fn forget(&self, id: BindingId) -> bool {
        self.take(id).is_some()
    }

    fn take(&self, id: BindingId) -> Option<Binding> {
        let mut state = self.state.lock();
        let (owner, position) = state.owners.iter().find_map(|(owner, bindings)| {
            bindings
                .iter()
                .position(|b| b.id == id)
                .map(|position| (owner.clone(), position))
        })?;
        let bindings = state.owners.get_mut(&owner)?;
        let binding = bindings.remove(position);
        if bindings.is_empty() {
            state.owners.remove(&owner);
        }
        Some(binding)
    }

    /// Labels of the bindings currently held for `owner`, in binding order.
    pub fn bindings_of(&self, owner: &ModuleId) -> Vec<String> {
        self.state
            .lock()
            .owners
            .get(owner)
            .map(|bindings| bindings.iter().map(|b| b.label.clone()).collect())
            .unwrap_or_default()
    }

    /// Run every release function recorded for `owner`, in binding order.
    ///
    /// Each one runs exactly once; failures and panics are logged and do not
    /// stop the remaining releases.
    pub fn release_owner(&self, owner: &ModuleId) -> ReleaseReport {
        let bindings = self.state.lock().owners.remove(owner).unwrap_or_default();
        let mut report = ReleaseReport::default();

        for Binding { id, label, release } in bindings {
            match catch_unwind(AssertUnwindSafe(release)) {
                Ok(Ok(())) => report.released += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!(module = %owner, binding = %id, label = %label, error = %e, "Failed to release resource");
                }
                Err(_) => {
                    report.failed += 1;
                    error!(module = %owner, binding = %id, label = %label, "Resource release panicked");
                }
            }
        }

        if report.released + report.failed > 0 {
            debug!(
                module = %owner,
                released = report.released,
                failed = report.failed,
                "Released module resources"
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    #[test]
    fn binds_to_current_owner_and_releases_in_order() {
        let binder = ResourceBinder::new();
        let owner = ModuleId::new("/mods/a");
        let order = Arc::new(Mutex::new(Vec::new()));

        context::sync_scope(owner.clone(), || {
            for name in ["first", "second", "third"] {
                let order = order.clone();
                binder
                    .bind(name, move || {
                        order.lock().push(name);
                        Ok(())
                    })
                    .unwrap();
            }
        });

        assert_eq!(binder.bindings_of(&owner), vec!["first", "second", "third"]);
        let report = binder.release_owner(&owner);
        assert_eq!(report, ReleaseReport { released: 3, failed: 0 });
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
        assert!(binder.bindings_of(&owner).is_empty());
    }

    #[test]
    fn releases_exactly_once() {
        let binder = ResourceBinder::new();
        let owner = ModuleId::new("/mods/a");
        let calls = counter();
        let c = calls.clone();
        binder.bind_to(owner.clone(), "socket", move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        binder.release_owner(&owner);
        binder.release_owner(&owner);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unbound_outside_owner_scope() {
        let binder = ResourceBinder::new();
        assert!(binder.bind("orphan", || Ok(())).is_none());
    }

    #[test]
    fn manual_release_is_not_repeated_by_owner_release() {
        let binder = ResourceBinder::new();
        let owner = ModuleId::new("/mods/a");
        let calls = counter();
        let c = calls.clone();
        let id = binder.bind_to(owner.clone(), "timer", move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(binder.release_binding(id).unwrap());
        assert!(!binder.release_binding(id).unwrap());
        let report = binder.release_owner(&owner);
        assert_eq!(report.released, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failures_and_panics_do_not_stop_release() {
        let binder = ResourceBinder::new();
        let owner = ModuleId::new("/mods/a");
        let calls = counter();

        binder.bind_to(owner.clone(), "errors", || Err(anyhow::anyhow!("close failed")));
        binder.bind_to(owner.clone(), "panics", || panic!("close panicked"));
        let c = calls.clone();
        binder.bind_to(owner.clone(), "fine", move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let report = binder.release_owner(&owner);
        assert_eq!(report, ReleaseReport { released: 1, failed: 2 });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn bound_values_drop_on_release() {
        struct Guard(Arc<AtomicUsize>);
        impl Drop for Guard {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let binder = ResourceBinder::new();
        let owner = ModuleId::new("/mods/a");
        let drops = counter();
        context::sync_scope(owner.clone(), || {
            binder.bind_value("guard", Guard(drops.clone())).unwrap();
        });
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        binder.release_owner(&owner);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn forget_skips_release() {
        let binder = ResourceBinder::new();
        let owner = ModuleId::new("/mods/a");
        let calls = counter();
        let c = calls.clone();
        let id = binder.bind_to(owner.clone(), "handed-off", move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(binder.forget(id));
        binder.release_owner(&owner);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
