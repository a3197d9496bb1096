//! Ambient execution context.
//!
//! Every entry into module code (load and unload hooks, listener callbacks
//! registered by a module, tasks a module spawns) runs inside a scope that
//! names the module that owns it. Resource bindings and store subscriptions
//! read the owner from here instead of being told explicitly.
//!
//! The owner lives in a tokio task-local. Plain `tokio::spawn` does not carry
//! task-locals over, so module code should spawn through [`spawn`].

use std::future::Future;

use tokio::task::JoinHandle;

use crate::module::ModuleId;

tokio::task_local! {
    static CURRENT_OWNER: ModuleId;
}

/// The module owning the currently running code, if any.
pub fn current_owner() -> Option<ModuleId> {
    CURRENT_OWNER.try_with(|owner| owner.clone()).ok()
}

/// Run `future` with `owner` as the current module.
pub async fn scope<F>(owner: ModuleId, future: F) -> F::Output
where
    F: Future,
{
    CURRENT_OWNER.scope(owner, future).await
}

/// Run a synchronous closure with `owner` as the current module.
pub fn sync_scope<R>(owner: ModuleId, f: impl FnOnce() -> R) -> R {
    CURRENT_OWNER.sync_scope(owner, f)
}

/// Spawn a task that inherits the current module, if there is one.
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match current_owner() {
        Some(owner) => tokio::spawn(CURRENT_OWNER.scope(owner, future)),
        None => tokio::spawn(future),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_owner_outside_scope() {
        assert_eq!(current_owner(), None);
    }

    #[test]
    fn sync_scope_sets_and_restores_owner() {
        let owner = ModuleId::new("/mods/a");
        let seen = sync_scope(owner.clone(), current_owner);
        assert_eq!(seen, Some(owner));
        assert_eq!(current_owner(), None);
    }

    #[tokio::test]
    async fn nested_scopes_shadow_outer_owner() {
        let outer = ModuleId::new("/mods/outer");
        let inner = ModuleId::new("/mods/inner");

        let (seen_inner, seen_after) = scope(outer.clone(), async {
            let seen_inner = scope(inner.clone(), async { current_owner() }).await;
            (seen_inner, current_owner())
        })
        .await;

        assert_eq!(seen_inner, Some(inner));
        assert_eq!(seen_after, Some(outer));
    }

    #[tokio::test]
    async fn spawned_tasks_inherit_owner() {
        let owner = ModuleId::new("/mods/spawner");
        let handle = scope(owner.clone(), async { spawn(async { current_owner() }) }).await;
        assert_eq!(handle.await.unwrap(), Some(owner));

        let detached = spawn(async { current_owner() });
        assert_eq!(detached.await.unwrap(), None);
    }
}
