//! Side-effect callbacks run inside lifecycle transactions.
//!
//! Hooks are registered once on a [`HookRegistryBuilder`] at startup and
//! frozen into an immutable [`HookRegistry`] that the lifecycle manager holds.
//! The built registry has no mutators, so dispatch never races registration.
//!
//! Dispatch is sequential in registration order. The first failing callback
//! stops the rest and its error aborts the enclosing transaction. Callbacks
//! receive the open transaction; anything they write rolls back with it.
//! No timeout is imposed here: the caller's [`OpContext`] deadline is checked
//! before each callback, but a callback that blocks must guard itself.

use crate::context::OpContext;
use crate::error::{HookError, LifecycleError, Result};
use crate::store::StoreTx;
use crate::types::{Device, Namespace};

pub const DEVICE_MERGE_HOOK: &str = "device_merge";
pub const NAMESPACE_DELETE_HOOK: &str = "namespace_delete";

/// Called with (tenant, stale device, surviving device) after a merge.
pub type DeviceMergeHook = Box<
    dyn Fn(&dyn StoreTx, &str, &Device, &Device) -> std::result::Result<(), HookError>
        + Send
        + Sync,
>;

/// Called before a namespace and its devices are deleted.
pub type NamespaceDeleteHook =
    Box<dyn Fn(&dyn StoreTx, &Namespace) -> std::result::Result<(), HookError> + Send + Sync>;

#[derive(Default)]
pub struct HookRegistryBuilder {
    device_merge: Vec<DeviceMergeHook>,
    namespace_delete: Vec<NamespaceDeleteHook>,
}

impl HookRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_device_merge<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&dyn StoreTx, &str, &Device, &Device) -> std::result::Result<(), HookError>
            + Send
            + Sync
            + 'static,
    {
        self.device_merge.push(Box::new(hook));
        self
    }

    pub fn on_namespace_delete<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&dyn StoreTx, &Namespace) -> std::result::Result<(), HookError>
            + Send
            + Sync
            + 'static,
    {
        self.namespace_delete.push(Box::new(hook));
        self
    }

    pub fn build(self) -> HookRegistry {
        tracing::debug!(
            device_merge = self.device_merge.len(),
            namespace_delete = self.namespace_delete.len(),
            "Hook registry sealed"
        );
        HookRegistry {
            device_merge: self.device_merge,
            namespace_delete: self.namespace_delete,
        }
    }
}

#[derive(Default)]
pub struct HookRegistry {
    device_merge: Vec<DeviceMergeHook>,
    namespace_delete: Vec<NamespaceDeleteHook>,
}

impl HookRegistry {
    pub fn builder() -> HookRegistryBuilder {
        HookRegistryBuilder::new()
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn device_merge_hooks(&self) -> usize {
        self.device_merge.len()
    }

    pub fn namespace_delete_hooks(&self) -> usize {
        self.namespace_delete.len()
    }

    pub fn dispatch_device_merge(
        &self,
        ctx: &OpContext,
        tx: &dyn StoreTx,
        tenant: &str,
        stale: &Device,
        survivor: &Device,
    ) -> Result<()> {
        for (index, hook) in self.device_merge.iter().enumerate() {
            ctx.check()?;
            hook(tx, tenant, stale, survivor).map_err(|source| {
                tracing::warn!(
                    tenant = %tenant,
                    hook_index = index,
                    error = %source,
                    "Device merge hook failed"
                );
                LifecycleError::HookFailed {
                    hook: DEVICE_MERGE_HOOK,
                    source,
                }
            })?;
        }
        Ok(())
    }

    pub fn dispatch_namespace_delete(
        &self,
        ctx: &OpContext,
        tx: &dyn StoreTx,
        namespace: &Namespace,
    ) -> Result<()> {
        for (index, hook) in self.namespace_delete.iter().enumerate() {
            ctx.check()?;
            hook(tx, namespace).map_err(|source| {
                tracing::warn!(
                    tenant = %namespace.tenant_id,
                    hook_index = index,
                    error = %source,
                    "Namespace delete hook failed"
                );
                LifecycleError::HookFailed {
                    hook: NAMESPACE_DELETE_HOOK,
                    source,
                }
            })?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("device_merge", &self.device_merge.len())
            .field("namespace_delete", &self.namespace_delete.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Db, Store};
    use std::sync::{Arc, Mutex};

    fn namespace() -> Namespace {
        Namespace {
            tenant_id: "tenant-1".to_string(),
            name: "dev".to_string(),
            max_devices: 0,
            devices_pending_count: 0,
            devices_accepted_count: 0,
            devices_rejected_count: 0,
            devices_removed_count: 0,
        }
    }

    fn test_db() -> (tempfile::TempDir, Db) {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Db::new(temp_dir.path().join("devices.db")).expect("db init");
        (temp_dir, db)
    }

    #[test]
    fn dispatches_in_registration_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut builder = HookRegistry::builder();
        for label in ["first", "second", "third"] {
            let calls = Arc::clone(&calls);
            builder.on_namespace_delete(move |_tx, _namespace| {
                calls.lock().unwrap().push(label);
                Ok(())
            });
        }
        let registry = builder.build();
        assert_eq!(registry.namespace_delete_hooks(), 3);

        let (_dir, db) = test_db();
        db.with_transaction(&OpContext::new(), |tx| {
            registry.dispatch_namespace_delete(&OpContext::new(), tx, &namespace())
        })
        .expect("dispatch");

        assert_eq!(*calls.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn first_failure_short_circuits() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut builder = HookRegistry::builder();
        {
            let calls = Arc::clone(&calls);
            builder.on_namespace_delete(move |_tx, _namespace| {
                calls.lock().unwrap().push("ok");
                Ok(())
            });
        }
        builder.on_namespace_delete(|_tx, _namespace| Err("cleanup failed".into()));
        {
            let calls = Arc::clone(&calls);
            builder.on_namespace_delete(move |_tx, _namespace| {
                calls.lock().unwrap().push("never");
                Ok(())
            });
        }
        let registry = builder.build();

        let (_dir, db) = test_db();
        let err = db
            .with_transaction(&OpContext::new(), |tx| {
                registry.dispatch_namespace_delete(&OpContext::new(), tx, &namespace())
            })
            .unwrap_err();

        assert!(matches!(
            err,
            LifecycleError::HookFailed {
                hook: NAMESPACE_DELETE_HOOK,
                ..
            }
        ));
        assert_eq!(*calls.lock().unwrap(), vec!["ok"]);
    }

    #[test]
    fn cancelled_context_stops_dispatch() {
        let mut builder = HookRegistry::builder();
        builder.on_namespace_delete(|_tx, _namespace| panic!("must not run"));
        let registry = builder.build();

        let ctx = OpContext::new();
        ctx.cancel();
        let (_dir, db) = test_db();
        let err = db
            .with_transaction(&OpContext::new(), |tx| {
                registry.dispatch_namespace_delete(&ctx, tx, &namespace())
            })
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Cancelled));
    }

    #[test]
    fn empty_registry_is_a_no_op() {
        let registry = HookRegistry::empty();
        let (_dir, db) = test_db();
        db.with_transaction(&OpContext::new(), |tx| {
            registry.dispatch_namespace_delete(&OpContext::new(), tx, &namespace())
        })
        .expect("dispatch");
        assert_eq!(registry.device_merge_hooks(), 0);
    }
}
