//! Device lifecycle orchestration.
//!
//! Each public operation runs as exactly one store transaction spanning every
//! lookup, the conflict check, a merge and its hooks, the quota check, and all
//! counter adjustments. Nothing is locked in-process; racing writers are
//! serialized (or rejected) by the store, and callers retry.
//!
//! ```text
//!            ┌──────────┐  reject   ┌──────────┐
//!  register ─▶ pending  ◀──────────▶ rejected │
//!            └────┬─────┘           └────┬─────┘
//!                 │ accept (admission)   │ accept
//!                 ▼                      │
//!            ┌──────────┐ ◀──────────────┘
//!            │ accepted │── delete ──▶ removed (tombstone)
//!            └──────────┘
//!  pending / rejected ── delete ──▶ purged
//! ```

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::conflict::{self, Admission};
use crate::context::OpContext;
use crate::counters::{self, CounterDelta};
use crate::error::{LifecycleError, Result};
use crate::hooks::HookRegistry;
use crate::merge;
use crate::quota::QuotaGuard;
use crate::store::{Store, StoreTx};
use crate::types::{
    normalize_hostname, CounterDrift, Device, DeviceChanges, DeviceStatus, Namespace,
};

/// Result of [`LifecycleManager::delete_device`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deletion {
    /// The device had been accepted and is kept as a `removed` record.
    Tombstoned(Device),
    /// The device was never accepted and no record remains.
    Purged { uid: String, status: DeviceStatus },
}

pub struct LifecycleManager<S: Store> {
    store: S,
    hooks: Arc<HookRegistry>,
    quota: QuotaGuard,
    clock: Arc<dyn Clock>,
}

impl<S: Store> LifecycleManager<S> {
    pub fn new(store: S, hooks: Arc<HookRegistry>, quota: QuotaGuard) -> Self {
        Self {
            store,
            hooks,
            quota,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Moves a device between pending, rejected and accepted.
    ///
    /// Accepted devices cannot be moved; deletion is the only way out.
    /// Requesting the current status is a no-op.
    pub fn update_status(
        &self,
        ctx: &OpContext,
        tenant: &str,
        uid: &str,
        status: DeviceStatus,
    ) -> Result<Device> {
        if status == DeviceStatus::Removed {
            return Err(LifecycleError::InvalidStatus(status));
        }
        let now = self.clock.now();

        let (device, previous) = self.store.with_transaction(ctx, |tx| {
            let namespace = require_namespace(tx, tenant)?;
            let mut device = require_live_device(tx, tenant, uid)?;
            let previous = device.status;

            if previous == DeviceStatus::Accepted {
                return Err(LifecycleError::DeviceStatusAccepted(uid.to_string()));
            }
            if previous == status {
                return Ok((device, previous));
            }

            if status == DeviceStatus::Accepted {
                device = self.admit(ctx, tx, namespace, device, now)?;
            } else {
                device.status = status;
                device.status_updated_at = now;
                tx.update_device(&device)?;
                counters::transition(tx, tenant, previous, status)?;
            }
            Ok((device, previous))
        })?;

        if previous == status {
            tracing::debug!(tenant = %tenant, uid = %uid, status = %status, "Status unchanged");
        } else {
            tracing::info!(
                tenant = %tenant,
                uid = %uid,
                from = %previous,
                to = %status,
                "Device status updated"
            );
        }
        Ok(device)
    }

    fn admit(
        &self,
        ctx: &OpContext,
        tx: &dyn StoreTx,
        namespace: Namespace,
        mut device: Device,
        now: DateTime<Utc>,
    ) -> Result<Device> {
        let previous = device.status;
        let tenant = namespace.tenant_id.clone();

        let namespace = match conflict::resolve(tx, &device)? {
            Admission::Conflict { hostname } => {
                return Err(LifecycleError::DeviceDuplicated(hostname));
            }
            Admission::Merge(stale) => {
                merge::execute(ctx, tx, &self.hooks, &stale, &mut device)?;
                tracing::info!(
                    tenant = %tenant,
                    stale_uid = %stale.uid,
                    uid = %device.uid,
                    name = %device.name,
                    "Device merged into reconnecting device"
                );
                require_namespace(tx, &tenant)?
            }
            Admission::Clear => namespace,
        };

        self.quota.check(&namespace)?;

        device.status = DeviceStatus::Accepted;
        device.status_updated_at = now;
        tx.update_device(&device)?;
        counters::transition(tx, &tenant, previous, DeviceStatus::Accepted)?;
        Ok(device)
    }

    /// Removes a device: accepted devices become tombstones, others are purged.
    pub fn delete_device(&self, ctx: &OpContext, tenant: &str, uid: &str) -> Result<Deletion> {
        let now = self.clock.now();

        let deletion = self.store.with_transaction(ctx, |tx| {
            require_namespace(tx, tenant)?;
            let mut device = require_live_device(tx, tenant, uid)?;

            if device.status == DeviceStatus::Accepted {
                device.status = DeviceStatus::Removed;
                device.status_updated_at = now;
                device.removed_at = Some(now);
                tx.update_device(&device)?;
                counters::transition(tx, tenant, DeviceStatus::Accepted, DeviceStatus::Removed)?;
                Ok(Deletion::Tombstoned(device))
            } else {
                tx.delete_device(tenant, uid)?;
                counters::adjust(tx, tenant, device.status, CounterDelta::Decrement)?;
                Ok(Deletion::Purged {
                    uid: device.uid,
                    status: device.status,
                })
            }
        })?;

        match &deletion {
            Deletion::Tombstoned(_) => {
                tracing::info!(tenant = %tenant, uid = %uid, "Device tombstoned")
            }
            Deletion::Purged { status, .. } => {
                tracing::info!(tenant = %tenant, uid = %uid, status = %status, "Device purged")
            }
        }
        Ok(deletion)
    }

    /// Applies operator changes. Hostnames stay unique across every live
    /// device of the namespace, whatever its status.
    pub fn update_device(
        &self,
        ctx: &OpContext,
        tenant: &str,
        uid: &str,
        changes: &DeviceChanges,
    ) -> Result<Device> {
        let name = match changes.name.as_deref() {
            Some(raw) => {
                let name = normalize_hostname(raw);
                if name.is_empty() {
                    return Err(LifecycleError::InvalidHostname(raw.to_string()));
                }
                Some(name)
            }
            None => None,
        };

        let device = self.store.with_transaction(ctx, |tx| {
            require_namespace(tx, tenant)?;
            let mut device = require_live_device(tx, tenant, uid)?;

            if let Some(name) = name {
                if name != device.name {
                    if let Some(owner) = tx.live_device_by_name(tenant, &name)? {
                        if owner.uid != device.uid {
                            return Err(LifecycleError::DeviceDuplicated(name));
                        }
                    }
                    device.name = name;
                }
            }
            if let Some(public_url) = changes.public_url {
                device.public_url = public_url;
            }

            tx.update_device(&device)?;
            Ok(device)
        })?;

        tracing::info!(tenant = %tenant, uid = %uid, name = %device.name, "Device updated");
        Ok(device)
    }

    /// Runs the pre-delete hooks, then drops the namespace with every device
    /// and session it owns.
    pub fn delete_namespace(&self, ctx: &OpContext, tenant: &str) -> Result<Namespace> {
        let namespace = self.store.with_transaction(ctx, |tx| {
            let namespace = require_namespace(tx, tenant)?;
            self.hooks.dispatch_namespace_delete(ctx, tx, &namespace)?;
            tx.delete_namespace(tenant)?;
            Ok(namespace)
        })?;

        tracing::info!(
            tenant = %tenant,
            devices = namespace.total_count(),
            "Namespace deleted"
        );
        Ok(namespace)
    }

    pub fn get_namespace(&self, ctx: &OpContext, tenant: &str) -> Result<Namespace> {
        self.store
            .with_read_transaction(ctx, |tx| require_namespace(tx, tenant))
    }

    /// Fetches a device, tombstones included.
    pub fn get_device(&self, ctx: &OpContext, tenant: &str, uid: &str) -> Result<Device> {
        self.store.with_read_transaction(ctx, |tx| {
            require_namespace(tx, tenant)?;
            tx.device(tenant, uid)?
                .ok_or_else(|| LifecycleError::DeviceNotFound(uid.to_string()))
        })
    }

    pub fn list_devices(
        &self,
        ctx: &OpContext,
        tenant: &str,
        status: Option<DeviceStatus>,
    ) -> Result<Vec<Device>> {
        self.store.with_read_transaction(ctx, |tx| {
            require_namespace(tx, tenant)?;
            tx.list_devices(tenant, status)
        })
    }

    /// Reports counters that disagree with the stored records.
    pub fn audit_counters(&self, ctx: &OpContext, tenant: &str) -> Result<Vec<CounterDrift>> {
        let drift = self
            .store
            .with_read_transaction(ctx, |tx| counters::audit(tx, tenant))?;
        if !drift.is_empty() {
            tracing::warn!(tenant = %tenant, drift = ?drift, "Device counters drifted");
        }
        Ok(drift)
    }
}

fn require_namespace(tx: &dyn StoreTx, tenant: &str) -> Result<Namespace> {
    tx.namespace(tenant)?
        .ok_or_else(|| LifecycleError::NamespaceNotFound(tenant.to_string()))
}

/// Resolves a device that is not a tombstone.
fn require_live_device(tx: &dyn StoreTx, tenant: &str, uid: &str) -> Result<Device> {
    match tx.device(tenant, uid)? {
        Some(device) if device.status != DeviceStatus::Removed => Ok(device),
        _ => Err(LifecycleError::DeviceNotFound(uid.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::quota::DeploymentMode;
    use crate::store::Db;
    use chrono::TimeZone;

    const TENANT: &str = "tenant-1";

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 31, 0, 0, 0).unwrap()
    }

    fn manager(max_devices: i64) -> (tempfile::TempDir, LifecycleManager<Db>) {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Db::new(temp_dir.path().join("devices.db")).expect("db init");
        db.create_namespace(TENANT, "dev", max_devices)
            .expect("namespace");
        let manager = LifecycleManager::new(
            db,
            Arc::new(HookRegistry::empty()),
            QuotaGuard::new(DeploymentMode::SelfManaged),
        )
        .with_clock(Arc::new(FixedClock::new(t0())));
        (temp_dir, manager)
    }

    fn register(manager: &LifecycleManager<Db>, name: &str, identity: &str) -> Device {
        manager
            .store()
            .register_device(&OpContext::new(), TENANT, name, identity, t0())
            .expect("register")
    }

    #[test]
    fn removed_is_not_a_requestable_status() {
        let (_dir, manager) = manager(0);
        let device = register(&manager, "box", "aa");
        let err = manager
            .update_status(&OpContext::new(), TENANT, &device.uid, DeviceStatus::Removed)
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidStatus(DeviceStatus::Removed)));
    }

    #[test]
    fn unknown_namespace_is_reported_before_device() {
        let (_dir, manager) = manager(0);
        let err = manager
            .update_status(&OpContext::new(), "other", "nope", DeviceStatus::Rejected)
            .unwrap_err();
        assert!(matches!(err, LifecycleError::NamespaceNotFound(tenant) if tenant == "other"));
    }

    #[test]
    fn device_from_another_tenant_is_not_found() {
        let (_dir, manager) = manager(0);
        manager
            .store()
            .create_namespace("tenant-2", "other", 0)
            .expect("namespace");
        let device = register(&manager, "box", "aa");
        let err = manager
            .update_status(&OpContext::new(), "tenant-2", &device.uid, DeviceStatus::Rejected)
            .unwrap_err();
        assert!(matches!(err, LifecycleError::DeviceNotFound(uid) if uid == device.uid));
    }

    #[test]
    fn tombstones_cannot_be_revived_or_deleted_again() {
        let (_dir, manager) = manager(0);
        let ctx = OpContext::new();
        let device = register(&manager, "box", "aa");
        manager
            .update_status(&ctx, TENANT, &device.uid, DeviceStatus::Accepted)
            .expect("accept");
        manager
            .delete_device(&ctx, TENANT, &device.uid)
            .expect("delete");

        assert!(matches!(
            manager.update_status(&ctx, TENANT, &device.uid, DeviceStatus::Pending),
            Err(LifecycleError::DeviceNotFound(_))
        ));
        assert!(matches!(
            manager.delete_device(&ctx, TENANT, &device.uid),
            Err(LifecycleError::DeviceNotFound(_))
        ));
        let tombstone = manager
            .get_device(&ctx, TENANT, &device.uid)
            .expect("tombstone readable");
        assert_eq!(tombstone.status, DeviceStatus::Removed);
    }

    #[test]
    fn tombstoned_hostname_can_be_reused() {
        let (_dir, manager) = manager(0);
        let ctx = OpContext::new();
        let old = register(&manager, "box", "aa");
        manager
            .update_status(&ctx, TENANT, &old.uid, DeviceStatus::Accepted)
            .expect("accept");
        manager.delete_device(&ctx, TENANT, &old.uid).expect("delete");

        let other = register(&manager, "spare", "bb");
        let renamed = manager
            .update_device(
                &ctx,
                TENANT,
                &other.uid,
                &DeviceChanges {
                    name: Some("BOX".to_string()),
                    public_url: None,
                },
            )
            .expect("rename");
        assert_eq!(renamed.name, "box");
    }

    #[test]
    fn empty_hostname_is_rejected() {
        let (_dir, manager) = manager(0);
        let device = register(&manager, "box", "aa");
        let err = manager
            .update_device(
                &OpContext::new(),
                TENANT,
                &device.uid,
                &DeviceChanges {
                    name: Some("   ".to_string()),
                    public_url: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidHostname(_)));
    }

    #[test]
    fn cancelled_context_leaves_device_untouched() {
        let (_dir, manager) = manager(0);
        let device = register(&manager, "box", "aa");
        let ctx = OpContext::new();
        ctx.cancel();

        let err = manager
            .update_status(&ctx, TENANT, &device.uid, DeviceStatus::Accepted)
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Cancelled));

        let stored = manager
            .get_device(&OpContext::new(), TENANT, &device.uid)
            .expect("device");
        assert_eq!(stored.status, DeviceStatus::Pending);
    }
}
