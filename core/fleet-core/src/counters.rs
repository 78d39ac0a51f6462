//! Per-namespace device counters.
//!
//! Every call site pairs a counter change with the device write it accounts
//! for, inside the same transaction. Errors are fatal and never retried here.

use crate::error::{LifecycleError, Result};
use crate::store::StoreTx;
use crate::types::{CounterDrift, DeviceStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterDelta {
    Decrement,
    Increment,
}

impl CounterDelta {
    pub fn as_i64(self) -> i64 {
        match self {
            CounterDelta::Decrement => -1,
            CounterDelta::Increment => 1,
        }
    }
}

pub fn adjust(
    tx: &dyn StoreTx,
    tenant: &str,
    status: DeviceStatus,
    delta: CounterDelta,
) -> Result<()> {
    tracing::debug!(
        tenant = %tenant,
        status = %status,
        delta = delta.as_i64(),
        "Adjusting device counter"
    );
    tx.increment_device_count(tenant, status, delta.as_i64())
}

/// Moves one device from `from` to `to`.
pub fn transition(
    tx: &dyn StoreTx,
    tenant: &str,
    from: DeviceStatus,
    to: DeviceStatus,
) -> Result<()> {
    adjust(tx, tenant, from, CounterDelta::Decrement)?;
    adjust(tx, tenant, to, CounterDelta::Increment)
}

/// Compares every stored counter with the actual record count.
pub fn audit(tx: &dyn StoreTx, tenant: &str) -> Result<Vec<CounterDrift>> {
    let namespace = tx
        .namespace(tenant)?
        .ok_or_else(|| LifecycleError::NamespaceNotFound(tenant.to_string()))?;

    let mut drift = Vec::new();
    for status in DeviceStatus::ALL {
        let actual = tx.count_devices(tenant, status)?;
        let recorded = namespace.count(status);
        if actual != recorded {
            drift.push(CounterDrift {
                status,
                recorded,
                actual,
            });
        }
    }
    Ok(drift)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::OpContext;
    use crate::store::{Db, Store};

    fn test_db() -> (tempfile::TempDir, Db) {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Db::new(temp_dir.path().join("devices.db")).expect("db init");
        db.create_namespace("tenant-1", "dev", 0).expect("namespace");
        (temp_dir, db)
    }

    #[test]
    fn transition_moves_one_unit() {
        let (_dir, db) = test_db();
        db.with_transaction(&OpContext::new(), |tx| {
            adjust(tx, "tenant-1", DeviceStatus::Pending, CounterDelta::Increment)?;
            transition(tx, "tenant-1", DeviceStatus::Pending, DeviceStatus::Rejected)
        })
        .expect("adjust");

        let namespace = db.namespace("tenant-1").expect("query").expect("exists");
        assert_eq!(namespace.devices_pending_count, 0);
        assert_eq!(namespace.devices_rejected_count, 1);
        assert_eq!(namespace.total_count(), 1);
    }

    #[test]
    fn audit_reports_unmatched_counters() {
        let (_dir, db) = test_db();
        let drift = db
            .with_transaction(&OpContext::new(), |tx| {
                adjust(tx, "tenant-1", DeviceStatus::Accepted, CounterDelta::Increment)?;
                audit(tx, "tenant-1")
            })
            .expect("audit");

        assert_eq!(
            drift,
            vec![CounterDrift {
                status: DeviceStatus::Accepted,
                recorded: 1,
                actual: 0,
            }]
        );
    }

    #[test]
    fn audit_is_clean_for_registered_devices() {
        let (_dir, db) = test_db();
        let ctx = OpContext::new();
        db.register_device(&ctx, "tenant-1", "box", "aa", chrono::Utc::now())
            .expect("register");
        let drift = db
            .with_transaction(&ctx, |tx| audit(tx, "tenant-1"))
            .expect("audit");
        assert!(drift.is_empty());
    }
}
