//! Folds a stale accepted record into the device replacing it.

use crate::context::OpContext;
use crate::counters::{self, CounterDelta};
use crate::error::Result;
use crate::hooks::HookRegistry;
use crate::store::StoreTx;
use crate::types::{Device, DeviceStatus};

/// Transfers sessions, takes over the stale hostname, drops the stale record
/// and its accepted count, then runs the merge hooks.
///
/// `survivor` is renamed in place and persisted; its status is left for the
/// caller to change.
pub fn execute(
    ctx: &OpContext,
    tx: &dyn StoreTx,
    hooks: &HookRegistry,
    stale: &Device,
    survivor: &mut Device,
) -> Result<()> {
    let tenant = stale.tenant_id.as_str();

    let sessions = tx.transfer_session_owner(&stale.uid, &survivor.uid)?;

    survivor.name = stale.name.clone();
    tx.update_device(survivor)?;

    tx.delete_device(tenant, &stale.uid)?;
    counters::adjust(tx, tenant, DeviceStatus::Accepted, CounterDelta::Decrement)?;

    hooks.dispatch_device_merge(ctx, tx, tenant, stale, survivor)?;

    tracing::debug!(
        tenant = %tenant,
        stale_uid = %stale.uid,
        survivor_uid = %survivor.uid,
        sessions,
        "Merged stale device"
    );
    Ok(())
}
