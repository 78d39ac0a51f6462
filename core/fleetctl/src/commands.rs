//! Maps parsed subcommands onto lifecycle operations.

use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use fleet_core::{
    Clock, Db, Deletion, DeviceChanges, DeviceStatus, FleetConfig, HookRegistry,
    LifecycleError, LifecycleManager, OpContext, SystemClock,
};

use crate::{Commands, DeviceCommand, DeviceRef, NamespaceCommand};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("Failed to encode response: {0}")]
    Json(#[from] serde_json::Error),
}

impl CommandError {
    pub fn code(&self) -> &'static str {
        match self {
            CommandError::Lifecycle(err) => err.kind().as_str(),
            CommandError::Json(_) => "internal",
        }
    }
}

pub fn run(command: Commands, config: &FleetConfig, db_path: PathBuf) -> Result<Value, CommandError> {
    let db = Db::new(db_path)?;
    let ctx = OpContext::new();

    match command {
        Commands::Namespace(command) => run_namespace(command, &ctx, db, config),
        Commands::Device(command) => run_device(command, &ctx, db, config),
    }
}

fn manager(db: Db, config: &FleetConfig) -> LifecycleManager<Db> {
    LifecycleManager::new(db, Arc::new(audit_hooks()), config.quota_guard())
}

/// Hooks that only record what happened; fleetctl owns no dependent data.
fn audit_hooks() -> HookRegistry {
    let mut builder = HookRegistry::builder();
    builder
        .on_device_merge(|_tx, tenant, stale, survivor| {
            tracing::info!(
                tenant = %tenant,
                stale_uid = %stale.uid,
                survivor_uid = %survivor.uid,
                "Device merged"
            );
            Ok(())
        })
        .on_namespace_delete(|_tx, namespace| {
            tracing::info!(
                tenant = %namespace.tenant_id,
                devices = namespace.total_count(),
                "Namespace deleted"
            );
            Ok(())
        });
    builder.build()
}

fn run_namespace(
    command: NamespaceCommand,
    ctx: &OpContext,
    db: Db,
    config: &FleetConfig,
) -> Result<Value, CommandError> {
    match command {
        NamespaceCommand::Create {
            tenant,
            name,
            max_devices,
        } => {
            let namespace = db.create_namespace(&tenant, &name, max_devices)?;
            Ok(serde_json::to_value(namespace)?)
        }
        NamespaceCommand::Show { tenant } => {
            let namespace = manager(db, config).get_namespace(ctx, &tenant)?;
            Ok(serde_json::to_value(namespace)?)
        }
        NamespaceCommand::Audit { tenant } => {
            let drift = manager(db, config).audit_counters(ctx, &tenant)?;
            Ok(serde_json::to_value(drift)?)
        }
        NamespaceCommand::Delete { tenant } => {
            let namespace = manager(db, config).delete_namespace(ctx, &tenant)?;
            Ok(serde_json::to_value(namespace)?)
        }
    }
}

fn run_device(
    command: DeviceCommand,
    ctx: &OpContext,
    db: Db,
    config: &FleetConfig,
) -> Result<Value, CommandError> {
    match command {
        DeviceCommand::Register {
            tenant,
            hostname,
            identity,
        } => {
            let device = db.register_device(ctx, &tenant, &hostname, &identity, SystemClock.now())?;
            Ok(serde_json::to_value(device)?)
        }
        DeviceCommand::List { tenant, status } => {
            let devices = manager(db, config).list_devices(ctx, &tenant, status)?;
            Ok(serde_json::to_value(devices)?)
        }
        DeviceCommand::Show(DeviceRef { tenant, uid }) => {
            let device = manager(db, config).get_device(ctx, &tenant, &uid)?;
            Ok(serde_json::to_value(device)?)
        }
        DeviceCommand::Accept(target) => set_status(db, config, ctx, target, DeviceStatus::Accepted),
        DeviceCommand::Reject(target) => set_status(db, config, ctx, target, DeviceStatus::Rejected),
        DeviceCommand::Pend(target) => set_status(db, config, ctx, target, DeviceStatus::Pending),
        DeviceCommand::Update {
            device,
            name,
            public_url,
        } => {
            let changes = DeviceChanges { name, public_url };
            let updated =
                manager(db, config).update_device(ctx, &device.tenant, &device.uid, &changes)?;
            Ok(serde_json::to_value(updated)?)
        }
        DeviceCommand::Delete(DeviceRef { tenant, uid }) => {
            let deletion = manager(db, config).delete_device(ctx, &tenant, &uid)?;
            Ok(deletion_json(deletion)?)
        }
    }
}

fn set_status(
    db: Db,
    config: &FleetConfig,
    ctx: &OpContext,
    target: DeviceRef,
    status: DeviceStatus,
) -> Result<Value, CommandError> {
    let device = manager(db, config).update_status(ctx, &target.tenant, &target.uid, status)?;
    Ok(serde_json::to_value(device)?)
}

fn deletion_json(deletion: Deletion) -> Result<Value, serde_json::Error> {
    Ok(match deletion {
        Deletion::Tombstoned(device) => json!({
            "outcome": "tombstoned",
            "device": serde_json::to_value(device)?,
        }),
        Deletion::Purged { uid, status } => json!({
            "outcome": "purged",
            "uid": uid,
            "status": status,
        }),
    })
}
