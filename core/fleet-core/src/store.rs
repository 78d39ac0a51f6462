//! SQLite persistence for the lifecycle core.
//!
//! [`Store`] is the transaction facility: it runs a closure against a
//! [`StoreTx`] and commits iff the closure returns `Ok`. Dropping the
//! transaction without committing rolls it back, so any error raised by the
//! lifecycle manager, a hook, or the store itself leaves no partial state.
//!
//! Write transactions are opened with `BEGIN IMMEDIATE`, so concurrent
//! writers serialize on the database lock. Read transactions are deferred and
//! run alongside a writer under WAL. The partial unique indexes on accepted
//! devices are the last line of defense for the uniqueness invariants when
//! two admissions race.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row, TransactionBehavior};
use std::path::{Path, PathBuf};

use crate::context::OpContext;
use crate::counters::{self, CounterDelta};
use crate::error::{LifecycleError, Result};
use crate::types::{normalize_hostname, Device, DeviceStatus, Namespace};

const DEVICE_COLUMNS: &str = "uid, tenant_id, name, identity, status, status_updated_at, \
     created_at, removed_at, disconnected_at, last_seen, public_url";

const NAMESPACE_COLUMNS: &str = "tenant_id, name, max_devices, devices_pending_count, \
     devices_accepted_count, devices_rejected_count, devices_removed_count";

/// Operations available inside an open transaction.
///
/// Lookups scoped by tenant never return another tenant's records.
pub trait StoreTx {
    fn namespace(&self, tenant: &str) -> Result<Option<Namespace>>;

    fn device(&self, tenant: &str, uid: &str) -> Result<Option<Device>>;

    fn accepted_device_by_identity(&self, tenant: &str, identity: &str)
        -> Result<Option<Device>>;

    fn accepted_device_by_name(&self, tenant: &str, name: &str) -> Result<Option<Device>>;

    /// Any non-removed device holding `name`, whatever its status.
    fn live_device_by_name(&self, tenant: &str, name: &str) -> Result<Option<Device>>;

    fn list_devices(&self, tenant: &str, status: Option<DeviceStatus>) -> Result<Vec<Device>>;

    fn count_devices(&self, tenant: &str, status: DeviceStatus) -> Result<i64>;

    fn insert_device(&self, device: &Device) -> Result<()>;

    fn update_device(&self, device: &Device) -> Result<()>;

    fn delete_device(&self, tenant: &str, uid: &str) -> Result<()>;

    fn increment_device_count(&self, tenant: &str, status: DeviceStatus, delta: i64)
        -> Result<()>;

    /// Reassigns every session owned by `old_uid` to `new_uid`.
    fn transfer_session_owner(&self, old_uid: &str, new_uid: &str) -> Result<u64>;

    /// Removes the namespace row together with its devices and sessions.
    fn delete_namespace(&self, tenant: &str) -> Result<()>;
}

/// Transaction facility consumed by the lifecycle manager.
pub trait Store: Send + Sync {
    fn with_transaction<T, F>(&self, ctx: &OpContext, op: F) -> Result<T>
    where
        F: FnOnce(&dyn StoreTx) -> Result<T>;

    /// Like [`Store::with_transaction`] for operations that only read. No
    /// write lock is taken up front, so concurrent writers are not blocked.
    fn with_read_transaction<T, F>(&self, ctx: &OpContext, op: F) -> Result<T>
    where
        F: FnOnce(&dyn StoreTx) -> Result<T>;
}

pub struct Db {
    path: PathBuf,
}

impl Db {
    pub fn new(path: PathBuf) -> Result<Self> {
        let db = Self { path };
        db.init_schema()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn create_namespace(
        &self,
        tenant: &str,
        name: &str,
        max_devices: i64,
    ) -> Result<Namespace> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO namespaces (tenant_id, name, max_devices) VALUES (?1, ?2, ?3)",
                params![tenant, name, max_devices],
            )
            .map_err(|err| LifecycleError::store("Failed to insert namespace", err))?;
            Ok(())
        })?;

        self.namespace(tenant)?
            .ok_or_else(|| LifecycleError::NamespaceNotFound(tenant.to_string()))
    }

    pub fn namespace(&self, tenant: &str) -> Result<Option<Namespace>> {
        self.with_connection(|conn| query_namespace(conn, tenant))
    }

    /// Inserts a new pending device and counts it, in one transaction.
    pub fn register_device(
        &self,
        ctx: &OpContext,
        tenant: &str,
        name: &str,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<Device> {
        let name = normalize_hostname(name);
        if name.is_empty() {
            return Err(LifecycleError::InvalidHostname(name));
        }
        let identity = identity.trim().to_lowercase();
        if identity.is_empty() {
            return Err(LifecycleError::InvalidIdentity);
        }

        let device = Device {
            uid: ulid::Ulid::new().to_string().to_lowercase(),
            tenant_id: tenant.to_string(),
            name,
            identity,
            status: DeviceStatus::Pending,
            status_updated_at: now,
            created_at: now,
            removed_at: None,
            disconnected_at: None,
            last_seen: None,
            public_url: false,
        };

        self.with_transaction(ctx, |tx| {
            if tx.namespace(tenant)?.is_none() {
                return Err(LifecycleError::NamespaceNotFound(tenant.to_string()));
            }
            tx.insert_device(&device)?;
            counters::adjust(tx, tenant, DeviceStatus::Pending, CounterDelta::Increment)
        })?;

        tracing::info!(
            tenant = %tenant,
            uid = %device.uid,
            name = %device.name,
            "Device registered as pending"
        );
        Ok(device)
    }

    pub fn open_session(&self, tenant: &str, device_uid: &str, now: DateTime<Utc>) -> Result<String> {
        let uid = ulid::Ulid::new().to_string().to_lowercase();
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO sessions (uid, device_uid, tenant_id, started_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![uid, device_uid, tenant, format_timestamp(&now)],
            )
            .map_err(|err| LifecycleError::store("Failed to insert session", err))?;
            Ok(())
        })?;
        Ok(uid)
    }

    pub fn sessions_for_device(&self, device_uid: &str) -> Result<Vec<String>> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare("SELECT uid FROM sessions WHERE device_uid = ?1 ORDER BY started_at, uid")
                .map_err(|err| LifecycleError::store("Failed to prepare sessions query", err))?;
            let rows = stmt
                .query_map(params![device_uid], |row| row.get::<_, String>(0))
                .map_err(|err| LifecycleError::store("Failed to query sessions", err))?;

            let mut sessions = Vec::new();
            for row in rows {
                sessions.push(
                    row.map_err(|err| LifecycleError::store("Failed to decode session row", err))?,
                );
            }
            Ok(sessions)
        })
    }

    fn init_schema(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS namespaces (
                    tenant_id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    max_devices INTEGER NOT NULL DEFAULT 0,
                    devices_pending_count INTEGER NOT NULL DEFAULT 0,
                    devices_accepted_count INTEGER NOT NULL DEFAULT 0,
                    devices_rejected_count INTEGER NOT NULL DEFAULT 0,
                    devices_removed_count INTEGER NOT NULL DEFAULT 0
                 );
                 CREATE TABLE IF NOT EXISTS devices (
                    uid TEXT PRIMARY KEY,
                    tenant_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    identity TEXT NOT NULL,
                    status TEXT NOT NULL,
                    status_updated_at TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    removed_at TEXT,
                    disconnected_at TEXT,
                    last_seen TEXT,
                    public_url INTEGER NOT NULL DEFAULT 0
                 );
                 CREATE INDEX IF NOT EXISTS devices_by_tenant_status
                    ON devices (tenant_id, status);
                 CREATE UNIQUE INDEX IF NOT EXISTS devices_accepted_name
                    ON devices (tenant_id, name) WHERE status = 'accepted';
                 CREATE UNIQUE INDEX IF NOT EXISTS devices_accepted_identity
                    ON devices (tenant_id, identity) WHERE status = 'accepted';
                 CREATE TABLE IF NOT EXISTS sessions (
                    uid TEXT PRIMARY KEY,
                    device_uid TEXT NOT NULL,
                    tenant_id TEXT NOT NULL,
                    started_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS sessions_by_device ON sessions (device_uid);
                 COMMIT;",
            )
            .map_err(|err| LifecycleError::store("Failed to initialize schema", err))
        })
    }

    fn with_connection<T>(&self, op: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent).map_err(|err| LifecycleError::Config {
                path: parent.display().to_string(),
                details: format!("Failed to create data dir: {}", err),
            })?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| LifecycleError::store("Failed to open sqlite db", err))?;

        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| LifecycleError::store("Failed to set busy_timeout", err))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| LifecycleError::store("Failed to enable WAL", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| LifecycleError::store("Failed to set synchronous", err))?;

        Ok(conn)
    }

    fn run_transaction<T, F>(
        &self,
        ctx: &OpContext,
        behavior: TransactionBehavior,
        op: F,
    ) -> Result<T>
    where
        F: FnOnce(&dyn StoreTx) -> Result<T>,
    {
        ctx.check()?;
        let result = self.with_connection(|conn| {
            let tx = conn
                .transaction_with_behavior(behavior)
                .map_err(|err| LifecycleError::store("Failed to start transaction", err))?;
            let scoped = SqliteTx { tx };

            let value = op(&scoped)?;
            ctx.check()?;

            scoped
                .tx
                .commit()
                .map_err(|err| LifecycleError::store("Failed to commit transaction", err))?;
            Ok(value)
        });

        if let Err(err) = &result {
            tracing::warn!(
                kind = err.kind().as_str(),
                error = %err,
                "Transaction rolled back"
            );
        }
        result
    }
}

impl Store for Db {
    fn with_transaction<T, F>(&self, ctx: &OpContext, op: F) -> Result<T>
    where
        F: FnOnce(&dyn StoreTx) -> Result<T>,
    {
        self.run_transaction(ctx, TransactionBehavior::Immediate, op)
    }

    fn with_read_transaction<T, F>(&self, ctx: &OpContext, op: F) -> Result<T>
    where
        F: FnOnce(&dyn StoreTx) -> Result<T>,
    {
        self.run_transaction(ctx, TransactionBehavior::Deferred, op)
    }
}

struct SqliteTx<'conn> {
    tx: rusqlite::Transaction<'conn>,
}

impl SqliteTx<'_> {
    fn query_device(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Option<Device>> {
        self.tx
            .query_row(sql, args, device_from_row)
            .optional()
            .map_err(|err| LifecycleError::store("Failed to query device", err))
    }
}

impl StoreTx for SqliteTx<'_> {
    fn namespace(&self, tenant: &str) -> Result<Option<Namespace>> {
        query_namespace(&self.tx, tenant)
    }

    fn device(&self, tenant: &str, uid: &str) -> Result<Option<Device>> {
        self.query_device(
            &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE tenant_id = ?1 AND uid = ?2"),
            params![tenant, uid],
        )
    }

    fn accepted_device_by_identity(
        &self,
        tenant: &str,
        identity: &str,
    ) -> Result<Option<Device>> {
        self.query_device(
            &format!(
                "SELECT {DEVICE_COLUMNS} FROM devices \
                 WHERE tenant_id = ?1 AND identity = ?2 AND status = 'accepted'"
            ),
            params![tenant, identity],
        )
    }

    fn accepted_device_by_name(&self, tenant: &str, name: &str) -> Result<Option<Device>> {
        self.query_device(
            &format!(
                "SELECT {DEVICE_COLUMNS} FROM devices \
                 WHERE tenant_id = ?1 AND name = ?2 AND status = 'accepted'"
            ),
            params![tenant, name],
        )
    }

    fn live_device_by_name(&self, tenant: &str, name: &str) -> Result<Option<Device>> {
        self.query_device(
            &format!(
                "SELECT {DEVICE_COLUMNS} FROM devices \
                 WHERE tenant_id = ?1 AND name = ?2 AND status != 'removed' \
                 ORDER BY created_at ASC, uid ASC LIMIT 1"
            ),
            params![tenant, name],
        )
    }

    fn list_devices(&self, tenant: &str, status: Option<DeviceStatus>) -> Result<Vec<Device>> {
        let mut stmt = self
            .tx
            .prepare(&format!(
                "SELECT {DEVICE_COLUMNS} FROM devices \
                 WHERE tenant_id = ?1 AND (?2 IS NULL OR status = ?2) \
                 ORDER BY created_at ASC, uid ASC"
            ))
            .map_err(|err| LifecycleError::store("Failed to prepare devices query", err))?;

        let rows = stmt
            .query_map(
                params![tenant, status.map(|status| status.as_str())],
                device_from_row,
            )
            .map_err(|err| LifecycleError::store("Failed to query devices", err))?;

        let mut devices = Vec::new();
        for row in rows {
            devices.push(row.map_err(|err| LifecycleError::store("Failed to decode device row", err))?);
        }
        Ok(devices)
    }

    fn count_devices(&self, tenant: &str, status: DeviceStatus) -> Result<i64> {
        self.tx
            .query_row(
                "SELECT COUNT(*) FROM devices WHERE tenant_id = ?1 AND status = ?2",
                params![tenant, status.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .map_err(|err| LifecycleError::store("Failed to count devices", err))
    }

    fn insert_device(&self, device: &Device) -> Result<()> {
        self.tx
            .execute(
                &format!(
                    "INSERT INTO devices ({DEVICE_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    device.uid,
                    device.tenant_id,
                    device.name,
                    device.identity,
                    device.status.as_str(),
                    format_timestamp(&device.status_updated_at),
                    format_timestamp(&device.created_at),
                    device.removed_at.as_ref().map(format_timestamp),
                    device.disconnected_at.as_ref().map(format_timestamp),
                    device.last_seen.as_ref().map(format_timestamp),
                    device.public_url
                ],
            )
            .map_err(|err| LifecycleError::store("Failed to insert device", err))?;
        Ok(())
    }

    fn update_device(&self, device: &Device) -> Result<()> {
        let changed = self
            .tx
            .execute(
                "UPDATE devices SET \
                    name = ?3, \
                    identity = ?4, \
                    status = ?5, \
                    status_updated_at = ?6, \
                    removed_at = ?7, \
                    disconnected_at = ?8, \
                    last_seen = ?9, \
                    public_url = ?10 \
                 WHERE tenant_id = ?1 AND uid = ?2",
                params![
                    device.tenant_id,
                    device.uid,
                    device.name,
                    device.identity,
                    device.status.as_str(),
                    format_timestamp(&device.status_updated_at),
                    device.removed_at.as_ref().map(format_timestamp),
                    device.disconnected_at.as_ref().map(format_timestamp),
                    device.last_seen.as_ref().map(format_timestamp),
                    device.public_url
                ],
            )
            .map_err(|err| LifecycleError::store("Failed to update device", err))?;

        if changed == 0 {
            return Err(LifecycleError::DeviceNotFound(device.uid.clone()));
        }
        Ok(())
    }

    fn delete_device(&self, tenant: &str, uid: &str) -> Result<()> {
        let changed = self
            .tx
            .execute(
                "DELETE FROM devices WHERE tenant_id = ?1 AND uid = ?2",
                params![tenant, uid],
            )
            .map_err(|err| LifecycleError::store("Failed to delete device", err))?;

        if changed == 0 {
            return Err(LifecycleError::DeviceNotFound(uid.to_string()));
        }
        Ok(())
    }

    fn increment_device_count(
        &self,
        tenant: &str,
        status: DeviceStatus,
        delta: i64,
    ) -> Result<()> {
        let column = status.counter_column();
        let changed = self
            .tx
            .execute(
                &format!("UPDATE namespaces SET {column} = {column} + ?1 WHERE tenant_id = ?2"),
                params![delta, tenant],
            )
            .map_err(|err| LifecycleError::store("Failed to update device counter", err))?;

        if changed == 0 {
            return Err(LifecycleError::NamespaceNotFound(tenant.to_string()));
        }
        Ok(())
    }

    fn transfer_session_owner(&self, old_uid: &str, new_uid: &str) -> Result<u64> {
        self.tx
            .execute(
                "UPDATE sessions SET device_uid = ?2 WHERE device_uid = ?1",
                params![old_uid, new_uid],
            )
            .map(|count| count as u64)
            .map_err(|err| LifecycleError::store("Failed to transfer session owner", err))
    }

    fn delete_namespace(&self, tenant: &str) -> Result<()> {
        self.tx
            .execute("DELETE FROM sessions WHERE tenant_id = ?1", params![tenant])
            .map_err(|err| LifecycleError::store("Failed to delete namespace sessions", err))?;
        self.tx
            .execute("DELETE FROM devices WHERE tenant_id = ?1", params![tenant])
            .map_err(|err| LifecycleError::store("Failed to delete namespace devices", err))?;
        let changed = self
            .tx
            .execute("DELETE FROM namespaces WHERE tenant_id = ?1", params![tenant])
            .map_err(|err| LifecycleError::store("Failed to delete namespace", err))?;

        if changed == 0 {
            return Err(LifecycleError::NamespaceNotFound(tenant.to_string()));
        }
        Ok(())
    }
}

fn query_namespace(conn: &Connection, tenant: &str) -> Result<Option<Namespace>> {
    conn.query_row(
        &format!("SELECT {NAMESPACE_COLUMNS} FROM namespaces WHERE tenant_id = ?1"),
        params![tenant],
        |row| {
            Ok(Namespace {
                tenant_id: row.get(0)?,
                name: row.get(1)?,
                max_devices: row.get(2)?,
                devices_pending_count: row.get(3)?,
                devices_accepted_count: row.get(4)?,
                devices_rejected_count: row.get(5)?,
                devices_removed_count: row.get(6)?,
            })
        },
    )
    .optional()
    .map_err(|err| LifecycleError::store("Failed to query namespace", err))
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<Device> {
    let status_raw: String = row.get(4)?;
    let status = DeviceStatus::from_str(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Unknown device status: {}", status_raw),
            )),
        )
    })?;

    Ok(Device {
        uid: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        identity: row.get(3)?,
        status,
        status_updated_at: timestamp_column(row, 5)?,
        created_at: timestamp_column(row, 6)?,
        removed_at: optional_timestamp_column(row, 7)?,
        disconnected_at: optional_timestamp_column(row, 8)?,
        last_seen: optional_timestamp_column(row, 9)?,
        public_url: row.get(10)?,
    })
}

fn timestamp_column(row: &Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(index)?;
    parse_rfc3339(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Invalid timestamp: {}", raw),
            )),
        )
    })
}

fn optional_timestamp_column(
    row: &Row<'_>,
    index: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(index)? {
        Some(_) => timestamp_column(row, index).map(Some),
        None => Ok(None),
    }
}

fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
