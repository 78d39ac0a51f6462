//! Records owned by the lifecycle core.
//!
//! Devices and namespaces are only ever mutated inside a store transaction;
//! these structs are plain snapshots of a row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Pending,
    Accepted,
    Rejected,
    Removed,
}

impl DeviceStatus {
    pub const ALL: [DeviceStatus; 4] = [
        DeviceStatus::Pending,
        DeviceStatus::Accepted,
        DeviceStatus::Rejected,
        DeviceStatus::Removed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Pending => "pending",
            DeviceStatus::Accepted => "accepted",
            DeviceStatus::Rejected => "rejected",
            DeviceStatus::Removed => "removed",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(DeviceStatus::Pending),
            "accepted" => Some(DeviceStatus::Accepted),
            "rejected" => Some(DeviceStatus::Rejected),
            "removed" => Some(DeviceStatus::Removed),
            _ => None,
        }
    }

    /// Name of the namespace column counting devices in this status.
    pub(crate) fn counter_column(&self) -> &'static str {
        match self {
            DeviceStatus::Pending => "devices_pending_count",
            DeviceStatus::Accepted => "devices_accepted_count",
            DeviceStatus::Rejected => "devices_rejected_count",
            DeviceStatus::Removed => "devices_removed_count",
        }
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub uid: String,
    pub tenant_id: String,
    /// Hostname. Always stored lower-cased.
    pub name: String,
    /// Hardware identity, typically the primary MAC address.
    pub identity: String,
    pub status: DeviceStatus,
    pub status_updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub removed_at: Option<DateTime<Utc>>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub public_url: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    pub tenant_id: String,
    pub name: String,
    /// Device ceiling. Zero or negative means unlimited or externally metered.
    pub max_devices: i64,
    pub devices_pending_count: i64,
    pub devices_accepted_count: i64,
    pub devices_rejected_count: i64,
    pub devices_removed_count: i64,
}

impl Namespace {
    pub fn count(&self, status: DeviceStatus) -> i64 {
        match status {
            DeviceStatus::Pending => self.devices_pending_count,
            DeviceStatus::Accepted => self.devices_accepted_count,
            DeviceStatus::Rejected => self.devices_rejected_count,
            DeviceStatus::Removed => self.devices_removed_count,
        }
    }

    pub fn total_count(&self) -> i64 {
        DeviceStatus::ALL.iter().map(|status| self.count(*status)).sum()
    }
}

/// Fields an operator may change on an existing device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceChanges {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub public_url: Option<bool>,
}

/// A namespace counter that disagrees with the number of device records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CounterDrift {
    pub status: DeviceStatus,
    pub recorded: i64,
    pub actual: i64,
}

/// Lower-cases and trims a hostname for comparison and storage.
pub fn normalize_hostname(name: &str) -> String {
    name.trim().to_lowercase()
}
