//! Decides whether admitting a device collides with an accepted one.
//!
//! Hostname ownership is the deciding signal: an identity match alone never
//! clears admission unless the hostname resolves to the same record.
//!
//! | by identity | by hostname | outcome  |
//! |-------------|-------------|----------|
//! | none        | none        | clear    |
//! | X           | X           | merge X  |
//! | X           | Y           | conflict |
//! | X           | none        | conflict |
//! | none        | Y           | conflict |

use crate::error::Result;
use crate::store::StoreTx;
use crate::types::Device;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// No accepted device collides with the candidate.
    Clear,
    /// The candidate is a reconnection of this stale accepted record.
    Merge(Device),
    /// Admission would break uniqueness of this hostname.
    Conflict { hostname: String },
}

pub fn classify(
    candidate: &Device,
    by_identity: Option<Device>,
    by_hostname: Option<Device>,
) -> Admission {
    match (by_identity, by_hostname) {
        (None, None) => Admission::Clear,
        (Some(identity), Some(hostname)) if identity.uid == hostname.uid => {
            if identity.uid == candidate.uid {
                Admission::Clear
            } else {
                Admission::Merge(identity)
            }
        }
        _ => Admission::Conflict {
            hostname: candidate.name.clone(),
        },
    }
}

/// Looks up accepted devices sharing the candidate's identity and hostname.
///
/// A blank identity never matches another record.
pub fn resolve(tx: &dyn StoreTx, candidate: &Device) -> Result<Admission> {
    let by_identity = if candidate.identity.trim().is_empty() {
        None
    } else {
        tx.accepted_device_by_identity(&candidate.tenant_id, &candidate.identity)?
    };
    let by_hostname = tx.accepted_device_by_name(&candidate.tenant_id, &candidate.name)?;

    let admission = classify(candidate, by_identity, by_hostname);
    tracing::debug!(
        tenant = %candidate.tenant_id,
        uid = %candidate.uid,
        admission = admission_label(&admission),
        "Admission classified"
    );
    Ok(admission)
}

fn admission_label(admission: &Admission) -> &'static str {
    match admission {
        Admission::Clear => "clear",
        Admission::Merge(_) => "merge",
        Admission::Conflict { .. } => "conflict",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceStatus;
    use chrono::Utc;

    fn device(uid: &str, name: &str, identity: &str, status: DeviceStatus) -> Device {
        let now = Utc::now();
        Device {
            uid: uid.to_string(),
            tenant_id: "tenant-1".to_string(),
            name: name.to_string(),
            identity: identity.to_string(),
            status,
            status_updated_at: now,
            created_at: now,
            removed_at: None,
            disconnected_at: None,
            last_seen: None,
            public_url: false,
        }
    }

    #[test]
    fn no_collisions_is_clear() {
        let candidate = device("b", "h2", "m2", DeviceStatus::Pending);
        assert_eq!(classify(&candidate, None, None), Admission::Clear);
    }

    #[test]
    fn same_record_on_both_keys_merges() {
        let stale = device("a", "h", "m", DeviceStatus::Accepted);
        let candidate = device("b", "h", "m", DeviceStatus::Pending);
        assert_eq!(
            classify(&candidate, Some(stale.clone()), Some(stale.clone())),
            Admission::Merge(stale)
        );
    }

    #[test]
    fn identity_and_hostname_owned_by_different_records_conflicts() {
        let by_identity = device("a", "h", "m", DeviceStatus::Accepted);
        let by_hostname = device("c", "h2", "m3", DeviceStatus::Accepted);
        let candidate = device("b", "h2", "m", DeviceStatus::Pending);
        assert_eq!(
            classify(&candidate, Some(by_identity), Some(by_hostname)),
            Admission::Conflict {
                hostname: "h2".to_string()
            }
        );
    }

    #[test]
    fn hostname_claimed_by_other_hardware_conflicts() {
        let owner = device("a", "h", "m", DeviceStatus::Accepted);
        let candidate = device("b", "h", "m2", DeviceStatus::Pending);
        assert_eq!(
            classify(&candidate, None, Some(owner)),
            Admission::Conflict {
                hostname: "h".to_string()
            }
        );
    }

    #[test]
    fn identity_match_alone_conflicts() {
        let owner = device("a", "h", "m", DeviceStatus::Accepted);
        let candidate = device("b", "h2", "m", DeviceStatus::Pending);
        assert_eq!(
            classify(&candidate, Some(owner), None),
            Admission::Conflict {
                hostname: "h2".to_string()
            }
        );
    }

    #[test]
    fn candidate_matching_itself_is_clear() {
        let candidate = device("a", "h", "m", DeviceStatus::Accepted);
        assert_eq!(
            classify(&candidate, Some(candidate.clone()), Some(candidate.clone())),
            Admission::Clear
        );
    }

    #[test]
    fn blank_identity_never_matches_accepted_records() {
        use crate::context::OpContext;
        use crate::store::{Db, Store};

        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Db::new(temp_dir.path().join("devices.db")).expect("db init");
        db.create_namespace("tenant-1", "dev", 0).expect("namespace");

        let admission = db
            .with_transaction(&OpContext::new(), |tx| {
                tx.insert_device(&device("a", "alpha", "", DeviceStatus::Accepted))?;
                let candidate = device("b", "beta", "", DeviceStatus::Pending);
                tx.insert_device(&candidate)?;
                resolve(tx, &candidate)
            })
            .expect("resolve");
        assert_eq!(admission, Admission::Clear);
    }
}
