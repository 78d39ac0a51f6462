//! Admission ceiling per namespace.
//!
//! Self-managed deployments enforce `max_devices` locally. Hosted, metered
//! deployments never apply the local ceiling; the decision belongs to the
//! billing side, reachable through an optional [`BillingEvaluator`].

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{LifecycleError, Result};
use crate::types::Namespace;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentMode {
    #[default]
    SelfManaged,
    HostedMetered,
}

impl DeploymentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentMode::SelfManaged => "self_managed",
            DeploymentMode::HostedMetered => "hosted_metered",
        }
    }
}

/// External billing decision for hosted deployments.
pub trait BillingEvaluator: Send + Sync {
    fn allows_admission(&self, namespace: &Namespace) -> bool;
}

#[derive(Clone, Default)]
pub struct QuotaGuard {
    mode: DeploymentMode,
    billing: Option<Arc<dyn BillingEvaluator>>,
}

impl QuotaGuard {
    pub fn new(mode: DeploymentMode) -> Self {
        Self {
            mode,
            billing: None,
        }
    }

    pub fn with_billing(mut self, billing: Arc<dyn BillingEvaluator>) -> Self {
        self.billing = Some(billing);
        self
    }

    pub fn mode(&self) -> DeploymentMode {
        self.mode
    }

    /// Fails if one more accepted device would exceed the namespace ceiling.
    pub fn check(&self, namespace: &Namespace) -> Result<()> {
        match self.mode {
            DeploymentMode::SelfManaged => {
                if namespace.max_devices > 0
                    && namespace.devices_accepted_count >= namespace.max_devices
                {
                    tracing::info!(
                        tenant = %namespace.tenant_id,
                        max_devices = namespace.max_devices,
                        accepted = namespace.devices_accepted_count,
                        "Device limit reached"
                    );
                    return Err(LifecycleError::DeviceMaxDevicesReached(
                        namespace.max_devices,
                    ));
                }
                Ok(())
            }
            DeploymentMode::HostedMetered => match &self.billing {
                Some(billing) if !billing.allows_admission(namespace) => {
                    tracing::info!(tenant = %namespace.tenant_id, "Billing refused admission");
                    Err(LifecycleError::BillingRejected(namespace.tenant_id.clone()))
                }
                _ => Ok(()),
            },
        }
    }
}

impl std::fmt::Debug for QuotaGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaGuard")
            .field("mode", &self.mode)
            .field("billing", &self.billing.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn namespace(max_devices: i64, accepted: i64) -> Namespace {
        Namespace {
            tenant_id: "tenant-1".to_string(),
            name: "dev".to_string(),
            max_devices,
            devices_pending_count: 0,
            devices_accepted_count: accepted,
            devices_rejected_count: 0,
            devices_removed_count: 0,
        }
    }

    struct Deny;

    impl BillingEvaluator for Deny {
        fn allows_admission(&self, _namespace: &Namespace) -> bool {
            false
        }
    }

    #[test]
    fn self_managed_enforces_ceiling() {
        let guard = QuotaGuard::new(DeploymentMode::SelfManaged);
        assert!(guard.check(&namespace(3, 2)).is_ok());
        assert!(matches!(
            guard.check(&namespace(3, 3)),
            Err(LifecycleError::DeviceMaxDevicesReached(3))
        ));
    }

    #[test]
    fn non_positive_ceiling_is_unlimited() {
        let guard = QuotaGuard::new(DeploymentMode::SelfManaged);
        assert!(guard.check(&namespace(0, 500)).is_ok());
        assert!(guard.check(&namespace(-1, 500)).is_ok());
    }

    #[test]
    fn hosted_ignores_local_ceiling() {
        let guard = QuotaGuard::new(DeploymentMode::HostedMetered);
        assert!(guard.check(&namespace(3, 3)).is_ok());
    }

    #[test]
    fn hosted_defers_to_billing() {
        let guard = QuotaGuard::new(DeploymentMode::HostedMetered).with_billing(Arc::new(Deny));
        assert!(matches!(
            guard.check(&namespace(0, 0)),
            Err(LifecycleError::BillingRejected(tenant)) if tenant == "tenant-1"
        ));
    }

    #[test]
    fn deployment_mode_parses_snake_case() {
        let mode: DeploymentMode = serde_json::from_str("\"hosted_metered\"").expect("parse");
        assert_eq!(mode, DeploymentMode::HostedMetered);
    }
}
