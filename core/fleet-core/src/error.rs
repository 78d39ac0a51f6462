//! Error types for lifecycle operations.
//! Every variant raised inside a transaction aborts it; callers match on
//! [`ErrorKind`] rather than on individual variants.

use crate::types::DeviceStatus;

/// Error returned by a registered hook callback.
pub type HookError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Coarse classification used by callers to map errors onto responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    Invalid,
    Duplicated,
    LimitReached,
    HookFailed,
    StoreFailure,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Invalid => "invalid",
            ErrorKind::Duplicated => "duplicated",
            ErrorKind::LimitReached => "limit_reached",
            ErrorKind::HookFailed => "hook_failed",
            ErrorKind::StoreFailure => "store_failure",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    // ─────────────────────────────────────────────────────────────────────
    // Resolution
    // ─────────────────────────────────────────────────────────────────────
    #[error("Namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    // ─────────────────────────────────────────────────────────────────────
    // State machine
    // ─────────────────────────────────────────────────────────────────────
    #[error("Device {0} is accepted and cannot change status")]
    DeviceStatusAccepted(String),

    #[error("Status {0} cannot be requested directly")]
    InvalidStatus(DeviceStatus),

    #[error("Invalid hostname: {0:?}")]
    InvalidHostname(String),

    #[error("Device identity must not be blank")]
    InvalidIdentity,

    // ─────────────────────────────────────────────────────────────────────
    // Admission
    // ─────────────────────────────────────────────────────────────────────
    #[error("Hostname already in use: {0}")]
    DeviceDuplicated(String),

    #[error("Maximum number of accepted devices reached: {0}")]
    DeviceMaxDevicesReached(i64),

    #[error("Billing refused admission for namespace {0}")]
    BillingRejected(String),

    #[error("{hook} hook failed: {source}")]
    HookFailed {
        hook: &'static str,
        #[source]
        source: HookError,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Store
    // ─────────────────────────────────────────────────────────────────────
    #[error("Store error: {context}: {source}")]
    Store {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Configuration error: {path}: {details}")]
    Config { path: String, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // Cancellation
    // ─────────────────────────────────────────────────────────────────────
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation deadline exceeded")]
    DeadlineExceeded,
}

impl LifecycleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LifecycleError::NamespaceNotFound(_) | LifecycleError::DeviceNotFound(_) => {
                ErrorKind::NotFound
            }
            LifecycleError::DeviceStatusAccepted(_) | LifecycleError::InvalidStatus(_) => {
                ErrorKind::InvalidState
            }
            LifecycleError::InvalidHostname(_)
            | LifecycleError::InvalidIdentity
            | LifecycleError::Config { .. } => ErrorKind::Invalid,
            LifecycleError::DeviceDuplicated(_) => ErrorKind::Duplicated,
            LifecycleError::DeviceMaxDevicesReached(_) | LifecycleError::BillingRejected(_) => {
                ErrorKind::LimitReached
            }
            LifecycleError::HookFailed { .. } => ErrorKind::HookFailed,
            LifecycleError::Store { .. } => ErrorKind::StoreFailure,
            LifecycleError::Cancelled | LifecycleError::DeadlineExceeded => ErrorKind::Cancelled,
        }
    }

    pub(crate) fn store(context: impl Into<String>, source: rusqlite::Error) -> Self {
        LifecycleError::Store {
            context: context.into(),
            source,
        }
    }
}

/// Convenience type alias for Results using LifecycleError.
pub type Result<T> = std::result::Result<T, LifecycleError>;
