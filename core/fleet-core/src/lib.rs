//! # fleet-core
//!
//! Lifecycle core for devices registered under a multi-tenant namespace:
//! admission, identity-conflict resolution, soft and hard deletion, and the
//! per-namespace counters that must always match the device records.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime dependency. Callers wrap with async if needed.
//! - **One transaction per operation**: every lookup, hook and counter change
//!   of a call commits together or not at all.
//! - **No in-process locking**: the store serializes concurrent writers.
//! - **Explicit collaborators**: hooks, deployment mode and clock are injected,
//!   never read from globals or the environment.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use fleet_core::{Db, DeviceStatus, HookRegistry, LifecycleManager, OpContext, QuotaGuard};
//!
//! let db = Db::new(path)?;
//! let manager = LifecycleManager::new(db, Arc::new(HookRegistry::empty()), QuotaGuard::default());
//! manager.update_status(&OpContext::new(), "tenant", "uid", DeviceStatus::Accepted)?;
//! ```

pub mod clock;
pub mod config;
pub mod conflict;
pub mod context;
pub mod counters;
pub mod error;
pub mod hooks;
pub mod lifecycle;
pub mod merge;
pub mod quota;
pub mod store;
pub mod types;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{load_config, FleetConfig};
pub use conflict::Admission;
pub use context::OpContext;
pub use counters::CounterDelta;
pub use error::{ErrorKind, HookError, LifecycleError, Result};
pub use hooks::{HookRegistry, HookRegistryBuilder};
pub use lifecycle::{Deletion, LifecycleManager};
pub use quota::{BillingEvaluator, DeploymentMode, QuotaGuard};
pub use store::{Db, Store, StoreTx};
pub use types::*;
