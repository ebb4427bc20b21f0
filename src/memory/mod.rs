//! Tier store: persisted lifecycle state.
//!
//! Three tables back the engine:
//!
//! - **tier_metrics**: one row per managed item (tier, surprise, cycle)
//! - **audit_log**: append-only record of every promote/demote/skip/place
//! - **forgetting_metrics**: regression-probe recall measurements
//!
//! ## Example
//!
//! ```rust,ignore
//! use continuum_memory::memory::{SqliteTierStore, TierStore, Tier};
//!
//! let store = SqliteTierStore::open("continuum.db")?;
//! let (metric, created) = store.create_if_absent("doc-42")?;
//! assert_eq!(metric.tier, Tier::L0);
//!
//! let counts = store.counts_by_tier()?;
//! ```

mod schema;
mod store;
mod types;

pub use schema::{get_schema_version, initialize_schema, is_initialized, SCHEMA_VERSION};
pub use store::{SqliteTierStore, TierStore};
pub use types::{
    clamp_unit, AuditAction, AuditQuery, AuditRecord, ForgettingMetric, MetricRefresh,
    NewAuditRecord, Tier, TierMetric, TransitionWrite, TrendPoint, SYSTEM_ACTOR,
};
