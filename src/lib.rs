//! # continuum-memory
//!
//! Tiered knowledge lifecycle engine for long-lived retrieval memories.
//!
//! Knowledge items live in one of four plasticity tiers, from `L0`
//! (volatile, reprocessed every cycle) to `L3` (stable, reprocessed
//! rarely). The engine scores items, gates reprocessing by tier, moves items
//! one tier at a time with a full audit trail, tracks recall regressions and
//! scopes vector retrieval to chosen tiers.
//!
//! ## Core Components
//!
//! - **Memory**: SQLite-backed tier metrics, audit log and forgetting metrics
//! - **Lifecycle**: surprise scoring, tier routing, update gating, promotion
//! - **Retrieval**: tier-isolated search over a pluggable vector backend
//! - **Engine**: facade over all of the above, or a no-op when disabled
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use continuum_memory::{build_engine, LifecycleConfig, SqliteTierStore, Tier};
//!
//! let store = Arc::new(SqliteTierStore::open("continuum.db")?);
//! let engine = build_engine(LifecycleConfig::from_env(), store)?;
//!
//! engine.register("doc-42")?;
//! if engine.should_update(Tier::L2, cycle) {
//!     // re-embed and rescore L2 items
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod memory;
pub mod retrieval;

pub use config::{LifecycleConfig, PerTier, RetrievalConfig};
pub use engine::{build_engine, ActiveEngine, DisabledEngine, LifecycleEngine, TierStats};
pub use error::{Error, Result, TransitionDirection};
pub use lifecycle::{
    route_tier, surprise_score, CycleReport, Decision, ForgettingTracker, LearningCycle,
    ProbeExtras, PromotionManager, ScoringOracle, SurpriseSignals, UpdateScheduler,
};
pub use memory::{
    AuditAction, AuditQuery, AuditRecord, ForgettingMetric, SqliteTierStore, Tier, TierMetric,
    TierStore, TrendPoint,
};
pub use retrieval::{
    Document, MetadataFilter, QueryOutcome, TierIsolatedRetriever, VectorBackend,
};
