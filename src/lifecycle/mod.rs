//! Knowledge lifecycle: scoring, routing, gating and tier transitions.
//!
//! Items move through four plasticity tiers (`L0` volatile .. `L3` stable).
//!
//! - [`surprise_score`] combines oracle signals into one score
//! - [`route_tier`] maps a score to the tier it suggests
//! - [`UpdateScheduler`] decides which tiers are reprocessed in a cycle
//! - [`PromotionManager`] moves items one tier at a time, with audit
//! - [`ForgettingTracker`] measures recall regressions on fixed probes
//! - [`LearningCycle`] drives all of the above over a batch of items
//!
//! # Example
//!
//! ```rust,ignore
//! use continuum_memory::lifecycle::{route_tier, surprise_score};
//!
//! let score = surprise_score(0.9, 0.8, 0.4, 0.6);
//! let suggested = route_tier(score);
//! ```

mod cycle;
mod forgetting;
mod promotion;
mod proptest;
mod router;
mod scheduler;
mod scorer;

pub use cycle::{CycleReport, ItemOutcome, LearningCycle};
pub use forgetting::{ForgettingTracker, ProbeExtras, REGRESSION_WARN_DELTA};
pub use promotion::{Decision, PromotionManager, MAX_TRANSITION_ATTEMPTS};
pub use router::{route_tier, L1_FLOOR, L2_FLOOR, L3_FLOOR};
pub use scheduler::UpdateScheduler;
pub use scorer::{
    surprise_score, InMemoryOracle, OracleReading, ScoringOracle, SurpriseSignals,
    NOVELTY_WEIGHT, RARITY_WEIGHT, RETRIEVAL_FREQUENCY_WEIGHT, VALIDATOR_OVERLAP_WEIGHT,
};
