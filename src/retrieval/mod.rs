//! Tier-isolated vector retrieval.
//!
//! Callers ask for documents from specific tiers (for example only `L3`
//! for stable facts). [`TierIsolatedRetriever`] enforces the scope whether
//! or not the backend can filter on metadata itself.

mod backend;
mod filter;
mod isolation;

pub use backend::{Document, FilterSupport, SearchCall, SimVectorBackend, VectorBackend};
pub use filter::{MetadataFilter, TIER_METADATA_KEY};
pub use isolation::{
    cancel_pair, CancelHandle, CancelSignal, QueryOutcome, Strategy, TierIsolatedRetriever,
};
