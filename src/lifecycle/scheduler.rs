//! Tiered update isolation.
//!
//! Volatile knowledge (L0) is reprocessed every cycle; stable knowledge is
//! reprocessed every `frequency[tier]` cycles, which bounds embedding and
//! re-scoring cost for the bulk of the corpus.

use std::sync::Arc;

use tracing::{trace, warn};

use crate::config::PerTier;
use crate::error::{Error, Result};
use crate::memory::{MetricRefresh, Tier, TierStore};

/// Cost-control gate keyed on the global cycle counter.
pub struct UpdateScheduler {
    frequency: PerTier<u64>,
    store: Arc<dyn TierStore>,
}

impl UpdateScheduler {
    pub fn new(frequency: PerTier<u64>, store: Arc<dyn TierStore>) -> Self {
        Self { frequency, store }
    }

    /// Reprocessing interval for `tier`, in cycles.
    pub fn frequency(&self, tier: Tier) -> u64 {
        self.frequency.get(tier)
    }

    /// Whether items in `tier` may be reprocessed during `cycle`.
    ///
    /// True iff `cycle mod frequency == 0`. Negative cycles use Euclidean
    /// modulo. A zero frequency fails open.
    pub fn should_update(&self, tier: Tier, cycle: i64) -> bool {
        let frequency = self.frequency.get(tier);
        if frequency == 0 {
            warn!(%tier, cycle, "Zero update frequency configured; allowing update");
            return true;
        }
        // Frequencies beyond i64::MAX can only divide cycle 0
        match i64::try_from(frequency) {
            Ok(f) => cycle.rem_euclid(f) == 0,
            Err(_) => cycle == 0,
        }
    }

    /// Like [`should_update`](Self::should_update) for a tier label read from
    /// an external source. Unrecognized labels fail open.
    pub fn should_update_label(&self, label: &str, cycle: i64) -> bool {
        match Tier::parse(label) {
            Some(tier) => self.should_update(tier, cycle),
            None => {
                warn!(tier = label, cycle, "Unrecognized tier; allowing update");
                true
            }
        }
    }

    /// Persist that `item_id` was reprocessed in `cycle`.
    ///
    /// Returns `false` if another worker already recorded a later cycle.
    pub fn record_update(&self, item_id: &str, tier: Tier, cycle: i64) -> Result<bool> {
        self.record_refresh(item_id, tier, cycle, &MetricRefresh::default())
    }

    /// Persist a reprocessing pass together with recomputed signals.
    pub fn record_refresh(
        &self,
        item_id: &str,
        tier: Tier,
        cycle: i64,
        refresh: &MetricRefresh,
    ) -> Result<bool> {
        let cycle = u64::try_from(cycle)
            .map_err(|_| Error::InvalidInput(format!("cannot record negative cycle {cycle}")))?;

        let written = self.store.record_update(item_id, cycle, refresh)?;
        trace!(item_id, %tier, cycle, written, "Recorded update cycle");
        Ok(written)
    }
}
