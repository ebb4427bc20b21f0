//! One learning cycle: gate, rescore, then evaluate each item.

use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::memory::{MetricRefresh, TierMetric, TierStore};

use super::promotion::{Decision, PromotionManager};
use super::scheduler::UpdateScheduler;
use super::scorer::ScoringOracle;

/// What happened to one item during a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub item_id: String,
    pub decision: Decision,
}

/// Counters for one cycle run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle: i64,
    /// Items looked at (after the batch cap)
    pub considered: usize,
    /// Not due for reprocessing in this cycle
    pub gated: usize,
    pub refreshed: usize,
    /// A later cycle was already recorded by another worker
    pub stale: usize,
    pub promoted: usize,
    pub demoted: usize,
    pub held: usize,
    pub skipped: usize,
    /// Not under lifecycle management
    pub missing: usize,
    /// Beyond the batch cap, left for the next run
    pub deferred: usize,
    /// Oracle or validation failures
    pub failed: usize,
    pub outcomes: Vec<ItemOutcome>,
}

impl CycleReport {
    /// Serialize the report to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(Error::Serialization)
    }

    fn tally(&mut self, item_id: &str, decision: Decision) {
        match &decision {
            Decision::Promoted(_) => self.promoted += 1,
            Decision::Demoted(_) => self.demoted += 1,
            Decision::Held { .. } => self.held += 1,
            Decision::Skipped(_) => self.skipped += 1,
            Decision::Disabled => {}
        }
        self.outcomes.push(ItemOutcome {
            item_id: item_id.to_string(),
            decision,
        });
    }
}

/// Drives a cycle over a batch of items.
///
/// Storage failures abort the run. Any other per-item failure is counted
/// and the run continues.
pub struct LearningCycle {
    store: Arc<dyn TierStore>,
    scheduler: Arc<UpdateScheduler>,
    promotions: Arc<PromotionManager>,
    max_batch_size: usize,
}

impl LearningCycle {
    pub fn new(
        store: Arc<dyn TierStore>,
        scheduler: Arc<UpdateScheduler>,
        promotions: Arc<PromotionManager>,
        max_batch_size: usize,
    ) -> Self {
        Self {
            store,
            scheduler,
            promotions,
            max_batch_size,
        }
    }

    #[instrument(skip(self, item_ids, oracle), fields(items = item_ids.len()))]
    pub async fn run(
        &self,
        cycle: i64,
        item_ids: &[String],
        oracle: &dyn ScoringOracle,
    ) -> Result<CycleReport> {
        let mut report = CycleReport {
            cycle,
            ..Default::default()
        };

        let batch = &item_ids[..item_ids.len().min(self.max_batch_size)];
        report.considered = batch.len();
        report.deferred = item_ids.len() - batch.len();
        if report.deferred > 0 {
            debug!(deferred = report.deferred, "Batch cap reached");
        }

        // Gate first so the oracle is only asked about items that are due
        let mut due: Vec<TierMetric> = Vec::with_capacity(batch.len());
        for item_id in batch {
            match self.store.get(item_id) {
                Ok(metric) if self.scheduler.should_update(metric.tier, cycle) => due.push(metric),
                Ok(_) => report.gated += 1,
                Err(e) if e.is_storage() => return Err(e),
                Err(e) => {
                    debug!(item_id, error = %e, "Item not under lifecycle management");
                    report.missing += 1;
                }
            }
        }

        let readings = join_all(due.iter().map(|m| oracle.observe(&m.item_id))).await;

        for (metric, reading) in due.iter().zip(readings) {
            let item_id = metric.item_id.as_str();
            let reading = match reading {
                Ok(reading) => reading,
                Err(e) => {
                    warn!(item_id, error = %e, "Oracle failed to score item");
                    report.failed += 1;
                    continue;
                }
            };

            let refresh = MetricRefresh {
                surprise_score: Some(reading.signals.score()),
                retrieval_count_7d: Some(reading.retrieval_count_7d),
                retrieval_count_30d: Some(reading.retrieval_count_30d),
                validator_overlap: Some(reading.signals.validator_overlap),
            };

            match self
                .scheduler
                .record_refresh(item_id, metric.tier, cycle, &refresh)
            {
                Ok(true) => report.refreshed += 1,
                Ok(false) => {
                    report.stale += 1;
                    continue;
                }
                Err(e) if e.is_storage() => return Err(e),
                Err(e) => {
                    warn!(item_id, error = %e, "Could not record refresh");
                    report.failed += 1;
                    continue;
                }
            }

            match self.promotions.evaluate(item_id) {
                Ok(decision) => report.tally(item_id, decision),
                Err(e) if e.is_storage() => return Err(e),
                Err(e) => {
                    warn!(item_id, error = %e, "Evaluation failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            cycle,
            considered = report.considered,
            refreshed = report.refreshed,
            promoted = report.promoted,
            demoted = report.demoted,
            "Learning cycle complete"
        );
        Ok(report)
    }
}
