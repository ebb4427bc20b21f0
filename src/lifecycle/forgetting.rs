//! Catastrophic-forgetting measurement over fixed regression probes.
//!
//! A probe is a query with a known relevant item. Recall@k is measured
//! before and after a knowledge update; the difference is the forgetting
//! delta. Positive deltas mean recall dropped.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::memory::{ForgettingMetric, TierStore, TrendPoint};

/// Deltas above this are logged as regressions.
pub const REGRESSION_WARN_DELTA: f64 = 0.1;

/// Optional context recorded alongside a probe measurement.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ProbeExtras {
    pub faithfulness: Option<f64>,
    pub overlap: Option<f64>,
    pub knowledge_update_timestamp: Option<DateTime<Utc>>,
}

impl ProbeExtras {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faithfulness(mut self, score: f64) -> Self {
        self.faithfulness = Some(score);
        self
    }

    pub fn overlap(mut self, score: f64) -> Self {
        self.overlap = Some(score);
        self
    }

    pub fn updated_at(mut self, ts: DateTime<Utc>) -> Self {
        self.knowledge_update_timestamp = Some(ts);
        self
    }
}

/// Records probe measurements and aggregates them into daily trends.
pub struct ForgettingTracker {
    store: Arc<dyn TierStore>,
}

impl ForgettingTracker {
    pub fn new(store: Arc<dyn TierStore>) -> Self {
        Self { store }
    }

    /// Store one measurement and return its id.
    ///
    /// Recall values and optional scores must be finite and in [0, 1].
    pub fn record(
        &self,
        regression_item_id: &str,
        query: &str,
        recall_before: f64,
        recall_after: f64,
        extras: ProbeExtras,
    ) -> Result<i64> {
        if regression_item_id.trim().is_empty() {
            return Err(Error::InvalidInput(
                "regression item id must not be empty".to_string(),
            ));
        }
        check_unit("recall_at_k_before", recall_before)?;
        check_unit("recall_at_k_after", recall_after)?;
        if let Some(score) = extras.faithfulness {
            check_unit("faithfulness_score", score)?;
        }
        if let Some(score) = extras.overlap {
            check_unit("overlap_score", score)?;
        }

        let metric = ForgettingMetric::new(regression_item_id, query, recall_before, recall_after)
            .with_faithfulness(extras.faithfulness)
            .with_overlap(extras.overlap)
            .with_update_timestamp(extras.knowledge_update_timestamp);

        let id = self.store.record_forgetting(&metric)?;
        if metric.forgetting_delta > REGRESSION_WARN_DELTA {
            warn!(
                regression_item_id,
                delta = metric.forgetting_delta,
                "Recall regression on probe"
            );
        } else {
            debug!(regression_item_id, delta = metric.forgetting_delta, id, "Recorded probe");
        }
        Ok(id)
    }

    /// Daily averages over the last `days` calendar days, oldest first.
    pub fn trends(&self, days: u32) -> Result<Vec<TrendPoint>> {
        self.store.forgetting_trends(days)
    }
}

fn check_unit(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "{name} must be a finite value in [0, 1], got {value}"
        )))
    }
}
