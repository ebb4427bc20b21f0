//! Surprise scoring and the scoring-oracle contract.
//!
//! The oracle supplies four signals expected in [0, 1]. Out-of-range values
//! are tolerated as a best-effort signal: they are logged, non-finite values
//! count as zero, and the weighted sum is clamped.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::memory::clamp_unit;

pub const RARITY_WEIGHT: f64 = 0.3;
pub const NOVELTY_WEIGHT: f64 = 0.3;
pub const RETRIEVAL_FREQUENCY_WEIGHT: f64 = 0.2;
pub const VALIDATOR_OVERLAP_WEIGHT: f64 = 0.2;

/// Raw surprise ingredients for one item.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SurpriseSignals {
    pub rarity: f64,
    pub novelty: f64,
    pub retrieval_frequency: f64,
    pub validator_overlap: f64,
}

impl SurpriseSignals {
    pub fn new(rarity: f64, novelty: f64, retrieval_frequency: f64, validator_overlap: f64) -> Self {
        Self {
            rarity,
            novelty,
            retrieval_frequency,
            validator_overlap,
        }
    }

    /// Every signal set to `value`.
    pub fn uniform(value: f64) -> Self {
        Self::new(value, value, value, value)
    }

    /// Names of signals outside [0, 1] or non-finite.
    pub fn out_of_range(&self) -> Vec<&'static str> {
        [
            ("rarity", self.rarity),
            ("novelty", self.novelty),
            ("retrieval_frequency", self.retrieval_frequency),
            ("validator_overlap", self.validator_overlap),
        ]
        .into_iter()
        .filter(|(_, v)| !(v.is_finite() && (0.0..=1.0).contains(v)))
        .map(|(name, _)| name)
        .collect()
    }

    pub fn is_well_formed(&self) -> bool {
        self.out_of_range().is_empty()
    }

    /// Weighted surprise score, clamped to [0, 1].
    pub fn score(&self) -> f64 {
        let offending = self.out_of_range();
        if !offending.is_empty() {
            warn!(signals = ?offending, "Surprise signals outside [0, 1]; clamping result");
        }
        surprise_score(
            self.rarity,
            self.novelty,
            self.retrieval_frequency,
            self.validator_overlap,
        )
    }
}

/// `0.3*rarity + 0.3*novelty + 0.2*retrieval_frequency + 0.2*validator_overlap`,
/// clamped to [0, 1]. Non-finite inputs contribute zero.
pub fn surprise_score(
    rarity: f64,
    novelty: f64,
    retrieval_frequency: f64,
    validator_overlap: f64,
) -> f64 {
    let finite = |v: f64| if v.is_finite() { v } else { 0.0 };
    let raw = RARITY_WEIGHT * finite(rarity)
        + NOVELTY_WEIGHT * finite(novelty)
        + RETRIEVAL_FREQUENCY_WEIGHT * finite(retrieval_frequency)
        + VALIDATOR_OVERLAP_WEIGHT * finite(validator_overlap);
    clamp_unit(raw)
}

/// What the oracle knows about an item at scoring time.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct OracleReading {
    pub signals: SurpriseSignals,
    pub retrieval_count_7d: u32,
    pub retrieval_count_30d: u32,
}

impl OracleReading {
    pub fn new(signals: SurpriseSignals) -> Self {
        Self {
            signals,
            ..Default::default()
        }
    }

    pub fn with_retrieval_counts(mut self, count_7d: u32, count_30d: u32) -> Self {
        self.retrieval_count_7d = count_7d;
        self.retrieval_count_30d = count_30d;
        self
    }
}

/// External collaborator supplying surprise ingredients.
#[async_trait]
pub trait ScoringOracle: Send + Sync {
    /// Current reading for an item.
    async fn observe(&self, item_id: &str) -> Result<OracleReading>;
}

/// Oracle backed by a fixed table, for simulations and tests.
#[derive(Debug, Default)]
pub struct InMemoryOracle {
    readings: RwLock<HashMap<String, OracleReading>>,
}

impl InMemoryOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, item_id: impl Into<String>, reading: OracleReading) {
        if let Ok(mut readings) = self.readings.write() {
            readings.insert(item_id.into(), reading);
        }
    }

    pub fn with(self, item_id: impl Into<String>, reading: OracleReading) -> Self {
        self.set(item_id, reading);
        self
    }
}

#[async_trait]
impl ScoringOracle for InMemoryOracle {
    async fn observe(&self, item_id: &str) -> Result<OracleReading> {
        let readings = self
            .readings
            .read()
            .map_err(|e| Error::Internal(format!("oracle lock poisoned: {e}")))?;
        readings
            .get(item_id)
            .copied()
            .ok_or_else(|| Error::not_found(item_id))
    }
}
