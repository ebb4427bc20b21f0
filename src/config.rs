//! Engine configuration.
//!
//! All values have defaults and can be overridden from `CONTINUUM_*`
//! environment variables via [`LifecycleConfig::from_env`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::memory::Tier;

/// Default score at or above which an item is eligible for promotion.
pub const DEFAULT_PROMOTE_THRESHOLD: f64 = 0.65;
/// Default score at or below which an item is eligible for demotion.
pub const DEFAULT_DEMOTE_THRESHOLD: f64 = 0.15;
/// Default retention in days, indexed by tier.
pub const DEFAULT_RETENTION_DAYS: [u32; 4] = [2, 21, 180, 9999];
/// Default update frequency in cycles, indexed by tier.
pub const DEFAULT_UPDATE_FREQUENCY: [u64; 4] = [1, 10, 100, 1000];
/// Default over-fetch multiplier for client-side tier filtering.
pub const DEFAULT_OVERFETCH_FACTOR: usize = 3;
/// Default retrieval deadline.
pub const DEFAULT_RETRIEVAL_TIMEOUT_MS: u64 = 2_000;
/// Default cap on items processed in one learning cycle.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 500;

/// Per-tier values, indexed by [`Tier::index`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerTier<T>(pub [T; 4]);

impl<T: Copy> PerTier<T> {
    pub fn get(&self, tier: Tier) -> T {
        self.0[tier.index()]
    }

    pub fn set(&mut self, tier: Tier, value: T) {
        self.0[tier.index()] = value;
    }
}

/// Retrieval isolation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Multiplier K for the unfiltered over-fetch (`limit * K`), at least 2
    pub overfetch_factor: usize,
    /// Widening rounds allowed when the first over-fetch comes back short
    pub max_overfetch_rounds: u32,
    /// Deadline for a whole query in milliseconds
    pub timeout_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            overfetch_factor: DEFAULT_OVERFETCH_FACTOR,
            max_overfetch_rounds: 3,
            timeout_ms: DEFAULT_RETRIEVAL_TIMEOUT_MS,
        }
    }
}

impl RetrievalConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Configuration for the lifecycle engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// When false the engine is a no-op
    pub enabled: bool,
    pub promote_threshold: f64,
    pub demote_threshold: f64,
    /// Owned here, enforced by the external retention policy
    pub retention_days: PerTier<u32>,
    pub update_frequency: PerTier<u64>,
    pub max_batch_size: usize,
    pub retrieval: RetrievalConfig,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            promote_threshold: DEFAULT_PROMOTE_THRESHOLD,
            demote_threshold: DEFAULT_DEMOTE_THRESHOLD,
            retention_days: PerTier(DEFAULT_RETENTION_DAYS),
            update_frequency: PerTier(DEFAULT_UPDATE_FREQUENCY),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            retrieval: RetrievalConfig::default(),
        }
    }
}

impl LifecycleConfig {
    /// Configuration with the engine switched off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Create configuration from environment variables.
    ///
    /// Unset or unparsable variables fall back to defaults; call
    /// [`validate`](Self::validate) on the result.
    pub fn from_env() -> Self {
        let mut config = Self {
            enabled: env_flag("CONTINUUM_ENABLED").unwrap_or(true),
            promote_threshold: env_parse("CONTINUUM_PROMOTE_THRESHOLD")
                .unwrap_or(DEFAULT_PROMOTE_THRESHOLD),
            demote_threshold: env_parse("CONTINUUM_DEMOTE_THRESHOLD")
                .unwrap_or(DEFAULT_DEMOTE_THRESHOLD),
            max_batch_size: env_parse("CONTINUUM_MAX_BATCH_SIZE").unwrap_or(DEFAULT_MAX_BATCH_SIZE),
            retrieval: RetrievalConfig {
                overfetch_factor: env_parse("CONTINUUM_OVERFETCH_FACTOR")
                    .unwrap_or(DEFAULT_OVERFETCH_FACTOR),
                max_overfetch_rounds: env_parse("CONTINUUM_OVERFETCH_ROUNDS").unwrap_or(3),
                timeout_ms: env_parse("CONTINUUM_RETRIEVAL_TIMEOUT_MS")
                    .unwrap_or(DEFAULT_RETRIEVAL_TIMEOUT_MS),
            },
            ..Self::default()
        };

        for tier in Tier::ALL {
            if let Some(days) = env_parse(&format!("CONTINUUM_RETENTION_{}_DAYS", tier)) {
                config.retention_days.set(tier, days);
            }
            if let Some(freq) = env_parse(&format!("CONTINUUM_UPDATE_FREQ_{}", tier)) {
                config.update_frequency.set(tier, freq);
            }
        }

        config
    }

    pub fn with_thresholds(mut self, promote: f64, demote: f64) -> Self {
        self.promote_threshold = promote;
        self.demote_threshold = demote;
        self
    }

    pub fn with_update_frequency(mut self, tier: Tier, cycles: u64) -> Self {
        self.update_frequency.set(tier, cycles);
        self
    }

    pub fn with_retrieval(mut self, retrieval: RetrievalConfig) -> Self {
        self.retrieval = retrieval;
        self
    }

    /// Retention window the external eviction policy applies to `tier`.
    pub fn retention(&self, tier: Tier) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days.get(tier)))
    }

    /// Reject configurations the engine cannot honour.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("promote_threshold", self.promote_threshold),
            ("demote_threshold", self.demote_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!("{name} must be in [0, 1], got {value}")));
            }
        }

        if self.demote_threshold >= self.promote_threshold {
            return Err(Error::Config(format!(
                "demote_threshold ({}) must be below promote_threshold ({})",
                self.demote_threshold, self.promote_threshold
            )));
        }

        for tier in Tier::ALL {
            if self.update_frequency.get(tier) == 0 {
                return Err(Error::Config(format!(
                    "update frequency for {tier} must be at least 1 cycle"
                )));
            }
        }

        if self.retrieval.overfetch_factor < 2 {
            return Err(Error::Config(format!(
                "overfetch_factor must be at least 2, got {}",
                self.retrieval.overfetch_factor
            )));
        }

        if self.max_batch_size == 0 {
            return Err(Error::Config("max_batch_size must be positive".to_string()));
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|s| s != "0" && s.to_lowercase() != "false")
}
