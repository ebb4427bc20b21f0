//! Lifecycle engine facade.
//!
//! [`build_engine`] returns either the store-backed [`ActiveEngine`] or the
//! no-op [`DisabledEngine`], depending on `LifecycleConfig::enabled`.
//! Callers hold an `Arc<dyn LifecycleEngine>` and never branch on the flag.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::config::{LifecycleConfig, RetrievalConfig};
use crate::error::{Error, Result};
use crate::lifecycle::{
    route_tier, CycleReport, Decision, ForgettingTracker, LearningCycle, ProbeExtras,
    PromotionManager, ScoringOracle, UpdateScheduler,
};
use crate::memory::{
    AuditQuery, AuditRecord, MetricRefresh, Tier, TierMetric, TierStore, TrendPoint,
};
use crate::retrieval::{TierIsolatedRetriever, VectorBackend};

/// Window for the transition counters in [`TierStats`].
pub const STATS_WINDOW_DAYS: i64 = 7;

/// Snapshot of tier occupancy and recent movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierStats {
    pub enabled: bool,
    /// Every tier is present, zero when empty
    pub counts: BTreeMap<Tier, u64>,
    pub total: u64,
    pub promotions_7d: u64,
    pub demotions_7d: u64,
}

impl TierStats {
    fn empty(enabled: bool) -> Self {
        Self {
            enabled,
            counts: Tier::ALL.into_iter().map(|t| (t, 0)).collect(),
            total: 0,
            promotions_7d: 0,
            demotions_7d: 0,
        }
    }

    /// Serialize the snapshot to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(Error::Serialization)
    }
}

/// Operations exposed to the host memory system.
#[async_trait]
pub trait LifecycleEngine: Send + Sync {
    fn is_enabled(&self) -> bool;

    /// Whether items in `tier` are due for reprocessing in `cycle`.
    fn should_update(&self, tier: Tier, cycle: i64) -> bool;

    /// Tier suggested by a surprise score.
    fn route_tier(&self, score: f64) -> Tier;

    /// Bring an item under management at L0. Existing items are returned as is.
    fn register(&self, item_id: &str) -> Result<Option<TierMetric>>;

    fn metric(&self, item_id: &str) -> Result<Option<TierMetric>>;

    /// Seed a new item directly at `tier`, audited as a placement.
    fn place(
        &self,
        item_id: &str,
        tier: Tier,
        performed_by: &str,
        reason: Option<&str>,
    ) -> Result<Option<AuditRecord>>;

    /// Stop managing an item. Its audit history is kept.
    fn purge(&self, item_id: &str) -> Result<bool>;

    fn promote(&self, item_id: &str, performed_by: &str, reason: Option<&str>) -> Result<Decision>;

    fn demote(&self, item_id: &str, performed_by: &str, reason: Option<&str>) -> Result<Decision>;

    /// Apply the automatic promotion rule to one item.
    fn evaluate(&self, item_id: &str) -> Result<Decision>;

    /// Record a reprocessing pass. `false` if a later cycle was already recorded.
    fn record_update(&self, item_id: &str, cycle: i64, refresh: &MetricRefresh) -> Result<bool>;

    fn record_forgetting(
        &self,
        regression_item_id: &str,
        query: &str,
        recall_before: f64,
        recall_after: f64,
        extras: ProbeExtras,
    ) -> Result<Option<i64>>;

    fn tier_stats(&self) -> TierStats;

    /// Newest first.
    fn audit_log(&self, query: &AuditQuery) -> Vec<AuditRecord>;

    fn forgetting_trends(&self, days: u32) -> Vec<TrendPoint>;

    /// Retriever scoped according to this engine's configuration.
    fn retriever(&self, backend: Arc<dyn VectorBackend>) -> TierIsolatedRetriever;

    async fn run_cycle(
        &self,
        cycle: i64,
        item_ids: &[String],
        oracle: &dyn ScoringOracle,
    ) -> Result<CycleReport>;
}

/// Build the engine selected by `config.enabled`.
///
/// An enabled configuration is validated first.
pub fn build_engine(
    config: LifecycleConfig,
    store: Arc<dyn TierStore>,
) -> Result<Arc<dyn LifecycleEngine>> {
    if !config.enabled {
        info!("Continuum lifecycle disabled");
        return Ok(Arc::new(DisabledEngine::new(config.retrieval)));
    }
    Ok(Arc::new(ActiveEngine::new(config, store)?))
}

/// Store-backed engine.
pub struct ActiveEngine {
    config: LifecycleConfig,
    store: Arc<dyn TierStore>,
    scheduler: Arc<UpdateScheduler>,
    promotions: Arc<PromotionManager>,
    forgetting: ForgettingTracker,
    cycle: LearningCycle,
}

impl ActiveEngine {
    pub fn new(config: LifecycleConfig, store: Arc<dyn TierStore>) -> Result<Self> {
        config.validate()?;

        let scheduler = Arc::new(UpdateScheduler::new(config.update_frequency, store.clone()));
        let promotions = Arc::new(PromotionManager::new(
            store.clone(),
            config.promote_threshold,
            config.demote_threshold,
        ));
        let cycle = LearningCycle::new(
            store.clone(),
            scheduler.clone(),
            promotions.clone(),
            config.max_batch_size,
        );

        Ok(Self {
            forgetting: ForgettingTracker::new(store.clone()),
            config,
            store,
            scheduler,
            promotions,
            cycle,
        })
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }
}

#[async_trait]
impl LifecycleEngine for ActiveEngine {
    fn is_enabled(&self) -> bool {
        true
    }

    fn should_update(&self, tier: Tier, cycle: i64) -> bool {
        self.scheduler.should_update(tier, cycle)
    }

    fn route_tier(&self, score: f64) -> Tier {
        route_tier(score)
    }

    #[instrument(skip(self))]
    fn register(&self, item_id: &str) -> Result<Option<TierMetric>> {
        let (metric, created) = self.store.create_if_absent(item_id)?;
        if created {
            info!(item_id, "Registered item at L0");
        }
        Ok(Some(metric))
    }

    fn metric(&self, item_id: &str) -> Result<Option<TierMetric>> {
        match self.store.get(item_id) {
            Ok(metric) => Ok(Some(metric)),
            Err(Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn place(
        &self,
        item_id: &str,
        tier: Tier,
        performed_by: &str,
        reason: Option<&str>,
    ) -> Result<Option<AuditRecord>> {
        self.promotions
            .place(item_id, tier, performed_by, reason)
            .map(Some)
    }

    #[instrument(skip(self))]
    fn purge(&self, item_id: &str) -> Result<bool> {
        let removed = self.store.purge(item_id)?;
        if removed {
            info!(item_id, "Purged item from lifecycle management");
        }
        Ok(removed)
    }

    fn promote(&self, item_id: &str, performed_by: &str, reason: Option<&str>) -> Result<Decision> {
        self.promotions.promote(item_id, performed_by, reason)
    }

    fn demote(&self, item_id: &str, performed_by: &str, reason: Option<&str>) -> Result<Decision> {
        self.promotions.demote(item_id, performed_by, reason)
    }

    fn evaluate(&self, item_id: &str) -> Result<Decision> {
        self.promotions.evaluate(item_id)
    }

    fn record_update(&self, item_id: &str, cycle: i64, refresh: &MetricRefresh) -> Result<bool> {
        let tier = self.store.get(item_id)?.tier;
        self.scheduler.record_refresh(item_id, tier, cycle, refresh)
    }

    fn record_forgetting(
        &self,
        regression_item_id: &str,
        query: &str,
        recall_before: f64,
        recall_after: f64,
        extras: ProbeExtras,
    ) -> Result<Option<i64>> {
        self.forgetting
            .record(regression_item_id, query, recall_before, recall_after, extras)
            .map(Some)
    }

    #[instrument(skip(self))]
    fn tier_stats(&self) -> TierStats {
        let mut stats = TierStats::empty(true);

        match self.store.counts_by_tier() {
            Ok(counts) => {
                for (tier, n) in counts {
                    stats.counts.insert(tier, n);
                }
                stats.total = stats.counts.values().sum();
            }
            Err(e) => {
                warn!(error = %e, "Tier counts unavailable");
                return stats;
            }
        }

        let since = Utc::now() - Duration::days(STATS_WINDOW_DAYS);
        match self.store.transition_counts_since(since) {
            Ok((promotions, demotions)) => {
                stats.promotions_7d = promotions;
                stats.demotions_7d = demotions;
            }
            Err(e) => warn!(error = %e, "Transition counts unavailable"),
        }
        stats
    }

    fn audit_log(&self, query: &AuditQuery) -> Vec<AuditRecord> {
        self.store.audit_log(query).unwrap_or_else(|e| {
            warn!(error = %e, "Audit log unavailable");
            Vec::new()
        })
    }

    fn forgetting_trends(&self, days: u32) -> Vec<TrendPoint> {
        self.forgetting.trends(days).unwrap_or_else(|e| {
            warn!(error = %e, days, "Forgetting trends unavailable");
            Vec::new()
        })
    }

    fn retriever(&self, backend: Arc<dyn VectorBackend>) -> TierIsolatedRetriever {
        TierIsolatedRetriever::from_config(backend, &self.config)
    }

    async fn run_cycle(
        &self,
        cycle: i64,
        item_ids: &[String],
        oracle: &dyn ScoringOracle,
    ) -> Result<CycleReport> {
        self.cycle.run(cycle, item_ids, oracle).await
    }
}

/// No-op engine used when the lifecycle is switched off.
///
/// Everything is a successful no-op: every tier is always due, scores route
/// to L0, reads are empty and retrieval is unscoped.
#[derive(Debug, Clone, Default)]
pub struct DisabledEngine {
    retrieval: RetrievalConfig,
}

impl DisabledEngine {
    pub fn new(retrieval: RetrievalConfig) -> Self {
        Self { retrieval }
    }
}

#[async_trait]
impl LifecycleEngine for DisabledEngine {
    fn is_enabled(&self) -> bool {
        false
    }

    fn should_update(&self, _tier: Tier, _cycle: i64) -> bool {
        true
    }

    fn route_tier(&self, _score: f64) -> Tier {
        Tier::L0
    }

    fn register(&self, _item_id: &str) -> Result<Option<TierMetric>> {
        Ok(None)
    }

    fn metric(&self, _item_id: &str) -> Result<Option<TierMetric>> {
        Ok(None)
    }

    fn place(
        &self,
        _item_id: &str,
        _tier: Tier,
        _performed_by: &str,
        _reason: Option<&str>,
    ) -> Result<Option<AuditRecord>> {
        Ok(None)
    }

    fn purge(&self, _item_id: &str) -> Result<bool> {
        Ok(false)
    }

    fn promote(&self, _item_id: &str, _performed_by: &str, _reason: Option<&str>) -> Result<Decision> {
        Ok(Decision::Disabled)
    }

    fn demote(&self, _item_id: &str, _performed_by: &str, _reason: Option<&str>) -> Result<Decision> {
        Ok(Decision::Disabled)
    }

    fn evaluate(&self, _item_id: &str) -> Result<Decision> {
        Ok(Decision::Disabled)
    }

    fn record_update(&self, _item_id: &str, _cycle: i64, _refresh: &MetricRefresh) -> Result<bool> {
        Ok(false)
    }

    fn record_forgetting(
        &self,
        _regression_item_id: &str,
        _query: &str,
        _recall_before: f64,
        _recall_after: f64,
        _extras: ProbeExtras,
    ) -> Result<Option<i64>> {
        Ok(None)
    }

    fn tier_stats(&self) -> TierStats {
        TierStats::empty(false)
    }

    fn audit_log(&self, _query: &AuditQuery) -> Vec<AuditRecord> {
        Vec::new()
    }

    fn forgetting_trends(&self, _days: u32) -> Vec<TrendPoint> {
        Vec::new()
    }

    fn retriever(&self, backend: Arc<dyn VectorBackend>) -> TierIsolatedRetriever {
        let config = LifecycleConfig {
            retrieval: self.retrieval.clone(),
            ..LifecycleConfig::disabled()
        };
        TierIsolatedRetriever::from_config(backend, &config)
    }

    async fn run_cycle(
        &self,
        cycle: i64,
        _item_ids: &[String],
        _oracle: &dyn ScoringOracle,
    ) -> Result<CycleReport> {
        Ok(CycleReport {
            cycle,
            ..Default::default()
        })
    }
}
