//! Promotion and demotion between adjacent tiers.
//!
//! Each item is a four-state machine (`L0..L3`) that moves one step per
//! decision. Writes are optimistic: the transition is applied only if the
//! stored tier still equals the tier that was read. A lost race is retried
//! once against the current tier and then abandoned.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result, TransitionDirection};
use crate::memory::{
    AuditAction, AuditRecord, NewAuditRecord, Tier, TierMetric, TierStore, TransitionWrite,
    SYSTEM_ACTOR,
};

/// Attempts per transition: the first try plus one retry.
pub const MAX_TRANSITION_ATTEMPTS: u32 = 2;

/// Outcome of a promotion-manager call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Promoted(AuditRecord),
    Demoted(AuditRecord),
    /// No threshold crossed, or already at the boundary tier
    Held {
        item_id: String,
        tier: Tier,
        surprise_score: f64,
    },
    /// Eligible, but the concurrency retry was exhausted
    Skipped(AuditRecord),
    /// Engine switched off
    Disabled,
}

impl Decision {
    /// Audit record written by this decision, if any.
    pub fn audit(&self) -> Option<&AuditRecord> {
        match self {
            Self::Promoted(r) | Self::Demoted(r) | Self::Skipped(r) => Some(r),
            Self::Held { .. } | Self::Disabled => None,
        }
    }

    /// Tier the item ended up in, if the decision touched an item.
    pub fn tier(&self) -> Option<Tier> {
        match self {
            Self::Promoted(r) | Self::Demoted(r) | Self::Skipped(r) => Some(r.to_tier),
            Self::Held { tier, .. } => Some(*tier),
            Self::Disabled => None,
        }
    }

    pub fn is_transition(&self) -> bool {
        matches!(self, Self::Promoted(_) | Self::Demoted(_))
    }
}

/// Evaluates eligibility and performs audited tier transitions.
pub struct PromotionManager {
    store: Arc<dyn TierStore>,
    promote_threshold: f64,
    demote_threshold: f64,
}

impl PromotionManager {
    pub fn new(store: Arc<dyn TierStore>, promote_threshold: f64, demote_threshold: f64) -> Self {
        Self {
            store,
            promote_threshold,
            demote_threshold,
        }
    }

    pub fn promote_threshold(&self) -> f64 {
        self.promote_threshold
    }

    pub fn demote_threshold(&self) -> f64 {
        self.demote_threshold
    }

    /// Direction an automatic evaluation would move `metric`, if any.
    pub fn eligibility(&self, metric: &TierMetric) -> Option<TransitionDirection> {
        if metric.surprise_score >= self.promote_threshold && metric.tier.next().is_some() {
            Some(TransitionDirection::Promote)
        } else if metric.surprise_score <= self.demote_threshold && metric.tier.previous().is_some()
        {
            Some(TransitionDirection::Demote)
        } else {
            None
        }
    }

    /// Operator-triggered promotion by one tier. Thresholds are not checked.
    #[instrument(skip(self, reason))]
    pub fn promote(&self, item_id: &str, performed_by: &str, reason: Option<&str>) -> Result<Decision> {
        let reason = reason.unwrap_or("manual promotion");
        self.manual(item_id, TransitionDirection::Promote, performed_by, reason)
    }

    /// Operator-triggered demotion by one tier. Thresholds are not checked.
    #[instrument(skip(self, reason))]
    pub fn demote(&self, item_id: &str, performed_by: &str, reason: Option<&str>) -> Result<Decision> {
        let reason = reason.unwrap_or("manual demotion");
        self.manual(item_id, TransitionDirection::Demote, performed_by, reason)
    }

    fn manual(
        &self,
        item_id: &str,
        direction: TransitionDirection,
        performed_by: &str,
        reason: &str,
    ) -> Result<Decision> {
        for attempt in 1..=MAX_TRANSITION_ATTEMPTS {
            let metric = self.store.get(item_id)?;
            let target = step(&metric, direction)?;

            if let Some(decision) = self.try_transition(&metric, direction, target, reason, performed_by)? {
                return Ok(decision);
            }
            debug!(item_id, attempt, "Tier changed underneath manual {direction}; retrying");
        }

        warn!(item_id, %direction, "Abandoning manual transition after concurrent updates");
        Err(Error::conflict(item_id, MAX_TRANSITION_ATTEMPTS))
    }

    /// Automatic, threshold-driven evaluation of one item.
    ///
    /// Holds are not audited. A transition lost to concurrent writers twice
    /// is recorded as a `skip` audit entry.
    #[instrument(skip(self))]
    pub fn evaluate(&self, item_id: &str) -> Result<Decision> {
        let mut direction = TransitionDirection::Promote;

        for attempt in 1..=MAX_TRANSITION_ATTEMPTS {
            let metric = self.store.get(item_id)?;

            let Some(eligible) = self.eligibility(&metric) else {
                return Ok(Decision::Held {
                    item_id: metric.item_id,
                    tier: metric.tier,
                    surprise_score: metric.surprise_score,
                });
            };
            direction = eligible;

            let target = step(&metric, direction)?;
            let reason = match direction {
                TransitionDirection::Promote => format!(
                    "surprise {:.3} >= promote threshold {:.2}",
                    metric.surprise_score, self.promote_threshold
                ),
                TransitionDirection::Demote => format!(
                    "surprise {:.3} <= demote threshold {:.2}",
                    metric.surprise_score, self.demote_threshold
                ),
            };

            if let Some(decision) =
                self.try_transition(&metric, direction, target, &reason, SYSTEM_ACTOR)?
            {
                return Ok(decision);
            }
            debug!(item_id, attempt, "Tier changed underneath evaluation; retrying");
        }

        // Re-read so the skip record carries the tier the item is actually in
        let current = self.store.get(item_id)?;
        warn!(item_id, %direction, tier = %current.tier, "Skipping transition after concurrent updates");
        let record = self.store.append_audit(&NewAuditRecord::from_metric(
            &current,
            AuditAction::Skip,
            current.tier,
            format!("{direction} abandoned: concurrent update conflict"),
            SYSTEM_ACTOR,
        ))?;
        Ok(Decision::Skipped(record))
    }

    /// Seed a new item directly at `tier`.
    #[instrument(skip(self, reason))]
    pub fn place(
        &self,
        item_id: &str,
        tier: Tier,
        performed_by: &str,
        reason: Option<&str>,
    ) -> Result<AuditRecord> {
        let metric = TierMetric::new(item_id).with_tier(tier);
        let audit = NewAuditRecord {
            from_tier: None,
            ..NewAuditRecord::from_metric(
                &metric,
                AuditAction::Place,
                tier,
                reason.unwrap_or("manual placement"),
                performed_by,
            )
        };

        let record = self.store.place(&metric, &audit)?;
        info!(item_id, %tier, performed_by, "Placed item");
        Ok(record)
    }

    /// One conditional write. `Ok(None)` means the tier moved underneath us.
    fn try_transition(
        &self,
        metric: &TierMetric,
        direction: TransitionDirection,
        target: Tier,
        reason: &str,
        performed_by: &str,
    ) -> Result<Option<Decision>> {
        let action = match direction {
            TransitionDirection::Promote => AuditAction::Promote,
            TransitionDirection::Demote => AuditAction::Demote,
        };
        let audit = NewAuditRecord::from_metric(metric, action, target, reason, performed_by);

        match self.store.transition(&audit)? {
            TransitionWrite::Applied { audit, .. } => {
                info!(
                    item_id = %audit.item_id,
                    from = %metric.tier,
                    to = %target,
                    performed_by,
                    "Tier {direction}d"
                );
                Ok(Some(match direction {
                    TransitionDirection::Promote => Decision::Promoted(audit),
                    TransitionDirection::Demote => Decision::Demoted(audit),
                }))
            }
            TransitionWrite::Conflict { current } => {
                debug!(item_id = %metric.item_id, expected = %metric.tier, %current, "Conditional write lost");
                Ok(None)
            }
        }
    }
}

/// Adjacent target tier, or `InvalidTransition` at the boundary.
fn step(metric: &TierMetric, direction: TransitionDirection) -> Result<Tier> {
    let target = match direction {
        TransitionDirection::Promote => metric.tier.next(),
        TransitionDirection::Demote => metric.tier.previous(),
    };
    target.ok_or_else(|| Error::invalid_transition(&metric.item_id, metric.tier, direction))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{AuditQuery, ForgettingMetric, MetricRefresh, SqliteTierStore, TrendPoint};
    use chrono::{DateTime, Utc};
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn manager() -> (PromotionManager, SqliteTierStore) {
        let store = SqliteTierStore::in_memory().unwrap();
        let manager = PromotionManager::new(Arc::new(store.clone()), 0.65, 0.15);
        (manager, store)
    }

    fn audit_count(store: &SqliteTierStore, item_id: &str) -> usize {
        store.audit_log(&AuditQuery::new().item(item_id)).unwrap().len()
    }

    #[test]
    fn test_promote_from_l3_is_invalid() {
        let (manager, store) = manager();
        store.upsert(&TierMetric::new("x").with_tier(Tier::L3)).unwrap();

        let err = manager.promote("x", "ops", None).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                tier: Tier::L3,
                direction: TransitionDirection::Promote,
                ..
            }
        ));
        assert_eq!(audit_count(&store, "x"), 0);
    }

    #[test]
    fn test_demote_from_l0_is_invalid() {
        let (manager, store) = manager();
        store.upsert(&TierMetric::new("x")).unwrap();

        assert!(matches!(
            manager.demote("x", "ops", None),
            Err(Error::InvalidTransition { tier: Tier::L0, .. })
        ));
    }

    #[test]
    fn test_promote_l1_yields_l2() {
        let (manager, store) = manager();
        store
            .upsert(&TierMetric::new("x").with_tier(Tier::L1).with_surprise(0.99))
            .unwrap();

        let decision = manager.promote("x", "ops", None).unwrap();
        assert_eq!(decision.tier(), Some(Tier::L2));
        assert_eq!(store.get("x").unwrap().tier, Tier::L2);
    }

    #[test]
    fn test_manual_transition_records_operator() {
        let (manager, store) = manager();
        store
            .upsert(&TierMetric::new("x").with_tier(Tier::L2).with_surprise(0.5))
            .unwrap();

        let Decision::Demoted(record) = manager.demote("x", "alice", Some("stale source")).unwrap()
        else {
            panic!("expected demotion");
        };
        assert_eq!(record.performed_by, "alice");
        assert_eq!(record.reason, "stale source");
        assert_eq!(record.from_tier, Some(Tier::L2));
        assert_eq!(record.to_tier, Tier::L1);
        assert_eq!(record.surprise_score, 0.5);

        let metric = store.get("x").unwrap();
        assert_eq!(metric.tier, Tier::L1);
        assert!(metric.last_demoted_at.is_some());

        let Decision::Promoted(record) = manager.promote("x", "bob", None).unwrap() else {
            panic!("expected promotion");
        };
        assert_eq!(record.reason, "manual promotion");
        assert_eq!(audit_count(&store, "x"), 2);
    }

    #[test]
    fn test_missing_item_is_not_found() {
        let (manager, _) = manager();
        assert!(matches!(
            manager.promote("ghost", "ops", None),
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(manager.evaluate("ghost"), Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_evaluate_hysteresis() {
        let (manager, store) = manager();
        store
            .upsert(&TierMetric::new("mid").with_tier(Tier::L1).with_surprise(0.4))
            .unwrap();
        store
            .upsert(&TierMetric::new("top").with_tier(Tier::L3).with_surprise(0.95))
            .unwrap();
        store
            .upsert(&TierMetric::new("low").with_tier(Tier::L2).with_surprise(0.15))
            .unwrap();

        assert!(matches!(
            manager.evaluate("mid").unwrap(),
            Decision::Held { tier: Tier::L1, .. }
        ));
        assert!(matches!(
            manager.evaluate("top").unwrap(),
            Decision::Held { tier: Tier::L3, .. }
        ));

        let decision = manager.evaluate("low").unwrap();
        let Decision::Demoted(record) = decision else {
            panic!("expected demotion, got {decision:?}");
        };
        assert_eq!(record.performed_by, SYSTEM_ACTOR);
        assert_eq!(record.to_tier, Tier::L1);

        assert_eq!(audit_count(&store, "mid"), 0);
        assert_eq!(audit_count(&store, "top"), 0);
    }

    #[test]
    fn test_two_step_promotion_never_skips_a_tier() {
        let (manager, store) = manager();
        store
            .upsert(&TierMetric::new("x").with_surprise(0.2))
            .unwrap();

        // Rescored to 0.7: the router would say L2, the manager moves one step
        store
            .record_update(
                "x",
                1,
                &MetricRefresh {
                    surprise_score: Some(0.7),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(crate::lifecycle::route_tier(0.7), Tier::L2);

        let first = manager.evaluate("x").unwrap();
        assert!(matches!(&first, Decision::Promoted(r) if r.from_tier == Some(Tier::L0) && r.to_tier == Tier::L1));
        assert_eq!(store.get("x").unwrap().tier, Tier::L1);

        let second = manager.evaluate("x").unwrap();
        assert!(matches!(&second, Decision::Promoted(r) if r.from_tier == Some(Tier::L1) && r.to_tier == Tier::L2));

        assert_eq!(store.get("x").unwrap().tier, Tier::L2);
        assert_eq!(audit_count(&store, "x"), 2);
    }

    #[test]
    fn test_place_seeds_with_creation_record() {
        let (manager, store) = manager();
        let record = manager
            .place("verified-fact", Tier::L3, "curator", None)
            .unwrap();

        assert_eq!(record.action, AuditAction::Place);
        assert_eq!(record.from_tier, None);
        assert_eq!(record.to_tier, Tier::L3);
        assert_eq!(store.get("verified-fact").unwrap().tier, Tier::L3);
        assert!(manager.place("verified-fact", Tier::L1, "curator", None).is_err());
    }

    /// Store wrapper that lets a rival worker promote the item right before
    /// the next `races` conditional writes.
    struct RacingStore {
        inner: SqliteTierStore,
        races: AtomicU32,
    }

    impl RacingStore {
        fn new(inner: SqliteTierStore, races: u32) -> Self {
            Self {
                inner,
                races: AtomicU32::new(races),
            }
        }
    }

    impl TierStore for RacingStore {
        fn get(&self, item_id: &str) -> Result<TierMetric> {
            self.inner.get(item_id)
        }
        fn upsert(&self, metric: &TierMetric) -> Result<()> {
            self.inner.upsert(metric)
        }
        fn create_if_absent(&self, item_id: &str) -> Result<(TierMetric, bool)> {
            self.inner.create_if_absent(item_id)
        }
        fn append_audit(&self, record: &NewAuditRecord) -> Result<AuditRecord> {
            self.inner.append_audit(record)
        }
        fn list_by_tier(&self, tier: Tier) -> Result<Vec<TierMetric>> {
            self.inner.list_by_tier(tier)
        }
        fn counts_by_tier(&self) -> Result<HashMap<Tier, u64>> {
            self.inner.counts_by_tier()
        }
        fn audit_log(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>> {
            self.inner.audit_log(query)
        }
        fn record_forgetting(&self, metric: &ForgettingMetric) -> Result<i64> {
            self.inner.record_forgetting(metric)
        }
        fn forgetting_trends(&self, window_days: u32) -> Result<Vec<TrendPoint>> {
            self.inner.forgetting_trends(window_days)
        }
        fn transition(&self, audit: &NewAuditRecord) -> Result<TransitionWrite> {
            let race = self
                .races
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if race {
                let current = self.inner.get(&audit.item_id)?;
                let rival = NewAuditRecord::from_metric(
                    &current,
                    AuditAction::Promote,
                    current.tier.next().unwrap_or(Tier::L3),
                    "rival worker",
                    "worker-b",
                );
                if current.tier != Tier::L3 {
                    self.inner.transition(&rival)?;
                }
            }
            self.inner.transition(audit)
        }
        fn place(&self, metric: &TierMetric, audit: &NewAuditRecord) -> Result<AuditRecord> {
            self.inner.place(metric, audit)
        }
        fn record_update(&self, item_id: &str, cycle: u64, refresh: &MetricRefresh) -> Result<bool> {
            self.inner.record_update(item_id, cycle, refresh)
        }
        fn transition_counts_since(&self, since: DateTime<Utc>) -> Result<(u64, u64)> {
            self.inner.transition_counts_since(since)
        }
        fn purge(&self, item_id: &str) -> Result<bool> {
            self.inner.purge(item_id)
        }
    }

    #[test]
    fn test_single_conflict_is_retried_against_current_tier() {
        let inner = SqliteTierStore::in_memory().unwrap();
        inner.upsert(&TierMetric::new("x").with_surprise(0.9)).unwrap();
        let manager = PromotionManager::new(Arc::new(RacingStore::new(inner.clone(), 1)), 0.65, 0.15);

        // Rival moves L0 -> L1; our retry then moves L1 -> L2
        let decision = manager.evaluate("x").unwrap();
        assert!(matches!(&decision, Decision::Promoted(r) if r.from_tier == Some(Tier::L1)));
        assert_eq!(inner.get("x").unwrap().tier, Tier::L2);
        assert_eq!(audit_count(&inner, "x"), 2);
    }

    #[test]
    fn test_exhausted_retry_manual_reports_conflict() {
        let inner = SqliteTierStore::in_memory().unwrap();
        inner.upsert(&TierMetric::new("x")).unwrap();
        let manager = PromotionManager::new(Arc::new(RacingStore::new(inner.clone(), 2)), 0.65, 0.15);

        let err = manager.promote("x", "ops", None).unwrap_err();
        assert!(matches!(
            err,
            Error::ConcurrentUpdateConflict { attempts: 2, .. }
        ));
        // Only the rival's two promotions were written
        let log = inner.audit_log(&AuditQuery::new().item("x")).unwrap();
        assert!(log.iter().all(|r| r.performed_by == "worker-b"));
        assert_eq!(inner.get("x").unwrap().tier, Tier::L2);
    }

    #[test]
    fn test_exhausted_retry_evaluate_records_skip() {
        let inner = SqliteTierStore::in_memory().unwrap();
        inner.upsert(&TierMetric::new("x").with_surprise(0.9)).unwrap();
        let manager = PromotionManager::new(Arc::new(RacingStore::new(inner.clone(), 2)), 0.65, 0.15);

        let decision = manager.evaluate("x").unwrap();
        let Decision::Skipped(record) = decision else {
            panic!("expected skip, got {decision:?}");
        };
        assert_eq!(record.action, AuditAction::Skip);
        assert_eq!(record.from_tier, Some(Tier::L2));
        assert_eq!(record.to_tier, Tier::L2);
        assert!(record.reason.contains("conflict"));
    }
}
