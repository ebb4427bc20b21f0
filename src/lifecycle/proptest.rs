//! Property-based tests for lifecycle invariants using proptest.
//!
//! - Routing is monotonic in the surprise score and clamps its input
//! - The surprise score always lands in [0, 1]
//! - The update gate is exactly `cycle mod frequency == 0`
//! - Forgetting deltas are exactly `before - after`
//! - Automatic transitions move at most one tier

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use proptest::prelude::*;

    use crate::config::{PerTier, DEFAULT_UPDATE_FREQUENCY};
    use crate::lifecycle::promotion::{Decision, PromotionManager};
    use crate::lifecycle::router::route_tier;
    use crate::lifecycle::scheduler::UpdateScheduler;
    use crate::lifecycle::scorer::surprise_score;
    use crate::memory::{ForgettingMetric, SqliteTierStore, Tier, TierMetric, TierStore};

    fn tier() -> impl Strategy<Value = Tier> {
        prop_oneof![Just(Tier::L0), Just(Tier::L1), Just(Tier::L2), Just(Tier::L3)]
    }

    // Signals including out-of-range and non-finite values
    fn wild_signal() -> impl Strategy<Value = f64> {
        prop_oneof![
            Just(f64::NAN),
            Just(f64::INFINITY),
            Just(-1.0),
            Just(2.5),
            0.0f64..=1.0f64,
            -100.0f64..100.0f64,
        ]
    }

    fn scheduler() -> UpdateScheduler {
        let store: Arc<dyn TierStore> = Arc::new(SqliteTierStore::in_memory().unwrap());
        UpdateScheduler::new(PerTier(DEFAULT_UPDATE_FREQUENCY), store)
    }

    // =========================================================================
    // Routing
    // =========================================================================

    proptest! {
        /// A higher score never routes to a lower tier.
        #[test]
        fn routing_is_monotonic(a in -1.0f64..2.0, b in -1.0f64..2.0) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(route_tier(lo) <= route_tier(hi));
        }

        /// Out-of-range scores route like their clamped value.
        #[test]
        fn routing_clamps(score in -50.0f64..50.0) {
            prop_assert_eq!(route_tier(score), route_tier(score.clamp(0.0, 1.0)));
        }

        /// The weighted score stays in [0, 1] whatever the oracle returns.
        #[test]
        fn surprise_score_is_bounded(
            r in wild_signal(),
            n in wild_signal(),
            f in wild_signal(),
            v in wild_signal()
        ) {
            let score = surprise_score(r, n, f, v);
            prop_assert!(score.is_finite());
            prop_assert!((0.0..=1.0).contains(&score), "score {} out of range", score);
        }
    }

    // =========================================================================
    // Update gate
    // =========================================================================

    proptest! {
        /// L0 is reprocessed on every cycle.
        #[test]
        fn l0_always_updates(cycle in any::<i64>()) {
            prop_assert!(scheduler().should_update(Tier::L0, cycle));
        }

        /// The gate matches the modulo rule for every tier.
        #[test]
        fn gate_matches_modulo(t in tier(), cycle in 0i64..5_000_000) {
            let s = scheduler();
            let frequency = i64::try_from(s.frequency(t)).unwrap();
            prop_assert_eq!(s.should_update(t, cycle), cycle % frequency == 0);
        }
    }

    // =========================================================================
    // Forgetting
    // =========================================================================

    proptest! {
        #[test]
        fn forgetting_delta_is_exact(before in 0.0f64..=1.0, after in 0.0f64..=1.0) {
            let metric = ForgettingMetric::new("probe", "query", before, after);
            prop_assert_eq!(metric.forgetting_delta, before - after);
        }
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Evaluation moves an item at most one tier, in the direction its
        /// score points, and audits exactly the moves it makes.
        #[test]
        fn evaluation_moves_at_most_one_tier(start in tier(), score in 0.0f64..=1.0) {
            let store = SqliteTierStore::in_memory().unwrap();
            store.upsert(&TierMetric::new("x").with_tier(start).with_surprise(score)).unwrap();
            let manager = PromotionManager::new(Arc::new(store.clone()), 0.65, 0.15);

            let decision = manager.evaluate("x").unwrap();
            let end = store.get("x").unwrap().tier;
            let distance = (end.index() as i64 - start.index() as i64).abs();
            prop_assert!(distance <= 1);

            match decision {
                Decision::Promoted(_) => prop_assert!(score >= 0.65 && end > start),
                Decision::Demoted(_) => prop_assert!(score <= 0.15 && end < start),
                Decision::Held { .. } => prop_assert_eq!(end, start),
                other => prop_assert!(false, "unexpected decision {:?}", other),
            }

            let audits = store.audit_log(&crate::memory::AuditQuery::new().item("x")).unwrap();
            prop_assert_eq!(audits.len(), distance as usize);
        }
    }
}
