//! Surprise score to tier routing.

use crate::memory::Tier;

/// Lower bound (inclusive) of L1.
pub const L1_FLOOR: f64 = 0.4;
/// Lower bound (inclusive) of L2.
pub const L2_FLOOR: f64 = 0.6;
/// Lower bound (inclusive) of L3.
pub const L3_FLOOR: f64 = 0.8;

/// Map a surprise score to its tier.
///
/// Boundaries are half-open with exclusive upper ends, so a score exactly on
/// a boundary belongs to the higher tier. Scores are clamped to [0, 1]
/// first; NaN routes to L0.
pub fn route_tier(score: f64) -> Tier {
    let score = if score.is_nan() { 0.0 } else { score.clamp(0.0, 1.0) };

    if score >= L3_FLOOR {
        Tier::L3
    } else if score >= L2_FLOOR {
        Tier::L2
    } else if score >= L1_FLOOR {
        Tier::L1
    } else {
        Tier::L0
    }
}
