//! Core data types for tiered knowledge lifecycle management.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Operator identity recorded for automatic decisions.
pub const SYSTEM_ACTOR: &str = "system";

/// Plasticity tier of a knowledge item.
///
/// L0 is the most volatile (reprocessed every cycle), L3 the most stable.
/// Ordering follows the tier index: `L0 < L1 < L2 < L3`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum Tier {
    #[default]
    L0,
    L1,
    L2,
    L3,
}

impl Tier {
    /// All tiers, lowest first.
    pub const ALL: [Tier; 4] = [Tier::L0, Tier::L1, Tier::L2, Tier::L3];

    /// The next tier up, if any.
    pub fn next(&self) -> Option<Tier> {
        match self {
            Tier::L0 => Some(Tier::L1),
            Tier::L1 => Some(Tier::L2),
            Tier::L2 => Some(Tier::L3),
            Tier::L3 => None,
        }
    }

    /// The next tier down, if any.
    pub fn previous(&self) -> Option<Tier> {
        match self {
            Tier::L0 => None,
            Tier::L1 => Some(Tier::L0),
            Tier::L2 => Some(Tier::L1),
            Tier::L3 => Some(Tier::L2),
        }
    }

    /// Zero-based tier index.
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Text label as stored in the database and in document metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::L0 => "L0",
            Tier::L1 => "L1",
            Tier::L2 => "L2",
            Tier::L3 => "L3",
        }
    }

    /// Parse a text label. Accepts `L0`..`L3` case-insensitively.
    pub fn parse(s: &str) -> Option<Tier> {
        match s.trim().to_ascii_uppercase().as_str() {
            "L0" => Some(Tier::L0),
            "L1" => Some(Tier::L1),
            "L2" => Some(Tier::L2),
            "L3" => Some(Tier::L3),
            _ => None,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of one knowledge item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierMetric {
    pub item_id: String,
    pub tier: Tier,
    /// Clamped to [0, 1]
    pub surprise_score: f64,
    pub retrieval_count_7d: u32,
    pub retrieval_count_30d: u32,
    /// Clamped to [0, 1]
    pub validator_overlap: f64,
    pub last_promoted_at: Option<DateTime<Utc>>,
    pub last_demoted_at: Option<DateTime<Utc>>,
    /// Global cycle at which the item was last reprocessed
    pub last_update_cycle: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TierMetric {
    /// A freshly managed item: L0, cycle 0, zeroed signals.
    pub fn new(item_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            item_id: item_id.into(),
            tier: Tier::L0,
            surprise_score: 0.0,
            retrieval_count_7d: 0,
            retrieval_count_30d: 0,
            validator_overlap: 0.0,
            last_promoted_at: None,
            last_demoted_at: None,
            last_update_cycle: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_surprise(mut self, score: f64) -> Self {
        self.surprise_score = clamp_unit(score);
        self
    }

    pub fn with_retrieval_counts(mut self, count_7d: u32, count_30d: u32) -> Self {
        self.retrieval_count_7d = count_7d;
        self.retrieval_count_30d = count_30d;
        self
    }

    pub fn with_validator_overlap(mut self, overlap: f64) -> Self {
        self.validator_overlap = clamp_unit(overlap);
        self
    }
}

/// Classification of an audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// One tier up
    Promote,
    /// One tier down
    Demote,
    /// Eligible transition abandoned (conflict retry exhausted)
    Skip,
    /// Item entered management directly at an operator-chosen tier
    Place,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Promote => "promote",
            Self::Demote => "demote",
            Self::Skip => "skip",
            Self::Place => "place",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "promote" => Some(Self::Promote),
            "demote" => Some(Self::Demote),
            "skip" => Some(Self::Skip),
            "place" => Some(Self::Place),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An audit record that has not been written yet.
///
/// The store assigns `id` and `created_at` on insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAuditRecord {
    pub item_id: String,
    pub action: AuditAction,
    pub from_tier: Option<Tier>,
    pub to_tier: Tier,
    pub reason: String,
    pub surprise_score: f64,
    pub retrieval_count_7d: u32,
    pub validator_overlap: f64,
    pub performed_by: String,
}

impl NewAuditRecord {
    /// Build a record from the pre-transition metric snapshot.
    pub fn from_metric(
        metric: &TierMetric,
        action: AuditAction,
        to_tier: Tier,
        reason: impl Into<String>,
        performed_by: impl Into<String>,
    ) -> Self {
        Self {
            item_id: metric.item_id.clone(),
            action,
            from_tier: Some(metric.tier),
            to_tier,
            reason: reason.into(),
            surprise_score: metric.surprise_score,
            retrieval_count_7d: metric.retrieval_count_7d,
            validator_overlap: metric.validator_overlap,
            performed_by: performed_by.into(),
        }
    }
}

/// Immutable audit trail entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: i64,
    pub item_id: String,
    pub action: AuditAction,
    /// `None` only for `Place` records
    pub from_tier: Option<Tier>,
    pub to_tier: Tier,
    pub reason: String,
    pub surprise_score: f64,
    pub retrieval_count_7d: u32,
    pub validator_overlap: f64,
    pub performed_by: String,
    pub created_at: DateTime<Utc>,
}

/// Filter for paginated audit queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditQuery {
    pub item_id: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for AuditQuery {
    fn default() -> Self {
        Self {
            item_id: None,
            limit: 50,
            offset: 0,
        }
    }
}

impl AuditQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn item(mut self, item_id: impl Into<String>) -> Self {
        self.item_id = Some(item_id.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// One regression evaluation of a fixed probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForgettingMetric {
    /// Assigned by the store; `0` before insertion
    pub id: i64,
    pub regression_item_id: String,
    pub regression_query: String,
    pub recall_at_k_before: f64,
    pub recall_at_k_after: f64,
    /// `recall_at_k_before - recall_at_k_after`; negative means recall improved
    pub forgetting_delta: f64,
    pub faithfulness_score: Option<f64>,
    pub overlap_score: Option<f64>,
    pub evaluation_timestamp: DateTime<Utc>,
    pub knowledge_update_timestamp: Option<DateTime<Utc>>,
}

impl ForgettingMetric {
    /// Create a measurement evaluated now. The delta is derived, never supplied.
    pub fn new(
        regression_item_id: impl Into<String>,
        regression_query: impl Into<String>,
        recall_before: f64,
        recall_after: f64,
    ) -> Self {
        Self {
            id: 0,
            regression_item_id: regression_item_id.into(),
            regression_query: regression_query.into(),
            recall_at_k_before: recall_before,
            recall_at_k_after: recall_after,
            forgetting_delta: recall_before - recall_after,
            faithfulness_score: None,
            overlap_score: None,
            evaluation_timestamp: Utc::now(),
            knowledge_update_timestamp: None,
        }
    }

    pub fn with_faithfulness(mut self, score: Option<f64>) -> Self {
        self.faithfulness_score = score;
        self
    }

    pub fn with_overlap(mut self, score: Option<f64>) -> Self {
        self.overlap_score = score;
        self
    }

    pub fn with_update_timestamp(mut self, ts: Option<DateTime<Utc>>) -> Self {
        self.knowledge_update_timestamp = ts;
        self
    }

    pub fn evaluated_at(mut self, ts: DateTime<Utc>) -> Self {
        self.evaluation_timestamp = ts;
        self
    }
}

/// Daily aggregate of forgetting measurements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub date: NaiveDate,
    pub avg_delta: f64,
    pub avg_recall_before: f64,
    pub avg_recall_after: f64,
    pub count: u64,
}

/// Values written when an item is reprocessed in a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct MetricRefresh {
    pub surprise_score: Option<f64>,
    pub retrieval_count_7d: Option<u32>,
    pub retrieval_count_30d: Option<u32>,
    pub validator_overlap: Option<f64>,
}

/// Outcome of a conditional tier write.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionWrite {
    /// Row updated and audit appended
    Applied { metric: TierMetric, audit: AuditRecord },
    /// Stored tier no longer matched the expected tier; nothing written
    Conflict { current: Tier },
}

/// Clamp to [0, 1]; non-finite values become 0.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Fixed-width UTC timestamp so text comparison orders chronologically.
pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}
