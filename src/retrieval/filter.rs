//! Metadata filters pushed down to vector backends.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::memory::Tier;

/// Metadata key carrying a document's tier label.
pub const TIER_METADATA_KEY: &str = "tier";

/// Equality or membership test on one string-valued metadata key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MetadataFilter {
    Eq { key: String, value: String },
    In { key: String, values: Vec<String> },
}

impl MetadataFilter {
    /// `tier == X` for one tier, `tier IN (...)` for several.
    pub fn tiers(tiers: &[Tier]) -> Self {
        match tiers {
            [single] => Self::Eq {
                key: TIER_METADATA_KEY.to_string(),
                value: single.as_str().to_string(),
            },
            many => Self::In {
                key: TIER_METADATA_KEY.to_string(),
                values: many.iter().map(|t| t.as_str().to_string()).collect(),
            },
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Eq { key, .. } | Self::In { key, .. } => key,
        }
    }

    /// Whether a metadata value satisfies the filter. Non-string values never match.
    pub fn matches(&self, value: Option<&Value>) -> bool {
        let Some(value) = value.and_then(Value::as_str) else {
            return false;
        };
        match self {
            Self::Eq { value: expected, .. } => value == expected,
            Self::In { values, .. } => values.iter().any(|v| v == value),
        }
    }
}
