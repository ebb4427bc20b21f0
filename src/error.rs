//! Error types for continuum-memory.

use thiserror::Error;

use crate::memory::Tier;

/// Result type alias using continuum-memory's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Direction of a tier transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionDirection {
    Promote,
    Demote,
}

impl std::fmt::Display for TransitionDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Promote => write!(f, "promote"),
            Self::Demote => write!(f, "demote"),
        }
    }
}

fn boundary_word(direction: &TransitionDirection) -> &'static str {
    match direction {
        TransitionDirection::Promote => "higher",
        TransitionDirection::Demote => "lower",
    }
}

/// Errors that can occur during lifecycle operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Item has no TierMetric row
    #[error("Item not found: {item_id}")]
    NotFound { item_id: String },

    /// Promote from L3 or demote from L0
    #[error("Invalid transition: cannot {direction} {item_id} from {tier} (no {} tier)", boundary_word(.direction))]
    InvalidTransition {
        item_id: String,
        tier: Tier,
        direction: TransitionDirection,
    },

    /// Optimistic concurrency retry exhausted
    #[error("Concurrent update conflict on {item_id} after {attempts} attempts")]
    ConcurrentUpdateConflict { item_id: String, attempts: u32 },

    /// Persistence layer unreachable (busy, locked, cannot open, I/O)
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Any other persistence failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Retrieval backend rejected the tier filter
    #[error("Metadata filter unsupported: {0}")]
    FilterUnsupported(String),

    /// Retrieval backend failure
    #[error("Retrieval backend error: {0}")]
    Backend(String),

    /// Caller supplied a value outside its documented range
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a not-found error.
    pub fn not_found(item_id: impl Into<String>) -> Self {
        Self::NotFound {
            item_id: item_id.into(),
        }
    }

    /// Create an invalid-transition error.
    pub fn invalid_transition(
        item_id: impl Into<String>,
        tier: Tier,
        direction: TransitionDirection,
    ) -> Self {
        Self::InvalidTransition {
            item_id: item_id.into(),
            tier,
            direction,
        }
    }

    /// Create a concurrency conflict error.
    pub fn conflict(item_id: impl Into<String>, attempts: u32) -> Self {
        Self::ConcurrentUpdateConflict {
            item_id: item_id.into(),
            attempts,
        }
    }

    /// Whether this error came from the persistence layer.
    ///
    /// Observability reads degrade to empty results on these.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::Storage(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if matches!(
                    e.code,
                    ErrorCode::DatabaseBusy
                        | ErrorCode::DatabaseLocked
                        | ErrorCode::CannotOpen
                        | ErrorCode::NotADatabase
                        | ErrorCode::SystemIoFailure
                        | ErrorCode::DiskFull
                        | ErrorCode::ReadOnly
                ) =>
            {
                Self::StoreUnavailable(err.to_string())
            }
            _ => Self::Storage(err.to_string()),
        }
    }
}
