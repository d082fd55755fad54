//! Application-wide error types.

use thiserror::Error;

use crate::store::CircleState;

#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Event parse error: {0}")]
    EventParse(String),

    /// A log is missing a required field or carries one of the wrong shape.
    /// Nothing has been written for it when this is returned.
    #[error("Malformed {kind} event: {reason}")]
    MalformedEvent { kind: String, reason: String },

    #[error("Corrupt stored record: {0}")]
    CorruptRecord(String),
}

impl IndexerError {
    pub fn malformed(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedEvent {
            kind: kind.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, IndexerError>;

/// Non-fatal anomalies raised while projecting an event. The audit record is
/// always written; only the aggregate mutation is skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProjectionWarning {
    #[error("{event} references unknown circle {circle_id}")]
    DanglingReference {
        circle_id: String,
        event: &'static str,
    },

    #[error("{event} for circle {circle_id} which is already {state}")]
    RedundantTerminalTransition {
        circle_id: String,
        event: &'static str,
        state: CircleState,
    },

    #[error("circle {circle_id} created again; keeping the original record")]
    DuplicateCreation { circle_id: String },
}
