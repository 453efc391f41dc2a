//! Error taxonomy for the scoring core.
//!
//! Two categories are fatal and reach the caller: calculation errors
//! (`InvalidInput`, `IncompleteInput`) and persistence errors. Cache eviction
//! and progress reporting failures are logged where they happen and never
//! show up here.

use thiserror::Error;

use crate::model::Perspective;

/// Result alias used across the scoring core.
pub type Result<T> = std::result::Result<T, ScoreError>;

/// Errors surfaced by [`crate::calculator::ScoreCalculator`] and
/// [`crate::manager::ScoreManager`].
#[derive(Error, Debug)]
pub enum ScoreError {
    /// Empty or malformed score set. Never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A configured perspective is missing under the `require_all` policy.
    #[error("incomplete input: missing perspectives {}", join_perspectives(.missing))]
    IncompleteInput { missing: Vec<Perspective> },

    /// Transaction or commit failure; nothing from the run was written.
    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// The run was cancelled or hit its deadline before commit.
    #[error("{0}")]
    Cancelled(String),
}

impl ScoreError {
    /// `true` for errors the caller fixes by sending different input (4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ScoreError::InvalidInput(_) | ScoreError::IncompleteInput { .. }
        )
    }

    /// `true` when re-issuing the whole call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ScoreError::Persistence(e) => e.is_transient(),
            ScoreError::Cancelled(_) => true,
            _ => false,
        }
    }

    /// Stable short code for logs and API bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ScoreError::InvalidInput(_) => "invalid_input",
            ScoreError::IncompleteInput { .. } => "incomplete_input",
            ScoreError::Persistence(_) => "persistence_error",
            ScoreError::Cancelled(_) => "cancelled",
        }
    }
}

fn join_perspectives(missing: &[Perspective]) -> String {
    missing
        .iter()
        .map(|p| p.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Storage layer failures.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("commit failed: {0}")]
    CommitFailed(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Lock contention, pool exhaustion and I/O hiccups are worth a retry.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(sqlx::Error::PoolTimedOut)
            | StoreError::Database(sqlx::Error::Io(_))
            | StoreError::Unavailable(_) => true,
            StoreError::Database(sqlx::Error::Database(db)) => {
                // SQLITE_BUSY (5) / SQLITE_LOCKED (6)
                matches!(db.code().as_deref(), Some("5") | Some("6"))
            }
            _ => false,
        }
    }
}

/// Cache eviction failure. Only ever logged.
#[derive(Error, Debug)]
#[error("cache error for key {key}: {reason}")]
pub struct CacheError {
    pub key: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(ScoreError::InvalidInput("empty".into()).is_client_error());
        let inc = ScoreError::IncompleteInput {
            missing: vec![Perspective::Right],
        };
        assert!(inc.is_client_error());
        assert!(!inc.is_retryable());
        assert_eq!(inc.to_string(), "incomplete input: missing perspectives right");

        let p = ScoreError::from(StoreError::Unavailable("pool closed".into()));
        assert!(!p.is_client_error());
        assert!(p.is_retryable());
        assert_eq!(p.code(), "persistence_error");

        let c = ScoreError::from(StoreError::CommitFailed("disk full".into()));
        assert!(!c.is_retryable());
    }
}
