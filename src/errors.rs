//! Typed error hierarchy for storyflow.
//!
//! Two top-level enums cover the two subsystems:
//! - `LedgerError`: persistence failures, including closed handles and outages
//! - `OrchestratorError`: programmer errors surfaced by pick/run/check
//!
//! Expected failure modes (a handler failing, an acceptance rejection) are not
//! errors; they come back as structured outcomes.

use thiserror::Error;

/// Errors from a `Ledger` backend.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Ledger handle is closed")]
    Closed,

    #[error("Story {story_id} rejected by store: {message}")]
    Conflict { story_id: String, message: String },

    #[error("Unknown step '{0}'")]
    UnknownStep(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Ledger unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),
}

impl LedgerError {
    /// True for outages that should degrade to filesystem fallback rather
    /// than abort the caller. Query and schema failures are not outages.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(
                rusqlite::ErrorCode::CannotOpen
                | rusqlite::ErrorCode::DatabaseBusy
                | rusqlite::ErrorCode::DatabaseLocked
                | rusqlite::ErrorCode::SystemIoFailure,
            ) => Self::Unavailable(e.into()),
            Some(rusqlite::ErrorCode::ConstraintViolation) => Self::Conflict {
                story_id: String::new(),
                message: e.to_string(),
            },
            _ => Self::Database(e.into()),
        }
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Unavailable(e.into()),
            other => Self::Database(other.into()),
        }
    }
}

/// Errors from the orchestrator that indicate caller mistakes or closed
/// resources.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unknown step '{0}'")]
    UnknownStep(String),

    #[error("No handler bound to step '{step}'")]
    NoHandler { step: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
