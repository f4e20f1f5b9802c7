//! Story ledger: durable record of stories, current step status, and the
//! append-only step history.
//!
//! Two backends share one contract:
//! - `SqliteLedger`: embedded single file (or in-memory for tests)
//! - `PostgresLedger`: client-server, tables under a configurable schema
//!
//! All timestamps are stored as UTC RFC 3339 strings with microsecond
//! precision (`2026-10-19T14:25:01.123456Z`) so string order matches time
//! order on both backends.

pub mod models;
pub mod postgres;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, LedgerBackend};
use crate::errors::LedgerError;
use crate::steps::StepRegistry;

pub use models::{
    NewHistory, StepHistory, StepState, StepStatistics, StepStatus, StepUpdate, Story,
    StoryRegistration, StorySnapshot,
};
pub use postgres::PostgresLedger;
pub use sqlite::SqliteLedger;

/// Persistence contract shared by every backend.
///
/// Handles are explicitly constructed and passed in; nothing here is global.
/// After `close()` every other call fails with `LedgerError::Closed`.
#[async_trait]
pub trait Ledger: Send + Sync {
    fn backend_name(&self) -> &'static str;

    fn registry(&self) -> &StepRegistry;

    /// Create tables and indexes if absent. Safe on every startup.
    async fn initialize(&self) -> Result<(), LedgerError>;

    /// Create the story or bump `updated_at`. Stored title/source/metadata
    /// are only filled in where they were previously null.
    async fn register_story(&self, story: &StoryRegistration) -> Result<String, LedgerError>;

    /// Upsert the `(story_id, step_name)` status row.
    async fn update_step_status(
        &self,
        story_id: &str,
        step_name: &str,
        update: &StepUpdate,
    ) -> Result<(), LedgerError>;

    /// Append one history row. Never merges with existing rows.
    async fn add_step_history(&self, entry: &NewHistory) -> Result<(), LedgerError>;

    /// Stories ready for `step_name`, oldest first: the previous step is
    /// completed (if there is one) and this step is not.
    async fn get_pending_stories(
        &self,
        step_name: &str,
        limit: usize,
    ) -> Result<Vec<String>, LedgerError>;

    /// Atomically claim one ready story for `run_id`, marking it running.
    /// Rows running under a heartbeat newer than `lease_timeout` are skipped;
    /// older ones are treated as orphans and reclaimed.
    async fn claim_candidate(
        &self,
        step_name: &str,
        run_id: &str,
        lease_timeout: Duration,
    ) -> Result<Option<String>, LedgerError>;

    /// Extend the lease on a row still running under `run_id`.
    async fn heartbeat(
        &self,
        story_id: &str,
        step_name: &str,
        run_id: &str,
    ) -> Result<bool, LedgerError>;

    async fn get_story_status(&self, story_id: &str)
    -> Result<Option<StorySnapshot>, LedgerError>;

    /// History rows oldest first, optionally for one step.
    async fn get_step_history(
        &self,
        story_id: &str,
        step_name: Option<&str>,
    ) -> Result<Vec<StepHistory>, LedgerError>;

    async fn get_step_statistics(&self) -> Result<StepStatistics, LedgerError>;

    /// Rows stuck at running with no heartbeat inside `lease_timeout`.
    async fn list_stale_running(
        &self,
        step_name: Option<&str>,
        lease_timeout: Duration,
    ) -> Result<Vec<StepStatus>, LedgerError>;

    async fn close(&self) -> Result<(), LedgerError>;
}

/// Open the configured backend and run `initialize()`.
pub async fn open_ledger(
    config: &Config,
    registry: StepRegistry,
) -> Result<Arc<dyn Ledger>, LedgerError> {
    let backend = config
        .backend()
        .map_err(|e| LedgerError::InvalidArgument(e.to_string()))?;
    let ledger: Arc<dyn Ledger> = match backend {
        LedgerBackend::SqliteFile(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| LedgerError::Unavailable(e.into()))?;
            }
            Arc::new(SqliteLedger::open(&path, registry)?)
        }
        LedgerBackend::SqliteMemory => Arc::new(SqliteLedger::open_in_memory(registry)?),
        LedgerBackend::Postgres { url, schema } => {
            Arc::new(PostgresLedger::connect(&url, &schema, registry).await?)
        }
    };
    ledger.initialize().await?;
    tracing::debug!(backend = ledger.backend_name(), "ledger opened");
    Ok(ledger)
}

pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn now_ts() -> String {
    format_ts(Utc::now())
}

/// Heartbeats older than this timestamp are stale.
pub(crate) fn lease_cutoff(lease_timeout: Duration) -> String {
    let lease = chrono::Duration::from_std(lease_timeout).unwrap_or(chrono::Duration::MAX);
    let cutoff = Utc::now()
        .checked_sub_signed(lease)
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    format_ts(cutoff)
}

/// Story ids double as artifact file stems, so they must be path-safe.
pub fn validate_story_id(story_id: &str) -> Result<(), LedgerError> {
    validate_path_segment("story_id", story_id)
}

/// Run ids name journal directories.
pub fn validate_run_id(run_id: &str) -> Result<(), LedgerError> {
    validate_path_segment("run_id", run_id)
}

fn validate_path_segment(label: &str, value: &str) -> Result<(), LedgerError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(LedgerError::InvalidArgument(format!(
            "{} must not be empty",
            label
        )));
    }
    if trimmed != value
        || value.len() > 255
        || value.starts_with('.')
        || value
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_control())
    {
        return Err(LedgerError::InvalidArgument(format!(
            "{} '{}' is not a valid file stem",
            label, value
        )));
    }
    Ok(())
}

/// Resolve a step against the registry, returning its predecessor.
pub(crate) fn resolve_step(
    registry: &StepRegistry,
    step_name: &str,
) -> Result<Option<String>, LedgerError> {
    registry
        .previous(step_name)
        .map(|p| p.map(str::to_string))
        .map_err(|_| LedgerError::UnknownStep(step_name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_story_id() {
        assert!(validate_story_id("story_20260101_000000_000001").is_ok());
        assert!(validate_story_id("A").is_ok());
        assert!(validate_story_id("").is_err());
        assert!(validate_story_id("  ").is_err());
        assert!(validate_story_id(" padded").is_err());
        assert!(validate_story_id("a/b").is_err());
        assert!(validate_story_id("..").is_err());
        assert!(validate_story_id(".hidden").is_err());
        assert!(validate_story_id("tab\there").is_err());
        assert!(validate_run_id("run-20261019-01").is_ok());
        assert!(validate_run_id("a\\b").is_err());
    }

    #[test]
    fn test_timestamps_sort_lexicographically() {
        let early = format_ts(DateTime::from_timestamp(1_000, 5_000).unwrap());
        let late = format_ts(DateTime::from_timestamp(1_000, 6_000).unwrap());
        assert!(early < late);
        assert!(early.ends_with('Z'));
        assert_eq!(early.len(), "1970-01-01T00:16:40.000005Z".len());
    }

    #[test]
    fn test_lease_cutoff_is_in_the_past() {
        let cutoff = lease_cutoff(Duration::from_secs(60));
        assert!(cutoff < now_ts());
        // Absurd leases clamp instead of panicking.
        let _ = lease_cutoff(Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_resolve_step() {
        let reg = StepRegistry::default();
        assert_eq!(resolve_step(&reg, "ingest").unwrap(), None);
        assert_eq!(
            resolve_step(&reg, "generate").unwrap().as_deref(),
            Some("preprocess")
        );
        assert!(matches!(
            resolve_step(&reg, "bogus"),
            Err(LedgerError::UnknownStep(_))
        ));
    }
}
