use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use super::models::{StepStatusRow, StoryRow};
use super::{
    Ledger, NewHistory, StepHistory, StepState, StepStatistics, StepStatus, StepUpdate,
    StoryRegistration, StorySnapshot, lease_cutoff, now_ts, resolve_step, validate_story_id,
};
use crate::errors::LedgerError;
use crate::steps::StepRegistry;

/// How long a writer waits on another process's lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Candidates examined per claim attempt.
const CLAIM_BATCH: i64 = 8;

/// Embedded ledger on a single SQLite file.
///
/// The connection sits behind a mutex and every operation runs on tokio's
/// blocking pool, so one caller holds it at a time and the guard is released
/// on every exit path. `close()` drops the connection.
pub struct SqliteLedger {
    conn: Arc<Mutex<Option<Connection>>>,
    registry: StepRegistry,
}

impl SqliteLedger {
    /// Open (or create) a ledger file. Call `initialize()` before use.
    pub fn open(path: &Path, registry: StepRegistry) -> Result<Self, LedgerError> {
        let conn = Connection::open(path).map_err(|e| {
            LedgerError::Unavailable(anyhow!(
                "Failed to open SQLite ledger at {}: {}",
                path.display(),
                e
            ))
        })?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::with_connection(conn, registry)
    }

    /// Private in-memory ledger (for testing).
    pub fn open_in_memory(registry: StepRegistry) -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            LedgerError::Unavailable(anyhow!("Failed to open in-memory SQLite ledger: {}", e))
        })?;
        Self::with_connection(conn, registry)
    }

    fn with_connection(conn: Connection, registry: StepRegistry) -> Result<Self, LedgerError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            registry,
        })
    }

    /// Run a closure with the connection on a blocking thread.
    async fn call<F, R>(&self, f: F) -> Result<R, LedgerError>
    where
        F: FnOnce(&mut Connection) -> Result<R, LedgerError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| LedgerError::Database(anyhow!("Ledger lock poisoned: {}", e)))?;
            let conn = guard.as_mut().ok_or(LedgerError::Closed)?;
            f(conn)
        })
        .await
        .map_err(|e| LedgerError::Database(anyhow!("Ledger task panicked: {}", e)))?
    }
}

fn run_migrations(conn: &Connection) -> Result<(), LedgerError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS stories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            story_id TEXT NOT NULL UNIQUE,
            title TEXT,
            source TEXT,
            metadata TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS step_status (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            story_id TEXT NOT NULL REFERENCES stories(story_id),
            step_name TEXT NOT NULL,
            status TEXT NOT NULL,
            run_id TEXT,
            error_message TEXT,
            acceptance_passed INTEGER,
            acceptance_details TEXT,
            started_at TEXT,
            completed_at TEXT,
            UNIQUE(story_id, step_name)
        );

        CREATE TABLE IF NOT EXISTS step_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            story_id TEXT NOT NULL REFERENCES stories(story_id),
            step_name TEXT NOT NULL,
            run_id TEXT,
            status TEXT NOT NULL,
            error_message TEXT,
            execution_time_ms INTEGER NOT NULL DEFAULT 0,
            timestamp TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_stories_created ON stories(created_at, id);
        CREATE INDEX IF NOT EXISTS idx_step_status_story ON step_status(story_id);
        CREATE INDEX IF NOT EXISTS idx_step_status_step ON step_status(step_name);
        CREATE INDEX IF NOT EXISTS idx_step_status_status ON step_status(status);
        CREATE INDEX IF NOT EXISTS idx_step_history_story ON step_history(story_id);
        CREATE INDEX IF NOT EXISTS idx_step_history_step ON step_history(step_name);
        ",
    )
    .map_err(|e| LedgerError::Database(anyhow!("Failed to create ledger tables: {}", e)))?;

    // Additive migrations (nullable columns, safe to re-run).
    // Only "duplicate column" errors are ignored.
    match conn.execute("ALTER TABLE step_status ADD COLUMN heartbeat_at TEXT", []) {
        Ok(_) => {}
        Err(e) if e.to_string().contains("duplicate column") => {}
        Err(e) => {
            return Err(LedgerError::Database(anyhow!(
                "Failed to add heartbeat_at column: {}",
                e
            )));
        }
    }
    Ok(())
}

/// Shared eligibility query. Parameters:
/// ?1 step, ?2 limit, ?3 lease cutoff (NULL = ignore leases), ?4 previous step
/// (NULL = first step).
const PENDING_SQL: &str = "
    SELECT s.story_id FROM stories s
    LEFT JOIN step_status cur
        ON cur.story_id = s.story_id AND cur.step_name = ?1
    WHERE (cur.story_id IS NULL OR cur.status <> 'completed')
      AND (?4 IS NULL OR EXISTS (
            SELECT 1 FROM step_status prev
            WHERE prev.story_id = s.story_id
              AND prev.step_name = ?4
              AND prev.status = 'completed'))
      AND (?3 IS NULL
           OR cur.story_id IS NULL
           OR cur.status <> 'running'
           OR cur.heartbeat_at IS NULL
           OR cur.heartbeat_at < ?3)
    ORDER BY s.created_at ASC, s.id ASC
    LIMIT ?2";

/// Conditional claim: only writes when the row is absent, not completed, and
/// not held under a live lease. ?1 story, ?2 step, ?3 run, ?4 now, ?5 cutoff.
const CLAIM_SQL: &str = "
    INSERT INTO step_status (story_id, step_name, status, run_id, started_at, heartbeat_at)
    VALUES (?1, ?2, 'running', ?3, ?4, ?4)
    ON CONFLICT(story_id, step_name) DO UPDATE SET
        status = 'running',
        run_id = excluded.run_id,
        error_message = NULL,
        acceptance_passed = NULL,
        acceptance_details = NULL,
        started_at = excluded.started_at,
        completed_at = NULL,
        heartbeat_at = excluded.heartbeat_at
    WHERE step_status.status <> 'completed'
      AND (step_status.status <> 'running'
           OR step_status.heartbeat_at IS NULL
           OR step_status.heartbeat_at < ?5)";

/// ?1 story, ?2 step, ?3 status, ?4 run, ?5 error, ?6 passed, ?7 details,
/// ?8 explicit started_at, ?9 now.
const UPSERT_STATUS_SQL: &str = "
    INSERT INTO step_status (story_id, step_name, status, run_id, error_message,
                             acceptance_passed, acceptance_details,
                             started_at, completed_at, heartbeat_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7,
            CASE WHEN ?3 = 'running' THEN COALESCE(?8, ?9) ELSE ?8 END,
            CASE WHEN ?3 IN ('completed', 'failed') THEN ?9 ELSE NULL END,
            CASE WHEN ?3 = 'running' THEN ?9 ELSE NULL END)
    ON CONFLICT(story_id, step_name) DO UPDATE SET
        status = excluded.status,
        run_id = COALESCE(excluded.run_id, step_status.run_id),
        error_message = excluded.error_message,
        acceptance_passed = CASE WHEN excluded.status = 'running'
            THEN excluded.acceptance_passed
            ELSE COALESCE(excluded.acceptance_passed, step_status.acceptance_passed) END,
        acceptance_details = CASE WHEN excluded.status = 'running'
            THEN excluded.acceptance_details
            ELSE COALESCE(excluded.acceptance_details, step_status.acceptance_details) END,
        started_at = CASE
            WHEN ?8 IS NOT NULL THEN ?8
            WHEN excluded.status = 'running'
                 AND NOT (step_status.status = 'running'
                          AND step_status.run_id IS COALESCE(excluded.run_id, step_status.run_id))
                THEN ?9
            ELSE step_status.started_at END,
        completed_at = CASE
            WHEN excluded.status IN ('completed', 'failed') THEN ?9
            WHEN excluded.status = 'running' THEN NULL
            ELSE step_status.completed_at END,
        heartbeat_at = CASE WHEN excluded.status = 'running' THEN ?9
            ELSE step_status.heartbeat_at END";

const STATUS_COLUMNS: &str = "story_id, step_name, status, run_id, error_message, \
     acceptance_passed, acceptance_details, started_at, completed_at, heartbeat_at";

fn read_status_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StepStatusRow> {
    Ok(StepStatusRow {
        story_id: row.get(0)?,
        step_name: row.get(1)?,
        status: row.get(2)?,
        run_id: row.get(3)?,
        error_message: row.get(4)?,
        acceptance_passed: row.get(5)?,
        acceptance_details: row.get(6)?,
        started_at: row.get(7)?,
        completed_at: row.get(8)?,
        heartbeat_at: row.get(9)?,
    })
}

fn collect_status(
    rows: impl Iterator<Item = rusqlite::Result<StepStatusRow>>,
) -> Result<Vec<StepStatus>, LedgerError> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?.into_status().map_err(LedgerError::Database)?);
    }
    Ok(out)
}

fn pending(
    conn: &Connection,
    step: &str,
    prev: Option<&str>,
    cutoff: Option<&str>,
    limit: i64,
) -> Result<Vec<String>, LedgerError> {
    let mut stmt = conn.prepare_cached(PENDING_SQL)?;
    let rows = stmt.query_map(params![step, limit, cutoff, prev], |row| row.get(0))?;
    let mut ids = Vec::new();
    for row in rows {
        ids.push(row?);
    }
    Ok(ids)
}

#[async_trait]
impl Ledger for SqliteLedger {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    async fn initialize(&self) -> Result<(), LedgerError> {
        self.call(|conn| run_migrations(conn)).await
    }

    async fn register_story(&self, story: &StoryRegistration) -> Result<String, LedgerError> {
        validate_story_id(&story.story_id)?;
        let story = story.clone();
        self.call(move |conn| {
            let now = now_ts();
            conn.execute(
                "INSERT INTO stories (story_id, title, source, metadata, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(story_id) DO UPDATE SET
                    title = COALESCE(stories.title, excluded.title),
                    source = COALESCE(stories.source, excluded.source),
                    metadata = COALESCE(stories.metadata, excluded.metadata),
                    updated_at = excluded.updated_at",
                params![
                    story.story_id,
                    story.title,
                    story.source,
                    story.metadata_json(),
                    now
                ],
            )
            .map_err(|e| match LedgerError::from(e) {
                LedgerError::Conflict { message, .. } => LedgerError::Conflict {
                    story_id: story.story_id.clone(),
                    message,
                },
                other => other,
            })?;
            Ok(story.story_id)
        })
        .await
    }

    async fn update_step_status(
        &self,
        story_id: &str,
        step_name: &str,
        update: &StepUpdate,
    ) -> Result<(), LedgerError> {
        validate_story_id(story_id)?;
        resolve_step(&self.registry, step_name)?;
        let (story_id, step_name, update) =
            (story_id.to_string(), step_name.to_string(), update.clone());
        self.call(move |conn| {
            conn.execute(
                UPSERT_STATUS_SQL,
                params![
                    story_id,
                    step_name,
                    update.status.as_str(),
                    update.run_id,
                    update.error_message,
                    update.acceptance_passed,
                    update.acceptance_details,
                    update.started_at,
                    now_ts()
                ],
            )
            .map_err(|e| match LedgerError::from(e) {
                LedgerError::Conflict { message, .. } => LedgerError::Conflict {
                    story_id: story_id.clone(),
                    message,
                },
                other => other,
            })?;
            Ok(())
        })
        .await
    }

    async fn add_step_history(&self, entry: &NewHistory) -> Result<(), LedgerError> {
        validate_story_id(&entry.story_id)?;
        resolve_step(&self.registry, &entry.step_name)?;
        let entry = entry.clone();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO step_history
                    (story_id, step_name, run_id, status, error_message, execution_time_ms, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.story_id,
                    entry.step_name,
                    entry.run_id,
                    entry.status.as_str(),
                    entry.error_message,
                    entry.execution_time_ms,
                    now_ts()
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_pending_stories(
        &self,
        step_name: &str,
        limit: usize,
    ) -> Result<Vec<String>, LedgerError> {
        let prev = resolve_step(&self.registry, step_name)?;
        let step = step_name.to_string();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.call(move |conn| pending(conn, &step, prev.as_deref(), None, limit))
            .await
    }

    async fn claim_candidate(
        &self,
        step_name: &str,
        run_id: &str,
        lease_timeout: Duration,
    ) -> Result<Option<String>, LedgerError> {
        let prev = resolve_step(&self.registry, step_name)?;
        let (step, run_id) = (step_name.to_string(), run_id.to_string());
        self.call(move |conn| {
            // IMMEDIATE takes the write lock up front so concurrent
            // processes serialize on the claim.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let cutoff = lease_cutoff(lease_timeout);
            let candidates = pending(&tx, &step, prev.as_deref(), Some(&cutoff), CLAIM_BATCH)?;
            let now = now_ts();
            let mut claimed = None;
            for story_id in candidates {
                let written = tx.execute(CLAIM_SQL, params![story_id, step, run_id, now, cutoff])?;
                if written == 1 {
                    claimed = Some(story_id);
                    break;
                }
            }
            tx.commit()?;
            Ok(claimed)
        })
        .await
    }

    async fn heartbeat(
        &self,
        story_id: &str,
        step_name: &str,
        run_id: &str,
    ) -> Result<bool, LedgerError> {
        let (story_id, step, run_id) =
            (story_id.to_string(), step_name.to_string(), run_id.to_string());
        self.call(move |conn| {
            let touched = conn.execute(
                "UPDATE step_status SET heartbeat_at = ?4
                 WHERE story_id = ?1 AND step_name = ?2 AND run_id = ?3 AND status = 'running'",
                params![story_id, step, run_id, now_ts()],
            )?;
            Ok(touched > 0)
        })
        .await
    }

    async fn get_story_status(
        &self,
        story_id: &str,
    ) -> Result<Option<StorySnapshot>, LedgerError> {
        let story_id = story_id.to_string();
        self.call(move |conn| {
            let story = conn
                .query_row(
                    "SELECT story_id, title, source, metadata, created_at, updated_at
                     FROM stories WHERE story_id = ?1",
                    params![story_id],
                    |row| {
                        Ok(StoryRow {
                            story_id: row.get(0)?,
                            title: row.get(1)?,
                            source: row.get(2)?,
                            metadata: row.get(3)?,
                            created_at: row.get(4)?,
                            updated_at: row.get(5)?,
                        })
                    },
                )
                .optional()?;
            let Some(story) = story else {
                return Ok(None);
            };
            let story = story.into_story().map_err(LedgerError::Database)?;

            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM step_status WHERE story_id = ?1 ORDER BY step_name ASC",
                STATUS_COLUMNS
            ))?;
            let steps = collect_status(stmt.query_map(params![story_id], read_status_row)?)?;
            Ok(Some(StorySnapshot { story, steps }))
        })
        .await
    }

    async fn get_step_history(
        &self,
        story_id: &str,
        step_name: Option<&str>,
    ) -> Result<Vec<StepHistory>, LedgerError> {
        let story_id = story_id.to_string();
        let step = step_name.map(str::to_string);
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, story_id, step_name, run_id, status, error_message, execution_time_ms, timestamp
                 FROM step_history
                 WHERE story_id = ?1 AND (?2 IS NULL OR step_name = ?2)
                 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![story_id, step], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })?;
            let mut history = Vec::new();
            for row in rows {
                let (id, story_id, step_name, run_id, status, error_message, ms, timestamp) = row?;
                let status = status
                    .parse::<StepState>()
                    .map_err(|e| LedgerError::Database(anyhow!(e)))?;
                history.push(StepHistory {
                    id,
                    story_id,
                    step_name,
                    run_id,
                    status,
                    error_message,
                    execution_time_ms: ms,
                    timestamp,
                });
            }
            Ok(history)
        })
        .await
    }

    async fn get_step_statistics(&self) -> Result<StepStatistics, LedgerError> {
        self.call(|conn| {
            let mut stmt = conn.prepare(
                "SELECT step_name, status, COUNT(*) FROM step_status GROUP BY step_name, status",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;
            let mut stats = StepStatistics::new();
            for row in rows {
                let (step, status, count) = row?;
                stats.entry(step).or_default().insert(status, count);
            }
            Ok(stats)
        })
        .await
    }

    async fn list_stale_running(
        &self,
        step_name: Option<&str>,
        lease_timeout: Duration,
    ) -> Result<Vec<StepStatus>, LedgerError> {
        if let Some(step) = step_name {
            resolve_step(&self.registry, step)?;
        }
        let step = step_name.map(str::to_string);
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM step_status
                 WHERE status = 'running'
                   AND (heartbeat_at IS NULL OR heartbeat_at < ?1)
                   AND (?2 IS NULL OR step_name = ?2)
                 ORDER BY heartbeat_at ASC, story_id ASC",
                STATUS_COLUMNS
            ))?;
            let rows = stmt.query_map(params![lease_cutoff(lease_timeout), step], read_status_row)?;
            collect_status(rows)
        })
        .await
    }

    async fn close(&self) -> Result<(), LedgerError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| LedgerError::Database(anyhow!("Ledger lock poisoned: {}", e)))?;
            if let Some(conn) = guard.take() {
                conn.close().map_err(|(_, e)| LedgerError::from(e))?;
            }
            Ok(())
        })
        .await
        .map_err(|e| LedgerError::Database(anyhow!("Ledger task panicked: {}", e)))?
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    async fn ledger_with(steps: &[&str]) -> Result<SqliteLedger> {
        let ledger = SqliteLedger::open_in_memory(StepRegistry::new(steps.iter().copied())?)?;
        ledger.initialize().await?;
        Ok(ledger)
    }

    async fn two_step_ledger() -> Result<SqliteLedger> {
        ledger_with(&["step1", "step2"]).await
    }

    async fn complete(ledger: &SqliteLedger, story: &str, step: &str) -> Result<()> {
        ledger
            .update_step_status(story, step, &StepUpdate::completed())
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() -> Result<()> {
        let ledger = two_step_ledger().await?;
        ledger.initialize().await?;
        ledger.initialize().await?;

        let counts = ledger
            .call(|conn| {
                let tables: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table'
                     AND name IN ('stories', 'step_status', 'step_history')",
                    [],
                    |row| row.get(0),
                )?;
                let indexes: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='index' AND name LIKE 'idx_%'",
                    [],
                    |row| row.get(0),
                )?;
                Ok((tables, indexes))
            })
            .await?;
        assert_eq!(counts, (3, 6));
        Ok(())
    }

    #[tokio::test]
    async fn test_first_step_gating() -> Result<()> {
        let ledger = two_step_ledger().await?;
        ledger.register_story(&StoryRegistration::new("fresh")).await?;

        assert_eq!(ledger.get_pending_stories("step1", 10).await?, vec!["fresh"]);
        complete(&ledger, "fresh", "step1").await?;
        assert!(ledger.get_pending_stories("step1", 10).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_dependency_gating() -> Result<()> {
        let ledger = two_step_ledger().await?;
        ledger.register_story(&StoryRegistration::new("s")).await?;

        assert!(ledger.get_pending_stories("step2", 10).await?.is_empty());
        complete(&ledger, "s", "step1").await?;
        assert_eq!(ledger.get_pending_stories("step2", 10).await?, vec!["s"]);
        complete(&ledger, "s", "step2").await?;
        assert!(ledger.get_pending_stories("step2", 10).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_pending_scenario_orders_by_creation() -> Result<()> {
        let ledger = two_step_ledger().await?;
        for id in ["A", "B", "C"] {
            ledger.register_story(&StoryRegistration::new(id)).await?;
            complete(&ledger, id, "step1").await?;
        }
        complete(&ledger, "B", "step2").await?;

        assert_eq!(ledger.get_pending_stories("step2", 10).await?, vec!["A", "C"]);
        assert_eq!(ledger.get_pending_stories("step2", 1).await?, vec!["A"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_and_running_rows_remain_pending() -> Result<()> {
        let ledger = two_step_ledger().await?;
        ledger.register_story(&StoryRegistration::new("f")).await?;
        ledger.register_story(&StoryRegistration::new("r")).await?;
        ledger
            .update_step_status("f", "step1", &StepUpdate::failed("boom").run_id("r1"))
            .await?;
        ledger
            .update_step_status("r", "step1", &StepUpdate::running("r1"))
            .await?;
        assert_eq!(ledger.get_pending_stories("step1", 10).await?, vec!["f", "r"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_step_is_rejected() -> Result<()> {
        let ledger = two_step_ledger().await?;
        assert!(matches!(
            ledger.get_pending_stories("step9", 1).await,
            Err(LedgerError::UnknownStep(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_statistics_scenario() -> Result<()> {
        let ledger = two_step_ledger().await?;
        for i in 0..5 {
            let id = format!("s{}", i);
            ledger.register_story(&StoryRegistration::new(&id)).await?;
            complete(&ledger, &id, "step1").await?;
            if i < 3 {
                complete(&ledger, &id, "step2").await?;
            }
        }
        let stats = ledger.get_step_statistics().await?;
        let expected: StepStatistics = [
            ("step1".to_string(), [("completed".to_string(), 5)].into()),
            ("step2".to_string(), [("completed".to_string(), 3)].into()),
        ]
        .into();
        assert_eq!(stats, expected);
        Ok(())
    }

    #[tokio::test]
    async fn test_history_is_append_only() -> Result<()> {
        let ledger = two_step_ledger().await?;
        ledger.register_story(&StoryRegistration::new("h")).await?;
        for run in ["run-1", "run-2"] {
            ledger
                .add_step_history(&NewHistory {
                    story_id: "h".into(),
                    step_name: "step1".into(),
                    run_id: Some(run.into()),
                    status: StepState::Completed,
                    error_message: None,
                    execution_time_ms: 12,
                })
                .await?;
        }
        let history = ledger.get_step_history("h", Some("step1")).await?;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].run_id.as_deref(), Some("run-1"));
        assert_eq!(history[1].run_id.as_deref(), Some("run-2"));
        assert!(ledger.get_step_history("h", Some("step2")).await?.is_empty());
        assert_eq!(ledger.get_step_history("h", None).await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_register_is_idempotent_and_fills_only_nulls() -> Result<()> {
        let ledger = two_step_ledger().await?;
        let id = ledger
            .register_story(&StoryRegistration::new("m").source("manual"))
            .await?;
        assert_eq!(id, "m");
        let first = ledger.get_story_status("m").await?.unwrap().story;

        ledger
            .register_story(
                &StoryRegistration::new("m")
                    .title("Later title")
                    .source("auto-generated")
                    .metadata(serde_json::json!({"k": 1})),
            )
            .await?;
        let second = ledger.get_story_status("m").await?.unwrap().story;
        assert_eq!(second.title.as_deref(), Some("Later title"));
        assert_eq!(second.source.as_deref(), Some("manual"));
        assert_eq!(second.metadata, Some(serde_json::json!({"k": 1})));
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);
        Ok(())
    }

    #[tokio::test]
    async fn test_register_rejects_bad_ids() -> Result<()> {
        let ledger = two_step_ledger().await?;
        assert!(matches!(
            ledger.register_story(&StoryRegistration::new("../x")).await,
            Err(LedgerError::InvalidArgument(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_status_timestamps() -> Result<()> {
        let ledger = two_step_ledger().await?;
        ledger.register_story(&StoryRegistration::new("t")).await?;

        ledger
            .update_step_status("t", "step1", &StepUpdate::running("run-1"))
            .await?;
        let running = ledger.get_story_status("t").await?.unwrap();
        let row = running.step("step1").unwrap();
        assert_eq!(row.status, StepState::Running);
        let started = row.started_at.clone().unwrap();
        assert!(row.completed_at.is_none());
        assert!(row.heartbeat_at.is_some());

        // Same run re-entering running keeps started_at.
        tokio::time::sleep(Duration::from_millis(5)).await;
        ledger
            .update_step_status("t", "step1", &StepUpdate::running("run-1"))
            .await?;
        let again = ledger.get_story_status("t").await?.unwrap();
        assert_eq!(again.step("step1").unwrap().started_at.as_deref(), Some(started.as_str()));

        ledger
            .update_step_status("t", "step1", &StepUpdate::completed())
            .await?;
        let done = ledger.get_story_status("t").await?.unwrap();
        let row = done.step("step1").unwrap();
        assert_eq!(row.status, StepState::Completed);
        assert_eq!(row.run_id.as_deref(), Some("run-1"));
        assert_eq!(row.started_at.as_deref(), Some(started.as_str()));
        assert!(row.completed_at.is_some());

        // A new run restarts the clock and clears completion.
        tokio::time::sleep(Duration::from_millis(5)).await;
        ledger
            .update_step_status("t", "step1", &StepUpdate::running("run-2"))
            .await?;
        let rerun = ledger.get_story_status("t").await?.unwrap();
        let row = rerun.step("step1").unwrap();
        assert!(row.started_at.as_deref().unwrap() > started.as_str());
        assert!(row.completed_at.is_none());
        assert_eq!(row.run_id.as_deref(), Some("run-2"));
        Ok(())
    }

    #[tokio::test]
    async fn test_explicit_started_at_wins() -> Result<()> {
        let ledger = two_step_ledger().await?;
        ledger.register_story(&StoryRegistration::new("e")).await?;
        ledger
            .update_step_status(
                "e",
                "step1",
                &StepUpdate::running("r").started_at("2020-01-01T00:00:00.000000Z"),
            )
            .await?;
        let snap = ledger.get_story_status("e").await?.unwrap();
        assert_eq!(
            snap.step("step1").unwrap().started_at.as_deref(),
            Some("2020-01-01T00:00:00.000000Z")
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_acceptance_fields_persist_until_rerun() -> Result<()> {
        let ledger = two_step_ledger().await?;
        ledger.register_story(&StoryRegistration::new("a")).await?;
        ledger
            .update_step_status("a", "step1", &StepUpdate::completed().acceptance(true, "fine"))
            .await?;
        // A later status write without acceptance keeps the verdict.
        ledger
            .update_step_status("a", "step1", &StepUpdate::completed())
            .await?;
        let snap = ledger.get_story_status("a").await?.unwrap();
        assert_eq!(snap.step("step1").unwrap().acceptance_passed, Some(true));

        ledger
            .update_step_status("a", "step1", &StepUpdate::running("r2"))
            .await?;
        let snap = ledger.get_story_status("a").await?.unwrap();
        assert_eq!(snap.step("step1").unwrap().acceptance_passed, None);
        assert_eq!(snap.step("step1").unwrap().acceptance_details, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_status_for_unregistered_story_conflicts() -> Result<()> {
        let ledger = two_step_ledger().await?;
        let err = ledger
            .update_step_status("ghost", "step1", &StepUpdate::completed())
            .await
            .unwrap_err();
        match err {
            LedgerError::Conflict { story_id, .. } => assert_eq!(story_id, "ghost"),
            other => panic!("expected Conflict, got {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_story_status_unknown_is_none_and_steps_ordered() -> Result<()> {
        let ledger = ledger_with(&["b-step", "a-step"]).await?;
        assert!(ledger.get_story_status("nobody").await?.is_none());

        ledger.register_story(&StoryRegistration::new("o")).await?;
        complete(&ledger, "o", "b-step").await?;
        complete(&ledger, "o", "a-step").await?;
        let snap = ledger.get_story_status("o").await?.unwrap();
        let names: Vec<&str> = snap.steps.iter().map(|s| s.step_name.as_str()).collect();
        assert_eq!(names, vec!["a-step", "b-step"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_until_lease_expires() -> Result<()> {
        let ledger = two_step_ledger().await?;
        ledger.register_story(&StoryRegistration::new("x")).await?;
        ledger.register_story(&StoryRegistration::new("y")).await?;
        let lease = Duration::from_secs(60);

        assert_eq!(ledger.claim_candidate("step1", "w1", lease).await?.as_deref(), Some("x"));
        assert_eq!(ledger.claim_candidate("step1", "w2", lease).await?.as_deref(), Some("y"));
        assert_eq!(ledger.claim_candidate("step1", "w3", lease).await?, None);

        // Plain pending query still reports running rows.
        assert_eq!(ledger.get_pending_stories("step1", 10).await?.len(), 2);

        let snap = ledger.get_story_status("x").await?.unwrap();
        let row = snap.step("step1").unwrap();
        assert_eq!(row.status, StepState::Running);
        assert_eq!(row.run_id.as_deref(), Some("w1"));
        Ok(())
    }

    #[tokio::test]
    async fn test_claim_reclaims_orphans() -> Result<()> {
        let ledger = two_step_ledger().await?;
        ledger.register_story(&StoryRegistration::new("o")).await?;
        assert!(ledger.claim_candidate("step1", "dead", Duration::from_secs(60)).await?.is_some());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let stale = ledger
            .list_stale_running(Some("step1"), Duration::from_millis(10))
            .await?;
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].run_id.as_deref(), Some("dead"));

        let reclaimed = ledger
            .claim_candidate("step1", "alive", Duration::from_millis(10))
            .await?;
        assert_eq!(reclaimed.as_deref(), Some("o"));
        let snap = ledger.get_story_status("o").await?.unwrap();
        assert_eq!(snap.step("step1").unwrap().run_id.as_deref(), Some("alive"));
        Ok(())
    }

    #[tokio::test]
    async fn test_claim_respects_dependency_gate_and_retries_failures() -> Result<()> {
        let ledger = two_step_ledger().await?;
        ledger.register_story(&StoryRegistration::new("g")).await?;
        let lease = Duration::from_secs(60);
        assert_eq!(ledger.claim_candidate("step2", "w", lease).await?, None);

        complete(&ledger, "g", "step1").await?;
        ledger
            .update_step_status("g", "step2", &StepUpdate::failed("nope").run_id("w0"))
            .await?;
        assert_eq!(ledger.claim_candidate("step2", "w1", lease).await?.as_deref(), Some("g"));
        let snap = ledger.get_story_status("g").await?.unwrap();
        let row = snap.step("step2").unwrap();
        assert_eq!(row.status, StepState::Running);
        assert!(row.error_message.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_heartbeat_only_touches_owned_running_rows() -> Result<()> {
        let ledger = two_step_ledger().await?;
        ledger.register_story(&StoryRegistration::new("hb")).await?;
        ledger
            .update_step_status("hb", "step1", &StepUpdate::running("mine"))
            .await?;
        assert!(ledger.heartbeat("hb", "step1", "mine").await?);
        assert!(!ledger.heartbeat("hb", "step1", "theirs").await?);
        complete(&ledger, "hb", "step1").await?;
        assert!(!ledger.heartbeat("hb", "step1", "mine").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_close_then_use_fails() -> Result<()> {
        let ledger = two_step_ledger().await?;
        ledger.close().await?;
        ledger.close().await?;
        assert!(matches!(
            ledger.get_step_statistics().await,
            Err(LedgerError::Closed)
        ));
        assert!(matches!(
            ledger.register_story(&StoryRegistration::new("z")).await,
            Err(LedgerError::Closed)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_file_ledger_survives_reopen_and_shares_claims() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("ledger.db");
        {
            let ledger = SqliteLedger::open(&path, StepRegistry::default())?;
            ledger.initialize().await?;
            ledger.register_story(&StoryRegistration::new("p")).await?;
            complete(&ledger, "p", "ingest").await?;
            ledger.close().await?;
        }

        let a = SqliteLedger::open(&path, StepRegistry::default())?;
        let b = SqliteLedger::open(&path, StepRegistry::default())?;
        a.initialize().await?;
        b.initialize().await?;
        assert_eq!(a.get_pending_stories("preprocess", 5).await?, vec!["p"]);

        let lease = Duration::from_secs(60);
        let (ca, cb) = tokio::join!(
            a.claim_candidate("preprocess", "wa", lease),
            b.claim_candidate("preprocess", "wb", lease)
        );
        let winners: Vec<String> = [ca?, cb?].into_iter().flatten().collect();
        assert_eq!(winners, vec!["p".to_string()]);
        Ok(())
    }
}
