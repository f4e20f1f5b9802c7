use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};

use super::models::{StepStatusRow, StoryRow};
use super::{
    Ledger, NewHistory, StepHistory, StepState, StepStatistics, StepStatus, StepUpdate,
    StoryRegistration, StorySnapshot, lease_cutoff, now_ts, resolve_step, validate_story_id,
};
use crate::errors::LedgerError;
use crate::steps::StepRegistry;

const MAX_CONNECTIONS: u32 = 5;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);
const CLAIM_BATCH: i64 = 8;

/// Arbitrary key serializing concurrent `initialize()` calls.
const MIGRATION_LOCK_KEY: i64 = 0x5354_4f52_5946_4c57;

/// Client-server ledger. Tables live under a dedicated schema.
pub struct PostgresLedger {
    pool: PgPool,
    schema: String,
    registry: StepRegistry,
    closed: AtomicBool,
}

impl PostgresLedger {
    /// Connect a pool. Call `initialize()` before use.
    pub async fn connect(
        url: &str,
        schema: &str,
        registry: StepRegistry,
    ) -> Result<Self, LedgerError> {
        validate_schema_name(schema)?;
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(url)
            .await
            .map_err(|e| LedgerError::Unavailable(anyhow!("Failed to connect to Postgres: {}", e)))?;
        Ok(Self {
            pool,
            schema: schema.to_string(),
            registry,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), LedgerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LedgerError::Closed);
        }
        Ok(())
    }

    /// Schema-qualified table name.
    fn t(&self, table: &str) -> String {
        format!("{}.{}", self.schema, table)
    }

    fn pending_sql(&self, lock: bool) -> String {
        format!(
            "SELECT s.story_id FROM {stories} s
             LEFT JOIN {status} cur
                 ON cur.story_id = s.story_id AND cur.step_name = $1
             WHERE (cur.story_id IS NULL OR cur.status <> 'completed')
               AND ($4::text IS NULL OR EXISTS (
                     SELECT 1 FROM {status} prev
                     WHERE prev.story_id = s.story_id
                       AND prev.step_name = $4::text
                       AND prev.status = 'completed'))
               AND ($3::text IS NULL
                    OR cur.story_id IS NULL
                    OR cur.status <> 'running'
                    OR cur.heartbeat_at IS NULL
                    OR cur.heartbeat_at < $3::text)
             ORDER BY s.created_at ASC, s.id ASC
             LIMIT $2{lock}",
            stories = self.t("stories"),
            status = self.t("step_status"),
            lock = if lock { " FOR UPDATE OF s SKIP LOCKED" } else { "" },
        )
    }

    fn status_select(&self) -> String {
        format!(
            "SELECT story_id, step_name, status, run_id, error_message, acceptance_passed, \
             acceptance_details, started_at, completed_at, heartbeat_at FROM {}",
            self.t("step_status")
        )
    }

    fn map_conflict(story_id: &str, e: sqlx::Error) -> LedgerError {
        if let sqlx::Error::Database(db) = &e
            && (db.is_foreign_key_violation() || db.is_unique_violation() || db.is_check_violation())
        {
            return LedgerError::Conflict {
                story_id: story_id.to_string(),
                message: db.message().to_string(),
            };
        }
        e.into()
    }

    async fn claim_in(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        step: &str,
        prev: Option<&str>,
        run_id: &str,
        cutoff: &str,
    ) -> Result<Option<String>, LedgerError> {
        let candidates: Vec<String> = sqlx::query_scalar(&self.pending_sql(true))
            .bind(step)
            .bind(CLAIM_BATCH)
            .bind(cutoff)
            .bind(prev)
            .fetch_all(&mut **tx)
            .await?;

        let claim = format!(
            "INSERT INTO {status} AS cur (story_id, step_name, status, run_id, started_at, heartbeat_at)
             VALUES ($1, $2, 'running', $3, $4, $4)
             ON CONFLICT (story_id, step_name) DO UPDATE SET
                 status = 'running',
                 run_id = EXCLUDED.run_id,
                 error_message = NULL,
                 acceptance_passed = NULL,
                 acceptance_details = NULL,
                 started_at = EXCLUDED.started_at,
                 completed_at = NULL,
                 heartbeat_at = EXCLUDED.heartbeat_at
             WHERE cur.status <> 'completed'
               AND (cur.status <> 'running'
                    OR cur.heartbeat_at IS NULL
                    OR cur.heartbeat_at < $5)",
            status = self.t("step_status"),
        );
        let now = now_ts();
        for story_id in candidates {
            let written = sqlx::query(&claim)
                .bind(&story_id)
                .bind(step)
                .bind(run_id)
                .bind(&now)
                .bind(cutoff)
                .execute(&mut **tx)
                .await?;
            if written.rows_affected() == 1 {
                return Ok(Some(story_id));
            }
        }
        Ok(None)
    }
}

/// Only plain identifiers are accepted; the schema name is interpolated.
pub fn validate_schema_name(schema: &str) -> Result<(), LedgerError> {
    let mut chars = schema.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !valid_start
        || schema.len() > 63
        || !schema.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(LedgerError::InvalidArgument(format!(
            "Invalid schema name '{}'",
            schema
        )));
    }
    Ok(())
}

fn status_row(row: &PgRow) -> Result<StepStatusRow, sqlx::Error> {
    Ok(StepStatusRow {
        story_id: row.try_get("story_id")?,
        step_name: row.try_get("step_name")?,
        status: row.try_get("status")?,
        run_id: row.try_get("run_id")?,
        error_message: row.try_get("error_message")?,
        acceptance_passed: row.try_get("acceptance_passed")?,
        acceptance_details: row.try_get("acceptance_details")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        heartbeat_at: row.try_get("heartbeat_at")?,
    })
}

fn into_statuses(rows: Vec<PgRow>) -> Result<Vec<StepStatus>, LedgerError> {
    rows.iter()
        .map(|r| {
            status_row(r)?
                .into_status()
                .map_err(LedgerError::Database)
        })
        .collect()
}

#[async_trait]
impl Ledger for PostgresLedger {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    async fn initialize(&self) -> Result<(), LedgerError> {
        self.ensure_open()?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        let statements = [
            format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id BIGSERIAL PRIMARY KEY,
                    story_id TEXT NOT NULL UNIQUE,
                    title TEXT,
                    source TEXT,
                    metadata TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )",
                self.t("stories")
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id BIGSERIAL PRIMARY KEY,
                    story_id TEXT NOT NULL REFERENCES {}(story_id),
                    step_name TEXT NOT NULL,
                    status TEXT NOT NULL,
                    run_id TEXT,
                    error_message TEXT,
                    acceptance_passed BOOLEAN,
                    acceptance_details TEXT,
                    started_at TEXT,
                    completed_at TEXT,
                    UNIQUE (story_id, step_name)
                )",
                self.t("step_status"),
                self.t("stories")
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id BIGSERIAL PRIMARY KEY,
                    story_id TEXT NOT NULL REFERENCES {}(story_id),
                    step_name TEXT NOT NULL,
                    run_id TEXT,
                    status TEXT NOT NULL,
                    error_message TEXT,
                    execution_time_ms BIGINT NOT NULL DEFAULT 0,
                    timestamp TEXT NOT NULL
                )",
                self.t("step_history"),
                self.t("stories")
            ),
            // Additive migrations
            format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS heartbeat_at TEXT",
                self.t("step_status")
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_stories_created ON {}(created_at, id)",
                self.t("stories")
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_step_status_story ON {}(story_id)",
                self.t("step_status")
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_step_status_step ON {}(step_name)",
                self.t("step_status")
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_step_status_status ON {}(status)",
                self.t("step_status")
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_step_history_story ON {}(story_id)",
                self.t("step_history")
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_step_history_step ON {}(step_name)",
                self.t("step_history")
            ),
        ];
        for sql in &statements {
            sqlx::query(sql).execute(&mut *tx).await.map_err(|e| {
                LedgerError::Database(anyhow!("Failed to create ledger tables: {}", e))
            })?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn register_story(&self, story: &StoryRegistration) -> Result<String, LedgerError> {
        self.ensure_open()?;
        validate_story_id(&story.story_id)?;
        let sql = format!(
            "INSERT INTO {stories} AS st (story_id, title, source, metadata, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $5)
             ON CONFLICT (story_id) DO UPDATE SET
                 title = COALESCE(st.title, EXCLUDED.title),
                 source = COALESCE(st.source, EXCLUDED.source),
                 metadata = COALESCE(st.metadata, EXCLUDED.metadata),
                 updated_at = EXCLUDED.updated_at",
            stories = self.t("stories")
        );
        sqlx::query(&sql)
            .bind(&story.story_id)
            .bind(&story.title)
            .bind(&story.source)
            .bind(story.metadata_json())
            .bind(now_ts())
            .execute(&self.pool)
            .await
            .map_err(|e| Self::map_conflict(&story.story_id, e))?;
        Ok(story.story_id.clone())
    }

    async fn update_step_status(
        &self,
        story_id: &str,
        step_name: &str,
        update: &StepUpdate,
    ) -> Result<(), LedgerError> {
        self.ensure_open()?;
        validate_story_id(story_id)?;
        resolve_step(&self.registry, step_name)?;
        let sql = format!(
            "INSERT INTO {status} AS cur (story_id, step_name, status, run_id, error_message,
                                          acceptance_passed, acceptance_details,
                                          started_at, completed_at, heartbeat_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7,
                     CASE WHEN $3 = 'running' THEN COALESCE($8::text, $9) ELSE $8::text END,
                     CASE WHEN $3 IN ('completed', 'failed') THEN $9 ELSE NULL END,
                     CASE WHEN $3 = 'running' THEN $9 ELSE NULL END)
             ON CONFLICT (story_id, step_name) DO UPDATE SET
                 status = EXCLUDED.status,
                 run_id = COALESCE(EXCLUDED.run_id, cur.run_id),
                 error_message = EXCLUDED.error_message,
                 acceptance_passed = CASE WHEN EXCLUDED.status = 'running'
                     THEN EXCLUDED.acceptance_passed
                     ELSE COALESCE(EXCLUDED.acceptance_passed, cur.acceptance_passed) END,
                 acceptance_details = CASE WHEN EXCLUDED.status = 'running'
                     THEN EXCLUDED.acceptance_details
                     ELSE COALESCE(EXCLUDED.acceptance_details, cur.acceptance_details) END,
                 started_at = CASE
                     WHEN $8::text IS NOT NULL THEN $8::text
                     WHEN EXCLUDED.status = 'running'
                          AND NOT (cur.status = 'running'
                                   AND cur.run_id IS NOT DISTINCT FROM
                                       COALESCE(EXCLUDED.run_id, cur.run_id))
                         THEN $9
                     ELSE cur.started_at END,
                 completed_at = CASE
                     WHEN EXCLUDED.status IN ('completed', 'failed') THEN $9
                     WHEN EXCLUDED.status = 'running' THEN NULL
                     ELSE cur.completed_at END,
                 heartbeat_at = CASE WHEN EXCLUDED.status = 'running' THEN $9
                     ELSE cur.heartbeat_at END",
            status = self.t("step_status")
        );
        sqlx::query(&sql)
            .bind(story_id)
            .bind(step_name)
            .bind(update.status.as_str())
            .bind(&update.run_id)
            .bind(&update.error_message)
            .bind(update.acceptance_passed)
            .bind(&update.acceptance_details)
            .bind(&update.started_at)
            .bind(now_ts())
            .execute(&self.pool)
            .await
            .map_err(|e| Self::map_conflict(story_id, e))?;
        Ok(())
    }

    async fn add_step_history(&self, entry: &NewHistory) -> Result<(), LedgerError> {
        self.ensure_open()?;
        validate_story_id(&entry.story_id)?;
        resolve_step(&self.registry, &entry.step_name)?;
        let sql = format!(
            "INSERT INTO {} (story_id, step_name, run_id, status, error_message, execution_time_ms, timestamp)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            self.t("step_history")
        );
        sqlx::query(&sql)
            .bind(&entry.story_id)
            .bind(&entry.step_name)
            .bind(&entry.run_id)
            .bind(entry.status.as_str())
            .bind(&entry.error_message)
            .bind(entry.execution_time_ms)
            .bind(now_ts())
            .execute(&self.pool)
            .await
            .map_err(|e| Self::map_conflict(&entry.story_id, e))?;
        Ok(())
    }

    async fn get_pending_stories(
        &self,
        step_name: &str,
        limit: usize,
    ) -> Result<Vec<String>, LedgerError> {
        self.ensure_open()?;
        let prev = resolve_step(&self.registry, step_name)?;
        let ids = sqlx::query_scalar(&self.pending_sql(false))
            .bind(step_name)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .bind(None::<String>)
            .bind(prev)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn claim_candidate(
        &self,
        step_name: &str,
        run_id: &str,
        lease_timeout: Duration,
    ) -> Result<Option<String>, LedgerError> {
        self.ensure_open()?;
        let prev = resolve_step(&self.registry, step_name)?;
        let cutoff = lease_cutoff(lease_timeout);
        let mut tx = self.pool.begin().await?;
        let claimed = self
            .claim_in(&mut tx, step_name, prev.as_deref(), run_id, &cutoff)
            .await?;
        tx.commit().await?;
        Ok(claimed)
    }

    async fn heartbeat(
        &self,
        story_id: &str,
        step_name: &str,
        run_id: &str,
    ) -> Result<bool, LedgerError> {
        self.ensure_open()?;
        let sql = format!(
            "UPDATE {} SET heartbeat_at = $4
             WHERE story_id = $1 AND step_name = $2 AND run_id = $3 AND status = 'running'",
            self.t("step_status")
        );
        let res = sqlx::query(&sql)
            .bind(story_id)
            .bind(step_name)
            .bind(run_id)
            .bind(now_ts())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn get_story_status(
        &self,
        story_id: &str,
    ) -> Result<Option<StorySnapshot>, LedgerError> {
        self.ensure_open()?;
        let sql = format!(
            "SELECT story_id, title, source, metadata, created_at, updated_at
             FROM {} WHERE story_id = $1",
            self.t("stories")
        );
        let Some(row) = sqlx::query(&sql)
            .bind(story_id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        let story = StoryRow {
            story_id: row.try_get("story_id")?,
            title: row.try_get("title")?,
            source: row.try_get("source")?,
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        }
        .into_story()
        .map_err(LedgerError::Database)?;

        let rows = sqlx::query(&format!(
            "{} WHERE story_id = $1 ORDER BY step_name ASC",
            self.status_select()
        ))
        .bind(story_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(Some(StorySnapshot {
            story,
            steps: into_statuses(rows)?,
        }))
    }

    async fn get_step_history(
        &self,
        story_id: &str,
        step_name: Option<&str>,
    ) -> Result<Vec<StepHistory>, LedgerError> {
        self.ensure_open()?;
        let sql = format!(
            "SELECT id, story_id, step_name, run_id, status, error_message, execution_time_ms, timestamp
             FROM {}
             WHERE story_id = $1 AND ($2::text IS NULL OR step_name = $2::text)
             ORDER BY id ASC",
            self.t("step_history")
        );
        let rows = sqlx::query(&sql)
            .bind(story_id)
            .bind(step_name)
            .fetch_all(&self.pool)
            .await?;
        let mut history = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            history.push(StepHistory {
                id: row.try_get("id")?,
                story_id: row.try_get("story_id")?,
                step_name: row.try_get("step_name")?,
                run_id: row.try_get("run_id")?,
                status: status
                    .parse::<StepState>()
                    .map_err(|e| LedgerError::Database(anyhow!(e)))?,
                error_message: row.try_get("error_message")?,
                execution_time_ms: row.try_get("execution_time_ms")?,
                timestamp: row.try_get("timestamp")?,
            });
        }
        Ok(history)
    }

    async fn get_step_statistics(&self) -> Result<StepStatistics, LedgerError> {
        self.ensure_open()?;
        let sql = format!(
            "SELECT step_name, status, COUNT(*) AS n FROM {} GROUP BY step_name, status",
            self.t("step_status")
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut stats = StepStatistics::new();
        for row in rows {
            let step: String = row.try_get("step_name")?;
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("n")?;
            stats.entry(step).or_default().insert(status, count);
        }
        Ok(stats)
    }

    async fn list_stale_running(
        &self,
        step_name: Option<&str>,
        lease_timeout: Duration,
    ) -> Result<Vec<StepStatus>, LedgerError> {
        self.ensure_open()?;
        if let Some(step) = step_name {
            resolve_step(&self.registry, step)?;
        }
        let sql = format!(
            "{} WHERE status = 'running'
                 AND (heartbeat_at IS NULL OR heartbeat_at < $1)
                 AND ($2::text IS NULL OR step_name = $2::text)
             ORDER BY heartbeat_at ASC NULLS FIRST, story_id ASC",
            self.status_select()
        );
        let rows = sqlx::query(&sql)
            .bind(lease_cutoff(lease_timeout))
            .bind(step_name)
            .fetch_all(&self.pool)
            .await?;
        into_statuses(rows)
    }

    async fn close(&self) -> Result<(), LedgerError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.pool.close().await;
        }
        Ok(())
    }
}
