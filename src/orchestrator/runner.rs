use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{Orchestrator, RunOutcome};
use crate::errors::OrchestratorError;
use crate::fallback::provenance;
use crate::handler::HandlerOutcome;
use crate::journal::RunRecord;
use crate::ledger::{Ledger, NewHistory, StepState, StepUpdate, now_ts};

/// Floor for the heartbeat interval.
const MIN_HEARTBEAT: Duration = Duration::from_millis(100);

impl Orchestrator {
    /// Execute the handler bound to `step_name` for one story.
    ///
    /// The row is marked running first, then completed or failed with a
    /// history row carrying the wall-clock time. Handler failures, errors and
    /// panics all come back as `success = false`. The journal always gets a
    /// record; the ledger writes degrade when it is unreachable.
    pub async fn run_step(
        &self,
        story_id: &str,
        step_name: &str,
        run_id: &str,
    ) -> Result<RunOutcome, OrchestratorError> {
        self.require_story_id(story_id)?;
        self.require_run_id(run_id)?;
        self.require_step(step_name)?;
        let handler = self
            .handlers
            .get(step_name)
            .cloned()
            .ok_or_else(|| OrchestratorError::NoHandler {
                step: step_name.to_string(),
            })?;
        let snapshot = self.lookup_story(story_id).await?;
        let ctx = self.context(story_id, step_name, run_id)?;
        std::fs::create_dir_all(&ctx.output_dir).map_err(|source| OrchestratorError::Io {
            path: ctx.output_dir.clone(),
            source,
        })?;

        let started_at = now_ts();
        let mut running_recorded = false;
        if let Some(ledger) = &self.ledger {
            let update = StepUpdate::running(run_id).started_at(&started_at);
            running_recorded = self
                .degrade(
                    "mark running",
                    ledger.update_step_status(story_id, step_name, &update).await,
                )?
                .is_some();
        }
        tracing::info!(story_id, step = step_name, run_id, "step started");

        let heartbeat = match (&self.ledger, running_recorded) {
            (Some(ledger), true) => Some(spawn_heartbeat(
                ledger.clone(),
                story_id,
                step_name,
                run_id,
                self.config.lease_timeout,
            )),
            _ => None,
        };

        let start = Instant::now();
        let task_ctx = ctx.clone();
        let joined = tokio::spawn(async move { handler.run(&task_ctx).await }).await;
        let elapsed = start.elapsed();
        if let Some(task) = heartbeat {
            task.abort();
        }

        let error = match joined {
            Ok(Ok(HandlerOutcome::Success)) => None,
            Ok(Ok(HandlerOutcome::Failure(message))) => Some(message),
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(join_err) => Some(panic_message(join_err)),
        };
        let status = if error.is_none() {
            StepState::Completed
        } else {
            StepState::Failed
        };
        let execution_time_ms = i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX);

        let (status_recorded, history_recorded) = match &self.ledger {
            Some(ledger) => {
                let mut update = StepUpdate::new(status).run_id(run_id);
                if let Some(err) = &error {
                    update = update.error(err);
                }
                let status_ok = self
                    .degrade(
                        "record status",
                        ledger.update_step_status(story_id, step_name, &update).await,
                    )?
                    .is_some();
                let history = NewHistory {
                    story_id: story_id.to_string(),
                    step_name: step_name.to_string(),
                    run_id: Some(run_id.to_string()),
                    status,
                    error_message: error.clone(),
                    execution_time_ms,
                };
                let history_ok = self
                    .degrade("record history", ledger.add_step_history(&history).await)?
                    .is_some();
                (status_ok, history_ok)
            }
            None => (false, false),
        };
        let ledger_recorded = status_recorded && history_recorded;

        let mut record = RunRecord::new(story_id, step_name, run_id, status);
        record.error_message = error.clone();
        record.execution_time_ms = Some(execution_time_ms);
        record.started_at = Some(started_at);
        record.history_synced = history_recorded;
        record.ledger_synced = ledger_recorded;
        if snapshot.is_none() {
            record.source = Some(provenance(&ctx.input_path).to_string());
        }
        if let Err(e) = self.journal.write(&record) {
            tracing::warn!(story_id, step = step_name, error = %e, "could not write run record");
        }

        match &error {
            None => tracing::info!(story_id, step = step_name, run_id, execution_time_ms, "step completed"),
            Some(err) => tracing::warn!(story_id, step = step_name, run_id, execution_time_ms, error = %err, "step failed"),
        }

        Ok(RunOutcome {
            story_id: story_id.to_string(),
            step_name: step_name.to_string(),
            run_id: run_id.to_string(),
            success: error.is_none(),
            error,
            execution_time_ms,
            ledger_recorded,
        })
    }
}

/// Refresh the lease while the handler runs. Aborted once it returns.
fn spawn_heartbeat(
    ledger: Arc<dyn Ledger>,
    story_id: &str,
    step_name: &str,
    run_id: &str,
    lease_timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    let (story_id, step_name, run_id) =
        (story_id.to_string(), step_name.to_string(), run_id.to_string());
    let period = (lease_timeout / 3).max(MIN_HEARTBEAT);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            match ledger.heartbeat(&story_id, &step_name, &run_id).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(story_id = %story_id, step = %step_name, "lease lost to another run");
                    break;
                }
                Err(e) => tracing::warn!(story_id = %story_id, error = %e, "heartbeat failed"),
            }
        }
    })
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return format!("handler task cancelled: {}", err);
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}
