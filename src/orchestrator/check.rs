use uuid::Uuid;

use super::Orchestrator;
use crate::errors::OrchestratorError;
use crate::fallback::provenance;
use crate::handler::AcceptanceVerdict;
use crate::journal::RunRecord;
use crate::ledger::{StepState, StepUpdate};

impl Orchestrator {
    /// Evaluate a step's artifact and write the verdict back.
    ///
    /// A pass marks the step completed, a rejection marks it failed; both are
    /// normal outcomes. A checker that errors counts as a rejection.
    pub async fn check_acceptance(
        &self,
        story_id: &str,
        step_name: &str,
    ) -> Result<AcceptanceVerdict, OrchestratorError> {
        self.require_story_id(story_id)?;
        self.require_step(step_name)?;
        let checker = self
            .checkers
            .get(step_name)
            .cloned()
            .ok_or_else(|| OrchestratorError::NoHandler {
                step: step_name.to_string(),
            })?;
        let snapshot = self.lookup_story(story_id).await?;

        // Attribute the check to the run that produced the artifact.
        let prior = self.journal.latest(step_name, story_id)?;
        let run_id = snapshot
            .as_ref()
            .and_then(|s| s.step(step_name))
            .and_then(|row| row.run_id.clone())
            .or_else(|| prior.as_ref().map(|r| r.run_id.clone()))
            .unwrap_or_else(|| format!("check-{}", Uuid::new_v4().simple()));
        let ctx = self.context(story_id, step_name, &run_id)?;

        let verdict = match checker.check(&ctx).await {
            Ok(verdict) => verdict,
            Err(e) => AcceptanceVerdict::reject(format!("acceptance check errored: {:#}", e)),
        };
        let status = if verdict.passed {
            StepState::Completed
        } else {
            StepState::Failed
        };

        let mut recorded = false;
        if let Some(ledger) = &self.ledger {
            let mut update = StepUpdate::new(status)
                .run_id(&run_id)
                .acceptance(verdict.passed, &verdict.reason);
            if !verdict.passed {
                update = update.error(format!("acceptance rejected: {}", verdict.reason));
            }
            recorded = self
                .degrade(
                    "record acceptance",
                    ledger.update_step_status(story_id, step_name, &update).await,
                )?
                .is_some();
        }

        let mut record = match self.journal.find(&run_id, step_name, story_id)? {
            Some(existing) => existing,
            None => RunRecord::new(story_id, step_name, &run_id, status),
        };
        record.status = status;
        record.error_message =
            (!verdict.passed).then(|| format!("acceptance rejected: {}", verdict.reason));
        record.acceptance = Some(verdict.clone());
        record.finished_at = crate::ledger::now_ts();
        if snapshot.is_none() && record.source.is_none() {
            record.source = Some(provenance(&ctx.input_path).to_string());
        }
        // An unsynced execution still owes the ledger its history row.
        record.ledger_synced =
            recorded && (record.history_synced || record.execution_time_ms.is_none());
        if let Err(e) = self.journal.write(&record) {
            tracing::warn!(story_id, step = step_name, error = %e, "could not write run record");
        }

        tracing::info!(
            story_id,
            step = step_name,
            passed = verdict.passed,
            reason = %verdict.reason,
            "acceptance checked"
        );
        Ok(verdict)
    }
}
