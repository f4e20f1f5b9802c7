//! Scheduling engine: pick a ready story, run its step, check acceptance.
//!
//! The orchestrator never loops. Each call is one logical action and all
//! state lives in the ledger, the run journal, and the artifacts on disk.
//! When the ledger is unreachable, candidate selection falls back to the
//! filesystem and writes are kept in the journal for later reconciliation.

mod check;
mod pick;
mod runner;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::acceptance::ArtifactChecker;
use crate::config::Config;
use crate::errors::{LedgerError, OrchestratorError};
use crate::fallback::find_artifact;
use crate::handler::{AcceptanceChecker, StepContext, StepHandler};
use crate::journal::RunJournal;
use crate::ledger::{Ledger, StepStatistics, StepStatus, StorySnapshot, validate_run_id, validate_story_id};
use crate::steps::StepRegistry;

/// Structured result of `run_step`. Handler failure is `success = false`,
/// never an `Err`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub story_id: String,
    pub step_name: String,
    pub run_id: String,
    pub success: bool,
    pub error: Option<String>,
    pub execution_time_ms: i64,
    /// False when the final status or history write could not reach the
    /// ledger; the journal record is then left unsynced.
    pub ledger_recorded: bool,
}

pub struct Orchestrator {
    config: Config,
    registry: StepRegistry,
    ledger: Option<Arc<dyn Ledger>>,
    handlers: HashMap<String, Arc<dyn StepHandler>>,
    checkers: HashMap<String, Arc<dyn AcceptanceChecker>>,
    journal: RunJournal,
}

pub struct OrchestratorBuilder {
    config: Config,
    registry: StepRegistry,
    ledger: Option<Arc<dyn Ledger>>,
    handlers: HashMap<String, Arc<dyn StepHandler>>,
    checkers: HashMap<String, Arc<dyn AcceptanceChecker>>,
}

impl OrchestratorBuilder {
    pub fn ledger(mut self, ledger: Arc<dyn Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn handler(mut self, step: impl Into<String>, handler: Arc<dyn StepHandler>) -> Self {
        self.handlers.insert(step.into(), handler);
        self
    }

    pub fn checker(mut self, step: impl Into<String>, checker: Arc<dyn AcceptanceChecker>) -> Self {
        self.checkers.insert(step.into(), checker);
        self
    }

    /// Steps without an explicit checker get an `ArtifactChecker` built from
    /// their configured thresholds.
    pub fn build(self) -> Result<Orchestrator, OrchestratorError> {
        for step in self.handlers.keys().chain(self.checkers.keys()) {
            if !self.registry.contains(step) {
                return Err(OrchestratorError::UnknownStep(step.clone()));
            }
        }

        let mut checkers = self.checkers;
        for step in self.registry.steps() {
            checkers.entry(step.clone()).or_insert_with(|| {
                Arc::new(ArtifactChecker::new(self.config.criteria_for(step)))
                    as Arc<dyn AcceptanceChecker>
            });
        }

        let journal = RunJournal::new(&self.config.run_root);
        Ok(Orchestrator {
            config: self.config,
            registry: self.registry,
            ledger: self.ledger,
            handlers: self.handlers,
            checkers,
            journal,
        })
    }
}

impl Orchestrator {
    pub fn builder(config: Config, registry: StepRegistry) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            registry,
            ledger: None,
            handlers: HashMap::new(),
            checkers: HashMap::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> Option<&Arc<dyn Ledger>> {
        self.ledger.as_ref()
    }

    pub fn journal(&self) -> &RunJournal {
        &self.journal
    }

    /// Full status for one story. `None` when the story is unknown or the
    /// ledger cannot be reached.
    pub async fn story_status(
        &self,
        story_id: &str,
    ) -> Result<Option<StorySnapshot>, OrchestratorError> {
        let Some(ledger) = &self.ledger else {
            return Ok(None);
        };
        Ok(self
            .degrade("story status", ledger.get_story_status(story_id).await)?
            .flatten())
    }

    /// Aggregate counts, or `None` when the ledger cannot be reached.
    pub async fn step_statistics(&self) -> Result<Option<StepStatistics>, OrchestratorError> {
        let Some(ledger) = &self.ledger else {
            return Ok(None);
        };
        self.degrade("step statistics", ledger.get_step_statistics().await)
    }

    /// Running rows whose lease has lapsed.
    pub async fn stale_running(
        &self,
        step_name: Option<&str>,
    ) -> Result<Option<Vec<StepStatus>>, OrchestratorError> {
        if let Some(step) = step_name {
            self.require_step(step)?;
        }
        let Some(ledger) = &self.ledger else {
            return Ok(None);
        };
        self.degrade(
            "stale listing",
            ledger
                .list_stale_running(step_name, self.config.lease_timeout)
                .await,
        )
    }

    /// Replay journal records written while the ledger was down.
    pub async fn reconcile(&self) -> Result<usize, OrchestratorError> {
        let ledger = self.ledger.as_ref().ok_or_else(|| {
            OrchestratorError::InvalidArgument("reconcile requires a ledger".to_string())
        })?;
        Ok(self.journal.reconcile(ledger.as_ref()).await?)
    }

    /// Paths a collaborator sees for one story at one step.
    pub fn context(
        &self,
        story_id: &str,
        step_name: &str,
        run_id: &str,
    ) -> Result<StepContext, OrchestratorError> {
        let prev = self.require_step(step_name)?;
        let input_path = match prev {
            Some(prev) => find_artifact(&self.config.step_dir(prev), story_id)
                .unwrap_or_else(|| self.config.artifact_path(prev, story_id)),
            None => find_artifact(&self.config.input_dir, story_id).unwrap_or_else(|| {
                self.config
                    .input_dir
                    .join(format!("{}.{}", story_id, self.config.artifact_extension))
            }),
        };
        Ok(StepContext {
            story_id: story_id.to_string(),
            run_id: run_id.to_string(),
            step_name: step_name.to_string(),
            input_path,
            output_path: self.config.artifact_path(step_name, story_id),
            output_dir: self.config.step_dir(step_name),
        })
    }

    /// Resolve a step, returning its predecessor.
    fn require_step(&self, step_name: &str) -> Result<Option<&str>, OrchestratorError> {
        self.registry
            .previous(step_name)
            .map_err(|_| OrchestratorError::UnknownStep(step_name.to_string()))
    }

    fn require_story_id(&self, story_id: &str) -> Result<(), OrchestratorError> {
        validate_story_id(story_id).map_err(invalid_argument)
    }

    fn require_run_id(&self, run_id: &str) -> Result<(), OrchestratorError> {
        validate_run_id(run_id).map_err(invalid_argument)
    }

    /// Outage-class ledger errors become `None` so the caller can carry on
    /// degraded; everything else is a real error.
    fn degrade<T>(
        &self,
        action: &str,
        res: Result<T, LedgerError>,
    ) -> Result<Option<T>, OrchestratorError> {
        match res {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_unavailable() => {
                tracing::warn!(action, error = %e, "ledger unavailable, continuing without it");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fail fast on stories the ledger has never seen. Skipped when the
    /// ledger is down.
    async fn lookup_story(
        &self,
        story_id: &str,
    ) -> Result<Option<StorySnapshot>, OrchestratorError> {
        let Some(ledger) = &self.ledger else {
            return Ok(None);
        };
        match self.degrade("story lookup", ledger.get_story_status(story_id).await)? {
            Some(None) => Err(OrchestratorError::InvalidArgument(format!(
                "unknown story '{}'",
                story_id
            ))),
            Some(snapshot) => Ok(snapshot),
            None => Ok(None),
        }
    }
}

fn invalid_argument(e: LedgerError) -> OrchestratorError {
    match e {
        LedgerError::InvalidArgument(msg) => OrchestratorError::InvalidArgument(msg),
        other => other.into(),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::ledger::{
        NewHistory, SqliteLedger, StepHistory, StepUpdate, StoryRegistration,
    };
    use async_trait::async_trait;
    use std::path::Path;
    use std::time::Duration;

    pub fn config_in(dir: &Path) -> Config {
        Config::defaults(dir).expect("default config")
    }

    pub async fn sqlite(registry: &StepRegistry) -> Arc<dyn Ledger> {
        let ledger = SqliteLedger::open_in_memory(registry.clone()).expect("open ledger");
        ledger.initialize().await.expect("initialize");
        Arc::new(ledger)
    }

    /// Ledger double whose every call reports an outage.
    pub struct DownLedger {
        pub registry: StepRegistry,
    }

    fn down<T>() -> Result<T, LedgerError> {
        Err(LedgerError::Unavailable(anyhow::anyhow!("connection refused")))
    }

    #[async_trait]
    impl Ledger for DownLedger {
        fn backend_name(&self) -> &'static str {
            "down"
        }
        fn registry(&self) -> &StepRegistry {
            &self.registry
        }
        async fn initialize(&self) -> Result<(), LedgerError> {
            down()
        }
        async fn register_story(&self, _: &StoryRegistration) -> Result<String, LedgerError> {
            down()
        }
        async fn update_step_status(&self, _: &str, _: &str, _: &StepUpdate) -> Result<(), LedgerError> {
            down()
        }
        async fn add_step_history(&self, _: &NewHistory) -> Result<(), LedgerError> {
            down()
        }
        async fn get_pending_stories(&self, _: &str, _: usize) -> Result<Vec<String>, LedgerError> {
            down()
        }
        async fn claim_candidate(
            &self,
            _: &str,
            _: &str,
            _: Duration,
        ) -> Result<Option<String>, LedgerError> {
            down()
        }
        async fn heartbeat(&self, _: &str, _: &str, _: &str) -> Result<bool, LedgerError> {
            down()
        }
        async fn get_story_status(&self, _: &str) -> Result<Option<StorySnapshot>, LedgerError> {
            down()
        }
        async fn get_step_history(
            &self,
            _: &str,
            _: Option<&str>,
        ) -> Result<Vec<StepHistory>, LedgerError> {
            down()
        }
        async fn get_step_statistics(&self) -> Result<StepStatistics, LedgerError> {
            down()
        }
        async fn list_stale_running(
            &self,
            _: Option<&str>,
            _: Duration,
        ) -> Result<Vec<StepStatus>, LedgerError> {
            down()
        }
        async fn close(&self) -> Result<(), LedgerError> {
            Ok(())
        }
    }
}
