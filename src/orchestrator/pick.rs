use super::Orchestrator;
use crate::errors::OrchestratorError;
use crate::fallback::{FallbackCandidate, FilesystemScanner};
use crate::ledger::StoryRegistration;

impl Orchestrator {
    /// Claim one ready story for `step_name` on behalf of `run_id`.
    ///
    /// With a reachable ledger this is an atomic claim: the story comes back
    /// already marked running under `run_id`, and concurrent callers never
    /// receive the same story. Without one, the filesystem is scanned instead
    /// (single writer only).
    pub async fn pick_one_candidate(
        &self,
        step_name: &str,
        run_id: &str,
    ) -> Result<Option<String>, OrchestratorError> {
        self.require_step(step_name)?;
        self.require_run_id(run_id)?;

        if let Some(ledger) = &self.ledger {
            let claimed = ledger
                .claim_candidate(step_name, run_id, self.config.lease_timeout)
                .await;
            if let Some(claimed) = self.degrade("claim candidate", claimed)? {
                match &claimed {
                    Some(story_id) => {
                        tracing::info!(step = step_name, run_id, story_id = %story_id, "claimed story")
                    }
                    None => tracing::debug!(step = step_name, "no story ready"),
                }
                return Ok(claimed);
            }
        }

        self.pick_from_filesystem(step_name).await
    }

    async fn pick_from_filesystem(
        &self,
        step_name: &str,
    ) -> Result<Option<String>, OrchestratorError> {
        let upstream = match self.require_step(step_name)? {
            Some(prev) => self.config.step_dir(prev),
            None => self.config.input_dir.clone(),
        };
        let current = self.config.step_dir(step_name);
        let first = self.registry.is_first(step_name);

        let Some(candidate) = FilesystemScanner::pick(&upstream, &current, first)? else {
            tracing::debug!(step = step_name, upstream = %upstream.display(), "nothing pending on disk");
            return Ok(None);
        };
        tracing::warn!(
            step = step_name,
            story_id = candidate.story_id(),
            source = candidate.source(),
            "picked story from filesystem fallback"
        );

        // Best effort: the ledger may still accept writes even if the claim failed.
        if let Some(ledger) = &self.ledger {
            let mut registration =
                StoryRegistration::new(candidate.story_id()).source(candidate.source());
            if let FallbackCandidate::Discovered { artifact, .. } = &candidate {
                registration = registration.metadata(serde_json::json!({
                    "discovered_from": artifact.display().to_string(),
                }));
            }
            if let Err(e) = ledger.register_story(&registration).await {
                tracing::warn!(story_id = candidate.story_id(), error = %e, "could not register fallback story");
            }
        }

        Ok(Some(candidate.story_id().to_string()))
    }
}
