//! Scheduling commands: `pick`, `run`, `check`.

use anyhow::Result;
use serde_json::json;
use std::path::Path;

use super::super::Cli;
use super::{Session, new_run_id, print_json};

pub async fn cmd_pick(
    cli: &Cli,
    project_dir: &Path,
    step: &str,
    run_id: Option<String>,
) -> Result<bool> {
    let run_id = run_id.unwrap_or_else(new_run_id);
    let session = Session::open(cli, project_dir).await?;
    let picked = session.orchestrator.pick_one_candidate(step, &run_id).await?;
    match picked {
        Some(story_id) => print_json(&json!({
            "story_id": story_id,
            "step": step,
            "run_id": run_id,
        }))?,
        None => print_json(&serde_json::Value::Null)?,
    }
    session.close().await?;
    Ok(true)
}

/// Exits non-zero when the handler failed.
pub async fn cmd_run(
    cli: &Cli,
    project_dir: &Path,
    step: &str,
    story_id: &str,
    run_id: Option<String>,
) -> Result<bool> {
    let run_id = run_id.unwrap_or_else(new_run_id);
    let session = Session::open(cli, project_dir).await?;
    let outcome = session
        .orchestrator
        .run_step(story_id, step, &run_id)
        .await?;
    print_json(&outcome)?;
    session.close().await?;
    Ok(outcome.success)
}

/// Exits non-zero when acceptance was rejected.
pub async fn cmd_check(cli: &Cli, project_dir: &Path, step: &str, story_id: &str) -> Result<bool> {
    let session = Session::open(cli, project_dir).await?;
    let verdict = session
        .orchestrator
        .check_acceptance(story_id, step)
        .await?;
    print_json(&json!({
        "story_id": story_id,
        "step": step,
        "passed": verdict.passed,
        "reason": verdict.reason,
    }))?;
    session.close().await?;
    Ok(verdict.passed)
}
