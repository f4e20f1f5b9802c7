//! Ledger and reporting commands: `init`, `register`, `status`, `stats`,
//! `stale`, `reconcile`, `steps`.

use anyhow::{Context, Result};
use serde_json::json;
use std::path::Path;

use storyflow::ledger::StoryRegistration;

use super::super::Cli;
use super::{Session, load_config, print_json};

pub async fn cmd_init(cli: &Cli, project_dir: &Path) -> Result<bool> {
    let config = load_config(cli, project_dir)?;
    config.ensure_directories()?;
    let session = Session::open(cli, project_dir).await?;
    if !session.config.disable_ledger {
        session.require_ledger()?;
    }
    print_json(&json!({
        "project_dir": session.config.project_dir,
        "output_root": session.config.output_root,
        "run_root": session.config.run_root,
        "backend": session.ledger.as_ref().map(|l| l.backend_name()),
        "steps": session.config.steps.steps(),
    }))?;
    session.close().await?;
    Ok(true)
}

pub async fn cmd_register(
    cli: &Cli,
    project_dir: &Path,
    story_id: &str,
    title: Option<&str>,
    source: Option<&str>,
    metadata: Option<&str>,
) -> Result<bool> {
    let mut registration = StoryRegistration::new(story_id).source(source.unwrap_or("manual"));
    if let Some(title) = title {
        registration = registration.title(title);
    }
    if let Some(raw) = metadata {
        let value: serde_json::Value =
            serde_json::from_str(raw).context("--metadata must be valid JSON")?;
        registration = registration.metadata(value);
    }

    let session = Session::open(cli, project_dir).await?;
    let id = session
        .require_ledger()?
        .register_story(&registration)
        .await
        .with_context(|| format!("Failed to register story {}", story_id))?;
    print_json(&json!({ "story_id": id }))?;
    session.close().await?;
    Ok(true)
}

pub async fn cmd_status(cli: &Cli, project_dir: &Path, story_id: &str) -> Result<bool> {
    let session = Session::open(cli, project_dir).await?;
    let snapshot = session.orchestrator.story_status(story_id).await?;
    print_json(&snapshot)?;
    session.close().await?;
    Ok(true)
}

pub async fn cmd_stats(cli: &Cli, project_dir: &Path) -> Result<bool> {
    let session = Session::open(cli, project_dir).await?;
    let stats = session.orchestrator.step_statistics().await?;
    print_json(&stats)?;
    session.close().await?;
    Ok(true)
}

pub async fn cmd_stale(cli: &Cli, project_dir: &Path, step: Option<&str>) -> Result<bool> {
    let session = Session::open(cli, project_dir).await?;
    let stale = session.orchestrator.stale_running(step).await?;
    print_json(&stale)?;
    session.close().await?;
    Ok(true)
}

pub async fn cmd_reconcile(cli: &Cli, project_dir: &Path) -> Result<bool> {
    let session = Session::open(cli, project_dir).await?;
    session.require_ledger()?;
    let replayed = session.orchestrator.reconcile().await?;
    print_json(&json!({ "replayed": replayed }))?;
    session.close().await?;
    Ok(true)
}

pub fn cmd_steps(cli: &Cli, project_dir: &Path) -> Result<bool> {
    let config = load_config(cli, project_dir)?;
    let registry = &config.steps;
    let steps: Vec<_> = registry
        .steps()
        .iter()
        .map(|name| {
            json!({
                "number": registry.number(name),
                "name": name,
                "previous": registry.previous(name).ok().flatten(),
                "next": registry.next(name),
                "command": config.command_for(name),
                "timeout_secs": config.timeout_for(name).map(|t| t.as_secs()),
                "output_dir": config.step_dir(name),
            })
        })
        .collect();
    print_json(&steps)?;
    Ok(true)
}
