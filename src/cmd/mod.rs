//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module   | Commands handled                                          |
//! |----------|-----------------------------------------------------------|
//! | `ledger` | `Init`, `Register`, `Status`, `Stats`, `Stale`, `Reconcile`, `Steps` |
//! | `step`   | `Pick`, `Run`, `Check`                                    |
//!
//! Every command prints one JSON document on stdout. Logs go to stderr.

pub mod ledger;
pub mod step;

pub use ledger::{
    cmd_init, cmd_reconcile, cmd_register, cmd_stale, cmd_stats, cmd_status, cmd_steps,
};
pub use step::{cmd_check, cmd_pick, cmd_run};

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use storyflow::config::Config;
use storyflow::handler::CommandHandler;
use storyflow::ledger::{Ledger, open_ledger};
use storyflow::orchestrator::Orchestrator;

use super::Cli;

/// `STORYFLOW_LOG` wins over `RUST_LOG`; `STORYFLOW_LOG_FORMAT=json`
/// switches to structured output.
pub fn init_tracing(verbose: bool) {
    let default = if verbose { "storyflow=debug" } else { "warn" };
    let filter = std::env::var("STORYFLOW_LOG")
        .ok()
        .and_then(|s| EnvFilter::try_new(s).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(default));

    let json = std::env::var("STORYFLOW_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Resolved config, an optional ledger, and an orchestrator wired with the
/// configured step commands.
pub struct Session {
    pub config: Config,
    pub ledger: Option<Arc<dyn Ledger>>,
    pub orchestrator: Orchestrator,
}

impl Session {
    pub async fn open(cli: &Cli, project_dir: &Path) -> Result<Self> {
        let config = load_config(cli, project_dir)?;
        let registry = config.steps.clone();

        let ledger = if config.disable_ledger {
            tracing::info!("ledger disabled, using filesystem fallback");
            None
        } else {
            match open_ledger(&config, registry.clone()).await {
                Ok(ledger) => Some(ledger),
                Err(e) if e.is_unavailable() => {
                    tracing::warn!(error = %e, "ledger unavailable, continuing degraded");
                    None
                }
                Err(e) => return Err(e).context("Failed to open ledger"),
            }
        };

        let mut builder = Orchestrator::builder(config.clone(), registry.clone());
        if let Some(ledger) = &ledger {
            builder = builder.ledger(ledger.clone());
        }
        for step in registry.steps() {
            if let Some(command) = config.command_for(step) {
                let mut handler = CommandHandler::new(command, config.project_dir.clone());
                if let Some(limit) = config.timeout_for(step) {
                    handler = handler.with_timeout(limit);
                }
                builder = builder.handler(step.clone(), Arc::new(handler));
            }
        }
        let orchestrator = builder.build()?;

        Ok(Self {
            config,
            ledger,
            orchestrator,
        })
    }

    pub fn require_ledger(&self) -> Result<&Arc<dyn Ledger>> {
        self.ledger.as_ref().context(if self.config.disable_ledger {
            "This command needs the ledger, but it is disabled"
        } else {
            "This command needs the ledger, but it is unavailable"
        })
    }

    pub async fn close(self) -> Result<()> {
        if let Some(ledger) = self.ledger {
            ledger.close().await.context("Failed to close ledger")?;
        }
        Ok(())
    }
}

pub fn load_config(cli: &Cli, project_dir: &Path) -> Result<Config> {
    let config = Config::load(project_dir)?.with_overrides(cli.no_ledger, cli.database_url.clone());
    for warning in config.validate() {
        tracing::warn!("config: {}", warning);
    }
    Ok(config)
}

/// Run ids default to a sortable timestamp plus a short random suffix.
pub fn new_run_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "run_{}_{}",
        chrono::Utc::now().format("%Y%m%d_%H%M%S"),
        &suffix[..8]
    )
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", json);
    Ok(())
}
