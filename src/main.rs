use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

mod cmd;

#[derive(Parser)]
#[command(name = "storyflow")]
#[command(version, about = "Story pipeline orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Skip the ledger and use filesystem fallback only
    #[arg(long, global = true)]
    pub no_ledger: bool,

    /// Ledger location (overrides STORYFLOW_DATABASE_URL)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create output directories and the ledger schema
    Init,
    /// Register a story (idempotent)
    Register {
        story_id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        source: Option<String>,
        /// JSON object stored with the story
        #[arg(long)]
        metadata: Option<String>,
    },
    /// Claim one ready story for a step
    Pick {
        step: String,
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Run a step's handler for one story
    Run {
        step: String,
        story_id: String,
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Evaluate acceptance criteria for a story's step output
    Check { step: String, story_id: String },
    /// Full status for one story
    Status { story_id: String },
    /// Story counts per step and status
    Stats,
    /// Running rows whose lease has expired
    Stale {
        #[arg(long)]
        step: Option<String>,
    },
    /// Replay run records written while the ledger was unavailable
    Reconcile,
    /// List the configured steps
    Steps,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    cmd::init_tracing(cli.verbose);

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let ok = match &cli.command {
        Commands::Init => cmd::cmd_init(&cli, &project_dir).await?,
        Commands::Register {
            story_id,
            title,
            source,
            metadata,
        } => {
            cmd::cmd_register(
                &cli,
                &project_dir,
                story_id,
                title.as_deref(),
                source.as_deref(),
                metadata.as_deref(),
            )
            .await?
        }
        Commands::Pick { step, run_id } => {
            cmd::cmd_pick(&cli, &project_dir, step, run_id.clone()).await?
        }
        Commands::Run {
            step,
            story_id,
            run_id,
        } => cmd::cmd_run(&cli, &project_dir, step, story_id, run_id.clone()).await?,
        Commands::Check { step, story_id } => {
            cmd::cmd_check(&cli, &project_dir, step, story_id).await?
        }
        Commands::Status { story_id } => cmd::cmd_status(&cli, &project_dir, story_id).await?,
        Commands::Stats => cmd::cmd_stats(&cli, &project_dir).await?,
        Commands::Stale { step } => cmd::cmd_stale(&cli, &project_dir, step.as_deref()).await?,
        Commands::Reconcile => cmd::cmd_reconcile(&cli, &project_dir).await?,
        Commands::Steps => cmd::cmd_steps(&cli, &project_dir)?,
    };

    Ok(if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
