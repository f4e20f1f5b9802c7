//! Layered configuration for storyflow.
//!
//! Values are resolved in order, later layers winning:
//! 1. built-in defaults
//! 2. `storyflow.toml` in the project directory
//! 3. `.env` in the project directory (loaded into the process environment)
//! 4. process environment (`STORYFLOW_*`)
//! 5. CLI overrides
//!
//! # Configuration File Format
//!
//! ```toml
//! [paths]
//! run_root = "runs"
//! output_root = "output"
//! input_dir = "output/input"
//!
//! [ledger]
//! database_url = "sqlite://.storyflow/ledger.db"
//! schema = "storyflow"
//! disabled = false
//! lease_timeout_secs = 3600
//!
//! [pipeline]
//! steps = ["ingest", "preprocess", "generate", "postprocess", "package"]
//! artifact_extension = "json"
//!
//! [steps.generate]
//! command = "./bin/generate.sh"
//! min_words = 200
//! max_words = 5000
//! min_scenes = 3
//! ```

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::acceptance::AcceptanceCriteria;
use crate::steps::StepRegistry;

pub const CONFIG_FILE: &str = "storyflow.toml";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://.storyflow/ledger.db";
pub const DEFAULT_SCHEMA: &str = "storyflow";
pub const DEFAULT_LEASE_TIMEOUT_SECS: u64 = 3600;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsSection {
    #[serde(default)]
    pub run_root: Option<PathBuf>,
    #[serde(default)]
    pub output_root: Option<PathBuf>,
    #[serde(default)]
    pub input_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerSection {
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub disabled: Option<bool>,
    #[serde(default)]
    pub lease_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineSection {
    #[serde(default)]
    pub steps: Option<Vec<String>>,
    #[serde(default)]
    pub artifact_extension: Option<String>,
}

/// Per-step settings: the handler command plus acceptance thresholds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepSection {
    #[serde(default)]
    pub command: Option<String>,
    /// Kill the step command after this many seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(flatten)]
    pub acceptance: AcceptanceCriteria,
}

/// Parsed `storyflow.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoryflowToml {
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub ledger: LedgerSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub steps: BTreeMap<String, StepSection>,
}

impl StoryflowToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid storyflow.toml")
    }

    pub fn load_or_default(project_dir: &Path) -> Result<Self> {
        let path = project_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }
}

/// Where the ledger lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerBackend {
    SqliteFile(PathBuf),
    SqliteMemory,
    Postgres { url: String, schema: String },
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    /// Run-scoped metadata (the run journal) is written here.
    pub run_root: PathBuf,
    /// Each step writes `<output_root>/<step>/<story_id>.<ext>`.
    pub output_root: PathBuf,
    /// Input scanned by the first step in fallback mode.
    pub input_dir: PathBuf,
    pub database_url: String,
    pub db_schema: String,
    pub disable_ledger: bool,
    pub lease_timeout: Duration,
    pub artifact_extension: String,
    pub steps: StepRegistry,
    acceptance: BTreeMap<String, AcceptanceCriteria>,
    commands: BTreeMap<String, String>,
    timeouts: BTreeMap<String, Duration>,
}

impl Config {
    /// Load configuration for a project directory from file, `.env` and the
    /// process environment.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let dotenv = project_dir.join(".env");
        if dotenv.exists() {
            dotenvy::from_path(&dotenv)
                .with_context(|| format!("Failed to load {}", dotenv.display()))?;
        }
        let toml = StoryflowToml::load_or_default(project_dir)?;
        Self::from_sources(project_dir, &toml, |key| std::env::var(key).ok())
    }

    /// Defaults only, rooted at `project_dir`.
    pub fn defaults(project_dir: &Path) -> Result<Self> {
        Self::from_sources(project_dir, &StoryflowToml::default(), |_| None)
    }

    /// Resolve configuration from a parsed file and an environment lookup.
    pub fn from_sources<F>(project_dir: &Path, toml: &StoryflowToml, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let project_dir = project_dir.to_path_buf();
        let resolve = |p: PathBuf| {
            if p.is_absolute() {
                p
            } else {
                project_dir.join(p)
            }
        };

        let steps = match env("STORYFLOW_STEPS") {
            Some(list) => StepRegistry::parse_list(&list).context("Invalid STORYFLOW_STEPS")?,
            None => match &toml.pipeline.steps {
                Some(list) => StepRegistry::new(list.clone()).context("Invalid [pipeline] steps")?,
                None => StepRegistry::default(),
            },
        };

        let run_root = env("STORYFLOW_RUN_ROOT")
            .map(PathBuf::from)
            .or_else(|| toml.paths.run_root.clone())
            .unwrap_or_else(|| PathBuf::from("runs"));
        let output_root = resolve(
            env("STORYFLOW_OUTPUT_ROOT")
                .map(PathBuf::from)
                .or_else(|| toml.paths.output_root.clone())
                .unwrap_or_else(|| PathBuf::from("output")),
        );
        let input_dir = env("STORYFLOW_INPUT_DIR")
            .map(PathBuf::from)
            .or_else(|| toml.paths.input_dir.clone())
            .map(&resolve)
            .unwrap_or_else(|| output_root.join("input"));

        let database_url = env("STORYFLOW_DATABASE_URL")
            .or_else(|| toml.ledger.database_url.clone())
            .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());
        let db_schema = env("STORYFLOW_DB_SCHEMA")
            .or_else(|| toml.ledger.schema.clone())
            .unwrap_or_else(|| DEFAULT_SCHEMA.to_string());
        let disable_ledger = match env("STORYFLOW_DISABLE_LEDGER") {
            Some(v) => parse_bool(&v)
                .with_context(|| format!("Invalid STORYFLOW_DISABLE_LEDGER '{}'", v))?,
            None => toml.ledger.disabled.unwrap_or(false),
        };
        let lease_secs = match env("STORYFLOW_LEASE_TIMEOUT_SECS") {
            Some(v) => v
                .trim()
                .parse::<u64>()
                .with_context(|| format!("Invalid STORYFLOW_LEASE_TIMEOUT_SECS '{}'", v))?,
            None => toml
                .ledger
                .lease_timeout_secs
                .unwrap_or(DEFAULT_LEASE_TIMEOUT_SECS),
        };
        if lease_secs == 0 {
            bail!("Lease timeout must be at least one second");
        }
        let artifact_extension = toml
            .pipeline
            .artifact_extension
            .clone()
            .unwrap_or_else(|| "json".to_string());

        let mut acceptance = BTreeMap::new();
        let mut commands = BTreeMap::new();
        let mut timeouts = BTreeMap::new();
        for step in steps.steps() {
            let mut criteria = AcceptanceCriteria::default_for_step(step);
            let mut timeout_secs = None;
            if let Some(section) = toml.steps.get(step) {
                criteria.merge(&section.acceptance);
                if let Some(cmd) = &section.command {
                    commands.insert(step.clone(), cmd.clone());
                }
                timeout_secs = section.timeout_secs;
            }
            apply_env_thresholds(step, &mut criteria, &env)?;
            if let Some(cmd) = env(&step_env_key(step, "COMMAND")) {
                commands.insert(step.clone(), cmd);
            }
            let timeout_key = step_env_key(step, "TIMEOUT_SECS");
            if let Some(v) = env(&timeout_key) {
                timeout_secs = Some(
                    v.trim()
                        .parse::<u64>()
                        .with_context(|| format!("Invalid {} '{}'", timeout_key, v))?,
                );
            }
            match timeout_secs {
                Some(0) => bail!("{} must be at least one second", timeout_key),
                Some(secs) => {
                    timeouts.insert(step.clone(), Duration::from_secs(secs));
                }
                None => {}
            }
            acceptance.insert(step.clone(), criteria);
        }

        for name in toml.steps.keys() {
            if !steps.contains(name) {
                tracing::warn!(step = %name, "[steps.{}] does not match any pipeline step", name);
            }
        }

        Ok(Self {
            run_root: resolve(run_root),
            output_root,
            input_dir,
            database_url,
            db_schema,
            disable_ledger,
            lease_timeout: Duration::from_secs(lease_secs),
            artifact_extension,
            steps,
            acceptance,
            commands,
            timeouts,
            project_dir,
        })
    }

    /// Apply CLI overrides.
    pub fn with_overrides(mut self, no_ledger: bool, database_url: Option<String>) -> Self {
        if no_ledger {
            self.disable_ledger = true;
        }
        if let Some(url) = database_url {
            self.database_url = url;
        }
        self
    }

    /// Acceptance thresholds for a step (defaults for unknown steps).
    pub fn criteria_for(&self, step: &str) -> AcceptanceCriteria {
        self.acceptance
            .get(step)
            .cloned()
            .unwrap_or_else(|| AcceptanceCriteria::default_for_step(step))
    }

    pub fn command_for(&self, step: &str) -> Option<&str> {
        self.commands.get(step).map(String::as_str)
    }

    /// Limit for the step's command, if one is configured.
    pub fn timeout_for(&self, step: &str) -> Option<Duration> {
        self.timeouts.get(step).copied()
    }

    pub fn step_dir(&self, step: &str) -> PathBuf {
        self.output_root.join(step)
    }

    pub fn artifact_path(&self, step: &str, story_id: &str) -> PathBuf {
        self.step_dir(step)
            .join(format!("{}.{}", story_id, self.artifact_extension))
    }

    pub fn backend(&self) -> Result<LedgerBackend> {
        let url = self.database_url.trim();
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            return Ok(LedgerBackend::Postgres {
                url: url.to_string(),
                schema: self.db_schema.clone(),
            });
        }
        let path = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
            .unwrap_or(url);
        if path.is_empty() {
            bail!("Empty database path in '{}'", self.database_url);
        }
        if path == ":memory:" {
            return Ok(LedgerBackend::SqliteMemory);
        }
        if url.contains("://") && !url.starts_with("sqlite://") {
            bail!("Unsupported database URL '{}'", self.database_url);
        }
        let path = PathBuf::from(path);
        Ok(LedgerBackend::SqliteFile(if path.is_absolute() {
            path
        } else {
            self.project_dir.join(path)
        }))
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.run_root).context("Failed to create run root directory")?;
        std::fs::create_dir_all(&self.input_dir).context("Failed to create input directory")?;
        for step in self.steps.steps() {
            std::fs::create_dir_all(self.step_dir(step))
                .with_context(|| format!("Failed to create output directory for step {}", step))?;
        }
        if let Ok(LedgerBackend::SqliteFile(path)) = self.backend()
            && let Some(parent) = path.parent()
        {
            std::fs::create_dir_all(parent).context("Failed to create ledger directory")?;
        }
        Ok(())
    }

    /// Configuration warnings that do not prevent running.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if let Err(e) = self.backend() {
            warnings.push(e.to_string());
        }
        for (step, criteria) in &self.acceptance {
            for w in criteria.validate() {
                warnings.push(format!("step {}: {}", step, w));
            }
        }
        warnings
    }
}

/// `STORYFLOW_<STEP>_<KEY>`, with `-` in step names mapped to `_`.
pub fn step_env_key(step: &str, key: &str) -> String {
    format!(
        "STORYFLOW_{}_{}",
        step.to_ascii_uppercase().replace('-', "_"),
        key
    )
}

fn apply_env_thresholds<F>(step: &str, criteria: &mut AcceptanceCriteria, env: &F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let parse_usize = |key: &str| -> Result<Option<usize>> {
        let name = step_env_key(step, key);
        env(&name)
            .map(|v| {
                v.trim()
                    .parse::<usize>()
                    .with_context(|| format!("Invalid {} '{}'", name, v))
            })
            .transpose()
    };

    if let Some(v) = parse_usize("MIN_LENGTH")? {
        criteria.min_length = Some(v);
    }
    if let Some(v) = parse_usize("MIN_WORDS")? {
        criteria.min_words = Some(v);
    }
    if let Some(v) = parse_usize("MAX_WORDS")? {
        criteria.max_words = Some(v);
    }
    if let Some(v) = parse_usize("MIN_SCENES")? {
        criteria.min_scenes = Some(v);
    }
    let score_key = step_env_key(step, "MIN_QUALITY_SCORE");
    if let Some(v) = env(&score_key) {
        let score = v
            .trim()
            .parse::<f64>()
            .with_context(|| format!("Invalid {} '{}'", score_key, v))?;
        criteria.min_quality_score = Some(score);
    }
    if let Some(v) = env(&step_env_key(step, "REQUIRED_FIELDS")) {
        criteria.required_fields = v
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }
    Ok(())
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => bail!("expected a boolean, got '{}'", other),
    }
}
