//! Per-run JSON journal under `<run_root>/<run_id>/<step>/<story_id>.json`.
//!
//! Every `run_step` and `check_acceptance` leaves a record here whether or not
//! the ledger accepted the write. Records written while the ledger was down
//! carry `ledger_synced = false` and are replayed by `reconcile`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::handler::AcceptanceVerdict;
use crate::ledger::{Ledger, NewHistory, StepState, StepUpdate, StoryRegistration, now_ts};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub story_id: String,
    pub step_name: String,
    pub run_id: String,
    pub status: StepState,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Set when the handler actually executed; absent for check-only records.
    #[serde(default)]
    pub execution_time_ms: Option<i64>,
    #[serde(default)]
    pub acceptance: Option<AcceptanceVerdict>,
    /// Provenance tag used when the story has to be registered on replay.
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
    pub finished_at: String,
    #[serde(default)]
    pub history_synced: bool,
    #[serde(default)]
    pub ledger_synced: bool,
}

impl RunRecord {
    pub fn new(story_id: &str, step_name: &str, run_id: &str, status: StepState) -> Self {
        Self {
            story_id: story_id.to_string(),
            step_name: step_name.to_string(),
            run_id: run_id.to_string(),
            status,
            error_message: None,
            execution_time_ms: None,
            acceptance: None,
            source: None,
            started_at: None,
            finished_at: now_ts(),
            history_synced: false,
            ledger_synced: false,
        }
    }
}

pub struct RunJournal {
    root: PathBuf,
}

impl RunJournal {
    pub fn new(run_root: &Path) -> Self {
        Self {
            root: run_root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn record_path(&self, run_id: &str, step_name: &str, story_id: &str) -> PathBuf {
        self.root
            .join(run_id)
            .join(step_name)
            .join(format!("{}.json", story_id))
    }

    /// Write (or replace) a record. The file is swapped in by rename so a
    /// crash never leaves a half-written record behind.
    pub fn write(&self, record: &RunRecord) -> Result<PathBuf> {
        let path = self.record_path(&record.run_id, &record.step_name, &record.story_id);
        let dir = path
            .parent()
            .context("Run record path has no parent directory")?;
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create run directory {}", dir.display()))?;

        let json = serde_json::to_string_pretty(record).context("Failed to serialize run record")?;
        let tmp = dir.join(format!(".{}.json.tmp", record.story_id));
        fs::write(&tmp, json).context("Failed to write run record")?;
        fs::rename(&tmp, &path).context("Failed to move run record into place")?;
        Ok(path)
    }

    pub fn load(&self, path: &Path) -> Result<RunRecord> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read run record {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse run record {}", path.display()))
    }

    pub fn find(&self, run_id: &str, step_name: &str, story_id: &str) -> Result<Option<RunRecord>> {
        let path = self.record_path(run_id, step_name, story_id);
        if !path.exists() {
            return Ok(None);
        }
        self.load(&path).map(Some)
    }

    /// Most recent record for a story at a step, across all runs.
    ///
    /// Only `<run_root>/*/<step>/<story>.json` is read, so the cost grows
    /// with the number of runs rather than the number of records.
    pub fn latest(&self, step_name: &str, story_id: &str) -> Result<Option<RunRecord>> {
        let mut latest: Option<RunRecord> = None;
        for run_dir in subdirs(&self.root)? {
            let path = run_dir
                .join(step_name)
                .join(format!("{}.json", story_id));
            if !path.is_file() {
                continue;
            }
            let record = match self.load(&path) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %format!("{:#}", e), "skipping unreadable run record");
                    continue;
                }
            };
            if latest
                .as_ref()
                .is_none_or(|l| record.finished_at > l.finished_at)
            {
                latest = Some(record);
            }
        }
        Ok(latest)
    }

    /// All record files, sorted by path.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        let mut records = Vec::new();
        for run_dir in subdirs(&self.root)? {
            for step_dir in subdirs(&run_dir)? {
                let entries = fs::read_dir(&step_dir)
                    .with_context(|| format!("Failed to read {}", step_dir.display()))?;
                records.extend(
                    entries
                        .filter_map(|e| e.ok())
                        .map(|e| e.path())
                        .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
                        .filter(|p| !is_hidden(p)),
                );
            }
        }
        records.sort();
        Ok(records)
    }

    /// Records the ledger has not seen yet, oldest first. Unreadable files
    /// are logged and skipped so they cannot block the rest.
    pub fn unsynced(&self) -> Result<Vec<(PathBuf, RunRecord)>> {
        let mut pending = Vec::new();
        for path in self.list()? {
            let record = match self.load(&path) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %format!("{:#}", e), "skipping unreadable run record");
                    continue;
                }
            };
            if !record.ledger_synced {
                pending.push((path, record));
            }
        }
        pending.sort_by(|a, b| a.1.finished_at.cmp(&b.1.finished_at));
        Ok(pending)
    }

    /// Replay unsynced records into the ledger, marking each one synced as
    /// it lands. Returns how many records were replayed.
    pub async fn reconcile(&self, ledger: &dyn Ledger) -> Result<usize> {
        let mut replayed = 0;
        for (path, mut record) in self.unsynced()? {
            let mut registration = StoryRegistration::new(&record.story_id);
            if let Some(source) = &record.source {
                registration = registration.source(source);
            }
            ledger
                .register_story(&registration)
                .await
                .with_context(|| format!("Failed to register story {}", record.story_id))?;

            let mut update = StepUpdate::new(record.status).run_id(&record.run_id);
            if let Some(err) = &record.error_message {
                update = update.error(err);
            }
            if let Some(verdict) = &record.acceptance {
                update = update.acceptance(verdict.passed, &verdict.reason);
            }
            if let Some(started) = &record.started_at {
                update = update.started_at(started);
            }
            ledger
                .update_step_status(&record.story_id, &record.step_name, &update)
                .await
                .with_context(|| format!("Failed to replay status for {}", record.story_id))?;

            if let Some(ms) = record.execution_time_ms
                && !record.history_synced
            {
                ledger
                    .add_step_history(&NewHistory {
                        story_id: record.story_id.clone(),
                        step_name: record.step_name.clone(),
                        run_id: Some(record.run_id.clone()),
                        status: record.status,
                        error_message: record.error_message.clone(),
                        execution_time_ms: ms,
                    })
                    .await
                    .with_context(|| format!("Failed to replay history for {}", record.story_id))?;
            }

            record.history_synced = true;
            record.ledger_synced = true;
            self.write(&record)?;
            tracing::info!(
                story_id = %record.story_id,
                step = %record.step_name,
                run_id = %record.run_id,
                path = %path.display(),
                "replayed run record into ledger"
            );
            replayed += 1;
        }
        Ok(replayed)
    }
}

fn subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut dirs: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read {}", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir() && !is_hidden(p))
        .collect();
    dirs.sort();
    Ok(dirs)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(true)
}
