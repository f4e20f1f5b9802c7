//! Degraded-mode candidate discovery from step output directories.
//!
//! Used only when the ledger cannot be reached. A story is ready for a step
//! when the previous step's directory holds an artifact whose stem has no
//! counterpart in the step's own directory. No locking is performed: this
//! path is single-writer only.

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Where a fallback candidate came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackCandidate {
    /// Found as an unprocessed artifact in the upstream directory.
    Discovered { story_id: String, artifact: PathBuf },
    /// No input existed for the first step; a fresh id was minted.
    Synthesized { story_id: String },
}

impl FallbackCandidate {
    pub fn story_id(&self) -> &str {
        match self {
            Self::Discovered { story_id, .. } | Self::Synthesized { story_id } => story_id,
        }
    }

    /// Provenance tag recorded when the story is registered.
    pub fn source(&self) -> &'static str {
        match self {
            Self::Discovered { .. } => DISCOVERED_SOURCE,
            Self::Synthesized { .. } => SYNTHESIZED_SOURCE,
        }
    }
}

const DISCOVERED_SOURCE: &str = "filesystem";
const SYNTHESIZED_SOURCE: &str = "auto-generated";

/// Provenance for a story the ledger has not seen, judged by whether its
/// input artifact exists on disk.
pub fn provenance(input_path: &Path) -> &'static str {
    if input_path.is_file() {
        DISCOVERED_SOURCE
    } else {
        SYNTHESIZED_SOURCE
    }
}

pub struct FilesystemScanner;

impl FilesystemScanner {
    /// Earliest artifact in `upstream` not mirrored (by stem) in `current`.
    /// Missing directories are treated as empty.
    pub fn next_unprocessed(upstream: &Path, current: &Path) -> Result<Option<(String, PathBuf)>> {
        let done: HashSet<String> = list_artifacts(current)?
            .into_iter()
            .map(|a| a.stem)
            .collect();

        let mut pending: Vec<Artifact> = list_artifacts(upstream)?
            .into_iter()
            .filter(|a| !done.contains(&a.stem))
            .collect();
        pending.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.stem.cmp(&b.stem)));

        Ok(pending.into_iter().next().map(|a| (a.stem, a.path)))
    }

    /// Pick a candidate for a step. `first_step` controls whether a fresh
    /// story id is minted when nothing is pending upstream.
    pub fn pick(upstream: &Path, current: &Path, first_step: bool) -> Result<Option<FallbackCandidate>> {
        if let Some((story_id, artifact)) = Self::next_unprocessed(upstream, current)? {
            return Ok(Some(FallbackCandidate::Discovered { story_id, artifact }));
        }
        if first_step {
            return Ok(Some(FallbackCandidate::Synthesized {
                story_id: synthesize_story_id(),
            }));
        }
        Ok(None)
    }
}

/// Story id derived from the current time, e.g. `story_20261019_142501_123456`.
pub fn synthesize_story_id() -> String {
    format!("story_{}", Utc::now().format("%Y%m%d_%H%M%S_%6f"))
}

/// Locate the artifact for `story_id` in `dir`, whatever its extension.
pub fn find_artifact(dir: &Path, story_id: &str) -> Option<PathBuf> {
    list_artifacts(dir)
        .ok()?
        .into_iter()
        .filter(|a| a.stem == story_id)
        .map(|a| a.path)
        .min()
}

struct Artifact {
    stem: String,
    path: PathBuf,
    modified: SystemTime,
}

fn list_artifacts(dir: &Path) -> Result<Vec<Artifact>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut artifacts = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))? {
        let entry = entry.context("Failed to read directory entry")?;
        let path = entry.path();
        let meta = match entry.metadata() {
            Ok(m) if m.is_file() => m,
            _ => continue,
        };
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if stem.is_empty() || stem.starts_with('.') {
            continue;
        }
        artifacts.push(Artifact {
            stem: stem.to_string(),
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            path,
        });
    }
    Ok(artifacts)
}
