use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status of a `(story, step)` row. "Pending" is the absence of a row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Running,
    Completed,
    Failed,
}

impl StepState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid step status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Story {
    pub story_id: String,
    pub title: Option<String>,
    pub source: Option<String>,
    pub metadata: Option<Value>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepStatus {
    pub story_id: String,
    pub step_name: String,
    pub status: StepState,
    pub run_id: Option<String>,
    pub error_message: Option<String>,
    pub acceptance_passed: Option<bool>,
    pub acceptance_details: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub heartbeat_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepHistory {
    pub id: i64,
    pub story_id: String,
    pub step_name: String,
    pub run_id: Option<String>,
    pub status: StepState,
    pub error_message: Option<String>,
    pub execution_time_ms: i64,
    pub timestamp: String,
}

/// Full status of one story: the story row plus every step row, ordered by
/// step name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorySnapshot {
    pub story: Story,
    pub steps: Vec<StepStatus>,
}

impl StorySnapshot {
    pub fn step(&self, step_name: &str) -> Option<&StepStatus> {
        self.steps.iter().find(|s| s.step_name == step_name)
    }
}

/// `step_name -> status -> count`.
pub type StepStatistics = BTreeMap<String, BTreeMap<String, i64>>;

/// Input to `register_story`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StoryRegistration {
    pub story_id: String,
    pub title: Option<String>,
    pub source: Option<String>,
    pub metadata: Option<Value>,
}

impl StoryRegistration {
    pub fn new(story_id: impl Into<String>) -> Self {
        Self {
            story_id: story_id.into(),
            ..Default::default()
        }
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub(crate) fn metadata_json(&self) -> Option<String> {
        self.metadata.as_ref().map(Value::to_string)
    }
}

/// Input to `update_step_status`.
///
/// Unset optional fields keep their stored values, except `error_message`
/// which is always overwritten and the acceptance fields which are cleared
/// when a row re-enters `running`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepUpdate {
    pub status: StepState,
    pub run_id: Option<String>,
    pub error_message: Option<String>,
    pub acceptance_passed: Option<bool>,
    pub acceptance_details: Option<String>,
    /// Explicit start time; otherwise `running` stamps "now" unless the row
    /// is already running under the same run id.
    pub started_at: Option<String>,
}

impl StepUpdate {
    pub fn new(status: StepState) -> Self {
        Self {
            status,
            run_id: None,
            error_message: None,
            acceptance_passed: None,
            acceptance_details: None,
            started_at: None,
        }
    }

    pub fn running(run_id: impl Into<String>) -> Self {
        Self::new(StepState::Running).run_id(run_id)
    }

    pub fn completed() -> Self {
        Self::new(StepState::Completed)
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self::new(StepState::Failed).error(error)
    }

    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error_message = Some(error.into());
        self
    }

    pub fn acceptance(mut self, passed: bool, details: impl Into<String>) -> Self {
        self.acceptance_passed = Some(passed);
        self.acceptance_details = Some(details.into());
        self
    }

    pub fn started_at(mut self, started_at: impl Into<String>) -> Self {
        self.started_at = Some(started_at.into());
        self
    }
}

/// Input to `add_step_history`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewHistory {
    pub story_id: String,
    pub step_name: String,
    pub run_id: Option<String>,
    pub status: StepState,
    pub error_message: Option<String>,
    pub execution_time_ms: i64,
}

/// Intermediate row for `step_status`, shared by both backends.
pub(crate) struct StepStatusRow {
    pub story_id: String,
    pub step_name: String,
    pub status: String,
    pub run_id: Option<String>,
    pub error_message: Option<String>,
    pub acceptance_passed: Option<bool>,
    pub acceptance_details: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub heartbeat_at: Option<String>,
}

impl StepStatusRow {
    pub fn into_status(self) -> anyhow::Result<StepStatus> {
        let status = StepState::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?;
        Ok(StepStatus {
            story_id: self.story_id,
            step_name: self.step_name,
            status,
            run_id: self.run_id,
            error_message: self.error_message,
            acceptance_passed: self.acceptance_passed,
            acceptance_details: self.acceptance_details,
            started_at: self.started_at,
            completed_at: self.completed_at,
            heartbeat_at: self.heartbeat_at,
        })
    }
}

/// Intermediate row for `stories`; metadata is JSON text on disk.
pub(crate) struct StoryRow {
    pub story_id: String,
    pub title: Option<String>,
    pub source: Option<String>,
    pub metadata: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl StoryRow {
    pub fn into_story(self) -> anyhow::Result<Story> {
        let metadata = match self.metadata {
            Some(text) => Some(
                serde_json::from_str(&text)
                    .map_err(|e| anyhow::anyhow!("Failed to parse story metadata JSON: {}", e))?,
            ),
            None => None,
        };
        Ok(Story {
            story_id: self.story_id,
            title: self.title,
            source: self.source,
            metadata,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_state_round_trips_through_str() {
        for state in [StepState::Running, StepState::Completed, StepState::Failed] {
            assert_eq!(state.as_str().parse::<StepState>().unwrap(), state);
        }
        assert!("pending".parse::<StepState>().is_err());
    }

    #[test]
    fn test_step_update_builders() {
        let u = StepUpdate::failed("boom").run_id("r1");
        assert_eq!(u.status, StepState::Failed);
        assert_eq!(u.error_message.as_deref(), Some("boom"));
        assert_eq!(u.run_id.as_deref(), Some("r1"));

        let a = StepUpdate::completed().acceptance(true, "ok");
        assert_eq!(a.acceptance_passed, Some(true));
        assert_eq!(a.acceptance_details.as_deref(), Some("ok"));
    }

    #[test]
    fn test_story_row_rejects_bad_metadata() {
        let row = StoryRow {
            story_id: "s".into(),
            title: None,
            source: None,
            metadata: Some("{not json".into()),
            created_at: String::new(),
            updated_at: String::new(),
        };
        assert!(row.into_story().is_err());
    }
}
