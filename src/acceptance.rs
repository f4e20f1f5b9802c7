//! Declarative acceptance criteria evaluated against step artifacts.
//!
//! Thresholds come from configuration; nothing here knows what a step
//! produces beyond "a JSON object or plain text".

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::fallback::find_artifact;
use crate::handler::{AcceptanceChecker, AcceptanceVerdict, StepContext};

/// Per-step acceptance thresholds. Unset bounds are not checked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptanceCriteria {
    /// JSON fields that must be present and non-null.
    #[serde(default)]
    pub required_fields: Vec<String>,
    /// Minimum content length in characters.
    #[serde(default)]
    pub min_length: Option<usize>,
    #[serde(default)]
    pub min_words: Option<usize>,
    #[serde(default)]
    pub max_words: Option<usize>,
    #[serde(default)]
    pub min_scenes: Option<usize>,
    #[serde(default)]
    pub min_quality_score: Option<f64>,
    #[serde(default = "default_content_field")]
    pub content_field: String,
    #[serde(default = "default_scenes_field")]
    pub scenes_field: String,
    #[serde(default = "default_quality_field")]
    pub quality_field: String,
}

fn default_content_field() -> String {
    "content".to_string()
}

fn default_scenes_field() -> String {
    "scenes".to_string()
}

fn default_quality_field() -> String {
    "quality_score".to_string()
}

impl Default for AcceptanceCriteria {
    fn default() -> Self {
        Self {
            required_fields: Vec::new(),
            min_length: None,
            min_words: None,
            max_words: None,
            min_scenes: None,
            min_quality_score: None,
            content_field: default_content_field(),
            scenes_field: default_scenes_field(),
            quality_field: default_quality_field(),
        }
    }
}

impl AcceptanceCriteria {
    /// Built-in thresholds for the reference pipeline's steps.
    pub fn default_for_step(step: &str) -> Self {
        match step {
            "generate" => Self {
                min_words: Some(50),
                max_words: Some(20_000),
                min_scenes: Some(1),
                ..Self::default()
            },
            "postprocess" => Self {
                min_quality_score: Some(0.5),
                ..Self::default()
            },
            _ => Self {
                min_length: Some(1),
                ..Self::default()
            },
        }
    }

    /// Overlay non-empty settings from `other` onto `self`.
    pub fn merge(&mut self, other: &AcceptanceCriteria) {
        if !other.required_fields.is_empty() {
            self.required_fields = other.required_fields.clone();
        }
        if other.min_length.is_some() {
            self.min_length = other.min_length;
        }
        if other.min_words.is_some() {
            self.min_words = other.min_words;
        }
        if other.max_words.is_some() {
            self.max_words = other.max_words;
        }
        if other.min_scenes.is_some() {
            self.min_scenes = other.min_scenes;
        }
        if other.min_quality_score.is_some() {
            self.min_quality_score = other.min_quality_score;
        }
        if other.content_field != default_content_field() {
            self.content_field = other.content_field.clone();
        }
        if other.scenes_field != default_scenes_field() {
            self.scenes_field = other.scenes_field.clone();
        }
        if other.quality_field != default_quality_field() {
            self.quality_field = other.quality_field.clone();
        }
    }

    /// Configuration warnings, e.g. inverted word bounds.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if let (Some(min), Some(max)) = (self.min_words, self.max_words)
            && min > max
        {
            warnings.push(format!("min_words ({}) exceeds max_words ({})", min, max));
        }
        if let Some(score) = self.min_quality_score
            && !score.is_finite()
        {
            warnings.push("min_quality_score is not a finite number".to_string());
        }
        warnings
    }

    /// Evaluate artifact text. Every configured bound is checked and all
    /// failures are reported together.
    pub fn evaluate(&self, text: &str) -> AcceptanceVerdict {
        let parsed: Option<serde_json::Map<String, Value>> =
            match serde_json::from_str::<Value>(text) {
                Ok(Value::Object(map)) => Some(map),
                _ => None,
            };

        let mut failures = Vec::new();
        let mut checks = Vec::new();

        for field in &self.required_fields {
            let present = parsed
                .as_ref()
                .and_then(|m| m.get(field))
                .is_some_and(|v| !v.is_null());
            if !present {
                failures.push(format!("missing required field '{}'", field));
            }
        }
        if !self.required_fields.is_empty() {
            checks.push(format!("{} required fields", self.required_fields.len()));
        }

        let content = parsed
            .as_ref()
            .and_then(|m| m.get(&self.content_field))
            .and_then(Value::as_str)
            .unwrap_or(text)
            .trim();

        if let Some(min) = self.min_length {
            let len = content.chars().count();
            if len < min {
                failures.push(format!("content length {} below minimum {}", len, min));
            }
            checks.push(format!("length {}", len));
        }

        if self.min_words.is_some() || self.max_words.is_some() {
            let words = content.split_whitespace().count();
            if let Some(min) = self.min_words
                && words < min
            {
                failures.push(format!("word count {} below minimum {}", words, min));
            }
            if let Some(max) = self.max_words
                && words > max
            {
                failures.push(format!("word count {} above maximum {}", words, max));
            }
            checks.push(format!("{} words", words));
        }

        if let Some(min) = self.min_scenes {
            let scenes = parsed
                .as_ref()
                .and_then(|m| m.get(&self.scenes_field))
                .and_then(Value::as_array)
                .map(Vec::len)
                .unwrap_or(0);
            if scenes < min {
                failures.push(format!("scene count {} below minimum {}", scenes, min));
            }
            checks.push(format!("{} scenes", scenes));
        }

        if let Some(min) = self.min_quality_score {
            match parsed
                .as_ref()
                .and_then(|m| m.get(&self.quality_field))
                .and_then(Value::as_f64)
            {
                Some(score) if score >= min => checks.push(format!("quality {:.2}", score)),
                Some(score) => failures.push(format!(
                    "quality score {:.2} below minimum {:.2}",
                    score, min
                )),
                None => failures.push(format!(
                    "missing numeric '{}' for quality threshold",
                    self.quality_field
                )),
            }
        }

        if !failures.is_empty() {
            return AcceptanceVerdict::reject(failures.join("; "));
        }
        if checks.is_empty() {
            AcceptanceVerdict::pass("artifact present; no criteria configured")
        } else {
            AcceptanceVerdict::pass(format!("passed: {}", checks.join(", ")))
        }
    }
}

/// Checks a step's artifact on disk against `AcceptanceCriteria`.
pub struct ArtifactChecker {
    criteria: AcceptanceCriteria,
}

impl ArtifactChecker {
    pub fn new(criteria: AcceptanceCriteria) -> Self {
        Self { criteria }
    }

    pub fn criteria(&self) -> &AcceptanceCriteria {
        &self.criteria
    }
}

#[async_trait]
impl AcceptanceChecker for ArtifactChecker {
    async fn check(&self, ctx: &StepContext) -> Result<AcceptanceVerdict> {
        let path = if ctx.output_path.exists() {
            Some(ctx.output_path.clone())
        } else {
            find_artifact(&ctx.output_dir, &ctx.story_id)
        };
        let Some(path) = path else {
            return Ok(AcceptanceVerdict::reject(format!(
                "no artifact for story {} in {}",
                ctx.story_id,
                ctx.output_dir.display()
            )));
        };
        let text = tokio::fs::read_to_string(&path).await?;
        Ok(self.criteria.evaluate(&text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn words(n: usize) -> String {
        vec!["word"; n].join(" ")
    }

    #[test]
    fn test_passes_when_all_bounds_hold() {
        let criteria = AcceptanceCriteria {
            required_fields: vec!["title".into()],
            min_words: Some(3),
            max_words: Some(10),
            min_scenes: Some(2),
            min_quality_score: Some(0.7),
            ..Default::default()
        };
        let artifact = serde_json::json!({
            "title": "A tale",
            "content": words(5),
            "scenes": [{"n": 1}, {"n": 2}],
            "quality_score": 0.9
        });
        let verdict = criteria.evaluate(&artifact.to_string());
        assert!(verdict.passed, "{}", verdict.reason);
        assert!(verdict.reason.contains("5 words"));
        assert!(verdict.reason.contains("2 scenes"));
    }

    #[test]
    fn test_reports_every_failure() {
        let criteria = AcceptanceCriteria {
            required_fields: vec!["title".into()],
            max_words: Some(2),
            min_scenes: Some(1),
            min_quality_score: Some(0.5),
            ..Default::default()
        };
        let artifact = serde_json::json!({ "content": words(4), "quality_score": 0.1 });
        let verdict = criteria.evaluate(&artifact.to_string());
        assert!(!verdict.passed);
        assert!(verdict.reason.contains("missing required field 'title'"));
        assert!(verdict.reason.contains("above maximum 2"));
        assert!(verdict.reason.contains("scene count 0"));
        assert!(verdict.reason.contains("quality score 0.10"));
        assert_eq!(verdict.reason.matches("; ").count(), 3);
    }

    #[test]
    fn test_plain_text_supplies_content_only() {
        let criteria = AcceptanceCriteria {
            min_length: Some(5),
            ..Default::default()
        };
        assert!(criteria.evaluate("hello world").passed);
        assert!(!criteria.evaluate("hi").passed);

        let needs_quality = AcceptanceCriteria {
            min_quality_score: Some(0.1),
            ..Default::default()
        };
        let verdict = needs_quality.evaluate("plain text");
        assert!(!verdict.passed);
        assert!(verdict.reason.contains("missing numeric 'quality_score'"));
    }

    #[test]
    fn test_null_required_field_is_missing() {
        let criteria = AcceptanceCriteria {
            required_fields: vec!["summary".into()],
            ..Default::default()
        };
        assert!(!criteria.evaluate(r#"{"summary": null}"#).passed);
        assert!(criteria.evaluate(r#"{"summary": ""}"#).passed);
    }

    #[test]
    fn test_custom_field_names() {
        let criteria = AcceptanceCriteria {
            min_words: Some(2),
            content_field: "body".into(),
            ..Default::default()
        };
        assert!(criteria.evaluate(r#"{"body": "two words"}"#).passed);
        assert!(!criteria.evaluate(r#"{"body": "one"}"#).passed);
    }

    #[test]
    fn test_no_criteria_passes() {
        let verdict = AcceptanceCriteria::default().evaluate("");
        assert!(verdict.passed);
        assert!(verdict.reason.contains("no criteria"));
    }

    #[test]
    fn test_merge_overlays_set_values() {
        let mut base = AcceptanceCriteria::default_for_step("generate");
        base.merge(&AcceptanceCriteria {
            min_words: Some(500),
            ..Default::default()
        });
        assert_eq!(base.min_words, Some(500));
        assert_eq!(base.max_words, Some(20_000));
        assert_eq!(base.min_scenes, Some(1));
    }

    #[test]
    fn test_validate_flags_inverted_bounds() {
        let criteria = AcceptanceCriteria {
            min_words: Some(10),
            max_words: Some(5),
            ..Default::default()
        };
        assert_eq!(criteria.validate().len(), 1);
        assert!(AcceptanceCriteria::default_for_step("generate").validate().is_empty());
    }

    #[tokio::test]
    async fn test_artifact_checker_missing_artifact_is_rejection() {
        let dir = tempdir().unwrap();
        let output_dir = dir.path().join("generate");
        let ctx = StepContext {
            story_id: "s9".into(),
            run_id: "r".into(),
            step_name: "generate".into(),
            input_path: dir.path().join("preprocess/s9.json"),
            output_path: output_dir.join("s9.json"),
            output_dir,
        };
        let checker = ArtifactChecker::new(AcceptanceCriteria::default());
        let verdict = checker.check(&ctx).await.unwrap();
        assert!(!verdict.passed);
        assert!(verdict.reason.contains("no artifact"));
    }

    #[tokio::test]
    async fn test_artifact_checker_finds_other_extension() {
        let dir = tempdir().unwrap();
        let output_dir = dir.path().join("ingest");
        std::fs::create_dir_all(&output_dir).unwrap();
        std::fs::write(output_dir.join("s1.txt"), "some raw text").unwrap();
        let ctx = StepContext {
            story_id: "s1".into(),
            run_id: "r".into(),
            step_name: "ingest".into(),
            input_path: dir.path().join("input/s1.txt"),
            output_path: output_dir.join("s1.json"),
            output_dir,
        };
        let checker = ArtifactChecker::new(AcceptanceCriteria::default_for_step("ingest"));
        assert!(checker.check(&ctx).await.unwrap().passed);
    }
}
