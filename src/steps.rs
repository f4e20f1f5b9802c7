//! Ordered step registry for the story pipeline.
//!
//! A registry is the single source of truth for step order. The step that
//! gates another is always found by index, so step names carry no meaning
//! beyond identity.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Reference pipeline used when no step list is configured.
pub const DEFAULT_STEPS: [&str; 5] = ["ingest", "preprocess", "generate", "postprocess", "package"];

/// Fixed, ordered list of named steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRegistry {
    steps: Vec<String>,
}

impl StepRegistry {
    /// Build a registry from an ordered list of names.
    ///
    /// Names must be non-empty, unique, and limited to `[a-z0-9_-]` so they
    /// are safe to use as directory names.
    pub fn new<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let steps: Vec<String> = names.into_iter().map(Into::into).collect();
        if steps.is_empty() {
            bail!("Step registry must contain at least one step");
        }
        for (i, name) in steps.iter().enumerate() {
            if !is_valid_step_name(name) {
                bail!(
                    "Invalid step name '{}': use lowercase letters, digits, '-' or '_'",
                    name
                );
            }
            if steps[..i].contains(name) {
                bail!("Duplicate step name '{}'", name);
            }
        }
        Ok(Self { steps })
    }

    /// Parse a comma-separated step list, e.g. `"ingest,generate,package"`.
    pub fn parse_list(list: &str) -> Result<Self> {
        Self::new(
            list.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        )
    }

    pub fn steps(&self) -> &[String] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn first(&self) -> &str {
        &self.steps[0]
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn is_first(&self, name: &str) -> bool {
        self.position(name) == Some(0)
    }

    /// Zero-based index of a step.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s == name)
    }

    /// One-based step number, as shown to operators.
    pub fn number(&self, name: &str) -> Option<usize> {
        self.position(name).map(|i| i + 1)
    }

    /// The step that must complete before `name` becomes eligible.
    /// `Ok(None)` for the first step; error for an unknown step.
    pub fn previous(&self, name: &str) -> Result<Option<&str>> {
        match self.position(name) {
            Some(0) => Ok(None),
            Some(i) => Ok(Some(self.steps[i - 1].as_str())),
            None => bail!("Unknown step '{}'", name),
        }
    }

    pub fn next(&self, name: &str) -> Option<&str> {
        let i = self.position(name)?;
        self.steps.get(i + 1).map(String::as_str)
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self {
            steps: DEFAULT_STEPS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

fn is_valid_step_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_has_reference_steps() {
        let reg = StepRegistry::default();
        assert_eq!(reg.len(), 5);
        assert_eq!(reg.first(), "ingest");
        assert_eq!(reg.number("generate"), Some(3));
        assert_eq!(reg.number("package"), Some(5));
    }

    #[test]
    fn test_previous_is_derived_by_index() {
        let reg = StepRegistry::new(["step1", "step2", "step3"]).unwrap();
        assert_eq!(reg.previous("step1").unwrap(), None);
        assert_eq!(reg.previous("step2").unwrap(), Some("step1"));
        assert_eq!(reg.previous("step3").unwrap(), Some("step2"));
        assert!(reg.previous("step4").is_err());
    }

    #[test]
    fn test_previous_does_not_parse_names() {
        // Names that look numbered out of order still follow registry order.
        let reg = StepRegistry::new(["09_final", "01_start"]).unwrap();
        assert_eq!(reg.previous("01_start").unwrap(), Some("09_final"));
        assert!(reg.is_first("09_final"));
    }

    #[test]
    fn test_next_step() {
        let reg = StepRegistry::default();
        assert_eq!(reg.next("ingest"), Some("preprocess"));
        assert_eq!(reg.next("package"), None);
        assert_eq!(reg.next("missing"), None);
    }

    #[test]
    fn test_rejects_empty_registry() {
        let names: Vec<String> = Vec::new();
        assert!(StepRegistry::new(names).is_err());
    }

    #[test]
    fn test_rejects_duplicates() {
        let err = StepRegistry::new(["a", "b", "a"]).unwrap_err();
        assert!(err.to_string().contains("Duplicate"));
    }

    #[test]
    fn test_rejects_unsafe_names() {
        assert!(StepRegistry::new(["ok", "../etc"]).is_err());
        assert!(StepRegistry::new(["Upper"]).is_err());
        assert!(StepRegistry::new([""]).is_err());
    }

    #[test]
    fn test_parse_list_trims_and_skips_blanks() {
        let reg = StepRegistry::parse_list(" ingest , generate,,package ").unwrap();
        assert_eq!(reg.steps(), &["ingest", "generate", "package"]);
    }
}
