//! Collaborator interfaces bound to steps: handlers do the work, checkers
//! judge the output.
//!
//! The orchestrator knows nothing about what a step produces. A handler reads
//! `input_path`, writes exactly one artifact at `output_path`, and reports
//! success or failure. A checker reads that artifact and returns a verdict.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Everything a collaborator needs to locate its input and output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepContext {
    pub story_id: String,
    pub run_id: String,
    pub step_name: String,
    /// Artifact produced by the previous step (or the pipeline input for the
    /// first step). May not exist.
    pub input_path: PathBuf,
    /// Where this step's artifact is expected.
    pub output_path: PathBuf,
    pub output_dir: PathBuf,
}

/// Result reported by a handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandlerOutcome {
    Success,
    Failure(String),
}

impl HandlerOutcome {
    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure(message.into())
    }
}

/// Pass/fail verdict from an acceptance check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptanceVerdict {
    pub passed: bool,
    pub reason: String,
}

impl AcceptanceVerdict {
    pub fn pass(reason: impl Into<String>) -> Self {
        Self {
            passed: true,
            reason: reason.into(),
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: reason.into(),
        }
    }
}

/// Business logic for one step. Returning `Err` is treated exactly like
/// returning `HandlerOutcome::Failure`.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn run(&self, ctx: &StepContext) -> Result<HandlerOutcome>;
}

/// Declarative evaluation of a step's artifact.
#[async_trait]
pub trait AcceptanceChecker: Send + Sync {
    async fn check(&self, ctx: &StepContext) -> Result<AcceptanceVerdict>;
}

type HandlerFn = dyn Fn(StepContext) -> Result<HandlerOutcome> + Send + Sync;

/// Adapts a synchronous closure into a `StepHandler`.
pub struct FnHandler {
    f: Arc<HandlerFn>,
}

impl FnHandler {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(StepContext) -> Result<HandlerOutcome> + Send + Sync + 'static,
    {
        Self { f: Arc::new(f) }
    }
}

#[async_trait]
impl StepHandler for FnHandler {
    async fn run(&self, ctx: &StepContext) -> Result<HandlerOutcome> {
        let f = self.f.clone();
        let ctx = ctx.clone();
        tokio::task::spawn_blocking(move || f(ctx))
            .await
            .context("Handler task panicked")?
    }
}

/// Bytes of stderr kept in a failure message.
const STDERR_TAIL: usize = 2000;

/// Runs a shell command as the step handler.
///
/// The command sees the step context through `STORYFLOW_*` environment
/// variables and must leave its artifact at `STORYFLOW_OUTPUT_PATH`.
pub struct CommandHandler {
    command: String,
    working_dir: PathBuf,
    timeout: Option<Duration>,
}

impl CommandHandler {
    pub fn new(command: impl Into<String>, working_dir: PathBuf) -> Self {
        Self {
            command: command.into(),
            working_dir,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl StepHandler for CommandHandler {
    async fn run(&self, ctx: &StepContext) -> Result<HandlerOutcome> {
        std::fs::create_dir_all(&ctx.output_dir).with_context(|| {
            format!(
                "Failed to create output directory {}",
                ctx.output_dir.display()
            )
        })?;
        // A leftover artifact from an earlier attempt must not count as output.
        match std::fs::remove_file(&ctx.output_path) {
            Ok(()) => tracing::debug!(path = %ctx.output_path.display(), "removed stale artifact"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| {
                    format!(
                        "Failed to remove stale artifact {}",
                        ctx.output_path.display()
                    )
                });
            }
        }

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("STORYFLOW_STORY_ID", &ctx.story_id)
            .env("STORYFLOW_RUN_ID", &ctx.run_id)
            .env("STORYFLOW_STEP", &ctx.step_name)
            .env("STORYFLOW_INPUT_PATH", &ctx.input_path)
            .env("STORYFLOW_OUTPUT_PATH", &ctx.output_path)
            .current_dir(&self.working_dir)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn handler command: {}", self.command))?;

        tracing::debug!(
            step = %ctx.step_name,
            story_id = %ctx.story_id,
            pid = child.id().unwrap_or(0),
            "handler command spawned"
        );

        let mut stderr = child.stderr.take().context("Failed to capture stderr")?;
        let wait = async {
            let mut buf = String::new();
            stderr.read_to_string(&mut buf).await?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, buf))
        };

        let (status, stderr_text) = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(res) => res.context("Failed to wait for handler command")?,
                Err(_) => {
                    return Ok(HandlerOutcome::failure(format!(
                        "handler command timed out after {}s",
                        limit.as_secs()
                    )));
                }
            },
            None => wait.await.context("Failed to wait for handler command")?,
        };

        if !status.success() {
            let code = status.code().unwrap_or(-1);
            let tail = tail(stderr_text.trim(), STDERR_TAIL);
            let message = if tail.is_empty() {
                format!("handler command exited with code {}", code)
            } else {
                format!("handler command exited with code {}: {}", code, tail)
            };
            return Ok(HandlerOutcome::Failure(message));
        }

        if !ctx.output_path.exists() {
            return Ok(HandlerOutcome::failure(format!(
                "handler command succeeded but wrote no artifact at {}",
                ctx.output_path.display()
            )));
        }

        Ok(HandlerOutcome::Success)
    }
}

fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ctx_in(dir: &std::path::Path) -> StepContext {
        let output_dir = dir.join("output/generate");
        StepContext {
            story_id: "s1".into(),
            run_id: "run-1".into(),
            step_name: "generate".into(),
            input_path: dir.join("output/preprocess/s1.json"),
            output_path: output_dir.join("s1.json"),
            output_dir,
        }
    }

    #[tokio::test]
    async fn test_fn_handler_passes_context() {
        let handler = FnHandler::new(|ctx| {
            if ctx.story_id == "s1" {
                Ok(HandlerOutcome::Success)
            } else {
                Ok(HandlerOutcome::failure("wrong story"))
            }
        });
        let dir = tempdir().unwrap();
        let outcome = handler.run(&ctx_in(dir.path())).await.unwrap();
        assert_eq!(outcome, HandlerOutcome::Success);
    }

    #[tokio::test]
    async fn test_command_handler_success_requires_artifact() {
        let dir = tempdir().unwrap();
        let ctx = ctx_in(dir.path());

        let writes = CommandHandler::new(
            r#"printf '{"story":"%s"}' "$STORYFLOW_STORY_ID" > "$STORYFLOW_OUTPUT_PATH""#,
            dir.path().to_path_buf(),
        );
        assert_eq!(writes.run(&ctx).await.unwrap(), HandlerOutcome::Success);
        let written = std::fs::read_to_string(&ctx.output_path).unwrap();
        assert_eq!(written, r#"{"story":"s1"}"#);

        std::fs::remove_file(&ctx.output_path).unwrap();
        let silent = CommandHandler::new("true", dir.path().to_path_buf());
        match silent.run(&ctx).await.unwrap() {
            HandlerOutcome::Failure(msg) => assert!(msg.contains("wrote no artifact")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_command_handler_ignores_artifact_from_earlier_attempt() {
        let dir = tempdir().unwrap();
        let ctx = ctx_in(dir.path());
        std::fs::create_dir_all(&ctx.output_dir).unwrap();
        std::fs::write(&ctx.output_path, r#"{"content":"old"}"#).unwrap();

        let noop = CommandHandler::new("true", dir.path().to_path_buf());
        match noop.run(&ctx).await.unwrap() {
            HandlerOutcome::Failure(msg) => assert!(msg.contains("wrote no artifact"), "{}", msg),
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(!ctx.output_path.exists());
    }

    #[tokio::test]
    async fn test_command_handler_nonzero_exit_captures_stderr() {
        let dir = tempdir().unwrap();
        let handler = CommandHandler::new("echo boom >&2; exit 3", dir.path().to_path_buf());
        match handler.run(&ctx_in(dir.path())).await.unwrap() {
            HandlerOutcome::Failure(msg) => {
                assert!(msg.contains("code 3"), "{}", msg);
                assert!(msg.contains("boom"), "{}", msg);
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_command_handler_timeout() {
        let dir = tempdir().unwrap();
        let handler = CommandHandler::new("sleep 5", dir.path().to_path_buf())
            .with_timeout(Duration::from_millis(100));
        match handler.run(&ctx_in(dir.path())).await.unwrap() {
            HandlerOutcome::Failure(msg) => assert!(msg.contains("timed out")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        assert_eq!(tail("abc", 10), "abc");
        assert_eq!(tail("abcdef", 3), "def");
        let s = "ééé";
        let t = tail(s, 3);
        assert!(s.ends_with(t));
    }
}
