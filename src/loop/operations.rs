//! Real [`Executor`] implementations.
//!
//! [`CommandExecutor`] runs an external command once per iteration and
//! reads its report from stdout.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::outcome::IterationResult;
use crate::error::IterationError;
use crate::testing::Executor;

/// Environment variable carrying the task text to the command.
pub const TASK_ENV: &str = "LOOPGUARD_TASK";

/// Executor that spawns a command for each iteration.
///
/// The task text is written to the command's stdin and exported as
/// `LOOPGUARD_TASK`. On a zero exit status, stdout is parsed as an
/// [`IterationResult`]: the last line that is a JSON object wins, otherwise
/// the whole output is treated as the result message. A non-zero status is
/// an [`IterationError`] built from stderr.
///
/// The child is killed when the iteration is cancelled or times out.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
    working_dir: PathBuf,
}

impl CommandExecutor {
    /// Create an executor for `program args...` run in `working_dir`.
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>, working_dir: PathBuf) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir,
        }
    }

    /// Build from a command line split into words.
    ///
    /// # Errors
    ///
    /// Returns an error if `command` is empty.
    pub fn from_command_line(command: &[String], working_dir: PathBuf) -> anyhow::Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("No command given"))?;
        Ok(Self::new(program.clone(), args.to_vec(), working_dir))
    }

    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }
}

/// Parse a command's stdout into a result.
#[must_use]
pub fn parse_report(stdout: &str) -> IterationResult {
    let from_line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str::<IterationResult>(line).ok());
    if let Some(result) = from_line {
        return result;
    }

    let trimmed = stdout.trim();
    if let Ok(result) = serde_json::from_str::<IterationResult>(trimmed) {
        return result;
    }

    IterationResult::default().with_message(trimmed)
}

fn failure_message(status: std::process::ExitStatus, stderr: &str) -> String {
    let detail = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty());
    match (status.code(), detail) {
        (Some(code), Some(detail)) => format!("command exited with status {}: {}", code, detail),
        (Some(code), None) => format!("command exited with status {}", code),
        (None, Some(detail)) => format!("command terminated by signal: {}", detail),
        (None, None) => "command terminated by signal".to_string(),
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    type Task = String;

    async fn execute(
        &self,
        cancel: CancellationToken,
        task: &String,
    ) -> Result<IterationResult, IterationError> {
        debug!(program = %self.program, "Spawning iteration command");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.working_dir)
            .env(TASK_ENV, task)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                IterationError::with_kind(
                    "spawn",
                    format!("failed to spawn {}: {}", self.program, e),
                )
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // The command may exit without reading its input
            if let Err(e) = stdin.write_all(task.as_bytes()).await {
                debug!(error = %e, "Could not write task to stdin");
            }
            drop(stdin);
        }

        let output = tokio::select! {
            () = cancel.cancelled() => {
                return Err(IterationError::with_kind("cancelled", "command cancelled"));
            }
            output = child.wait_with_output() => output?,
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(IterationError::new(failure_message(output.status, &stderr)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_report(&stdout))
    }
}
