//! Iteration outcome types.
//!
//! [`IterationResult`] is what an executor reports after one attempt. The
//! control core only looks at the fields defined here; everything else about
//! the work is opaque to it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Status reported by an executor for one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationStatus {
    /// The attempt ran to completion
    #[default]
    Success,
    /// Some of the planned work was done
    Partial,
    /// The attempt finished but the work did not succeed
    Failed,
    /// The executor cannot proceed without outside input
    Blocked,
}

impl std::fmt::Display for IterationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Partial => write!(f, "partial"),
            Self::Failed => write!(f, "failed"),
            Self::Blocked => write!(f, "blocked"),
        }
    }
}

/// Step progress an executor may report alongside a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepProgress {
    pub completed: u32,
    pub total: u32,
}

/// Result of one successful executor call.
///
/// Deserializes from the JSON an external command prints, with every field
/// optional:
///
/// ```
/// use loopguard::r#loop::outcome::{IterationResult, IterationStatus};
///
/// let result: IterationResult = serde_json::from_str(
///     r#"{"status": "success", "change_count": 3, "exit_signal": true}"#,
/// ).unwrap();
/// assert_eq!(result.status, IterationStatus::Success);
/// assert_eq!(result.change_count, 3);
/// assert!(result.exit_signal);
/// assert_eq!(result.next_task_count, 0);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IterationResult {
    pub status: IterationStatus,
    /// Size of the change this iteration produced (files, lines - executor's choice)
    pub change_count: u32,
    /// Executor explicitly claims the task is done
    pub exit_signal: bool,
    /// Remaining tasks the executor knows about
    pub next_task_count: u32,
    /// Names of artifacts produced this iteration
    pub artifact_names: BTreeSet<String>,
    pub message: String,
    /// Optional step progress, applied to the loop state
    pub steps: Option<StepProgress>,
}

impl IterationResult {
    /// A successful result with the given change count.
    #[must_use]
    pub fn success(change_count: u32) -> Self {
        Self {
            status: IterationStatus::Success,
            change_count,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: IterationStatus) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn with_exit_signal(mut self, exit_signal: bool) -> Self {
        self.exit_signal = exit_signal;
        self
    }

    #[must_use]
    pub fn with_next_tasks(mut self, count: u32) -> Self {
        self.next_task_count = count;
        self
    }

    #[must_use]
    pub fn with_artifact(mut self, name: impl Into<String>) -> Self {
        self.artifact_names.insert(name.into());
        self
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    #[must_use]
    pub fn with_steps(mut self, completed: u32, total: u32) -> Self {
        self.steps = Some(StepProgress { completed, total });
        self
    }

    /// Check whether a "summary" artifact was produced.
    ///
    /// Matches on the file stem, so `summary`, `SUMMARY.md` and
    /// `docs/summary.txt` all count.
    #[must_use]
    pub fn has_summary_artifact(&self) -> bool {
        self.artifact_names.iter().any(|name| {
            std::path::Path::new(name)
                .file_stem()
                .and_then(|stem| stem.to_str())
                .is_some_and(|stem| stem.eq_ignore_ascii_case("summary"))
        })
    }
}
