//! Heuristic exit detection.
//!
//! After every successful iteration the detector counts *completion
//! indicators* - independent hints that the task may be done - and decides
//! whether the loop has converged.
//!
//! | # | Indicator                                                  |
//! |---|------------------------------------------------------------|
//! | 1 | executor set `exit_signal`                                 |
//! | 2 | a `summary` artifact was produced                          |
//! | 3 | `next_task_count == 0`                                     |
//! | 4 | success with zero changes, 2+ evaluations in a row         |
//! | 5 | message reads like completion, 2+ evaluations in a row     |
//! | 6 | all planned steps are complete                             |
//!
//! With `require_explicit_signal` (the default) the loop only exits when the
//! indicator count reaches the threshold *and* the executor set
//! `exit_signal`. Error and stagnation streaks force an exit regardless.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

use super::outcome::{IterationResult, IterationStatus};
use super::state::LoopState;
use crate::config::ExitConfig;

/// Phrases in an executor message that suggest the task is finished.
pub const COMPLETION_KEYWORDS: &[&str] = &[
    "complete",
    "finished",
    "done",
    "all tasks",
    "no more",
    "nothing left",
    "successfully",
];

/// Evaluations in a row a debounced indicator must hold before it counts.
pub const DEBOUNCE_EVALUATIONS: u32 = 2;

/// Outcome of one [`ExitDetector::evaluate`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ExitDecision {
    /// Keep iterating
    Continue { indicators: u32 },
    /// Converged: enough indicators (and the explicit signal, if required)
    Complete { indicators: u32 },
    /// Forced: too many failed iterations in a row
    TooManyErrors { count: u32 },
    /// Forced: too many zero-change iterations in a row
    Stagnated { count: u32 },
}

impl ExitDecision {
    #[must_use]
    pub fn should_exit(&self) -> bool {
        !matches!(self, Self::Continue { .. })
    }

    /// True for exits that bypassed the indicator count.
    #[must_use]
    pub fn is_forced(&self) -> bool {
        matches!(self, Self::TooManyErrors { .. } | Self::Stagnated { .. })
    }
}

impl std::fmt::Display for ExitDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Continue { indicators } => write!(f, "continue ({} indicators)", indicators),
            Self::Complete { indicators } => write!(f, "complete ({} indicators)", indicators),
            Self::TooManyErrors { count } => write!(f, "{} consecutive errors", count),
            Self::Stagnated { count } => write!(f, "no progress in {} iterations", count),
        }
    }
}

#[derive(Debug, Default)]
struct ExitState {
    no_change_streak: u32,
    completion_message_streak: u32,
    error_streak: u32,
    last_indicators: u32,
}

/// Decides from iteration results whether a run has converged.
#[derive(Debug)]
pub struct ExitDetector {
    config: ExitConfig,
    keywords: Option<Regex>,
    state: Mutex<ExitState>,
}

impl ExitDetector {
    #[must_use]
    pub fn new(config: ExitConfig) -> Self {
        let pattern = COMPLETION_KEYWORDS
            .iter()
            .map(|k| regex::escape(k))
            .collect::<Vec<_>>()
            .join("|");
        let keywords = Regex::new(&format!("(?i)(?:{})", pattern)).ok();

        Self {
            config,
            keywords,
            state: Mutex::new(ExitState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ExitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn config(&self) -> &ExitConfig {
        &self.config
    }

    /// Check whether a message reads like a completion report.
    #[must_use]
    pub fn is_completion_message(&self, message: &str) -> bool {
        match &self.keywords {
            Some(re) => re.is_match(message),
            None => {
                let lower = message.to_lowercase();
                COMPLETION_KEYWORDS.iter().any(|k| lower.contains(k))
            }
        }
    }

    /// Evaluate the latest result against the run state.
    ///
    /// Updates the debounce counters and stores the indicator count on
    /// `state`. Forced exits return before any indicator is counted.
    pub fn evaluate(&self, result: &IterationResult, state: &LoopState) -> ExitDecision {
        let mut inner = self.lock();

        let errors = state.consecutive_errors().max(inner.error_streak);
        if errors >= self.config.max_consecutive_errors {
            return ExitDecision::TooManyErrors { count: errors };
        }
        let no_change = state.consecutive_no_change();
        if no_change >= self.config.max_consecutive_no_progress {
            return ExitDecision::Stagnated { count: no_change };
        }

        if result.status == IterationStatus::Success && result.change_count == 0 {
            inner.no_change_streak += 1;
        } else {
            inner.no_change_streak = 0;
        }
        if self.is_completion_message(&result.message) {
            inner.completion_message_streak += 1;
        } else {
            inner.completion_message_streak = 0;
        }

        let total_steps = state.total_steps();
        let checks = [
            result.exit_signal,
            result.has_summary_artifact(),
            result.next_task_count == 0,
            inner.no_change_streak >= DEBOUNCE_EVALUATIONS,
            inner.completion_message_streak >= DEBOUNCE_EVALUATIONS,
            total_steps > 0 && state.completed_steps() >= total_steps,
        ];
        let indicators = checks.iter().filter(|hit| **hit).count() as u32;
        inner.last_indicators = indicators;
        state.set_completion_indicators(indicators);

        let threshold_met = indicators >= self.config.completion_threshold;
        let exit = if self.config.require_explicit_signal {
            threshold_met && result.exit_signal
        } else {
            threshold_met
        };

        debug!(
            indicators,
            threshold = self.config.completion_threshold,
            exit_signal = result.exit_signal,
            exit,
            "exit evaluation"
        );

        if exit {
            ExitDecision::Complete { indicators }
        } else {
            ExitDecision::Continue { indicators }
        }
    }

    /// Whether the loop should stop. See [`ExitDetector::evaluate`].
    pub fn should_exit(&self, result: &IterationResult, state: &LoopState) -> bool {
        self.evaluate(result, state).should_exit()
    }

    /// Check only the forced-exit streaks, without touching debounce state.
    #[must_use]
    pub fn forced_exit(&self, state: &LoopState) -> Option<ExitDecision> {
        let errors = state.consecutive_errors().max(self.lock().error_streak);
        if errors >= self.config.max_consecutive_errors {
            return Some(ExitDecision::TooManyErrors { count: errors });
        }
        let no_change = state.consecutive_no_change();
        if no_change >= self.config.max_consecutive_no_progress {
            return Some(ExitDecision::Stagnated { count: no_change });
        }
        None
    }

    /// Clear the debounce counters.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.no_change_streak = 0;
        inner.completion_message_streak = 0;
        inner.last_indicators = 0;
    }

    /// Extend the detector's own error streak, returning the new length.
    pub fn record_error(&self) -> u32 {
        let mut inner = self.lock();
        inner.error_streak += 1;
        inner.error_streak
    }

    /// End the detector's error streak.
    pub fn clear_errors(&self) {
        self.lock().error_streak = 0;
    }

    #[must_use]
    pub fn error_streak(&self) -> u32 {
        self.lock().error_streak
    }

    /// Indicator count from the most recent evaluation.
    #[must_use]
    pub fn last_indicators(&self) -> u32 {
        self.lock().last_indicators
    }
}

impl Default for ExitDetector {
    fn default() -> Self {
        Self::new(ExitConfig::default())
    }
}
