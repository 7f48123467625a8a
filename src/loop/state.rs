//! Loop state types and transitions.
//!
//! [`LoopState`] is the phase state machine shared between the controller
//! and read-only observers (status endpoints, the CLI). All mutators take
//! the internal write lock for the duration of a single update; readers
//! take the read lock or work from a [`LoopStateSnapshot`].
//!
//! ```text
//! Idle ──> Planning ──> Executing ──> Validating ──> FinalValidating ──> Complete
//!                           ^              │                │
//!                           └──────────────┴────────────────┘  (reject)
//!
//! any non-terminal phase ──> Failed
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::error::{LoopError, Result};

/// Phase of a loop run.
///
/// # Example
///
/// ```
/// use loopguard::r#loop::state::LoopPhase;
///
/// assert_eq!(LoopPhase::FinalValidating.to_string(), "final_validating");
/// assert!(LoopPhase::Complete.is_terminal());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    /// No run in progress
    Idle,
    /// Run accepted, preparing the first iteration
    Planning,
    /// Executor is working on the task
    Executing,
    /// Checking an iteration's result
    Validating,
    /// Exit detector fired, confirming completion
    FinalValidating,
    /// Run finished successfully
    Complete,
    /// Run stopped on a fatal condition
    Failed,
}

impl LoopPhase {
    /// Complete and Failed accept no further transitions.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Check whether `self -> next` is an edge of the state machine.
    #[must_use]
    pub fn can_transition_to(&self, next: LoopPhase) -> bool {
        use LoopPhase::{Complete, Executing, Failed, FinalValidating, Idle, Planning, Validating};

        if self.is_terminal() {
            return false;
        }
        matches!(
            (*self, next),
            (Idle, Planning)
                | (Planning, Executing)
                | (Executing, Validating)
                | (Validating, Executing)
                | (Validating, FinalValidating)
                | (FinalValidating, Complete)
                | (FinalValidating, Executing)
                | (_, Failed)
        )
    }
}

impl std::fmt::Display for LoopPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Validating => "validating",
            Self::FinalValidating => "final_validating",
            Self::Complete => "complete",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One entry in the append-only phase history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: LoopPhase,
    pub to: LoopPhase,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
struct StateInner {
    run_id: Option<Uuid>,
    phase: LoopPhase,
    iteration: u32,
    step_number: u32,
    total_steps: u32,
    completed_steps: u32,
    consecutive_errors: u32,
    consecutive_no_change: u32,
    completion_indicators: u32,
    phase_start_time: Instant,
    phase_history: Vec<PhaseTransition>,
}

impl StateInner {
    fn new() -> Self {
        Self {
            run_id: None,
            phase: LoopPhase::Idle,
            iteration: 0,
            step_number: 0,
            total_steps: 0,
            completed_steps: 0,
            consecutive_errors: 0,
            consecutive_no_change: 0,
            completion_indicators: 0,
            phase_start_time: Instant::now(),
            phase_history: Vec::new(),
        }
    }

    fn apply(&mut self, to: LoopPhase, reason: Option<String>) -> Result<()> {
        let from = self.phase;
        if from == to {
            return Ok(());
        }
        if !from.can_transition_to(to) {
            return Err(LoopError::InvalidTransition { from, to });
        }

        debug!(%from, %to, reason = reason.as_deref().unwrap_or(""), "phase transition");
        self.phase_history.push(PhaseTransition {
            from,
            to,
            timestamp: Utc::now(),
            reason,
        });
        self.phase = to;
        self.phase_start_time = Instant::now();
        Ok(())
    }
}

/// Guarded phase state machine plus iteration and streak counters.
///
/// `consecutive_errors` and `consecutive_no_change` kept here are the
/// authoritative streaks for a run; the exit detector reads them.
///
/// # Example
///
/// ```
/// use loopguard::r#loop::state::{LoopPhase, LoopState};
///
/// let state = LoopState::new();
/// state.begin_run().unwrap();
/// state.transition(LoopPhase::Executing).unwrap();
/// assert_eq!(state.phase(), LoopPhase::Executing);
/// assert_eq!(state.snapshot().phase_history.len(), 2);
/// ```
#[derive(Debug)]
pub struct LoopState {
    inner: RwLock<StateInner>,
}

impl LoopState {
    /// Create an idle state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StateInner::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, StateInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StateInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Phase transitions
    // =========================================================================

    /// Claim the state for a new run.
    ///
    /// Succeeds from Idle or a terminal phase: the state is reinitialized
    /// and moved to Planning in one step. Any other phase means a run is
    /// in flight.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::AlreadyRunning`] if a run is active.
    pub fn begin_run(&self) -> Result<Uuid> {
        let mut inner = self.write();
        if inner.phase != LoopPhase::Idle && !inner.phase.is_terminal() {
            return Err(LoopError::AlreadyRunning);
        }

        let run_id = Uuid::new_v4();
        *inner = StateInner::new();
        inner.run_id = Some(run_id);
        inner.apply(LoopPhase::Planning, Some("run started".to_string()))?;
        Ok(run_id)
    }

    /// Move to `phase`. No-op if already there.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::InvalidTransition`] for edges outside the
    /// state machine, including any edge out of a terminal phase.
    pub fn transition(&self, phase: LoopPhase) -> Result<()> {
        self.write().apply(phase, None)
    }

    /// Move to `phase`, recording why. No-op if already there.
    ///
    /// # Errors
    ///
    /// Same as [`LoopState::transition`].
    pub fn transition_with_reason(
        &self,
        phase: LoopPhase,
        reason: impl Into<String>,
    ) -> Result<()> {
        self.write().apply(phase, Some(reason.into()))
    }

    /// Explicit external reset back to Idle, clearing all counters and history.
    pub fn reset(&self) {
        *self.write() = StateInner::new();
    }

    // =========================================================================
    // Counters
    // =========================================================================

    /// Advance the iteration counter, returning the new value.
    pub fn next_iteration(&self) -> u32 {
        let mut inner = self.write();
        inner.iteration += 1;
        inner.iteration
    }

    /// Record a successful iteration: ends the error streak and updates
    /// the no-change streak.
    pub fn record_success(&self, change_count: u32) {
        let mut inner = self.write();
        inner.consecutive_errors = 0;
        if change_count == 0 {
            inner.consecutive_no_change += 1;
        } else {
            inner.consecutive_no_change = 0;
        }
    }

    /// Record a failed iteration, returning the new error streak.
    pub fn record_error(&self) -> u32 {
        let mut inner = self.write();
        inner.consecutive_errors += 1;
        inner.consecutive_errors
    }

    /// Set the number of planned steps.
    pub fn set_total_steps(&self, total: u32) {
        self.write().total_steps = total;
    }

    /// Overwrite step progress as reported by the executor.
    pub fn set_step_progress(&self, completed: u32, total: u32) {
        let mut inner = self.write();
        inner.total_steps = total;
        inner.completed_steps = completed;
        inner.step_number = completed.saturating_add(1).min(total.max(1));
    }

    /// Mark the current step done and move to the next one.
    pub fn complete_step(&self) {
        let mut inner = self.write();
        inner.completed_steps += 1;
        inner.step_number = inner.completed_steps + 1;
    }

    /// Store the latest completion indicator count.
    pub fn set_completion_indicators(&self, indicators: u32) {
        self.write().completion_indicators = indicators;
    }

    // =========================================================================
    // Getters
    // =========================================================================

    #[must_use]
    pub fn phase(&self) -> LoopPhase {
        self.read().phase
    }

    #[must_use]
    pub fn run_id(&self) -> Option<Uuid> {
        self.read().run_id
    }

    #[must_use]
    pub fn iteration(&self) -> u32 {
        self.read().iteration
    }

    #[must_use]
    pub fn consecutive_errors(&self) -> u32 {
        self.read().consecutive_errors
    }

    #[must_use]
    pub fn consecutive_no_change(&self) -> u32 {
        self.read().consecutive_no_change
    }

    #[must_use]
    pub fn total_steps(&self) -> u32 {
        self.read().total_steps
    }

    #[must_use]
    pub fn completed_steps(&self) -> u32 {
        self.read().completed_steps
    }

    #[must_use]
    pub fn completion_indicators(&self) -> u32 {
        self.read().completion_indicators
    }

    /// Time spent in the current phase.
    #[must_use]
    pub fn phase_elapsed(&self) -> Duration {
        self.read().phase_start_time.elapsed()
    }

    /// Deep copy for concurrent readers. Holds no lock once returned.
    #[must_use]
    pub fn snapshot(&self) -> LoopStateSnapshot {
        let inner = self.read();
        LoopStateSnapshot {
            run_id: inner.run_id,
            phase: inner.phase,
            iteration: inner.iteration,
            step_number: inner.step_number,
            total_steps: inner.total_steps,
            completed_steps: inner.completed_steps,
            consecutive_errors: inner.consecutive_errors,
            consecutive_no_change: inner.consecutive_no_change,
            completion_indicators: inner.completion_indicators,
            phase_elapsed: inner.phase_start_time.elapsed(),
            phase_history: inner.phase_history.clone(),
        }
    }
}

impl Default for LoopState {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable copy of a [`LoopState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopStateSnapshot {
    pub run_id: Option<Uuid>,
    pub phase: LoopPhase,
    pub iteration: u32,
    pub step_number: u32,
    pub total_steps: u32,
    pub completed_steps: u32,
    pub consecutive_errors: u32,
    pub consecutive_no_change: u32,
    pub completion_indicators: u32,
    pub phase_elapsed: Duration,
    pub phase_history: Vec<PhaseTransition>,
}

impl LoopStateSnapshot {
    /// Phases visited, in order, starting with the first `from`.
    #[must_use]
    pub fn visited_phases(&self) -> Vec<LoopPhase> {
        let mut phases: Vec<LoopPhase> = self
            .phase_history
            .first()
            .map(|t| t.from)
            .into_iter()
            .collect();
        phases.extend(self.phase_history.iter().map(|t| t.to));
        phases
    }
}
