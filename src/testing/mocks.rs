//! Test doubles for the [`Executor`] seam.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::traits::Executor;
use crate::error::IterationError;
use crate::r#loop::outcome::IterationResult;

/// Error kind reported when an attempt is abandoned because `cancel` fired.
pub const CANCELLED_KIND: &str = "cancelled";

#[derive(Debug, Clone)]
enum Step {
    Ok(IterationResult),
    Err(IterationError),
    /// Block until cancelled
    Hang,
}

/// Executor that replays a queue of outcomes.
///
/// Once the queue is drained every call returns the fallback result
/// (one change, one pending task by default), so a run keeps going until
/// some policy stops it.
///
/// # Example
///
/// ```rust,ignore
/// let executor = ScriptedExecutor::new()
///     .then_err(IterationError::new("compile failed"))
///     .then_ok(result::finished());
///
/// assert_eq!(executor.calls(), 0);
/// ```
#[derive(Debug)]
pub struct ScriptedExecutor {
    steps: Mutex<VecDeque<Step>>,
    fallback: IterationResult,
    delay: Duration,
    calls: AtomicU32,
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self {
            steps: Mutex::new(VecDeque::new()),
            fallback: result::working(1),
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
        }
    }
}

impl ScriptedExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(self, step: Step) -> Self {
        self.steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(step);
        self
    }

    /// Queue a successful result.
    #[must_use]
    pub fn then_ok(self, result: IterationResult) -> Self {
        self.push(Step::Ok(result))
    }

    /// Queue a failure.
    #[must_use]
    pub fn then_err(self, err: IterationError) -> Self {
        self.push(Step::Err(err))
    }

    /// Queue the same failure `times` times.
    #[must_use]
    pub fn then_err_times(mut self, err: IterationError, times: u32) -> Self {
        for _ in 0..times {
            self = self.push(Step::Err(err.clone()));
        }
        self
    }

    /// Queue a call that never finishes on its own.
    #[must_use]
    pub fn then_hang(self) -> Self {
        self.push(Step::Hang)
    }

    /// Result returned once the queue is empty.
    #[must_use]
    pub fn with_fallback(mut self, result: IterationResult) -> Self {
        self.fallback = result;
        self
    }

    /// Simulated work time per call.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of times `execute` has been called.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Outcomes still queued.
    pub fn remaining(&self) -> usize {
        self.steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn cancelled() -> IterationError {
    IterationError::with_kind(CANCELLED_KIND, "attempt cancelled")
}

#[async_trait]
impl Executor for ScriptedExecutor {
    type Task = String;

    async fn execute(
        &self,
        cancel: CancellationToken,
        _task: &String,
    ) -> Result<IterationResult, IterationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let step = self
            .steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();

        if !self.delay.is_zero() {
            tokio::select! {
                () = cancel.cancelled() => return Err(cancelled()),
                () = tokio::time::sleep(self.delay) => {}
            }
        }

        match step {
            Some(Step::Ok(result)) => Ok(result),
            Some(Step::Err(err)) => Err(err),
            Some(Step::Hang) => {
                cancel.cancelled().await;
                Err(cancelled())
            }
            None => Ok(self.fallback.clone()),
        }
    }
}

/// Shorthand builders for common [`IterationResult`] shapes.
pub mod result {
    use crate::r#loop::outcome::IterationResult;

    /// Progress made, more work pending.
    #[must_use]
    pub fn working(change_count: u32) -> IterationResult {
        IterationResult::success(change_count)
            .with_next_tasks(1)
            .with_message("working")
    }

    /// Succeeded without changing anything, more work pending.
    #[must_use]
    pub fn idle() -> IterationResult {
        IterationResult::success(0)
            .with_next_tasks(1)
            .with_message("idle")
    }

    /// Explicit exit signal with nothing left to do.
    #[must_use]
    pub fn finished() -> IterationResult {
        IterationResult::success(1)
            .with_exit_signal(true)
            .with_next_tasks(0)
            .with_message("all tasks finished")
    }
}
