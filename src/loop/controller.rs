//! The iteration driver.
//!
//! [`LoopController::run`] repeatedly invokes an [`Executor`] until the exit
//! detector is satisfied or a safety policy stops the run.
//!
//! ```text
//!            ┌───────────────────────────────────────────────────┐
//!            v                                                   │
//!   cancelled? ──> breaker open? ──> rate-limit token ──> execute (timeout)
//!       │               │                                   │        │
//!       v               v                                 error    success
//!   Cancelled      CircuitOpen               record_error ──┘        │
//!                                              (ErrorLimit?)   record_success
//!                                                                    │
//!                                                  exit detector ──> Complete
//!                                                                    │
//!                                                               cooldown ──┘
//! ```
//!
//! The breaker and rate limiter live as long as the controller; the exit
//! detector and the loop state are reinitialized by every run.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::breaker::{CircuitBreaker, CircuitState};
use super::exit::{ExitDecision, ExitDetector};
use super::outcome::IterationResult;
use super::rate_limit::RateLimiter;
use super::state::{LoopPhase, LoopState, LoopStateSnapshot};
use crate::config::LoopConfig;
use crate::error::{IterationError, LoopError, Result};
use crate::testing::Executor;

/// Counters for the most recent run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetrics {
    /// Executor invocations
    pub iterations: u32,
    pub successes: u32,
    pub failures: u32,
    /// Sum of `change_count` over successful iterations
    pub total_changes: u64,
    /// Wall time of the run (so far, while it is active)
    pub duration: Duration,
}

/// The run currently holding the controller.
#[derive(Debug)]
struct ActiveRun {
    token: CancellationToken,
    started: Instant,
}

/// Drives an [`Executor`] under the circuit breaker, rate limiter and exit
/// detector.
///
/// # Example
///
/// ```rust,ignore
/// let controller = LoopController::new(LoopConfig::default(), executor)?;
/// let cancel = CancellationToken::new();
/// controller.run(&cancel, &task).await?;
/// println!("{:?}", controller.metrics());
/// ```
#[derive(Debug)]
pub struct LoopController<E: Executor> {
    config: LoopConfig,
    executor: E,
    breaker: Arc<CircuitBreaker>,
    limiter: Option<Arc<RateLimiter>>,
    state: Arc<LoopState>,
    active: Mutex<Option<ActiveRun>>,
    metrics: Mutex<RunMetrics>,
}

impl<E: Executor> LoopController<E> {
    /// Create a controller.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::InvalidConfig`] if `config` does not validate.
    pub fn new(config: LoopConfig, executor: E) -> Result<Self> {
        config.validate()?;

        let breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker.clone()));
        let limiter = config
            .rate_limited()
            .then(|| Arc::new(RateLimiter::new(config.rate_limit_per_hour)));

        Ok(Self {
            config,
            executor,
            breaker,
            limiter,
            state: Arc::new(LoopState::new()),
            active: Mutex::new(None),
            metrics: Mutex::new(RunMetrics::default()),
        })
    }

    /// Share a breaker with other controllers.
    #[must_use]
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    /// Share a rate limiter with other controllers, enabling rate limiting
    /// regardless of `rate_limit_per_hour`.
    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    #[must_use]
    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    #[must_use]
    pub fn executor(&self) -> &E {
        &self.executor
    }

    fn metrics_mut(&self) -> MutexGuard<'_, RunMetrics> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock order: `active` before `metrics`.
    fn active_mut(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Host surface
    // =========================================================================

    /// Run the loop until it completes or a policy stops it.
    ///
    /// `cancel` is the caller's token; [`LoopController::stop`] cancels a
    /// child of it, so either one ends the run.
    ///
    /// # Errors
    ///
    /// - [`LoopError::AlreadyRunning`] if another run is active
    /// - [`LoopError::Cancelled`] when cancelled or stopped
    /// - [`LoopError::CircuitOpen`] when the breaker blocks or trips
    /// - [`LoopError::ErrorLimit`] after too many consecutive errors
    /// - [`LoopError::MaxIterations`] when iterations run out
    ///
    /// `ErrorLimit` is an outcome beyond the basic success, circuit-open,
    /// cancelled and max-iterations contract.
    pub async fn run(&self, cancel: &CancellationToken, task: &E::Task) -> Result<()> {
        let (run_id, token) = {
            let mut active = self.active_mut();
            if active.is_some() {
                return Err(LoopError::AlreadyRunning);
            }
            let run_id = self.state.begin_run()?;
            let token = cancel.child_token();
            *self.metrics_mut() = RunMetrics::default();
            *active = Some(ActiveRun {
                token: token.clone(),
                started: Instant::now(),
            });
            (run_id, token)
        };

        info!(
            %run_id,
            max_iterations = self.config.max_iterations,
            rate_limit_per_hour = self.config.rate_limit_per_hour,
            "Loop started"
        );

        let result = self.drive(&token, task).await;

        let reason = result.as_ref().err().map(|err| {
            if err.is_cancelled() {
                "cancelled".to_string()
            } else {
                err.to_string()
            }
        });
        if let Some(reason) = &reason {
            if !self.state.phase().is_terminal() {
                if let Err(e) = self
                    .state
                    .transition_with_reason(LoopPhase::Failed, reason.clone())
                {
                    debug!(error = %e, "Could not mark run failed");
                }
            }
        }

        // Release the controller only once the run's state is final
        let metrics = {
            let mut active = self.active_mut();
            let mut metrics = self.metrics_mut();
            if let Some(run) = active.take() {
                metrics.duration = run.started.elapsed();
            }
            *metrics
        };

        match reason {
            None => info!(
                %run_id,
                iterations = metrics.iterations,
                changes = metrics.total_changes,
                "Loop complete"
            ),
            Some(reason) => {
                info!(
                    %run_id,
                    iterations = metrics.iterations,
                    reason = %reason,
                    "Loop stopped"
                );
            }
        }

        result
    }

    /// Cancel the active run, if any. In-flight waits return promptly.
    pub fn stop(&self) {
        if let Some(run) = self.active_mut().as_ref() {
            info!("Stop requested");
            run.token.cancel();
        }
    }

    /// Check whether a run is in progress.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.active_mut().is_some()
    }

    /// Snapshot of the current (or last) run's state.
    #[must_use]
    pub fn state(&self) -> LoopStateSnapshot {
        self.state.snapshot()
    }

    /// Shared handle to the live state, for observers.
    #[must_use]
    pub fn state_handle(&self) -> Arc<LoopState> {
        Arc::clone(&self.state)
    }

    /// Metrics of the current (or last) run.
    #[must_use]
    pub fn metrics(&self) -> RunMetrics {
        let started = self.active_mut().as_ref().map(|run| run.started);
        let mut metrics = *self.metrics_mut();
        if let Some(started) = started {
            metrics.duration = started.elapsed();
        }
        metrics
    }

    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    #[must_use]
    pub fn rate_limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.limiter.as_ref()
    }

    /// Close the breaker, refill the limiter and return the state to Idle.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::AlreadyRunning`] while a run is active.
    pub fn reset(&self) -> Result<()> {
        let active = self.active_mut();
        if active.is_some() {
            return Err(LoopError::AlreadyRunning);
        }
        self.breaker.reset();
        if let Some(limiter) = &self.limiter {
            limiter.reset();
        }
        self.state.reset();
        *self.metrics_mut() = RunMetrics::default();
        drop(active);
        Ok(())
    }

    // =========================================================================
    // Iteration driver
    // =========================================================================

    async fn drive(&self, token: &CancellationToken, task: &E::Task) -> Result<()> {
        let detector = ExitDetector::new(self.config.exit.clone());
        let max = self.config.max_iterations;

        for round in 1..=max {
            if token.is_cancelled() {
                return Err(LoopError::Cancelled);
            }

            if self.breaker.is_open() {
                let reason = self
                    .breaker
                    .trip_reason()
                    .map_or_else(|| "circuit breaker open".to_string(), |r| r.to_string());
                return Err(LoopError::circuit_open(reason));
            }

            if let Some(limiter) = &self.limiter {
                limiter.wait(token).await?;
            }

            self.state.transition(LoopPhase::Executing)?;
            let iteration = self.state.next_iteration();
            self.metrics_mut().iterations += 1;
            debug!(iteration, breaker = %self.breaker.state(), "Starting iteration");

            let outcome = self.execute_once(token, task).await?;
            if token.is_cancelled() {
                return Err(LoopError::Cancelled);
            }

            match outcome {
                Err(err) => {
                    warn!(
                        iteration,
                        error = %err,
                        kind = err.kind.as_deref().unwrap_or("-"),
                        "Iteration failed"
                    );
                    self.metrics_mut().failures += 1;

                    self.breaker.record_error(&err);
                    if self.breaker.state() == CircuitState::Open {
                        let reason = self
                            .breaker
                            .trip_reason()
                            .map_or_else(|| err.to_string(), |r| r.to_string());
                        return Err(LoopError::circuit_tripped(reason, err));
                    }

                    self.state.record_error();
                    detector.record_error();
                    if let Some(ExitDecision::TooManyErrors { count }) =
                        detector.forced_exit(&self.state)
                    {
                        return Err(LoopError::ErrorLimit {
                            count,
                            threshold: self.config.exit.max_consecutive_errors,
                        });
                    }
                }
                Ok(result) => {
                    {
                        let mut metrics = self.metrics_mut();
                        metrics.successes += 1;
                        metrics.total_changes += u64::from(result.change_count);
                    }
                    debug!(
                        iteration,
                        status = %result.status,
                        changes = result.change_count,
                        exit_signal = result.exit_signal,
                        next_tasks = result.next_task_count,
                        "Iteration succeeded"
                    );

                    self.breaker.record_success(result.change_count);
                    self.state.record_success(result.change_count);
                    detector.clear_errors();
                    if let Some(steps) = result.steps {
                        self.state.set_step_progress(steps.completed, steps.total);
                    }

                    self.state.transition(LoopPhase::Validating)?;
                    match detector.evaluate(&result, &self.state) {
                        ExitDecision::Continue { .. } => {}
                        ExitDecision::TooManyErrors { count } => {
                            return Err(LoopError::ErrorLimit {
                                count,
                                threshold: self.config.exit.max_consecutive_errors,
                            });
                        }
                        decision => {
                            info!(iteration, %decision, "Exit condition met");
                            self.state.transition_with_reason(
                                LoopPhase::FinalValidating,
                                decision.to_string(),
                            )?;
                            self.state.transition(LoopPhase::Complete)?;
                            return Ok(());
                        }
                    }
                }
            }

            if round < max {
                self.cooldown(token).await?;
            }
        }

        Err(LoopError::MaxIterations { max })
    }

    /// Invoke the executor once under the per-iteration timeout.
    ///
    /// The outer `Result` carries run-level cancellation; the inner one is
    /// the iteration's own outcome.
    async fn execute_once(
        &self,
        token: &CancellationToken,
        task: &E::Task,
    ) -> Result<std::result::Result<IterationResult, IterationError>> {
        let attempt = token.child_token();
        let limit = self.config.iteration_timeout();

        tokio::select! {
            biased;

            () = token.cancelled() => {
                attempt.cancel();
                Err(LoopError::Cancelled)
            }
            outcome = tokio::time::timeout(limit, self.executor.execute(attempt.clone(), task)) => {
                match outcome {
                    Ok(result) => Ok(result),
                    Err(_) => {
                        attempt.cancel();
                        warn!(timeout_secs = limit.as_secs(), "Iteration timed out");
                        Ok(Err(IterationError::timeout(limit)))
                    }
                }
            }
        }
    }

    async fn cooldown(&self, token: &CancellationToken) -> Result<()> {
        let delay = self.config.cooldown();
        if delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            () = token.cancelled() => Err(LoopError::Cancelled),
            () = tokio::time::sleep(delay) => Ok(()),
        }
    }
}
