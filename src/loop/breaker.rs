//! Failure and stagnation circuit breaker.
//!
//! The breaker stops a loop that is clearly not converging. It opens on any
//! of three patterns:
//!
//! - the same error repeating (`same_error_threshold` in a row)
//! - no output change (`no_progress_threshold` zero-change successes in a row)
//! - a sharp drop in output size between two successes
//!   (`output_decline_threshold` percent)
//!
//! ```text
//! Closed ──trip──> Open ──recovery timeout──> HalfOpen ──success──> Closed
//!                   ^                             │
//!                   └──────────failure────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::IterationError;

/// State of the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Healthy, iterations allowed
    Closed,
    /// Blocking until the recovery timeout elapses
    Open,
    /// One trial iteration allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Why the breaker last opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TripReason {
    /// Successes with no change, `count` in a row
    NoProgress { count: u32 },
    /// The same error, `count` in a row
    SameError { count: u32, error: String },
    /// Change size dropped by `percent` between two successes
    OutputDecline { percent: u32 },
    /// The half-open trial failed
    TrialFailed { error: String },
}

impl std::fmt::Display for TripReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoProgress { count } => {
                write!(f, "no progress in {} consecutive iterations", count)
            }
            Self::SameError { count, error } => {
                write!(f, "same error repeated {} times: {}", count, error)
            }
            Self::OutputDecline { percent } => {
                write!(f, "output declined by {}%", percent)
            }
            Self::TrialFailed { error } => write!(f, "half-open trial failed: {}", error),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    last_error: Option<IterationError>,
    same_error_count: u32,
    no_progress_count: u32,
    last_open_time: Option<Instant>,
    opened_at: Option<DateTime<Utc>>,
    last_change_size: u32,
    success_count: u64,
    failure_count: u64,
    trip_reason: Option<TripReason>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            last_error: None,
            same_error_count: 0,
            no_progress_count: 0,
            last_open_time: None,
            opened_at: None,
            last_change_size: 0,
            success_count: 0,
            failure_count: 0,
            trip_reason: None,
        }
    }

    fn open(&mut self, reason: TripReason) {
        warn!(
            from = %self.state,
            reason = %reason,
            failures = self.failure_count,
            "Circuit breaker opened"
        );
        self.state = CircuitState::Open;
        self.last_open_time = Some(Instant::now());
        self.opened_at = Some(Utc::now());
        self.trip_reason = Some(reason);
    }

    fn close(&mut self) {
        info!("Circuit breaker closed after successful trial");
        let (success_count, failure_count) = (self.success_count, self.failure_count);
        *self = Self::new();
        self.success_count = success_count;
        self.failure_count = failure_count;
    }
}

/// Thread-safe circuit breaker. All methods take one internal lock for the
/// duration of a single update.
///
/// # Example
///
/// ```
/// use loopguard::config::CircuitBreakerConfig;
/// use loopguard::error::IterationError;
/// use loopguard::r#loop::breaker::CircuitBreaker;
///
/// let breaker = CircuitBreaker::new(CircuitBreakerConfig {
///     same_error_threshold: 3,
///     ..Default::default()
/// });
/// for _ in 0..3 {
///     breaker.record_error(&IterationError::new("x"));
/// }
/// assert!(breaker.is_open());
///
/// breaker.reset();
/// breaker.record_error(&IterationError::new("y"));
/// assert!(!breaker.is_open());
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Record a successful iteration that changed `change_size` units.
    pub fn record_success(&self, change_size: u32) {
        let mut inner = self.lock();
        inner.success_count += 1;

        if inner.state == CircuitState::HalfOpen {
            inner.close();
            inner.last_change_size = change_size;
            return;
        }

        let mut trip = None;
        if change_size == 0 {
            inner.no_progress_count += 1;
            if inner.no_progress_count >= self.config.no_progress_threshold {
                trip = Some(TripReason::NoProgress {
                    count: inner.no_progress_count,
                });
            }
        } else {
            inner.no_progress_count = 0;
        }

        let last = inner.last_change_size;
        if last > 0 && change_size > 0 {
            let ratio = u64::from(change_size) * 100 / u64::from(last);
            let decline = 100u64.saturating_sub(ratio);
            if decline >= u64::from(self.config.output_decline_threshold) {
                // decline <= 100 here, the cast is lossless
                trip = Some(TripReason::OutputDecline {
                    percent: decline as u32,
                });
            }
        }

        inner.last_change_size = change_size;
        if let Some(reason) = trip {
            if inner.state == CircuitState::Closed {
                inner.open(reason);
            }
        }
    }

    /// Record a failed iteration.
    pub fn record_error(&self, err: &IterationError) {
        let mut inner = self.lock();
        inner.failure_count += 1;

        if inner.state == CircuitState::HalfOpen {
            inner.last_error = Some(err.clone());
            inner.same_error_count = 1;
            inner.open(TripReason::TrialFailed {
                error: err.to_string(),
            });
            return;
        }

        let same = inner
            .last_error
            .as_ref()
            .is_some_and(|last| last.fingerprint() == err.fingerprint());
        inner.same_error_count = if same { inner.same_error_count + 1 } else { 1 };
        inner.last_error = Some(err.clone());

        if inner.same_error_count >= self.config.same_error_threshold
            && inner.state == CircuitState::Closed
        {
            let count = inner.same_error_count;
            inner.open(TripReason::SameError {
                count,
                error: err.to_string(),
            });
        }
    }

    /// Check whether iterations are blocked.
    ///
    /// An open breaker whose recovery timeout has elapsed moves to half-open
    /// and returns false, letting exactly one trial through.
    pub fn is_open(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => false,
            CircuitState::Open => {
                let elapsed = inner
                    .last_open_time
                    .map(|t| t.elapsed())
                    .unwrap_or_default();
                if elapsed >= self.config.recovery_timeout() {
                    info!(
                        elapsed_secs = elapsed.as_secs(),
                        "Circuit breaker half-open, allowing one trial"
                    );
                    inner.state = CircuitState::HalfOpen;
                    false
                } else {
                    true
                }
            }
        }
    }

    /// Force the breaker closed and zero all counters.
    pub fn reset(&self) {
        *self.lock() = BreakerInner::new();
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Why the breaker last opened, if it has.
    #[must_use]
    pub fn trip_reason(&self) -> Option<TripReason> {
        self.lock().trip_reason.clone()
    }

    /// Serializable copy of the breaker's bookkeeping.
    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            state: inner.state,
            last_error: inner.last_error.as_ref().map(ToString::to_string),
            same_error_count: inner.same_error_count,
            no_progress_count: inner.no_progress_count,
            last_change_size: inner.last_change_size,
            success_count: inner.success_count,
            failure_count: inner.failure_count,
            opened_at: inner.opened_at,
            trip_reason: inner.trip_reason.clone(),
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

/// Point-in-time view of a [`CircuitBreaker`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub last_error: Option<String>,
    pub same_error_count: u32,
    pub no_progress_count: u32,
    pub last_change_size: u32,
    pub success_count: u64,
    pub failure_count: u64,
    pub opened_at: Option<DateTime<Utc>>,
    pub trip_reason: Option<TripReason>,
}
