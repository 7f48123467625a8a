//! Token-bucket rate limiter for iterations.
//!
//! The bucket holds up to `capacity` tokens (a tenth of the hourly budget,
//! at least one) and refills continuously at `per_hour / 3600` tokens per
//! second. Each iteration consumes one token.
//!
//! [`RateLimiter::wait`] never holds the internal lock while sleeping, and
//! every sleep races the caller's cancellation token.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{LoopError, Result};

/// Minimum spacing between retries inside [`RateLimiter::wait`].
pub const MIN_WAIT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(per_hour: u32) -> Self {
        let (capacity, refill_rate) = rates(per_hour);
        Self {
            tokens: capacity,
            capacity,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until one whole token is available.
    fn time_to_next_token(&self) -> Duration {
        let deficit = 1.0 - self.tokens;
        if deficit <= 0.0 {
            return Duration::ZERO;
        }
        if self.refill_rate <= 0.0 {
            return MIN_WAIT_INTERVAL;
        }
        Duration::from_secs_f64(deficit / self.refill_rate)
    }
}

fn rates(per_hour: u32) -> (f64, f64) {
    let capacity = f64::from((per_hour / 10).max(1));
    let refill_rate = f64::from(per_hour) / 3600.0;
    (capacity, refill_rate)
}

/// Thread-safe token bucket.
///
/// # Example
///
/// ```
/// use loopguard::r#loop::rate_limit::RateLimiter;
///
/// let limiter = RateLimiter::new(3600); // 360 burst, 1 token/sec
/// assert_eq!(limiter.capacity(), 360.0);
/// assert!(limiter.allow());
/// ```
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a full bucket for `per_hour` operations per hour.
    #[must_use]
    pub fn new(per_hour: u32) -> Self {
        Self {
            bucket: Mutex::new(Bucket::new(per_hour)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a token if one is available. Never blocks.
    pub fn allow(&self) -> bool {
        self.lock().try_take()
    }

    /// Wait until a token is available and take it.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::Cancelled`] as soon as `cancel` fires.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(LoopError::Cancelled);
            }

            let delay = {
                let mut bucket = self.lock();
                if bucket.try_take() {
                    return Ok(());
                }
                bucket.time_to_next_token().max(MIN_WAIT_INTERVAL)
            };

            debug!(delay_ms = delay.as_millis() as u64, "Rate limited, waiting for token");
            tokio::select! {
                () = cancel.cancelled() => return Err(LoopError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Take a token now, going into debt if none is available.
    ///
    /// Returns how long the caller must wait before proceeding; zero when a
    /// token was available.
    pub fn reserve(&self) -> Duration {
        let mut bucket = self.lock();
        bucket.refill();
        let wait = bucket.time_to_next_token();
        bucket.tokens -= 1.0;
        wait
    }

    /// Change the hourly budget. Tokens accrued so far are kept, clamped to
    /// the new capacity.
    pub fn set_rate(&self, per_hour: u32) {
        let mut bucket = self.lock();
        bucket.refill();
        let (capacity, refill_rate) = rates(per_hour);
        bucket.capacity = capacity;
        bucket.refill_rate = refill_rate;
        if bucket.tokens > capacity {
            bucket.tokens = capacity;
        }
    }

    /// Tokens currently available (after refill). May be negative after
    /// [`RateLimiter::reserve`].
    pub fn available(&self) -> f64 {
        let mut bucket = self.lock();
        bucket.refill();
        bucket.tokens
    }

    #[must_use]
    pub fn capacity(&self) -> f64 {
        self.lock().capacity
    }

    /// Refill rate in tokens per second.
    #[must_use]
    pub fn refill_rate(&self) -> f64 {
        self.lock().refill_rate
    }

    /// Refill the bucket to capacity.
    pub fn reset(&self) {
        let mut bucket = self.lock();
        bucket.tokens = bucket.capacity;
        bucket.last_refill = Instant::now();
    }
}
