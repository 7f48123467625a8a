//! Iteration control core.
//!
//! This module contains the loop driver and its safety policies:
//!
//! - [`controller`] - Drives an executor iteration by iteration
//! - [`state`] - Phase state machine and run counters
//! - [`breaker`] - Failure and stagnation circuit breaker
//! - [`rate_limit`] - Token-bucket rate limiter
//! - [`exit`] - Heuristic, dual-condition exit detection
//! - [`outcome`] - What an executor reports per iteration
//! - [`operations`] - Real executor implementations
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐     ┌──────────────┐     ┌──────────────┐
//! │LoopController │────>│ LoopState    │<────│ ExitDetector │
//! │               │     │              │     │              │
//! └───────────────┘     └──────────────┘     └──────────────┘
//!       │                                           ^
//!       v                                           │
//! ┌───────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ Executor      │     │ Circuit      │     │ Rate         │
//! │               │     │ Breaker      │     │ Limiter      │
//! └───────────────┘     └──────────────┘     └──────────────┘
//! ```

pub mod breaker;
pub mod controller;
pub mod exit;
pub mod operations;
pub mod outcome;
pub mod rate_limit;
pub mod state;

// Re-exports for convenience
pub use breaker::{BreakerSnapshot, CircuitBreaker, CircuitState, TripReason};
pub use controller::{LoopController, RunMetrics};
pub use exit::{ExitDecision, ExitDetector};
pub use operations::CommandExecutor;
pub use outcome::{IterationResult, IterationStatus, StepProgress};
pub use rate_limit::RateLimiter;
pub use state::{LoopPhase, LoopState, LoopStateSnapshot, PhaseTransition};
