//! loopguard - iteration control for long-running autonomous tasks
//!
//! Drives a "try, check, retry" loop around an opaque executor and keeps it
//! safe with three independent policies: a failure/stagnation circuit
//! breaker, a token-bucket rate limiter and a dual-condition exit detector.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`r#loop`] - Loop controller, phase state machine and safety policies
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Custom error types and handling
//! - [`testing`] - Executor trait and test doubles
//!
//! # Example
//!
//! ```rust,ignore
//! use loopguard::{LoopConfig, LoopController};
//! use loopguard::r#loop::CommandExecutor;
//! use tokio_util::sync::CancellationToken;
//!
//! let config = LoopConfig::discover(".".as_ref())?;
//! let executor = CommandExecutor::new("./step.sh", vec![], ".".into());
//! let controller = LoopController::new(config, executor)?;
//!
//! controller.run(&CancellationToken::new(), &"fix the build".to_string()).await?;
//! println!("{:?}", controller.state());
//! ```

pub mod config;
pub mod error;
pub mod r#loop;
pub mod testing;

// Re-export commonly used types
pub use error::{IterationError, LoopError, Result};

pub use config::{CircuitBreakerConfig, ExitConfig, LoopConfig};

pub use r#loop::{
    CircuitBreaker, CircuitState, ExitDecision, ExitDetector, IterationResult, IterationStatus,
    LoopController, LoopPhase, LoopState, LoopStateSnapshot, RateLimiter, RunMetrics,
};

pub use testing::{Executor, ScriptedExecutor};
