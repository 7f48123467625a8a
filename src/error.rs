//! Error types for loopguard.
//!
//! Two layers of errors exist:
//!
//! - [`IterationError`] - a single failed attempt reported by an executor.
//!   These are absorbed by the circuit breaker and never fail a run directly.
//! - [`LoopError`] - the terminal outcome of a run (circuit open, cancelled,
//!   gave up) plus configuration and state machine errors.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::r#loop::state::LoopPhase;

/// Main error type for loopguard operations
#[derive(Error, Debug)]
pub enum LoopError {
    // =========================================================================
    // Run Outcome Errors
    // =========================================================================
    /// The circuit breaker is open and blocks further iterations
    #[error("Circuit breaker open: {reason}")]
    CircuitOpen {
        reason: String,
        #[source]
        source: Option<IterationError>,
    },

    /// Maximum iterations exhausted without the exit detector firing
    #[error("Maximum iterations ({max}) exhausted without completion")]
    MaxIterations { max: u32 },

    /// The driving cancellation token fired
    #[error("Loop cancelled")]
    Cancelled,

    /// Too many consecutive iteration errors
    #[error("Giving up after {count} consecutive iteration errors (limit: {threshold})")]
    ErrorLimit { count: u32, threshold: u32 },

    /// Another run is already active on this controller
    #[error("Loop controller is already running")]
    AlreadyRunning,

    // =========================================================================
    // State Machine Errors
    // =========================================================================
    /// Rejected phase transition
    #[error("Invalid phase transition: {from} -> {to}")]
    InvalidTransition { from: LoopPhase, to: LoopPhase },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// TOML error wrapper
    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LoopError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a circuit-open error with no underlying iteration error
    pub fn circuit_open(reason: impl Into<String>) -> Self {
        Self::CircuitOpen {
            reason: reason.into(),
            source: None,
        }
    }

    /// Create a circuit-open error caused by an iteration error
    pub fn circuit_tripped(reason: impl Into<String>, source: IterationError) -> Self {
        Self::CircuitOpen {
            reason: reason.into(),
            source: Some(source),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Check if this is a circuit-open error
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Check if this error came from cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Check if this error means the loop gave up rather than failed
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::MaxIterations { .. })
    }

    /// Check if this error is fatal (retrying the same run will not help)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MaxIterations { .. }
                | Self::ErrorLimit { .. }
                | Self::Config { .. }
                | Self::InvalidConfig { .. }
        )
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::CircuitOpen { .. } => 2,
            Self::MaxIterations { .. } => 3,
            Self::ErrorLimit { .. } => 4,
            Self::AlreadyRunning => 5,
            Self::Config { .. } | Self::InvalidConfig { .. } => 7,
            Self::Cancelled => 130,
            _ => 1,
        }
    }
}

/// Type alias for loopguard results
pub type Result<T> = std::result::Result<T, LoopError>;

/// A single failed iteration, as reported by an executor.
///
/// The circuit breaker groups repeated failures by [`fingerprint`]: the
/// explicit `kind` when one is set, otherwise the exact message.
///
/// [`fingerprint`]: IterationError::fingerprint
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct IterationError {
    /// Optional stable error code (e.g. "timeout", "E0308")
    pub kind: Option<String>,
    /// Human readable message
    pub message: String,
}

impl IterationError {
    /// Kind used for iterations that exceed the per-iteration timeout.
    pub const TIMEOUT_KIND: &'static str = "timeout";

    /// Create an error from a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: None,
            message: message.into(),
        }
    }

    /// Create an error with an explicit kind
    pub fn with_kind(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            message: message.into(),
        }
    }

    /// Create the error recorded when an iteration exceeds its timeout
    pub fn timeout(limit: Duration) -> Self {
        Self::with_kind(
            Self::TIMEOUT_KIND,
            format!("iteration timed out after {}s", limit.as_secs()),
        )
    }

    /// Key used to decide whether two errors are "the same error".
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        self.kind.as_deref().unwrap_or(&self.message)
    }

    /// Check if this error came from the per-iteration timeout
    pub fn is_timeout(&self) -> bool {
        self.kind.as_deref() == Some(Self::TIMEOUT_KIND)
    }
}

impl From<anyhow::Error> for IterationError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{:#}", err))
    }
}

impl From<std::io::Error> for IterationError {
    fn from(err: std::io::Error) -> Self {
        Self::with_kind(format!("io::{:?}", err.kind()), err.to_string())
    }
}
