//! Configuration management for the loop controller.
//!
//! All fields are optional in the on-disk format; anything left out takes the
//! default documented on the field. Durations are configured in whole seconds.
//!
//! # Example
//!
//! `loopguard.toml`:
//! ```toml
//! max_iterations = 50
//! cooldown_secs = 2
//! rate_limit_per_hour = 120
//!
//! [circuit_breaker]
//! same_error_threshold = 3
//!
//! [exit]
//! require_explicit_signal = false
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{LoopError, Result};

/// File name looked up in the project directory.
pub const CONFIG_FILENAME: &str = "loopguard.toml";

/// JSON config path, relative to the project directory.
pub const JSON_CONFIG_PATH: &str = ".loopguard/config.json";

// ============================================================================
// Circuit Breaker
// ============================================================================

/// Thresholds for the failure/stagnation circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive zero-change iterations before opening (default: 3).
    #[serde(default = "default_no_progress_threshold")]
    pub no_progress_threshold: u32,

    /// Identical errors in a row before opening (default: 5).
    #[serde(default = "default_same_error_threshold")]
    pub same_error_threshold: u32,

    /// Percentage drop in change size between iterations that opens the
    /// breaker (default: 70).
    #[serde(default = "default_output_decline_threshold")]
    pub output_decline_threshold: u32,

    /// Seconds an open breaker waits before allowing a trial (default: 300).
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
}

fn default_no_progress_threshold() -> u32 {
    3
}

fn default_same_error_threshold() -> u32 {
    5
}

fn default_output_decline_threshold() -> u32 {
    70
}

fn default_recovery_timeout_secs() -> u64 {
    300
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            no_progress_threshold: default_no_progress_threshold(),
            same_error_threshold: default_same_error_threshold(),
            output_decline_threshold: default_output_decline_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
        }
    }
}

impl CircuitBreakerConfig {
    #[must_use]
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }

    /// Validates the breaker thresholds.
    ///
    /// # Errors
    ///
    /// Returns an error if a threshold is zero or the decline percentage is
    /// outside 1-100.
    pub fn validate(&self) -> Result<()> {
        if self.no_progress_threshold == 0 {
            return Err(LoopError::invalid_config(
                "circuit_breaker.no_progress_threshold",
                "must be at least 1",
            ));
        }
        if self.same_error_threshold == 0 {
            return Err(LoopError::invalid_config(
                "circuit_breaker.same_error_threshold",
                "must be at least 1",
            ));
        }
        if !(1..=100).contains(&self.output_decline_threshold) {
            return Err(LoopError::invalid_config(
                "circuit_breaker.output_decline_threshold",
                format!("must be 1-100, got {}", self.output_decline_threshold),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Exit Detection
// ============================================================================

/// Thresholds for the exit detector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitConfig {
    /// Require the executor's explicit exit signal on top of the indicator
    /// count (default: true).
    #[serde(default = "default_true")]
    pub require_explicit_signal: bool,

    /// Completion indicators needed to exit (default: 2).
    #[serde(default = "default_completion_threshold")]
    pub completion_threshold: u32,

    /// Zero-change iterations in a row that force an exit (default: 3).
    #[serde(default = "default_max_consecutive_no_progress")]
    pub max_consecutive_no_progress: u32,

    /// Failed iterations in a row that force an exit (default: 5).
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
}

fn default_true() -> bool {
    true
}

fn default_completion_threshold() -> u32 {
    2
}

fn default_max_consecutive_no_progress() -> u32 {
    3
}

fn default_max_consecutive_errors() -> u32 {
    5
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            require_explicit_signal: true,
            completion_threshold: default_completion_threshold(),
            max_consecutive_no_progress: default_max_consecutive_no_progress(),
            max_consecutive_errors: default_max_consecutive_errors(),
        }
    }
}

impl ExitConfig {
    /// Validates the exit thresholds.
    ///
    /// # Errors
    ///
    /// Returns an error if any threshold is zero.
    pub fn validate(&self) -> Result<()> {
        let thresholds = [
            ("exit.completion_threshold", self.completion_threshold),
            (
                "exit.max_consecutive_no_progress",
                self.max_consecutive_no_progress,
            ),
            ("exit.max_consecutive_errors", self.max_consecutive_errors),
        ];

        for (field, value) in thresholds {
            if value == 0 {
                return Err(LoopError::invalid_config(field, "must be at least 1"));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Loop Controller
// ============================================================================

/// Configuration for a [`LoopController`](crate::r#loop::controller::LoopController).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Iteration cap for a single run (default: 1000).
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Per-iteration executor timeout in seconds (default: 900).
    #[serde(default = "default_iteration_timeout_secs")]
    pub iteration_timeout_secs: u64,

    /// Pause between iterations in seconds (default: 5).
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Iterations allowed per hour; 0 disables rate limiting (default: 0).
    #[serde(default)]
    pub rate_limit_per_hour: u32,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub exit: ExitConfig,
}

fn default_max_iterations() -> u32 {
    1000
}

fn default_iteration_timeout_secs() -> u64 {
    15 * 60
}

fn default_cooldown_secs() -> u64 {
    5
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            iteration_timeout_secs: default_iteration_timeout_secs(),
            cooldown_secs: default_cooldown_secs(),
            rate_limit_per_hour: 0,
            circuit_breaker: CircuitBreakerConfig::default(),
            exit: ExitConfig::default(),
        }
    }
}

impl LoopConfig {
    #[must_use]
    pub fn iteration_timeout(&self) -> Duration {
        Duration::from_secs(self.iteration_timeout_secs)
    }

    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    /// Returns true if a rate limit is configured.
    #[must_use]
    pub fn rate_limited(&self) -> bool {
        self.rate_limit_per_hour > 0
    }

    /// Validates the whole configuration.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(LoopError::invalid_config(
                "max_iterations",
                "must be at least 1",
            ));
        }
        if self.iteration_timeout_secs == 0 {
            return Err(LoopError::invalid_config(
                "iteration_timeout_secs",
                "must be at least 1",
            ));
        }
        self.circuit_breaker.validate()?;
        self.exit.validate()
    }

    /// Load configuration from a file.
    ///
    /// `.json` files are parsed as JSON, everything else as TOML. A missing
    /// file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// if the parsed configuration fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let config: LoopConfig = if is_json {
            serde_json::from_str(&content).map_err(|e| {
                LoopError::config_with_path(e.to_string(), path.to_path_buf())
            })?
        } else {
            toml::from_str(&content).map_err(|e| {
                LoopError::config_with_path(e.to_string(), path.to_path_buf())
            })?
        };

        config.validate()?;
        Ok(config)
    }

    /// Find and load configuration for a project directory.
    ///
    /// Looks for `loopguard.toml`, then `.loopguard/config.json`, then the
    /// user config directory. Falls back to defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a discovered file fails to load.
    pub fn discover(project_dir: &Path) -> Result<Self> {
        match Self::locate(project_dir) {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    /// First existing config file for `project_dir`, if any.
    #[must_use]
    pub fn locate(project_dir: &Path) -> Option<PathBuf> {
        let candidates = [
            Some(project_dir.join(CONFIG_FILENAME)),
            Some(project_dir.join(JSON_CONFIG_PATH)),
            Self::user_config_path(),
        ];
        candidates.into_iter().flatten().find(|p| p.exists())
    }

    /// Per-user config file (`~/.config/loopguard/loopguard.toml` on Linux).
    #[must_use]
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("loopguard").join(CONFIG_FILENAME))
    }

    /// Serialize to TOML, as written by `loopguard config init`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| LoopError::config(e.to_string()))
    }
}
