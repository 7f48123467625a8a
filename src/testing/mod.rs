//! Testing infrastructure for loopguard.
//!
//! - **Traits**: the [`Executor`] seam the controller drives
//! - **Mocks**: [`ScriptedExecutor`], a queue-driven test double
//!
//! # Example
//!
//! ```rust,ignore
//! use loopguard::testing::{result, ScriptedExecutor};
//!
//! let executor = ScriptedExecutor::new()
//!     .then_ok(result::working(3))
//!     .then_ok(result::finished());
//! ```

pub mod mocks;
pub mod traits;

// Re-export commonly used types
pub use mocks::*;
pub use traits::*;
