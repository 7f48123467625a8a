//! Seams between the control loop and the work it drives.
//!
//! The loop never looks inside a task. Anything that can attempt it once
//! and report an [`IterationResult`] implements [`Executor`], which lets the
//! controller run against a real command in production and a
//! [`ScriptedExecutor`](super::mocks::ScriptedExecutor) in tests.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::IterationError;
use crate::r#loop::outcome::IterationResult;

/// One attempt at a task.
///
/// # Example
///
/// ```rust,ignore
/// use loopguard::testing::Executor;
///
/// async fn attempt_twice<E: Executor>(executor: &E, task: &E::Task) -> bool {
///     for _ in 0..2 {
///         let cancel = CancellationToken::new();
///         if executor.execute(cancel, task).await.is_ok() {
///             return true;
///         }
///     }
///     false
/// }
/// ```
#[async_trait]
pub trait Executor: Send + Sync {
    /// Opaque description of the work.
    type Task: Send + Sync;

    /// Attempt the task once.
    ///
    /// `cancel` fires when the run is stopped or the iteration times out;
    /// implementations should return promptly once it does.
    ///
    /// # Errors
    ///
    /// Returns an [`IterationError`] when the attempt fails. The loop keeps
    /// going until its safety policies say otherwise.
    async fn execute(
        &self,
        cancel: CancellationToken,
        task: &Self::Task,
    ) -> Result<IterationResult, IterationError>;
}

#[async_trait]
impl<E: Executor + ?Sized> Executor for std::sync::Arc<E> {
    type Task = E::Task;

    async fn execute(
        &self,
        cancel: CancellationToken,
        task: &Self::Task,
    ) -> Result<IterationResult, IterationError> {
        (**self).execute(cancel, task).await
    }
}
