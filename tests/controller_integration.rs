//! Integration tests for the loop controller through the public API

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use loopguard::testing::result;
use loopguard::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, Executor, IterationError,
    IterationResult, LoopConfig, LoopController, LoopError, LoopPhase, RateLimiter,
    ScriptedExecutor,
};

fn config() -> LoopConfig {
    LoopConfig {
        max_iterations: 50,
        cooldown_secs: 0,
        ..Default::default()
    }
}

/// Works through a fixed number of steps, reporting progress as it goes.
struct StepExecutor {
    steps: u32,
    done: AtomicU32,
}

#[async_trait]
impl Executor for StepExecutor {
    type Task = Vec<String>;

    async fn execute(
        &self,
        _cancel: CancellationToken,
        task: &Vec<String>,
    ) -> Result<IterationResult, IterationError> {
        assert_eq!(task.len() as u32, self.steps);
        let done = self.done.fetch_add(1, Ordering::SeqCst) + 1;
        let remaining = self.steps - done;
        Ok(IterationResult::success(10)
            .with_steps(done, self.steps)
            .with_next_tasks(remaining)
            .with_exit_signal(remaining == 0)
            .with_message(format!("step {} of {}", done, self.steps)))
    }
}

#[tokio::test(start_paused = true)]
async fn test_custom_executor_runs_to_completion() {
    let executor = StepExecutor {
        steps: 4,
        done: AtomicU32::new(0),
    };
    let controller = LoopController::new(config(), executor).unwrap();
    let task = vec!["a".into(), "b".into(), "c".into(), "d".into()];

    controller.run(&CancellationToken::new(), &task).await.unwrap();

    let state = controller.state();
    assert_eq!(state.phase, LoopPhase::Complete);
    assert_eq!(state.iteration, 4);
    assert_eq!(state.completed_steps, 4);
    // exit signal, no next tasks, all steps complete
    assert_eq!(state.completion_indicators, 3);
    assert_eq!(controller.metrics().total_changes, 40);
}

#[tokio::test(start_paused = true)]
async fn test_identical_failures_open_circuit_at_threshold() {
    let mut config = config();
    config.circuit_breaker = CircuitBreakerConfig {
        same_error_threshold: 3,
        ..Default::default()
    };
    let executor = ScriptedExecutor::new()
        .then_err_times(IterationError::with_kind("E0308", "mismatched types at 10:4"), 2)
        .then_err(IterationError::with_kind("E0308", "mismatched types at 12:9"));
    let controller = LoopController::new(config, executor).unwrap();

    let err = controller
        .run(&CancellationToken::new(), &"task".to_string())
        .await
        .unwrap_err();

    assert!(err.is_circuit_open());
    assert_eq!(err.exit_code(), 2);
    let breaker = controller.breaker().snapshot();
    assert_eq!(breaker.state, CircuitState::Open);
    assert_eq!(breaker.same_error_count, 3);
    assert!(breaker.opened_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_changing_errors_do_not_trip_breaker() {
    let mut config = config();
    config.circuit_breaker.same_error_threshold = 2;
    config.exit.max_consecutive_errors = 4;
    let executor = ScriptedExecutor::new()
        .then_err(IterationError::new("one"))
        .then_err(IterationError::new("two"))
        .then_err(IterationError::new("three"))
        .then_err(IterationError::new("four"));
    let controller = LoopController::new(config, executor).unwrap();

    let err = controller
        .run(&CancellationToken::new(), &"task".to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, LoopError::ErrorLimit { count: 4, .. }));
    assert_eq!(controller.breaker().state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_shared_breaker_across_controllers() {
    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
        same_error_threshold: 2,
        ..Default::default()
    }));

    let first = LoopController::new(
        config(),
        ScriptedExecutor::new().then_err_times(IterationError::new("disk full"), 2),
    )
    .unwrap()
    .with_breaker(Arc::clone(&breaker));
    let second = LoopController::new(config(), ScriptedExecutor::new())
        .unwrap()
        .with_breaker(Arc::clone(&breaker));

    let cancel = CancellationToken::new();
    assert!(first.run(&cancel, &"a".to_string()).await.is_err());
    let err = second.run(&cancel, &"b".to_string()).await.unwrap_err();
    assert!(err.is_circuit_open());
    assert_eq!(second.executor().calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_spacing_through_controller() {
    // 3600/h: a burst of 360, then one iteration per second
    let limiter = Arc::new(RateLimiter::new(3600));
    while limiter.allow() {}

    let executor = ScriptedExecutor::new()
        .then_ok(result::working(2))
        .then_ok(result::working(2))
        .then_ok(result::finished());
    let controller = LoopController::new(config(), executor)
        .unwrap()
        .with_rate_limiter(Arc::clone(&limiter));

    let start = tokio::time::Instant::now();
    controller
        .run(&CancellationToken::new(), &"task".to_string())
        .await
        .unwrap();
    assert!(start.elapsed() >= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_exit_signal_ignored_while_work_remains() {
    let mut config = config();
    config.max_iterations = 5;
    let claims_done = IterationResult::success(3)
        .with_exit_signal(true)
        .with_next_tasks(2)
        .with_message("making progress");
    let executor = ScriptedExecutor::new().with_fallback(claims_done);
    let controller = LoopController::new(config, executor).unwrap();

    let err = controller
        .run(&CancellationToken::new(), &"task".to_string())
        .await
        .unwrap_err();
    assert!(err.is_exhausted());
    assert_eq!(controller.state().completion_indicators, 1);
}

#[tokio::test(start_paused = true)]
async fn test_external_cancel_while_rate_limited() {
    let mut config = config();
    config.rate_limit_per_hour = 1;
    let controller = Arc::new(LoopController::new(config, ScriptedExecutor::new()).unwrap());
    let cancel = CancellationToken::new();

    let runner = {
        let controller = Arc::clone(&controller);
        let cancel = cancel.clone();
        tokio::spawn(async move { controller.run(&cancel, &"task".to_string()).await })
    };

    tokio::time::sleep(Duration::from_secs(30)).await;
    cancel.cancel();
    let err = runner.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(err.exit_code(), 130);
    // The first token was spent, the second never arrived
    assert_eq!(controller.executor().calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_state_history_is_serializable() {
    let controller = LoopController::new(
        config(),
        ScriptedExecutor::new().then_ok(result::finished()),
    )
    .unwrap();
    controller
        .run(&CancellationToken::new(), &"task".to_string())
        .await
        .unwrap();

    let json = serde_json::to_value(controller.state()).unwrap();
    assert_eq!(json["phase"], "complete");
    let history = json["phase_history"].as_array().unwrap();
    assert_eq!(history.first().unwrap()["to"], "planning");
    assert_eq!(history.last().unwrap()["to"], "complete");
}

/// Counts iterations during which its controller claims to be idle.
#[derive(Default)]
struct WatchingExecutor {
    controller: OnceLock<Weak<LoopController<WatchingExecutor>>>,
    idle_seen: AtomicU32,
}

#[async_trait]
impl Executor for WatchingExecutor {
    type Task = String;

    async fn execute(
        &self,
        _cancel: CancellationToken,
        _task: &String,
    ) -> Result<IterationResult, IterationError> {
        let running = self
            .controller
            .get()
            .and_then(Weak::upgrade)
            .is_some_and(|controller| controller.is_running());
        if !running {
            self.idle_seen.fetch_add(1, Ordering::SeqCst);
        }
        tokio::task::yield_now().await;
        Ok(result::finished())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_runs_keep_controller_marked_running() {
    for _ in 0..500 {
        let controller =
            Arc::new(LoopController::new(config(), WatchingExecutor::default()).unwrap());
        let _ = controller.executor().controller.set(Arc::downgrade(&controller));

        let runs: Vec<_> = (0..2)
            .map(|_| {
                let controller = Arc::clone(&controller);
                tokio::spawn(async move {
                    controller
                        .run(&CancellationToken::new(), &"task".to_string())
                        .await
                })
            })
            .collect();

        let mut completed = 0;
        for run in runs {
            match run.await.unwrap() {
                Ok(()) => completed += 1,
                Err(err) => assert!(matches!(err, LoopError::AlreadyRunning)),
            }
        }

        assert!(completed >= 1);
        assert_eq!(controller.executor().idle_seen.load(Ordering::SeqCst), 0);
        assert!(!controller.is_running());
    }
}

#[tokio::test(start_paused = true)]
async fn test_reset_rejected_until_run_finishes() {
    let executor = ScriptedExecutor::new().then_hang();
    let controller = Arc::new(LoopController::new(config(), executor).unwrap());

    let runner = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            controller
                .run(&CancellationToken::new(), &"task".to_string())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(matches!(controller.reset(), Err(LoopError::AlreadyRunning)));
    assert_eq!(controller.state().phase, LoopPhase::Executing);

    controller.stop();
    assert!(runner.await.unwrap().unwrap_err().is_cancelled());
    assert_eq!(controller.state().phase, LoopPhase::Failed);
    controller.reset().unwrap();
    assert_eq!(controller.state().phase, LoopPhase::Idle);
}
