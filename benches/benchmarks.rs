//! Benchmark suite for the loop's safety policies.
//!
//! This module provides performance benchmarks for the per-iteration hot
//! paths:
//! - Circuit breaker bookkeeping
//! - Rate limiter token accounting
//! - Exit detection
//!
//! # Running Benchmarks
//!
//! ```bash
//! # Run all benchmarks
//! cargo bench
//!
//! # Save baseline for comparison
//! cargo bench -- --save-baseline main
//!
//! # Compare against baseline
//! cargo bench -- --baseline main
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use loopguard::config::{CircuitBreakerConfig, ExitConfig};
use loopguard::{
    CircuitBreaker, ExitDetector, IterationError, IterationResult, LoopPhase, LoopState,
    RateLimiter,
};

// ============================================================================
// Circuit Breaker Benchmarks
// ============================================================================

/// Alternating fingerprints keep the breaker closed, so every call takes the
/// full bookkeeping path.
fn bench_breaker_record(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker");

    let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
    let first = IterationError::with_kind("E0308", "mismatched types");
    let second = IterationError::new("use of moved value: `config`");
    group.bench_function("record_error_alternating", |b| {
        b.iter(|| {
            breaker.record_error(black_box(&first));
            breaker.record_error(black_box(&second));
        });
    });

    let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
    group.bench_function("record_success_steady", |b| {
        b.iter(|| breaker.record_success(black_box(5)));
    });

    group.bench_function("is_open_closed", |b| {
        b.iter(|| black_box(breaker.is_open()));
    });

    group.finish();
}

// ============================================================================
// Rate Limiter Benchmarks
// ============================================================================

fn bench_rate_limiter(c: &mut Criterion) {
    let mut group = c.benchmark_group("rate_limiter");

    for per_hour in [60, 3600, 360_000] {
        let limiter = RateLimiter::new(per_hour);
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("allow", per_hour), &limiter, |b, limiter| {
            b.iter(|| black_box(limiter.allow()));
        });
    }

    let limiter = RateLimiter::new(3600);
    group.bench_function("reserve_and_reset", |b| {
        b.iter(|| {
            black_box(limiter.reserve());
            limiter.reset();
        });
    });

    group.finish();
}

// ============================================================================
// Exit Detection Benchmarks
// ============================================================================

fn bench_exit_detection(c: &mut Criterion) {
    let mut group = c.benchmark_group("exit_detector");

    let state = LoopState::new();
    if state.begin_run().is_err() || state.transition(LoopPhase::Executing).is_err() {
        return;
    }
    state.set_step_progress(3, 5);

    let detector = ExitDetector::new(ExitConfig::default());
    let results = [
        (
            "working",
            IterationResult::success(4)
                .with_next_tasks(2)
                .with_message("refactoring the parser module"),
        ),
        (
            "finished",
            IterationResult::success(1)
                .with_exit_signal(true)
                .with_artifact("SUMMARY.md")
                .with_message("All tasks finished successfully"),
        ),
    ];

    for (name, result) in &results {
        group.bench_with_input(BenchmarkId::new("evaluate", name), result, |b, result| {
            b.iter(|| black_box(detector.evaluate(black_box(result), &state)));
        });
    }

    let long_message = "compiling crate ".repeat(256);
    group.throughput(Throughput::Bytes(long_message.len() as u64));
    group.bench_function("keyword_scan_miss", |b| {
        b.iter(|| black_box(detector.is_completion_message(black_box(&long_message))));
    });

    group.finish();
}

criterion_group!(breaker_benches, bench_breaker_record);

criterion_group!(limiter_benches, bench_rate_limiter);

criterion_group!(exit_benches, bench_exit_detection);

criterion_main!(breaker_benches, limiter_benches, exit_benches);
