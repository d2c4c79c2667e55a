// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]

use super::*;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use yare::parameterized;

#[derive(Debug, Clone, PartialEq)]
struct TestError(&'static str);

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

fn fast_config(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        base_delay_ms: 0,
        max_delay_ms: 0,
        jitter_factor: 0.0,
        deadlock_min_delay_ms: 0,
        deadlock_max_delay_ms: 0,
        ..RetryConfig::default()
    }
}

fn ms(d: Duration) -> u128 {
    d.as_millis()
}

#[tokio::test]
async fn success_on_first_attempt() {
    let policy = RetryPolicy::new(fast_config(3));
    let calls = Arc::new(AtomicU32::new(0));

    let result: Result<&str, TestError> = policy
        .execute("op", || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("done")
            }
        })
        .await;

    assert_eq!(result.unwrap(), "done");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(policy.retry_log().is_empty());
}

#[tokio::test]
async fn two_failures_then_success_takes_three_calls() {
    let policy = RetryPolicy::new(fast_config(3));
    let calls = Arc::new(AtomicU32::new(0));

    let result: Result<u32, TestError> = policy
        .execute("upload notes", || {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(TestError("network unreachable"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

    assert_eq!(result.unwrap(), 42);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let log = policy.retry_log();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].operation, "upload notes");
    assert_eq!(log[0].attempt, 1);
    assert_eq!(log[1].attempt, 2);
    assert_eq!(log[1].error, "network unreachable");
}

#[tokio::test]
async fn always_failing_propagates_original_error() {
    let policy = RetryPolicy::new(fast_config(3));
    let calls = Arc::new(AtomicU32::new(0));

    let result: Result<(), TestError> = policy
        .execute("op", || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError("request timeout"))
            }
        })
        .await;

    assert_eq!(result.unwrap_err(), TestError("request timeout"));
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn non_retryable_error_returns_immediately() {
    let policy = RetryPolicy::new(fast_config(5));
    let calls = Arc::new(AtomicU32::new(0));

    let result: Result<(), TestError> = policy
        .execute("op", || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError("validation failed: title required"))
            }
        })
        .await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn options_override_budget_and_predicate() {
    let policy = RetryPolicy::new(fast_config(1));
    let calls = Arc::new(AtomicU32::new(0));

    let options = RetryOptions::default()
        .max_retries(5)
        .should_retry(|e: &TestError| e.0.starts_with("validation"));

    let result: Result<(), TestError> = policy
        .execute_with("op", options, || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError("validation failed"))
            }
        })
        .await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn zero_max_retries_still_makes_one_call() {
    let policy = RetryPolicy::new(fast_config(0));
    let calls = Arc::new(AtomicU32::new(0));

    let result: Result<(), TestError> = policy
        .execute("op", || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError("network down"))
            }
        })
        .await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn deadlocks_use_separate_budget() {
    let policy = RetryPolicy::new(RetryConfig { max_retries: 1, ..RetryConfig::default() });
    let calls = Arc::new(AtomicU32::new(0));
    let started = tokio::time::Instant::now();

    let result: Result<(), TestError> = policy
        .execute("write", || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError("storage deadlock: database is locked"))
            }
        })
        .await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 11);
    // 10 random waits, each within [10, 250] ms
    let elapsed = ms(started.elapsed());
    assert!((100..=2_500).contains(&elapsed), "elapsed {elapsed}ms");
}

#[tokio::test]
async fn predicate_can_refuse_a_deadlock_retry() {
    let policy = RetryPolicy::new(fast_config(3));
    let calls = Arc::new(AtomicU32::new(0));
    let options = RetryOptions::default().should_retry(|e: &TestError| !e.0.contains("constraint"));

    let result: Result<(), TestError> = policy
        .execute_with("write", options, || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError("constraint failed after deadlock"))
            }
        })
        .await;

    assert_eq!(result, Err(TestError("constraint failed after deadlock")));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(policy.retry_log().is_empty());
}

#[tokio::test]
async fn accepted_deadlock_keeps_its_own_budget() {
    let policy = RetryPolicy::new(fast_config(0));
    let calls = Arc::new(AtomicU32::new(0));
    let options = RetryOptions::default().should_retry(|_: &TestError| true);

    let result: Result<(), TestError> = policy
        .execute_with("write", options, || {
            let calls = Arc::clone(&calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TestError("deadlock detected"))
                } else {
                    Ok(())
                }
            }
        })
        .await;

    assert!(result.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn backoff_waits_between_attempts() {
    let policy = RetryPolicy::new(RetryConfig { jitter_factor: 0.0, ..RetryConfig::default() });
    let started = tokio::time::Instant::now();

    let result: Result<(), TestError> =
        policy.execute("op", || async { Err(TestError("network down")) }).await;

    assert!(result.is_err());
    // 100 + 200 + 400
    let elapsed = ms(started.elapsed());
    assert!((700..=710).contains(&elapsed), "elapsed {elapsed}ms");
}

#[tokio::test(start_paused = true)]
async fn cancellation_cuts_backoff_short() {
    let policy = RetryPolicy::new(RetryConfig {
        base_delay_ms: 10_000,
        max_delay_ms: 60_000,
        ..RetryConfig::default()
    });
    let calls = Arc::new(AtomicU32::new(0));
    let token = CancellationToken::new();

    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let started = tokio::time::Instant::now();
    let result: Result<(), TestError> = policy
        .execute_with("op", RetryOptions::default().cancel(token), || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError("connection reset"))
            }
        })
        .await;

    assert_eq!(result.unwrap_err(), TestError("connection reset"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(ms(started.elapsed()) < 1_000);
}

#[parameterized(
    first = { 0, 70, 130 },
    second = { 1, 140, 260 },
    third = { 2, 280, 520 },
)]
fn backoff_shape_with_jitter(attempt: u32, low: u128, high: u128) {
    let policy = RetryPolicy::default();
    for _ in 0..200 {
        let delay = ms(policy.calculate_delay(attempt));
        assert!((low..=high).contains(&delay), "attempt {attempt}: {delay}ms");
    }
}

#[test]
fn backoff_without_jitter_is_exact() {
    let policy = RetryPolicy::new(RetryConfig { jitter_factor: 0.0, ..RetryConfig::default() });
    assert_eq!(policy.calculate_delay(0), Duration::from_millis(100));
    assert_eq!(policy.calculate_delay(1), Duration::from_millis(200));
    assert_eq!(policy.calculate_delay(3), Duration::from_millis(800));
}

#[test]
fn backoff_is_capped_before_jitter() {
    let policy = RetryPolicy::new(RetryConfig { max_delay_ms: 1_000, ..RetryConfig::default() });
    for _ in 0..100 {
        let delay = ms(policy.calculate_delay(20));
        assert!((700..=1_300).contains(&delay), "{delay}ms");
    }
}

#[test]
fn deadlock_delay_stays_in_window() {
    let policy = RetryPolicy::default();
    for _ in 0..200 {
        let delay = ms(policy.deadlock_delay());
        assert!((10..=250).contains(&delay), "{delay}ms");
    }
}

#[tokio::test]
async fn retry_log_is_bounded() {
    let policy = RetryPolicy::new(fast_config(149));

    let result: Result<(), TestError> =
        policy.execute("op", || async { Err(TestError("timeout")) }).await;

    assert!(result.is_err());
    let log = policy.retry_log();
    assert_eq!(log.len(), RETRY_LOG_CAPACITY);
    assert_eq!(log[0].attempt, 50);
    assert_eq!(log[RETRY_LOG_CAPACITY - 1].attempt, 149);

    policy.clear_log();
    assert!(policy.retry_log().is_empty());
}

#[parameterized(
    network = { "network unreachable", true },
    timeout = { "request timeout after 500ms", true },
    refused = { "connect ECONNREFUSED 127.0.0.1:7890", true },
    connection = { "connection closed", true },
    validation = { "validation failed", false },
    auth = { "unauthorized", false },
)]
fn default_transient_classification(message: &str, expected: bool) {
    assert_eq!(is_transient_message(message), expected);
}

#[parameterized(
    deadlock = { "Deadlock detected", true },
    sqlite_locked = { "storage deadlock: database is locked", true },
    lock_timeout = { "lock timeout exceeded", true },
    network = { "network unreachable", false },
)]
fn default_deadlock_classification(message: &str, expected: bool) {
    assert_eq!(is_deadlock_message(message), expected);
}
