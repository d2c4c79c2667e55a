// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Bounded retry with exponential backoff and jitter.
//!
//! Two budgets exist. Ordinary transient errors (network, timeouts) retry up
//! to `max_retries` times with exponential backoff. Storage deadlocks get the
//! larger `deadlock_max_retries` budget and a uniformly random delay, so
//! competing writers stop retrying in lock step.

use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetryConfig;

/// Number of retry log entries kept in memory.
pub const RETRY_LOG_CAPACITY: usize = 100;

/// Message fragments treated as transient by default.
const TRANSIENT_MARKERS: &[&str] = &["network", "timeout", "econnrefused", "connection"];

/// Message fragments treated as storage deadlocks by default.
const DEADLOCK_MARKERS: &[&str] = &["deadlock", "database is locked", "lock timeout"];

/// Predicate deciding whether an error is worth another attempt.
pub type RetryPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Default transient check on the error message.
pub fn is_transient_message(message: &str) -> bool {
    let message = message.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| message.contains(m))
}

/// Default deadlock check on the error message.
pub fn is_deadlock_message(message: &str) -> bool {
    let message = message.to_lowercase();
    DEADLOCK_MARKERS.iter().any(|m| message.contains(m))
}

/// Per-call overrides for [`RetryPolicy::execute_with`].
pub struct RetryOptions<E> {
    pub max_retries: Option<u32>,
    pub should_retry: Option<RetryPredicate<E>>,
    /// Cuts a pending backoff short; the last error is returned as is.
    pub cancel: Option<CancellationToken>,
}

impl<E> Default for RetryOptions<E> {
    fn default() -> Self {
        RetryOptions { max_retries: None, should_retry: None, cancel: None }
    }
}

impl<E> Clone for RetryOptions<E> {
    fn clone(&self) -> Self {
        RetryOptions {
            max_retries: self.max_retries,
            should_retry: self.should_retry.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<E> RetryOptions<E> {
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn should_retry(mut self, f: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.should_retry = Some(Arc::new(f));
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// One failed attempt, kept for observability.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryLogEntry {
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    /// 1-based number of the attempt that failed.
    pub attempt: u32,
    pub error: String,
}

/// Retry policy shared by every network and storage call of the engine.
///
/// Cloning is cheap and clones share the retry log.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    log: Arc<Mutex<VecDeque<RetryLogEntry>>>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        RetryPolicy { config, log: Arc::new(Mutex::new(VecDeque::new())) }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Runs `operation` with the default options.
    pub async fn execute<F, Fut, T, E>(&self, label: &str, operation: F) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.execute_with(label, RetryOptions::default(), operation).await
    }

    /// Runs `operation`, retrying failures the options classify as transient.
    ///
    /// On exhaustion the last error is returned unchanged. Total calls are
    /// at most `max_retries + 1` for transient errors, or
    /// `deadlock_max_retries + 1` once deadlocks are involved.
    pub async fn execute_with<F, Fut, T, E>(
        &self,
        label: &str,
        options: RetryOptions<E>,
        operation: F,
    ) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let max_retries = options.max_retries.unwrap_or(self.config.max_retries);
        let mut attempt = 0u32;
        let mut deadlock_attempt = 0u32;

        loop {
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let message = err.to_string();
            let calls = attempt + deadlock_attempt + 1;

            // A caller predicate vetoes every retry, deadlocks included
            if let Some(predicate) = &options.should_retry {
                if !predicate(&err) {
                    return Err(err);
                }
            }

            let delay = if is_deadlock_message(&message) {
                if deadlock_attempt >= self.config.deadlock_max_retries {
                    warn!(operation = label, attempts = calls, error = %message, "deadlock retries exhausted");
                    return Err(err);
                }
                deadlock_attempt += 1;
                self.deadlock_delay()
            } else {
                if options.should_retry.is_none() && !is_transient_message(&message) {
                    return Err(err);
                }
                if attempt >= max_retries {
                    warn!(operation = label, attempts = calls, max_retries, error = %message, "max retries exhausted");
                    return Err(err);
                }
                let delay = self.calculate_delay(attempt);
                attempt += 1;
                delay
            };

            self.record(label, calls, &message);
            debug!(
                operation = label,
                attempt = calls,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "retrying after transient error"
            );

            match &options.cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => {
                            debug!(operation = label, "retry cancelled during backoff");
                            return Err(err);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
        }
    }

    /// Backoff for 0-indexed retry `attempt`.
    ///
    /// `base * multiplier^attempt`, capped at `max_delay`, then scaled by a
    /// uniform factor in `[1 - jitter, 1 + jitter]`.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base = self.config.base_delay_ms as f64 * self.config.backoff_multiplier.powi(exponent);
        let capped = base.min(self.config.max_delay_ms as f64);

        let jitter = self.config.jitter_factor;
        let factor = if jitter > 0.0 {
            rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter))
        } else {
            1.0
        };

        Duration::from_secs_f64((capped * factor).max(0.0) / 1000.0)
    }

    /// Uniformly random delay in the deadlock window.
    pub fn deadlock_delay(&self) -> Duration {
        let min = self.config.deadlock_min_delay_ms;
        let max = self.config.deadlock_max_delay_ms.max(min);
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    /// Snapshot of the retry log, oldest first.
    pub fn retry_log(&self) -> Vec<RetryLogEntry> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).iter().cloned().collect()
    }

    pub fn clear_log(&self) {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn record(&self, label: &str, attempt: u32, error: &str) {
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        if log.len() == RETRY_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(RetryLogEntry {
            timestamp: Utc::now(),
            operation: label.to_string(),
            attempt,
            error: error.to_string(),
        });
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
