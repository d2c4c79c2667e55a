// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Wall clock abstraction and server clock-skew correction.
//!
//! Devices disagree about the current time. The orchestrator measures the
//! difference once against the server (`offset = server - local`) and brings
//! every remote timestamp into the local frame before comparing it with a
//! local one, so drift alone never produces a false conflict.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Trait for getting the current wall clock time.
///
/// This allows injecting a controllable clock for testing.
pub trait ClockSource: Send + Sync {
    /// Returns the current time in milliseconds since Unix epoch.
    fn now_ms(&self) -> i64;
}

/// System clock implementation using `std::time::SystemTime`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
    }
}

impl<C: ClockSource + ?Sized> ClockSource for std::sync::Arc<C> {
    fn now_ms(&self) -> i64 {
        (**self).now_ms()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    time_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(initial_ms: i64) -> Self {
        ManualClock { time_ms: AtomicI64::new(initial_ms) }
    }

    pub fn set(&self, ms: i64) {
        self.time_ms.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: i64) {
        self.time_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl ClockSource for ManualClock {
    fn now_ms(&self) -> i64 {
        self.time_ms.load(Ordering::SeqCst)
    }
}

/// Measured difference between the server clock and the local clock.
///
/// Zero until [`ClockOffset::measure`] has been called.
#[derive(Debug, Default)]
pub struct ClockOffset {
    offset_ms: AtomicI64,
    measured: AtomicBool,
}

impl ClockOffset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `server_ms - local_ms` and returns it.
    pub fn measure(&self, server_ms: i64, local_ms: i64) -> i64 {
        let offset = server_ms - local_ms;
        self.offset_ms.store(offset, Ordering::SeqCst);
        self.measured.store(true, Ordering::SeqCst);
        offset
    }

    /// Current offset in milliseconds (positive when the server is ahead).
    pub fn get(&self) -> i64 {
        self.offset_ms.load(Ordering::SeqCst)
    }

    pub fn is_measured(&self) -> bool {
        self.measured.load(Ordering::SeqCst)
    }

    /// Converts a server timestamp into the local clock frame.
    pub fn to_local(&self, remote_ms: i64) -> i64 {
        remote_ms - self.get()
    }

    /// Converts a local timestamp into the server clock frame.
    pub fn to_remote(&self, local_ms: i64) -> i64 {
        local_ms + self.get()
    }
}

#[cfg(test)]
#[path = "clock_tests.rs"]
mod tests;
