// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Error types for the sync engine.
//!
//! Errors fall into three groups. Transient failures (network, timeouts,
//! storage deadlocks) are retried internally and only surface once retries
//! run out. Rejections come from the server and are reported per record.
//! Setup failures abort a whole sync cycle.

use thiserror::Error;

use crate::connection::ConnectionError;
use crate::queue::QueueError;
use crate::transport::TransportError;

/// All possible errors that can occur in sync engine operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] drift_core::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("record '{id}' rejected by server: {reason}")]
    Rejected { id: String, reason: String },

    #[error("server error: {0}")]
    Remote(String),

    #[error("sync engine not initialized\n  hint: call initialize() with a device id first")]
    NotInitialized,

    #[error("sync setup failed: {0}")]
    Setup(String),

    #[error("server time query failed: {0}")]
    ClockQuery(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true if retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transport(_) => true,
            Error::Connection(e) => e.is_transient(),
            Error::Core(e) => e.is_busy(),
            _ => false,
        }
    }

    /// Returns true for failures that must abort a whole sync cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::NotInitialized | Error::Setup(_) | Error::ClockQuery(_))
    }
}

/// A specialized Result type for sync engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
