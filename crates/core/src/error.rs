// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Error types for drift-core operations.

use thiserror::Error;

/// All possible errors that can occur in drift-core operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("record not found: {entity}/{id}")]
    RecordNotFound { entity: String, id: String },

    #[error("unknown entity: '{0}'\n  hint: register the entity schema before syncing it")]
    UnknownEntity(String),

    #[error("invalid entity schema '{entity}': {reason}")]
    InvalidSchema { entity: String, reason: String },

    #[error("invalid sync status: '{0}'\n  hint: valid statuses are: pending, synced, conflict")]
    InvalidSyncStatus(String),

    #[error("invalid operation: '{0}'\n  hint: valid operations are: insert, update, delete")]
    InvalidOperation(String),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("invalid sync status transition: cannot go from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("storage deadlock: {0}")]
    Busy(String),

    #[error("database error: {0}")]
    Database(rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupted data: {0}")]
    CorruptedData(String),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match e.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                Error::Busy(e.to_string())
            }
            _ => Error::Database(e),
        }
    }
}

impl Error {
    /// Returns true for lock contention on the backing store.
    ///
    /// These are retried with the deadlock budget rather than surfaced.
    pub fn is_busy(&self) -> bool {
        matches!(self, Error::Busy(_))
    }
}

/// A specialized Result type for drift-core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
