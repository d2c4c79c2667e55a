// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]

use super::*;
use yare::parameterized;

#[parameterized(
    record_not_found = { Error::RecordNotFound { entity: "projects".into(), id: "p-1".into() }, "projects/p-1" },
    unknown_entity = { Error::UnknownEntity("widgets".into()), "widgets" },
    invalid_status = { Error::InvalidSyncStatus("dirty".into()), "pending, synced, conflict" },
    invalid_operation = { Error::InvalidOperation("upsert".into()), "insert, update, delete" },
    busy = { Error::Busy("database is locked".into()), "deadlock" },
)]
fn error_display_contains(err: Error, expected: &str) {
    assert!(err.to_string().contains(expected));
}

#[test]
fn error_from_io() {
    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
    let err: Error = io_err.into();
    assert!(matches!(err, Error::Io(_)));
}

#[test]
fn error_from_json() {
    let json_err = serde_json::from_str::<()>("invalid").unwrap_err();
    let err: Error = json_err.into();
    assert!(matches!(err, Error::Json(_)));
}

#[test]
fn error_from_sqlite_busy_maps_to_busy() {
    let sqlite_err = rusqlite::Error::SqliteFailure(
        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
        Some("database is locked".to_string()),
    );
    let err: Error = sqlite_err.into();
    assert!(err.is_busy());
    assert!(err.to_string().contains("deadlock"));
}

#[test]
fn error_from_sqlite_other_maps_to_database() {
    let err: Error = rusqlite::Error::QueryReturnedNoRows.into();
    assert!(matches!(err, Error::Database(_)));
    assert!(!err.is_busy());
}
