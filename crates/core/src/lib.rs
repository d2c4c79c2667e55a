// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! drift-core: data model and local storage for the drift sync engine.
//!
//! This crate provides the record types, entity schemas, field mapping, wire
//! protocol and SQLite store shared by the `driftsync` engine and the
//! `driftd` daemon. Everything here is synchronous; the async behavior lives
//! in the engine.

pub mod clock;
pub mod error;
pub mod mapper;
pub mod protocol;
pub mod record;
pub mod schema;
pub mod store;

pub use clock::{ClockOffset, ClockSource, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use mapper::{FieldMapper, ToLocalOptions};
pub use protocol::{ClientMessage, DownloadResponse, RejectedRecord, ServerMessage, UploadResponse};
pub use record::{
    ChangeLogEntry, ConflictRecord, Operation, RemoteRecord, SyncCursor, SyncStatus,
    SyncableRecord,
};
pub use schema::{EntityRegistry, EntitySchema, FieldKind, FieldMapping};
pub use store::{LocalStore, NewChange, SqliteStore};
