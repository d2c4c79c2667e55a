// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Local storage for syncable records, the change log and sync bookkeeping.
//!
//! [`LocalStore`] is the seam the sync engine talks to; [`SqliteStore`] is the
//! SQLite-backed implementation. Every read-modify-write goes through a single
//! `IMMEDIATE` transaction so an application write racing a download can never
//! leave a torn record behind.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::record::{ChangeLogEntry, ConflictRecord, Operation, SyncCursor, SyncableRecord};

/// SQL schema for the local sync store.
pub const SCHEMA: &str = r#"
-- Entity rows, one table for all entities; application columns live in `fields`
CREATE TABLE IF NOT EXISTS records (
    entity TEXT NOT NULL,
    id TEXT NOT NULL,
    fields TEXT NOT NULL,
    sync_status TEXT NOT NULL DEFAULT 'pending',
    synced_at INTEGER,
    device_id TEXT NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (entity, id)
);

-- Append-only local mutation log; only `applied` is ever updated
CREATE TABLE IF NOT EXISTS change_log (
    entity TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    record_id TEXT NOT NULL,
    operation TEXT NOT NULL,
    payload TEXT NOT NULL,
    device_id TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    applied INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (entity, sequence)
);

-- Download cursors per (entity, device)
CREATE TABLE IF NOT EXISTS sync_cursors (
    entity TEXT NOT NULL,
    device_id TEXT NOT NULL,
    last_synced_sequence INTEGER NOT NULL,
    last_synced_at INTEGER NOT NULL,
    PRIMARY KEY (entity, device_id)
);

-- Unresolved write/write conflicts
CREATE TABLE IF NOT EXISTS conflicts (
    entity TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    local_version TEXT NOT NULL,
    remote_version TEXT NOT NULL,
    detected_at INTEGER NOT NULL,
    PRIMARY KEY (entity, entity_id)
);

-- Persisted device settings (device_id)
CREATE TABLE IF NOT EXISTS device (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_records_status ON records(entity, sync_status);
CREATE INDEX IF NOT EXISTS idx_change_log_record ON change_log(entity, record_id, applied);
"#;

const RECORD_COLUMNS: &str =
    "id, fields, sync_status, synced_at, device_id, deleted, updated_at";

const CHANGE_COLUMNS: &str =
    "entity, sequence, record_id, operation, payload, device_id, timestamp, applied";

/// Closure applied to the current record inside a store transaction.
///
/// Returning `Ok(None)` leaves the row untouched.
pub type RecordUpdate<'a> =
    &'a mut dyn FnMut(Option<SyncableRecord>) -> Result<Option<SyncableRecord>>;

/// Closure producing the owning record for a change log entry.
pub type ChangeApply<'a> = &'a mut dyn FnMut(Option<SyncableRecord>) -> Result<SyncableRecord>;

/// A change log entry that has not been assigned a sequence yet.
#[derive(Debug, Clone)]
pub struct NewChange<'a> {
    pub entity: &'a str,
    pub record_id: &'a str,
    pub operation: Operation,
    pub payload: &'a Value,
    pub device_id: &'a str,
    pub timestamp: i64,
}

/// The local storage engine consumed by the sync engine.
pub trait LocalStore: Send + Sync {
    fn get(&self, entity: &str, id: &str) -> Result<Option<SyncableRecord>>;

    fn put(&self, entity: &str, record: &SyncableRecord) -> Result<()>;

    /// Atomic read-modify-write of one record.
    ///
    /// Returns the record as written, or `None` if `f` declined to write.
    fn update(&self, entity: &str, id: &str, f: RecordUpdate<'_>)
        -> Result<Option<SyncableRecord>>;

    /// All records of an entity with `sync_status = pending`.
    fn pending(&self, entity: &str) -> Result<Vec<SyncableRecord>>;

    fn all(&self, entity: &str) -> Result<Vec<SyncableRecord>>;

    /// Appends a change with the next per-entity sequence and writes the
    /// owning record produced by `f`, in one transaction.
    fn append_change(
        &self,
        change: NewChange<'_>,
        f: ChangeApply<'_>,
    ) -> Result<(ChangeLogEntry, SyncableRecord)>;

    /// Entries with `sequence > since`, unapplied first, each group by sequence.
    fn changes_since(&self, entity: &str, since: u64) -> Result<Vec<ChangeLogEntry>>;

    /// Sequences of unapplied entries for one record.
    fn unapplied_for_record(&self, entity: &str, record_id: &str) -> Result<Vec<u64>>;

    /// Flags entries as applied. Returns how many changed state.
    fn mark_applied(&self, entity: &str, sequences: &[u64]) -> Result<usize>;

    fn entities_with_unapplied(&self) -> Result<Vec<String>>;

    fn cursor(&self, entity: &str, device_id: &str) -> Result<Option<SyncCursor>>;

    /// Stores `cursor` if it does not roll the current one back.
    ///
    /// Returns whether the stored cursor changed.
    fn advance_cursor(&self, cursor: &SyncCursor) -> Result<bool>;

    /// Explicit re-sync reset.
    fn reset_cursor(&self, entity: &str, device_id: &str) -> Result<()>;

    fn save_conflict(&self, conflict: &ConflictRecord) -> Result<()>;

    fn conflicts(&self, entity: &str) -> Result<Vec<ConflictRecord>>;

    fn remove_conflict(&self, entity: &str, entity_id: &str) -> Result<bool>;

    fn device_id(&self) -> Result<Option<String>>;

    fn set_device_id(&self, device_id: &str) -> Result<()>;
}

/// Convert a typed error into a rusqlite row-mapping error.
fn conversion_error(err: Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
}

/// Parse a string value from the database, returning a rusqlite error on parse failure.
fn parse_db<T: std::str::FromStr>(
    value: &str,
    column: &str,
) -> std::result::Result<T, rusqlite::Error> {
    value.parse().map_err(|_| {
        conversion_error(Error::CorruptedData(format!(
            "invalid value '{value}' in column '{column}'"
        )))
    })
}

/// Parse a JSON column.
fn parse_json<T: serde::de::DeserializeOwned>(
    value: &str,
    column: &str,
) -> std::result::Result<T, rusqlite::Error> {
    serde_json::from_str(value).map_err(|e| {
        conversion_error(Error::CorruptedData(format!("invalid JSON in column '{column}': {e}")))
    })
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncableRecord> {
    let fields: String = row.get(1)?;
    let status: String = row.get(2)?;

    Ok(SyncableRecord {
        id: row.get(0)?,
        fields: parse_json::<Map<String, Value>>(&fields, "fields")?,
        sync_status: parse_db(&status, "sync_status")?,
        synced_at: row.get(3)?,
        device_id: row.get(4)?,
        deleted: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn change_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChangeLogEntry> {
    let operation: String = row.get(3)?;
    let payload: String = row.get(4)?;
    let sequence: i64 = row.get(1)?;

    Ok(ChangeLogEntry {
        entity: row.get(0)?,
        sequence: sequence as u64,
        record_id: row.get(2)?,
        operation: parse_db(&operation, "operation")?,
        payload: parse_json(&payload, "payload")?,
        device_id: row.get(5)?,
        timestamp: row.get(6)?,
        applied: row.get(7)?,
    })
}

fn read_record(conn: &Connection, entity: &str, id: &str) -> Result<Option<SyncableRecord>> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM records WHERE entity = ?1 AND id = ?2");
    Ok(conn.query_row(&sql, params![entity, id], record_from_row).optional()?)
}

fn write_record(conn: &Connection, entity: &str, record: &SyncableRecord) -> Result<()> {
    let fields = serde_json::to_string(&record.fields)?;
    conn.execute(
        "INSERT INTO records (entity, id, fields, sync_status, synced_at, device_id, deleted, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT (entity, id) DO UPDATE SET
             fields = excluded.fields,
             sync_status = excluded.sync_status,
             synced_at = excluded.synced_at,
             device_id = excluded.device_id,
             deleted = excluded.deleted,
             updated_at = excluded.updated_at",
        params![
            entity,
            record.id,
            fields,
            record.sync_status.as_str(),
            record.synced_at,
            record.device_id,
            record.deleted,
            record.updated_at,
        ],
    )?;
    Ok(())
}

/// SQLite-backed [`LocalStore`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open a store at the given path, creating the schema if needed.
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;

        // WAL mode lets readers proceed while a sync transaction writes
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = %path.display(), "store opened");

        Ok(SqliteStore { conn: Mutex::new(conn) })
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteStore { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn query_records(&self, sql: &str, entity: &str) -> Result<Vec<SyncableRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![entity], record_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

impl LocalStore for SqliteStore {
    fn get(&self, entity: &str, id: &str) -> Result<Option<SyncableRecord>> {
        read_record(&self.conn(), entity, id)
    }

    fn put(&self, entity: &str, record: &SyncableRecord) -> Result<()> {
        write_record(&self.conn(), entity, record)
    }

    fn update(
        &self,
        entity: &str,
        id: &str,
        f: RecordUpdate<'_>,
    ) -> Result<Option<SyncableRecord>> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = read_record(&tx, entity, id)?;
        let written = match f(current)? {
            Some(record) => {
                if record.id != id {
                    return Err(Error::InvalidRecord(format!(
                        "update of '{id}' produced record '{}'",
                        record.id
                    )));
                }
                write_record(&tx, entity, &record)?;
                Some(record)
            }
            None => None,
        };

        tx.commit()?;
        Ok(written)
    }

    fn pending(&self, entity: &str) -> Result<Vec<SyncableRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM records
             WHERE entity = ?1 AND sync_status = 'pending'
             ORDER BY updated_at DESC, id"
        );
        self.query_records(&sql, entity)
    }

    fn all(&self, entity: &str) -> Result<Vec<SyncableRecord>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM records WHERE entity = ?1 ORDER BY id");
        self.query_records(&sql, entity)
    }

    fn append_change(
        &self,
        change: NewChange<'_>,
        f: ChangeApply<'_>,
    ) -> Result<(ChangeLogEntry, SyncableRecord)> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = read_record(&tx, change.entity, change.record_id)?;
        let record = f(current)?;
        if record.id != change.record_id {
            return Err(Error::InvalidRecord(format!(
                "change for '{}' produced record '{}'",
                change.record_id, record.id
            )));
        }
        write_record(&tx, change.entity, &record)?;

        let last: i64 = tx.query_row(
            "SELECT COALESCE(MAX(sequence), 0) FROM change_log WHERE entity = ?1",
            params![change.entity],
            |row| row.get(0),
        )?;
        let sequence = last + 1;

        tx.execute(
            "INSERT INTO change_log (entity, sequence, record_id, operation, payload, device_id, timestamp, applied)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
            params![
                change.entity,
                sequence,
                change.record_id,
                change.operation.as_str(),
                serde_json::to_string(change.payload)?,
                change.device_id,
                change.timestamp,
            ],
        )?;

        tx.commit()?;

        let entry = ChangeLogEntry {
            entity: change.entity.to_string(),
            record_id: change.record_id.to_string(),
            operation: change.operation,
            payload: change.payload.clone(),
            sequence: sequence as u64,
            device_id: change.device_id.to_string(),
            timestamp: change.timestamp,
            applied: false,
        };
        Ok((entry, record))
    }

    fn changes_since(&self, entity: &str, since: u64) -> Result<Vec<ChangeLogEntry>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {CHANGE_COLUMNS} FROM change_log
             WHERE entity = ?1 AND sequence > ?2
             ORDER BY applied ASC, sequence ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![entity, since as i64], change_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    fn unapplied_for_record(&self, entity: &str, record_id: &str) -> Result<Vec<u64>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT sequence FROM change_log
             WHERE entity = ?1 AND record_id = ?2 AND applied = 0
             ORDER BY sequence",
        )?;
        let rows = stmt.query_map(params![entity, record_id], |row| row.get::<_, i64>(0))?;
        let sequences = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sequences.into_iter().map(|s| s as u64).collect())
    }

    fn mark_applied(&self, entity: &str, sequences: &[u64]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut changed = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE change_log SET applied = 1
                 WHERE entity = ?1 AND sequence = ?2 AND applied = 0",
            )?;
            for seq in sequences {
                changed += stmt.execute(params![entity, *seq as i64])?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    fn entities_with_unapplied(&self) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT entity FROM change_log WHERE applied = 0 ORDER BY entity",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    fn cursor(&self, entity: &str, device_id: &str) -> Result<Option<SyncCursor>> {
        let conn = self.conn();
        let cursor = conn
            .query_row(
                "SELECT last_synced_sequence, last_synced_at FROM sync_cursors
                 WHERE entity = ?1 AND device_id = ?2",
                params![entity, device_id],
                |row| {
                    let seq: i64 = row.get(0)?;
                    Ok(SyncCursor {
                        entity: entity.to_string(),
                        device_id: device_id.to_string(),
                        last_synced_sequence: seq as u64,
                        last_synced_at: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(cursor)
    }

    fn advance_cursor(&self, cursor: &SyncCursor) -> Result<bool> {
        let changed = self.conn().execute(
            "INSERT INTO sync_cursors (entity, device_id, last_synced_sequence, last_synced_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (entity, device_id) DO UPDATE SET
                 last_synced_sequence = excluded.last_synced_sequence,
                 last_synced_at = excluded.last_synced_at
             WHERE excluded.last_synced_sequence >= sync_cursors.last_synced_sequence
               AND excluded.last_synced_at >= sync_cursors.last_synced_at
               AND (excluded.last_synced_sequence != sync_cursors.last_synced_sequence
                    OR excluded.last_synced_at != sync_cursors.last_synced_at)",
            params![
                cursor.entity,
                cursor.device_id,
                cursor.last_synced_sequence as i64,
                cursor.last_synced_at,
            ],
        )?;
        if changed == 0 {
            trace!(entity = %cursor.entity, sequence = cursor.last_synced_sequence, "cursor not moved");
        }
        Ok(changed > 0)
    }

    fn reset_cursor(&self, entity: &str, device_id: &str) -> Result<()> {
        self.conn().execute(
            "DELETE FROM sync_cursors WHERE entity = ?1 AND device_id = ?2",
            params![entity, device_id],
        )?;
        Ok(())
    }

    fn save_conflict(&self, conflict: &ConflictRecord) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO conflicts (entity, entity_id, local_version, remote_version, detected_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                conflict.entity,
                conflict.entity_id,
                serde_json::to_string(&conflict.local_version)?,
                serde_json::to_string(&conflict.remote_version)?,
                conflict.detected_at,
            ],
        )?;
        Ok(())
    }

    fn conflicts(&self, entity: &str) -> Result<Vec<ConflictRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT entity, entity_id, local_version, remote_version, detected_at
             FROM conflicts WHERE entity = ?1 ORDER BY detected_at, entity_id",
        )?;
        let rows = stmt.query_map(params![entity], |row| {
            let local: String = row.get(2)?;
            let remote: String = row.get(3)?;
            Ok(ConflictRecord {
                entity: row.get(0)?,
                entity_id: row.get(1)?,
                local_version: parse_json(&local, "local_version")?,
                remote_version: parse_json(&remote, "remote_version")?,
                detected_at: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    fn remove_conflict(&self, entity: &str, entity_id: &str) -> Result<bool> {
        let removed = self.conn().execute(
            "DELETE FROM conflicts WHERE entity = ?1 AND entity_id = ?2",
            params![entity, entity_id],
        )?;
        Ok(removed > 0)
    }

    fn device_id(&self) -> Result<Option<String>> {
        let conn = self.conn();
        let id = conn
            .query_row("SELECT value FROM device WHERE key = 'device_id'", [], |row| row.get(0))
            .optional()?;
        Ok(id)
    }

    fn set_device_id(&self, device_id: &str) -> Result<()> {
        if device_id.trim().is_empty() {
            return Err(Error::InvalidRecord("device_id cannot be empty".to_string()));
        }
        self.conn().execute(
            "INSERT OR REPLACE INTO device (key, value) VALUES ('device_id', ?1)",
            params![device_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
