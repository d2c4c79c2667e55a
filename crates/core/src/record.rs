// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Core sync data types.
//!
//! This module contains the records exchanged between the local store and the
//! remote: [`SyncableRecord`] (local, snake_case, epoch-ms), [`RemoteRecord`]
//! (wire, camelCase, ISO-8601), the append-only [`ChangeLogEntry`], the
//! per-entity [`SyncCursor`] and the [`ConflictRecord`] surfaced to callers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Whether a local record matches the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Holds a local edit that has not been acknowledged by the server.
    Pending,
    /// Matches the remote copy as of `synced_at`.
    Synced,
    /// Local and remote copies diverged; needs explicit resolution.
    Conflict,
}

impl SyncStatus {
    /// Returns the string representation used in storage and display.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Conflict => "conflict",
        }
    }

    /// Check if the engine may move a record from this status to `target`.
    ///
    /// `conflict -> synced` is not allowed here; it only happens through an
    /// explicit resolution write.
    pub fn can_transition_to(&self, target: SyncStatus) -> bool {
        use SyncStatus::*;
        matches!(
            (self, target),
            (Pending, Synced)
                | (Pending, Conflict)
                | (Synced, Pending)
                | (Conflict, Pending)
                | (Pending, Pending)
                | (Synced, Synced)
                | (Conflict, Conflict)
        )
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(SyncStatus::Pending),
            "synced" => Ok(SyncStatus::Synced),
            "conflict" => Ok(SyncStatus::Conflict),
            _ => Err(Error::InvalidSyncStatus(s.to_string())),
        }
    }
}

/// Kind of local mutation recorded in the change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "insert" => Ok(Operation::Insert),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            _ => Err(Error::InvalidOperation(s.to_string())),
        }
    }
}

/// A local entity row plus its sync metadata.
///
/// `fields` holds the application columns under their snake_case local
/// names; everything else is owned by the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncableRecord {
    pub id: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
    pub sync_status: SyncStatus,
    pub synced_at: Option<i64>,
    pub device_id: String,
    #[serde(default)]
    pub deleted: bool,
    pub updated_at: i64,
}

impl SyncableRecord {
    /// Creates a new, never-synced record.
    pub fn new(
        id: impl Into<String>,
        fields: Map<String, Value>,
        device_id: impl Into<String>,
        now_ms: i64,
    ) -> Self {
        SyncableRecord {
            id: id.into(),
            fields,
            sync_status: SyncStatus::Pending,
            synced_at: None,
            device_id: device_id.into(),
            deleted: false,
            updated_at: now_ms,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.sync_status == SyncStatus::Pending
    }

    pub fn is_synced(&self) -> bool {
        self.sync_status == SyncStatus::Synced
    }

    pub fn is_conflict(&self) -> bool {
        self.sync_status == SyncStatus::Conflict
    }

    /// Returns a field by its local name.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Flags a fresh local mutation.
    ///
    /// `updated_at` strictly advances and never equals `synced_at`, so every
    /// edit is distinguishable from the version before it, even within one
    /// millisecond or after the wall clock steps back.
    pub fn mark_pending(&mut self, now_ms: i64) {
        let mut updated_at = now_ms.max(self.updated_at + 1);
        if self.synced_at == Some(updated_at) {
            updated_at += 1;
        }
        self.updated_at = updated_at;
        self.sync_status = SyncStatus::Pending;
    }

    /// Records a server acknowledgement.
    pub fn mark_synced(&mut self, now_ms: i64) -> Result<()> {
        self.transition(SyncStatus::Synced)?;
        self.synced_at = Some(now_ms);
        Ok(())
    }

    /// Flags a detected write/write clash.
    pub fn mark_conflict(&mut self) -> Result<()> {
        self.transition(SyncStatus::Conflict)
    }

    fn transition(&mut self, target: SyncStatus) -> Result<()> {
        if !self.sync_status.can_transition_to(target) {
            return Err(Error::InvalidTransition {
                from: self.sync_status.to_string(),
                to: target.to_string(),
            });
        }
        self.sync_status = target;
        Ok(())
    }
}

/// A record in the remote wire representation.
///
/// Application fields are flattened next to the envelope and use camelCase
/// names; timestamps are ISO-8601 strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
    pub id: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// One entry of the append-only local change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub entity: String,
    pub record_id: String,
    pub operation: Operation,
    pub payload: Value,
    /// Strictly increasing per entity.
    pub sequence: u64,
    pub device_id: String,
    pub timestamp: i64,
    pub applied: bool,
}

/// Per-(entity, device) marker of the last successful download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub entity: String,
    pub device_id: String,
    pub last_synced_sequence: u64,
    pub last_synced_at: i64,
}

impl SyncCursor {
    /// The cursor a never-synced entity starts from.
    pub fn initial(entity: impl Into<String>, device_id: impl Into<String>) -> Self {
        SyncCursor {
            entity: entity.into(),
            device_id: device_id.into(),
            last_synced_sequence: 0,
            last_synced_at: 0,
        }
    }

    /// Returns true if moving to `next` would not roll this cursor back.
    pub fn can_advance_to(&self, next: &SyncCursor) -> bool {
        next.last_synced_sequence >= self.last_synced_sequence
            && next.last_synced_at >= self.last_synced_at
    }
}

/// A detected write/write clash, kept until the caller resolves it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub entity: String,
    pub entity_id: String,
    pub local_version: SyncableRecord,
    pub remote_version: SyncableRecord,
    pub detected_at: i64,
}

#[cfg(test)]
#[path = "record_tests.rs"]
mod tests;
