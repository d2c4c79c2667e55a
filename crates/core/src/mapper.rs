// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Translation between the local and remote record representations.
//!
//! The mapper is the only place field names and timestamp formats change:
//!
//! | side   | field names | timestamps        | sync metadata |
//! |--------|-------------|-------------------|---------------|
//! | local  | snake_case  | epoch milliseconds | yes           |
//! | remote | camelCase   | ISO-8601 (UTC)    | no            |
//!
//! Hydrating a remote record normally marks it `synced`. Callers that must
//! not lose an in-flight local edit pass [`ToLocalOptions::preserve`], and a
//! freshly detected conflict is stamped with [`ToLocalOptions::force`].

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::clock::{ClockSource, SystemClock};
use crate::error::{Error, Result};
use crate::record::{RemoteRecord, SyncStatus, SyncableRecord};
use crate::schema::{EntitySchema, FieldKind};

/// Formats epoch milliseconds as an ISO-8601 UTC string with millisecond precision.
pub fn to_iso8601(epoch_ms: i64) -> Result<String> {
    DateTime::<Utc>::from_timestamp_millis(epoch_ms)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .ok_or_else(|| Error::InvalidTimestamp(format!("{epoch_ms} ms is out of range")))
}

/// Parses an ISO-8601 / RFC 3339 string into epoch milliseconds.
pub fn to_millis(iso: &str) -> Result<i64> {
    DateTime::parse_from_rfc3339(iso)
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| Error::InvalidTimestamp(format!("'{iso}': {e}")))
}

/// Options for [`FieldMapper::to_local`]. Precedence, lowest to highest:
/// default (`synced`, `synced_at = now`), preserved existing status, forced status.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToLocalOptions<'a> {
    pub existing_record: Option<&'a SyncableRecord>,
    pub preserve_local_status: bool,
    pub force_sync_status: Option<SyncStatus>,
}

impl<'a> ToLocalOptions<'a> {
    /// Keep `existing`'s `sync_status` and `synced_at`.
    pub fn preserve(existing: &'a SyncableRecord) -> Self {
        ToLocalOptions {
            existing_record: Some(existing),
            preserve_local_status: true,
            force_sync_status: None,
        }
    }

    /// Stamp the result with `status` regardless of anything else.
    pub fn force(status: SyncStatus) -> Self {
        ToLocalOptions { force_sync_status: Some(status), ..Default::default() }
    }

    pub fn with_existing(mut self, existing: &'a SyncableRecord) -> Self {
        self.existing_record = Some(existing);
        self
    }
}

/// Bidirectional local ↔ remote record translator.
#[derive(Clone)]
pub struct FieldMapper {
    clock: Arc<dyn ClockSource>,
}

impl Default for FieldMapper {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl FieldMapper {
    pub fn new(clock: Arc<dyn ClockSource>) -> Self {
        FieldMapper { clock }
    }

    /// Maps a local record to the wire representation, dropping local-only metadata.
    pub fn to_remote(&self, local: &SyncableRecord, schema: &EntitySchema) -> Result<RemoteRecord> {
        let mut fields = Map::with_capacity(local.fields.len());

        for (name, value) in &local.fields {
            match schema.by_local(name) {
                Some(m) => {
                    let value = match m.kind {
                        FieldKind::Plain => value.clone(),
                        FieldKind::Timestamp => millis_to_wire(value)?,
                    };
                    fields.insert(m.remote.to_string(), value);
                }
                None => {
                    fields.insert(name.clone(), value.clone());
                }
            }
        }

        Ok(RemoteRecord {
            id: local.id.clone(),
            updated_at: to_iso8601(local.updated_at)?,
            device_id: Some(local.device_id.clone()),
            deleted: local.deleted,
            fields,
        })
    }

    /// Maps a wire record to the local representation.
    pub fn to_local(
        &self,
        remote: &RemoteRecord,
        schema: &EntitySchema,
        options: ToLocalOptions<'_>,
    ) -> Result<SyncableRecord> {
        let mut fields = Map::with_capacity(remote.fields.len());

        for (name, value) in &remote.fields {
            match schema.by_remote(name) {
                Some(m) => {
                    let value = match m.kind {
                        FieldKind::Plain => value.clone(),
                        FieldKind::Timestamp => wire_to_millis(value)?,
                    };
                    fields.insert(m.local.to_string(), value);
                }
                None => {
                    fields.insert(name.clone(), value.clone());
                }
            }
        }

        let device_id = remote
            .device_id
            .clone()
            .or_else(|| options.existing_record.map(|r| r.device_id.clone()))
            .unwrap_or_default();

        let mut sync_status = SyncStatus::Synced;
        let mut synced_at = Some(self.clock.now_ms());

        if options.preserve_local_status {
            if let Some(existing) = options.existing_record {
                sync_status = existing.sync_status;
                synced_at = existing.synced_at;
            }
        }

        if let Some(forced) = options.force_sync_status {
            sync_status = forced;
            if forced == SyncStatus::Pending && !options.preserve_local_status {
                // The default stamp claims a sync that never happened
                synced_at = None;
            }
        }

        let updated_at = to_millis(&remote.updated_at)?;
        match sync_status {
            SyncStatus::Synced if synced_at.is_none() => synced_at = Some(self.clock.now_ms()),
            SyncStatus::Pending if synced_at == Some(updated_at) => synced_at = None,
            _ => {}
        }

        Ok(SyncableRecord {
            id: remote.id.clone(),
            fields,
            sync_status,
            synced_at,
            device_id,
            deleted: remote.deleted,
            updated_at,
        })
    }

    /// Hydrates a record the device has never seen. Always `synced`.
    pub fn to_local_as_new(
        &self,
        remote: &RemoteRecord,
        schema: &EntitySchema,
    ) -> Result<SyncableRecord> {
        self.to_local(remote, schema, ToLocalOptions::default())
    }

    /// Hydrates over an existing record, keeping its sync status.
    pub fn to_local_for_update(
        &self,
        remote: &RemoteRecord,
        schema: &EntitySchema,
        existing: &SyncableRecord,
    ) -> Result<SyncableRecord> {
        self.to_local(remote, schema, ToLocalOptions::preserve(existing))
    }
}

fn millis_to_wire(value: &Value) -> Result<Value> {
    match value.as_i64() {
        Some(ms) => Ok(Value::String(to_iso8601(ms)?)),
        None => Ok(value.clone()),
    }
}

fn wire_to_millis(value: &Value) -> Result<Value> {
    match value.as_str() {
        Some(iso) => Ok(Value::from(to_millis(iso)?)),
        None => Ok(value.clone()),
    }
}

#[cfg(test)]
#[path = "mapper_tests.rs"]
mod tests;
