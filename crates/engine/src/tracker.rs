// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Durable change tracking for local writes.
//!
//! Every application write goes through [`ChangeTracker::track_change`],
//! which appends a change log entry and marks the owning record `pending`
//! in one store transaction. The orchestrator marks entries applied once
//! the server acknowledges the record.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use drift_core::{
    ChangeLogEntry, ClockSource, LocalStore, NewChange, Operation, SyncableRecord,
};

use crate::error::Result;
use crate::orchestrator::{CycleReport, SyncOrchestrator};

/// Options for [`ChangeTracker::sync_now`].
#[derive(Debug, Clone, Default)]
pub struct SyncNowOptions {
    /// Sync exactly these entities instead of those with unapplied changes.
    pub entities: Option<Vec<String>>,
}

impl SyncNowOptions {
    pub fn entities<I, S>(entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SyncNowOptions { entities: Some(entities.into_iter().map(Into::into).collect()) }
    }
}

/// Records local mutations as an ordered per-entity change log.
#[derive(Clone)]
pub struct ChangeTracker {
    store: Arc<dyn LocalStore>,
    clock: Arc<dyn ClockSource>,
    device_id: String,
}

impl ChangeTracker {
    pub fn new(
        store: Arc<dyn LocalStore>,
        clock: Arc<dyn ClockSource>,
        device_id: impl Into<String>,
    ) -> Self {
        ChangeTracker { store, clock, device_id: device_id.into() }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Apply a local write and log it.
    ///
    /// `Insert` creates the record (or revives a deleted one), `Update`
    /// merges `data` into the existing fields, `Delete` leaves a tombstone.
    /// A record in `conflict` keeps that status until it is resolved.
    pub fn track_change(
        &self,
        entity: &str,
        operation: Operation,
        id: &str,
        data: Map<String, Value>,
    ) -> Result<ChangeLogEntry> {
        let now = self.clock.now_ms();
        let payload = Value::Object(data.clone());
        let change = NewChange {
            entity,
            record_id: id,
            operation,
            payload: &payload,
            device_id: &self.device_id,
            timestamp: now,
        };

        let mut data = Some(data);
        let (entry, record) = self.store.append_change(change, &mut |current| {
            let data = data.take().unwrap_or_default();
            apply_write(entity, id, operation, current, data, &self.device_id, now)
        })?;

        debug!(
            entity,
            id,
            operation = %operation,
            sequence = entry.sequence,
            status = %record.sync_status,
            "change tracked"
        );
        Ok(entry)
    }

    /// Entries after `since`, unapplied first.
    pub fn get_changes_since(&self, entity: &str, since: u64) -> Result<Vec<ChangeLogEntry>> {
        Ok(self.store.changes_since(entity, since)?)
    }

    /// Mark entries applied. Already applied entries are skipped.
    ///
    /// Returns how many entries changed state.
    pub fn mark_applied(&self, entries: &[ChangeLogEntry]) -> Result<usize> {
        let mut by_entity: BTreeMap<&str, Vec<u64>> = BTreeMap::new();
        for entry in entries.iter().filter(|e| !e.applied) {
            by_entity.entry(&entry.entity).or_default().push(entry.sequence);
        }

        let mut changed = 0;
        for (entity, sequences) in by_entity {
            changed += self.store.mark_applied(entity, &sequences)?;
        }
        Ok(changed)
    }

    pub fn unapplied_for_record(&self, entity: &str, record_id: &str) -> Result<Vec<u64>> {
        Ok(self.store.unapplied_for_record(entity, record_id)?)
    }

    /// Run an upload and download cycle right away.
    ///
    /// Without explicit entities, every entity with unapplied changes is
    /// synced. Entities the orchestrator does not know are skipped.
    pub async fn sync_now(
        &self,
        orchestrator: &SyncOrchestrator,
        options: SyncNowOptions,
    ) -> Result<CycleReport> {
        let requested = match options.entities {
            Some(entities) => entities,
            None => self.store.entities_with_unapplied()?,
        };

        let entities: Vec<String> =
            requested.into_iter().filter(|e| orchestrator.is_registered(e)).collect();
        if entities.is_empty() {
            debug!("sync_now: nothing to sync");
            return Ok(CycleReport::default());
        }

        orchestrator.sync_entities(&entities).await
    }
}

fn apply_write(
    entity: &str,
    id: &str,
    operation: Operation,
    current: Option<SyncableRecord>,
    data: Map<String, Value>,
    device_id: &str,
    now: i64,
) -> drift_core::Result<SyncableRecord> {
    let not_found = || drift_core::Error::RecordNotFound {
        entity: entity.to_string(),
        id: id.to_string(),
    };

    let mut record = match (operation, current) {
        (Operation::Insert, None) => return Ok(SyncableRecord::new(id, data, device_id, now)),
        (Operation::Insert, Some(existing)) if !existing.deleted => {
            return Err(drift_core::Error::InvalidRecord(format!(
                "{entity}/{id} already exists"
            )));
        }
        (Operation::Insert, Some(mut existing)) => {
            existing.fields = data;
            existing.deleted = false;
            existing
        }
        (Operation::Update, Some(mut existing)) => {
            existing.fields.extend(data);
            existing
        }
        (Operation::Delete, Some(mut existing)) => {
            existing.deleted = true;
            existing
        }
        (Operation::Update | Operation::Delete, None) => return Err(not_found()),
    };

    let in_conflict = record.is_conflict();
    record.device_id = device_id.to_string();
    record.mark_pending(now);
    if in_conflict {
        record.mark_conflict()?;
    }
    Ok(record)
}

#[cfg(test)]
#[path = "tracker_tests.rs"]
mod tests;
