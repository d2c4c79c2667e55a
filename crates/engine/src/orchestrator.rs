// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Per-entity sync cycles.
//!
//! A cycle uploads every pending record of an entity, then downloads what
//! changed on the server since the entity's cursor. Each network call is a
//! [`SyncQueue`] task wrapped in the [`RetryPolicy`], so the number of calls
//! in flight stays bounded no matter how many entities sync at once.
//!
//! ```text
//! idle ──▶ uploading ──▶ downloading ──▶ idle
//!              │               │
//!              └──────┬────────┘
//!                     ▼
//!                   failed ──(next cycle)──▶ uploading
//! ```
//!
//! Remote timestamps are moved into the local clock frame with the offset
//! measured by [`SyncOrchestrator::initialize`] before any comparison.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::join_all;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use drift_core::mapper;
use drift_core::protocol::DownloadResponse;
use drift_core::{
    ClockOffset, ClockSource, ConflictRecord, EntityRegistry, EntitySchema, FieldMapper,
    LocalStore, NewChange, Operation, RemoteRecord, SyncCursor, SyncStatus, SyncableRecord,
    ToLocalOptions,
};

use crate::error::{Error, Result};
use crate::queue::SyncQueue;
use crate::remote::RemoteApi;
use crate::retry::{RetryOptions, RetryPolicy};

/// Where an entity is in its sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CycleState {
    #[default]
    Idle,
    Uploading,
    Downloading,
    /// The last cycle failed. Cleared when the next cycle starts.
    Failed,
}

/// How a conflict is settled.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Keep the local version and upload it again.
    KeepLocal,
    /// Replace the local version with the remote one.
    TakeRemote,
    /// Replace the local fields and upload the result.
    Merge(Map<String, Value>),
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::KeepLocal => "keep_local",
            Resolution::TakeRemote => "take_remote",
            Resolution::Merge(_) => "merge",
        }
    }
}

/// Policy consulted when a download detects a conflict.
///
/// Returning `None` leaves the conflict for the application to resolve.
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, conflict: &ConflictRecord) -> Option<Resolution>;
}

/// Newest `updated_at` wins. Ties go to the remote copy.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriterWins;

impl ConflictResolver for LastWriterWins {
    fn resolve(&self, conflict: &ConflictRecord) -> Option<Resolution> {
        if conflict.local_version.updated_at > conflict.remote_version.updated_at {
            Some(Resolution::KeepLocal)
        } else {
            Some(Resolution::TakeRemote)
        }
    }
}

/// The local copy always wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalWins;

impl ConflictResolver for LocalWins {
    fn resolve(&self, _conflict: &ConflictRecord) -> Option<Resolution> {
        Some(Resolution::KeepLocal)
    }
}

/// A record (or a whole download when `record_id` is `None`) that did not sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFailure {
    pub entity: String,
    pub record_id: Option<String>,
    pub error: String,
}

/// Aggregated outcome of one or more entity cycles.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    /// Records uploaded or written from a download.
    pub success: usize,
    pub failed: usize,
    /// Conflicts detected, including those a resolver settled.
    pub conflicts: usize,
    /// Conflicts settled by the configured resolver.
    pub resolved: usize,
    pub failures: Vec<RecordFailure>,
}

impl CycleReport {
    pub fn merge(&mut self, other: CycleReport) {
        self.success += other.success;
        self.failed += other.failed;
        self.conflicts += other.conflicts;
        self.resolved += other.resolved;
        self.failures.extend(other.failures);
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }

    fn record_failure(&mut self, entity: &str, record_id: Option<&str>, error: &Error) {
        self.failed += 1;
        self.failures.push(RecordFailure {
            entity: entity.to_string(),
            record_id: record_id.map(str::to_string),
            error: error.to_string(),
        });
    }
}

/// Notifications from the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    CycleStarted { entity: String },
    CycleFinished { entity: String, report: CycleReport },
    CycleFailed { entity: String, error: String },
    ConflictDetected(ConflictRecord),
}

/// Result of applying one downloaded record.
enum Applied {
    Written,
    /// Local edit is newer than anything the server sent.
    Skipped,
    Conflict(Box<ConflictRecord>),
}

struct Inner {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteApi>,
    registry: EntityRegistry,
    queue: SyncQueue,
    retry: RetryPolicy,
    mapper: FieldMapper,
    clock: Arc<dyn ClockSource>,
    offset: ClockOffset,
    device_id: Mutex<Option<String>>,
    states: Mutex<HashMap<String, CycleState>>,
    resolver: Mutex<Option<Arc<dyn ConflictResolver>>>,
    events: mpsc::Sender<SyncEvent>,
    cancel: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Composes the store, remote, queue and retry policy into sync cycles.
///
/// Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl SyncOrchestrator {
    /// Create an orchestrator. Call [`initialize`](Self::initialize) before syncing.
    ///
    /// Returns the orchestrator and a receiver for sync events.
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteApi>,
        registry: EntityRegistry,
        queue: SyncQueue,
        retry: RetryPolicy,
        clock: Arc<dyn ClockSource>,
    ) -> (Self, mpsc::Receiver<SyncEvent>) {
        let (events, event_rx) = mpsc::channel(256);
        let orchestrator = SyncOrchestrator {
            inner: Arc::new(Inner {
                store,
                remote,
                registry,
                queue,
                retry,
                mapper: FieldMapper::new(Arc::clone(&clock)),
                clock,
                offset: ClockOffset::new(),
                device_id: Mutex::new(None),
                states: Mutex::new(HashMap::new()),
                resolver: Mutex::new(None),
                events,
                cancel: CancellationToken::new(),
            }),
        };
        (orchestrator, event_rx)
    }

    /// Install (or clear) the policy applied to newly detected conflicts.
    pub fn set_resolver(&self, resolver: Option<Arc<dyn ConflictResolver>>) {
        *lock(&self.inner.resolver) = resolver;
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.inner.registry
    }

    pub fn is_registered(&self, entity: &str) -> bool {
        self.inner.registry.contains(entity)
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.inner.queue
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.retry
    }

    pub fn device_id(&self) -> Option<String> {
        lock(&self.inner.device_id).clone()
    }

    /// Measured `server - local` clock offset in milliseconds.
    pub fn clock_offset(&self) -> i64 {
        self.inner.offset.get()
    }

    pub fn entity_state(&self, entity: &str) -> CycleState {
        lock(&self.inner.states).get(entity).copied().unwrap_or_default()
    }

    /// Persist the device id and measure the clock offset against the server.
    ///
    /// Returns the offset. A failed time query is fatal.
    pub async fn initialize(&self, device_id: &str) -> Result<i64> {
        if device_id.trim().is_empty() {
            return Err(Error::Setup("device id cannot be empty".to_string()));
        }
        self.inner.store.set_device_id(device_id)?;

        let remote = &self.inner.remote;
        let started = self.inner.clock.now_ms();
        let server_ms = self
            .inner
            .retry
            .execute_with("server_time", self.retry_options(), move || async move {
                remote.ensure_connected().await?;
                remote.server_time().await
            })
            .await
            .map_err(|e| Error::ClockQuery(e.to_string()))?;
        let finished = self.inner.clock.now_ms();

        // Server answered somewhere inside the round trip
        let local = started + (finished - started) / 2;
        let offset = self.inner.offset.measure(server_ms, local);
        *lock(&self.inner.device_id) = Some(device_id.to_string());

        info!(device_id, offset_ms = offset, "sync engine initialized");
        Ok(offset)
    }

    /// Upload every pending record of `entity`.
    ///
    /// Each record is its own queue task, prioritized by recency. Records the
    /// server rejects, or that fail after retries, stay `pending` and are
    /// reported as failures.
    pub async fn upload_local_changes(&self, entity: &str) -> Result<CycleReport> {
        let device_id = self.require_device()?;
        let schema = *self.inner.registry.get(entity)?;
        let pending = self.inner.store.pending(entity)?;

        let mut report = CycleReport::default();
        if pending.is_empty() {
            debug!(entity, "nothing to upload");
            return Ok(report);
        }

        let mut uploads = Vec::with_capacity(pending.len());
        for record in pending {
            let wire = match self.to_wire(&record, &schema) {
                Ok(wire) => wire,
                Err(e) => {
                    warn!(entity, id = %record.id, error = %e, "record cannot be mapped for upload");
                    report.record_failure(entity, Some(&record.id), &e);
                    continue;
                }
            };
            // Entries logged later belong to a newer version
            let sequences = self.inner.store.unapplied_for_record(entity, &record.id)?;

            let this = self.clone();
            let name = entity.to_string();
            let handle = self.inner.queue.enqueue(record.updated_at, move || async move {
                this.upload_record(&name, wire).await
            });
            uploads.push((record, sequences, handle));
        }

        for (record, sequences, handle) in uploads {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(Error::Queue(e)),
            };
            match outcome.and_then(|()| self.finish_upload(entity, &record, &sequences)) {
                Ok(()) => report.success += 1,
                Err(e) => {
                    warn!(entity, id = %record.id, error = %e, "upload failed, record stays pending");
                    report.record_failure(entity, Some(&record.id), &e);
                }
            }
        }

        info!(entity, uploaded = report.success, failed = report.failed, "upload finished");
        if report.success > 0 {
            if let Err(e) = self.inner.remote.notify(entity, &device_id) {
                warn!(entity, error = %e, "change notification not sent");
            }
        }
        Ok(report)
    }

    /// Download and apply remote changes after the entity's cursor.
    ///
    /// The cursor only moves when every record in the batch was applied.
    pub async fn download_remote_changes(&self, entity: &str) -> Result<CycleReport> {
        let device_id = self.require_device()?;
        let schema = *self.inner.registry.get(entity)?;
        let cursor = self
            .inner
            .store
            .cursor(entity, &device_id)?
            .unwrap_or_else(|| SyncCursor::initial(entity, &device_id));
        let requested_at = self.inner.clock.now_ms();

        let this = self.clone();
        let name = entity.to_string();
        let since = cursor.last_synced_sequence;
        let response = self
            .inner
            .queue
            .enqueue(requested_at, move || async move { this.fetch(&name, since).await })
            .await??;

        let mut report = CycleReport::default();
        let mut all_applied = true;

        for remote in &response.records {
            let applied = self.apply_with_retry(entity, &schema, &cursor, &device_id, remote).await;
            match applied {
                Ok(Applied::Written) => report.success += 1,
                Ok(Applied::Skipped) => {
                    debug!(entity, id = %remote.id, "local edit is newer, remote copy skipped");
                }
                Ok(Applied::Conflict(conflict)) => {
                    report.conflicts += 1;
                    match self.record_conflict(*conflict) {
                        Ok(resolved) => report.resolved += usize::from(resolved),
                        Err(e) => {
                            all_applied = false;
                            report.record_failure(entity, Some(&remote.id), &e);
                        }
                    }
                }
                Err(e) => {
                    warn!(entity, id = %remote.id, error = %e, "remote record not applied");
                    all_applied = false;
                    report.record_failure(entity, Some(&remote.id), &e);
                }
            }
        }

        if all_applied {
            let next = SyncCursor {
                entity: entity.to_string(),
                device_id,
                last_synced_sequence: response.next_cursor.max(cursor.last_synced_sequence),
                last_synced_at: requested_at.max(cursor.last_synced_at),
            };
            self.inner.store.advance_cursor(&next)?;
        } else {
            warn!(entity, failed = report.failed, "cursor held back until every record applies");
        }

        info!(
            entity,
            received = response.records.len(),
            applied = report.success,
            conflicts = report.conflicts,
            "download finished"
        );
        Ok(report)
    }

    /// Upload then download one entity.
    pub async fn sync_entity(&self, entity: &str) -> Result<CycleReport> {
        self.set_state(entity, CycleState::Uploading);
        self.emit(SyncEvent::CycleStarted { entity: entity.to_string() });

        let result = async {
            let mut report = self.upload_local_changes(entity).await?;
            self.set_state(entity, CycleState::Downloading);
            report.merge(self.download_remote_changes(entity).await?);
            Ok::<_, Error>(report)
        }
        .await;

        match result {
            Ok(report) => {
                self.set_state(entity, CycleState::Idle);
                self.emit(SyncEvent::CycleFinished {
                    entity: entity.to_string(),
                    report: report.clone(),
                });
                Ok(report)
            }
            Err(e) => {
                warn!(entity, error = %e, "sync cycle failed");
                self.set_state(entity, CycleState::Failed);
                self.emit(SyncEvent::CycleFailed { entity: entity.to_string(), error: e.to_string() });
                Err(e)
            }
        }
    }

    /// Sync every registered entity.
    pub async fn sync_incremental(&self) -> Result<CycleReport> {
        let entities: Vec<String> =
            self.inner.registry.names().into_iter().map(str::to_string).collect();
        self.sync_entities(&entities).await
    }

    /// Sync the given entities concurrently through the shared queue.
    ///
    /// An unreachable server aborts before any entity is touched. After
    /// that, a failing entity is reported and the others carry on.
    pub async fn sync_entities(&self, entities: &[String]) -> Result<CycleReport> {
        self.require_device()?;

        let remote = &self.inner.remote;
        if let Err(e) = self
            .inner
            .retry
            .execute_with("connect", self.retry_options(), move || remote.ensure_connected())
            .await
        {
            error!(error = %e, "sync aborted: server unreachable");
            return Err(Error::Setup(e.to_string()));
        }

        info!(entities = entities.len(), "sync cycle started");
        let results = join_all(entities.iter().map(|entity| self.sync_entity(entity))).await;

        let mut report = CycleReport::default();
        for (entity, result) in entities.iter().zip(results) {
            match result {
                Ok(entity_report) => report.merge(entity_report),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => report.record_failure(entity, None, &e),
            }
        }

        info!(
            success = report.success,
            failed = report.failed,
            conflicts = report.conflicts,
            "sync cycle finished"
        );
        Ok(report)
    }

    /// Unresolved conflicts of an entity, oldest first.
    pub fn conflicts(&self, entity: &str) -> Result<Vec<ConflictRecord>> {
        Ok(self.inner.store.conflicts(entity)?)
    }

    /// Settle a conflict and return the record as written.
    ///
    /// `KeepLocal` and `Merge` log a change and leave the record `pending`
    /// for the next upload. `TakeRemote` writes the remote copy as `synced`
    /// and retires the local change log entries it replaces.
    pub fn resolve_conflict(
        &self,
        entity: &str,
        id: &str,
        resolution: Resolution,
    ) -> Result<SyncableRecord> {
        let device_id = self.require_device()?;
        let store = &self.inner.store;
        let not_found =
            || drift_core::Error::RecordNotFound { entity: entity.to_string(), id: id.to_string() };

        let conflict = store
            .conflicts(entity)?
            .into_iter()
            .find(|c| c.entity_id == id)
            .ok_or_else(not_found)?;
        let now = self.inner.clock.now_ms();
        let name = resolution.as_str();

        let record = match resolution {
            Resolution::TakeRemote => {
                let record = SyncableRecord {
                    sync_status: SyncStatus::Synced,
                    synced_at: Some(now),
                    ..conflict.remote_version
                };
                let written = store.update(entity, id, &mut |current| match current {
                    Some(_) => Ok(Some(record.clone())),
                    None => Err(not_found()),
                })?;
                let superseded = store.unapplied_for_record(entity, id)?;
                store.mark_applied(entity, &superseded)?;
                written.unwrap_or(record)
            }
            Resolution::KeepLocal | Resolution::Merge(_) => {
                let current = store.get(entity, id)?.ok_or_else(not_found)?;
                let fields = match resolution {
                    Resolution::Merge(fields) => fields,
                    _ => current.fields,
                };
                let payload = Value::Object(fields.clone());
                let change = NewChange {
                    entity,
                    record_id: id,
                    operation: Operation::Update,
                    payload: &payload,
                    device_id: &device_id,
                    timestamp: now,
                };
                let (_, record) = store.append_change(change, &mut |current| {
                    let mut record = current.ok_or_else(not_found)?;
                    record.fields = fields.clone();
                    record.device_id = device_id.clone();
                    record.mark_pending(now);
                    Ok(record)
                })?;
                record
            }
        };

        store.remove_conflict(entity, id)?;
        info!(entity, id, resolution = name, "conflict resolved");
        Ok(record)
    }

    /// Forget the download cursor so the next cycle fetches everything.
    pub fn reset_cursor(&self, entity: &str) -> Result<()> {
        let device_id = self.require_device()?;
        self.inner.registry.get(entity)?;
        self.inner.store.reset_cursor(entity, &device_id)?;
        info!(entity, "cursor reset");
        Ok(())
    }

    /// Wait for every queued network call to finish.
    pub async fn drain(&self) {
        self.inner.queue.drain().await;
    }

    /// Cancel pending backoff waits and reject queued calls.
    pub fn shutdown(&self) -> usize {
        self.inner.cancel.cancel();
        self.inner.queue.shutdown()
    }

    fn require_device(&self) -> Result<String> {
        lock(&self.inner.device_id).clone().ok_or(Error::NotInitialized)
    }

    fn retry_options(&self) -> RetryOptions<Error> {
        RetryOptions::default()
            .should_retry(Error::is_transient)
            .cancel(self.inner.cancel.clone())
    }

    fn set_state(&self, entity: &str, state: CycleState) {
        lock(&self.inner.states).insert(entity.to_string(), state);
    }

    fn emit(&self, event: SyncEvent) {
        if let Err(e) = self.inner.events.try_send(event) {
            debug!(error = %e, "sync event dropped");
        }
    }

    /// Wire form with `updated_at` moved into the server clock frame.
    fn to_wire(&self, record: &SyncableRecord, schema: &EntitySchema) -> Result<RemoteRecord> {
        let mut wire = self.inner.mapper.to_remote(record, schema)?;
        wire.updated_at = mapper::to_iso8601(self.inner.offset.to_remote(record.updated_at))?;
        Ok(wire)
    }

    async fn upload_record(&self, entity: &str, wire: RemoteRecord) -> Result<()> {
        let remote = &self.inner.remote;
        let label = format!("upload {entity}/{}", wire.id);
        let wire = &wire;

        let response = self
            .inner
            .retry
            .execute_with(&label, self.retry_options(), move || {
                remote.upload(entity, vec![wire.clone()])
            })
            .await?;

        if let Some(rejected) = response.rejection(&wire.id) {
            return Err(Error::Rejected { id: rejected.id.clone(), reason: rejected.reason.clone() });
        }
        if !response.is_accepted(&wire.id) {
            return Err(Error::Remote(format!("upload of '{}' was not acknowledged", wire.id)));
        }
        Ok(())
    }

    /// Mark an acknowledged record synced, unless it changed during the upload.
    fn finish_upload(
        &self,
        entity: &str,
        uploaded: &SyncableRecord,
        sequences: &[u64],
    ) -> Result<()> {
        let now = self.inner.clock.now_ms();
        let written = self.inner.store.update(entity, &uploaded.id, &mut |current| match current {
            Some(mut record) if record.is_pending() && record.updated_at == uploaded.updated_at => {
                record.mark_synced(now)?;
                Ok(Some(record))
            }
            _ => Ok(None),
        })?;

        match written {
            Some(_) => {
                self.inner.store.mark_applied(entity, sequences)?;
                debug!(entity, id = %uploaded.id, "record synced");
            }
            None => debug!(entity, id = %uploaded.id, "record changed during upload, left pending"),
        }
        Ok(())
    }

    async fn fetch(&self, entity: &str, since: u64) -> Result<DownloadResponse> {
        let remote = &self.inner.remote;
        let label = format!("download {entity}");
        self.inner
            .retry
            .execute_with(&label, self.retry_options(), move || remote.download(entity, since))
            .await
    }

    /// [`apply_remote`](Self::apply_remote) under the deadlock retry budget.
    async fn apply_with_retry(
        &self,
        entity: &str,
        schema: &EntitySchema,
        cursor: &SyncCursor,
        device_id: &str,
        remote: &RemoteRecord,
    ) -> Result<Applied> {
        let label = format!("apply {entity}/{}", remote.id);
        self.inner
            .retry
            .execute_with(&label, self.retry_options(), move || async move {
                self.apply_remote(entity, schema, cursor, device_id, remote)
            })
            .await
    }

    /// Apply one downloaded record in a single store transaction.
    fn apply_remote(
        &self,
        entity: &str,
        schema: &EntitySchema,
        cursor: &SyncCursor,
        device_id: &str,
        remote: &RemoteRecord,
    ) -> Result<Applied> {
        let mapper = &self.inner.mapper;
        let remote_at = self.inner.offset.to_local(mapper::to_millis(&remote.updated_at)?);
        let own_echo = remote.device_id.as_deref() == Some(device_id);
        let now = self.inner.clock.now_ms();
        let mut outcome = Applied::Skipped;

        self.inner.store.update(entity, &remote.id, &mut |current| match current {
            None => {
                let mut record = mapper.to_local_as_new(remote, schema)?;
                record.updated_at = remote_at;
                outcome = Applied::Written;
                Ok(Some(record))
            }
            Some(existing) if existing.is_synced() => {
                let options = ToLocalOptions::default().with_existing(&existing);
                let mut record = mapper.to_local(remote, schema, options)?;
                record.updated_at = remote_at;
                outcome = Applied::Written;
                Ok(Some(record))
            }
            Some(existing) if !own_echo && remote_at > cursor.last_synced_at => {
                let options = ToLocalOptions::force(SyncStatus::Conflict).with_existing(&existing);
                let mut remote_version = mapper.to_local(remote, schema, options)?;
                remote_version.updated_at = remote_at;

                let mut local = existing.clone();
                local.mark_conflict()?;
                outcome = Applied::Conflict(Box::new(ConflictRecord {
                    entity: entity.to_string(),
                    entity_id: remote.id.clone(),
                    local_version: existing,
                    remote_version,
                    detected_at: now,
                }));
                Ok(Some(local))
            }
            Some(_) => {
                outcome = Applied::Skipped;
                Ok(None)
            }
        })?;

        Ok(outcome)
    }

    /// Persist a detected conflict and offer it to the resolver.
    ///
    /// Returns true if the resolver settled it.
    fn record_conflict(&self, conflict: ConflictRecord) -> Result<bool> {
        self.inner.store.save_conflict(&conflict)?;
        warn!(
            entity = %conflict.entity,
            id = %conflict.entity_id,
            local_updated_at = conflict.local_version.updated_at,
            remote_updated_at = conflict.remote_version.updated_at,
            "conflict detected"
        );

        let resolution = lock(&self.inner.resolver).as_ref().and_then(|r| r.resolve(&conflict));
        let (entity, id) = (conflict.entity.clone(), conflict.entity_id.clone());
        self.emit(SyncEvent::ConflictDetected(conflict));

        match resolution {
            Some(resolution) => {
                self.resolve_conflict(&entity, &id, resolution)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
