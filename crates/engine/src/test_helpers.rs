// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test doubles for engine tests.

#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

use drift_core::protocol::{ClientMessage, DownloadResponse, ServerMessage, UploadResponse};
use drift_core::record::{RemoteRecord, SyncableRecord};
use drift_core::schema::{EntityRegistry, EntitySchema, FieldMapping};
use drift_core::{mapper, ManualClock, RejectedRecord, SqliteStore};

use crate::config::RetryConfig;
use crate::connection::TransportFactory;
use crate::error::{Error, Result};
use crate::orchestrator::{SyncEvent, SyncOrchestrator};
use crate::queue::SyncQueue;
use crate::remote::{RemoteApi, RemoteFuture};
use crate::retry::RetryPolicy;
use crate::tracker::ChangeTracker;
use crate::transport::{Transport, TransportError, TransportFuture};

pub const NOTE_FIELDS: &[FieldMapping] = &[
    FieldMapping::plain("title", "title"),
    FieldMapping::plain("body_text", "bodyText"),
    FieldMapping::timestamp("due_at", "dueAt"),
];

pub const NOTES: EntitySchema = EntitySchema::new("notes", NOTE_FIELDS);

pub const TASK_FIELDS: &[FieldMapping] = &[
    FieldMapping::plain("title", "title"),
    FieldMapping::plain("is_done", "isDone"),
];

pub const TASKS: EntitySchema = EntitySchema::new("tasks", TASK_FIELDS);

/// Ten small tables for throughput tests.
pub const TABLES: [EntitySchema; 10] = [
    EntitySchema::new("t0", NOTE_FIELDS),
    EntitySchema::new("t1", NOTE_FIELDS),
    EntitySchema::new("t2", NOTE_FIELDS),
    EntitySchema::new("t3", NOTE_FIELDS),
    EntitySchema::new("t4", NOTE_FIELDS),
    EntitySchema::new("t5", NOTE_FIELDS),
    EntitySchema::new("t6", NOTE_FIELDS),
    EntitySchema::new("t7", NOTE_FIELDS),
    EntitySchema::new("t8", NOTE_FIELDS),
    EntitySchema::new("t9", NOTE_FIELDS),
];

pub const DEVICE: &str = "device-a";

/// Local clock at the start of every harness.
pub const LOCAL_START: i64 = 1_700_000_000_000;

pub fn titled(title: &str) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("title".into(), json!(title));
    fields
}

/// A local note record.
pub fn note(id: &str, title: &str, updated_at: i64) -> SyncableRecord {
    let mut fields = Map::new();
    fields.insert("title".into(), json!(title));
    SyncableRecord::new(id, fields, "device-a", updated_at)
}

/// A remote note record stamped at `updated_at` (server frame).
pub fn remote_note(id: &str, title: &str, updated_at: i64) -> RemoteRecord {
    let mut fields = Map::new();
    fields.insert("title".into(), json!(title));
    RemoteRecord {
        id: id.to_string(),
        updated_at: mapper::to_iso8601(updated_at).unwrap(),
        device_id: Some("device-b".to_string()),
        deleted: false,
        fields,
    }
}

pub fn title_of(record: &SyncableRecord) -> Option<&Value> {
    record.field("title")
}

/// Retry settings with short, deterministic delays.
pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 3,
        base_delay_ms: 10,
        max_delay_ms: 50,
        backoff_multiplier: 2.0,
        jitter_factor: 0.0,
        deadlock_max_retries: 5,
        deadlock_min_delay_ms: 1,
        deadlock_max_delay_ms: 5,
    }
}

/// An orchestrator wired to an in-memory store and a [`MockRemote`].
pub struct Harness {
    pub store: Arc<SqliteStore>,
    pub remote: MockRemote,
    pub clock: Arc<ManualClock>,
    pub orchestrator: SyncOrchestrator,
    pub events: mpsc::Receiver<SyncEvent>,
}

impl Harness {
    pub fn new(schemas: &[EntitySchema]) -> Self {
        Self::with_options(schemas, 3, fast_retry())
    }

    pub fn with_options(schemas: &[EntitySchema], concurrency: usize, retry: RetryConfig) -> Self {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(LOCAL_START));
        let remote = MockRemote::new(LOCAL_START);
        let registry = EntityRegistry::with_schemas(schemas).unwrap();
        let (orchestrator, events) = SyncOrchestrator::new(
            store.clone(),
            Arc::new(remote.clone()),
            registry,
            SyncQueue::new(concurrency),
            RetryPolicy::new(retry),
            clock.clone(),
        );
        Harness { store, remote, clock, orchestrator, events }
    }

    pub fn tracker(&self) -> ChangeTracker {
        ChangeTracker::new(self.store.clone(), self.clock.clone(), DEVICE)
    }

    pub async fn init(&self) {
        self.orchestrator.initialize(DEVICE).await.unwrap();
    }

    /// Drain every event emitted so far.
    pub fn take_events(&mut self) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

// ---------------------------------------------------------------------------
// Transport double
// ---------------------------------------------------------------------------

pub type Responder = Arc<dyn Fn(&ClientMessage) -> Option<ServerMessage> + Send + Sync>;

#[derive(Default)]
struct ServerState {
    refuse_next: u32,
    refuse_all: bool,
    connects: u32,
    received: Vec<ClientMessage>,
    links: HashMap<u64, mpsc::UnboundedSender<ServerMessage>>,
    next_link: u64,
    responder: Option<Responder>,
}

/// In-process stand-in for a WebSocket server.
#[derive(Clone, Default)]
pub struct MockServer {
    state: Arc<Mutex<ServerState>>,
}

impl MockServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap()
    }

    /// Factory handing out transports connected to this server.
    pub fn factory(&self) -> TransportFactory {
        let state = Arc::clone(&self.state);
        Arc::new(move || {
            Box::new(MockTransport { state: Arc::clone(&state), link: None }) as Box<dyn Transport>
        })
    }

    pub fn refuse_next(&self, n: u32) {
        self.lock().refuse_next = n;
    }

    pub fn refuse_all(&self, refuse: bool) {
        self.lock().refuse_all = refuse;
    }

    pub fn connects(&self) -> u32 {
        self.lock().connects
    }

    pub fn received(&self) -> Vec<ClientMessage> {
        self.lock().received.clone()
    }

    pub fn live_links(&self) -> usize {
        self.lock().links.len()
    }

    pub fn respond_with(
        &self,
        f: impl Fn(&ClientMessage) -> Option<ServerMessage> + Send + Sync + 'static,
    ) {
        self.lock().responder = Some(Arc::new(f));
    }

    /// Close every open connection from the server side.
    pub fn drop_connections(&self) {
        self.lock().links.clear();
    }

    /// Push an unsolicited message to every open connection.
    pub fn push(&self, msg: ServerMessage) {
        for tx in self.lock().links.values() {
            let _ = tx.send(msg.clone());
        }
    }
}

pub struct MockTransport {
    state: Arc<Mutex<ServerState>>,
    link: Option<(u64, mpsc::UnboundedReceiver<ServerMessage>)>,
}

impl Transport for MockTransport {
    fn connect(&mut self, _url: &str) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.connects += 1;
            if state.refuse_all || state.refuse_next > 0 {
                state.refuse_next = state.refuse_next.saturating_sub(1);
                return Err(TransportError::ConnectionFailed("mock refused".into()));
            }
            let id = state.next_link;
            state.next_link += 1;
            let (tx, rx) = mpsc::unbounded_channel();
            state.links.insert(id, tx);
            drop(state);
            self.link = Some((id, rx));
            Ok(())
        })
    }

    fn disconnect(&mut self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            if let Some((id, _)) = self.link.take() {
                self.state.lock().unwrap().links.remove(&id);
            }
            Ok(())
        })
    }

    fn send(&mut self, msg: ClientMessage) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let id = match &self.link {
                Some((id, _)) => *id,
                None => return Err(TransportError::ConnectionClosed),
            };
            let (tx, responder) = {
                let mut state = self.state.lock().unwrap();
                let Some(tx) = state.links.get(&id).cloned() else {
                    return Err(TransportError::SendFailed("link dropped".into()));
                };
                state.received.push(msg.clone());
                (tx, state.responder.clone())
            };
            // Without a responder the server only keeps the connection alive
            let reply = match responder {
                Some(respond) => respond(&msg),
                None => match msg {
                    ClientMessage::Ping { id } => Some(ServerMessage::pong(id)),
                    _ => None,
                },
            };
            if let Some(reply) = reply {
                let _ = tx.send(reply);
            }
            Ok(())
        })
    }

    fn recv(&mut self) -> TransportFuture<'_, Option<ServerMessage>> {
        Box::pin(async move {
            let Some((_, rx)) = self.link.as_mut() else {
                return Err(TransportError::ConnectionClosed);
            };
            match rx.recv().await {
                Some(msg) => Ok(Some(msg)),
                None => {
                    self.link = None;
                    Ok(None)
                }
            }
        })
    }

    fn is_connected(&self) -> bool {
        self.link.is_some()
    }
}

// ---------------------------------------------------------------------------
// Remote API double
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RemoteState {
    entities: HashMap<String, Vec<(u64, RemoteRecord)>>,
    next_seq: u64,
    server_time: i64,
    rejections: HashMap<String, String>,
    upload_failures: u32,
    download_failures: u32,
    unreachable: bool,
    time_unavailable: bool,
    latency: Duration,
    uploads: Vec<(String, Vec<RemoteRecord>)>,
    downloads: Vec<(String, u64)>,
    notifications: Vec<(String, String)>,
    connect_checks: u32,
}

/// In-memory sync server implementing [`RemoteApi`] directly.
#[derive(Clone, Default)]
pub struct MockRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl MockRemote {
    pub fn new(server_time: i64) -> Self {
        let remote = Self::default();
        remote.lock().server_time = server_time;
        remote
    }

    fn lock(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap()
    }

    /// Store a record as if another device uploaded it. Returns its sequence.
    pub fn seed(&self, entity: &str, record: RemoteRecord) -> u64 {
        let mut state = self.lock();
        state.next_seq += 1;
        let seq = state.next_seq;
        let rows = state.entities.entry(entity.to_string()).or_default();
        rows.retain(|(_, r)| r.id != record.id);
        rows.push((seq, record));
        seq
    }

    /// Latest copy of every record of an entity.
    pub fn records(&self, entity: &str) -> Vec<RemoteRecord> {
        self.lock()
            .entities
            .get(entity)
            .map(|rows| rows.iter().map(|(_, r)| r.clone()).collect())
            .unwrap_or_default()
    }

    pub fn set_server_time(&self, ms: i64) {
        self.lock().server_time = ms;
    }

    pub fn reject(&self, id: &str, reason: &str) {
        self.lock().rejections.insert(id.to_string(), reason.to_string());
    }

    pub fn fail_uploads(&self, n: u32) {
        self.lock().upload_failures = n;
    }

    pub fn fail_downloads(&self, n: u32) {
        self.lock().download_failures = n;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    pub fn set_time_unavailable(&self, unavailable: bool) {
        self.lock().time_unavailable = unavailable;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    pub fn uploads(&self) -> Vec<(String, Vec<RemoteRecord>)> {
        self.lock().uploads.clone()
    }

    pub fn downloads(&self) -> Vec<(String, u64)> {
        self.lock().downloads.clone()
    }

    /// `(entity, device_id)` of every change notification, in order.
    pub fn notifications(&self) -> Vec<(String, String)> {
        self.lock().notifications.clone()
    }

    pub fn connect_checks(&self) -> u32 {
        self.lock().connect_checks
    }

    pub fn handle_upload(&self, entity: &str, records: Vec<RemoteRecord>) -> UploadResponse {
        let mut response = UploadResponse::default();
        for record in records {
            let reason = self.lock().rejections.get(&record.id).cloned();
            match reason {
                Some(reason) => response.rejected.push(RejectedRecord { id: record.id, reason }),
                None => {
                    response.accepted.push(record.id.clone());
                    self.seed(entity, record);
                }
            }
        }
        response
    }

    pub fn handle_download(&self, entity: &str, since: u64) -> DownloadResponse {
        let state = self.lock();
        let mut rows: Vec<_> = state
            .entities
            .get(entity)
            .map(|rows| rows.iter().filter(|(seq, _)| *seq > since).cloned().collect())
            .unwrap_or_default();
        rows.sort_by_key(|(seq, _)| *seq);
        let next_cursor = rows.last().map_or(since, |(seq, _)| *seq);
        DownloadResponse { records: rows.into_iter().map(|(_, r)| r).collect(), next_cursor }
    }

    /// Answer a protocol request, for use as a [`MockServer`] responder.
    pub fn respond(&self, msg: &ClientMessage) -> Option<ServerMessage> {
        match msg {
            ClientMessage::ServerTime { request_id } => Some(ServerMessage::ServerTime {
                request_id: *request_id,
                timestamp: self.lock().server_time,
            }),
            ClientMessage::Upload { request_id, entity, records } => Some(
                ServerMessage::upload_ack(*request_id, self.handle_upload(entity, records.clone())),
            ),
            ClientMessage::Download { request_id, entity, since } => {
                Some(ServerMessage::download(*request_id, self.handle_download(entity, *since)))
            }
            ClientMessage::Ping { id } => Some(ServerMessage::pong(*id)),
            ClientMessage::Notify { .. } => None,
        }
    }

    async fn delay(&self) {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

impl RemoteApi for MockRemote {
    fn ensure_connected(&self) -> RemoteFuture<'_, ()> {
        Box::pin(async move {
            let unreachable = {
                let mut state = self.lock();
                state.connect_checks += 1;
                state.unreachable
            };
            if unreachable {
                return Err(Error::Transport(TransportError::ConnectionFailed(
                    "mock server unreachable".into(),
                )));
            }
            Ok(())
        })
    }

    fn server_time(&self) -> RemoteFuture<'_, i64> {
        Box::pin(async move {
            let state = self.lock();
            if state.time_unavailable {
                return Err(Error::Remote("time service unavailable".into()));
            }
            Ok(state.server_time)
        })
    }

    fn upload<'a>(
        &'a self,
        entity: &'a str,
        records: Vec<RemoteRecord>,
    ) -> RemoteFuture<'a, UploadResponse> {
        Box::pin(async move {
            self.delay().await;
            {
                let mut state = self.lock();
                state.uploads.push((entity.to_string(), records.clone()));
                if state.upload_failures > 0 {
                    state.upload_failures -= 1;
                    return Err(Error::Transport(TransportError::Timeout(500)));
                }
            }
            Ok(self.handle_upload(entity, records))
        })
    }

    fn download<'a>(&'a self, entity: &'a str, since: u64) -> RemoteFuture<'a, DownloadResponse> {
        Box::pin(async move {
            self.delay().await;
            {
                let mut state = self.lock();
                state.downloads.push((entity.to_string(), since));
                if state.download_failures > 0 {
                    state.download_failures -= 1;
                    return Err(Error::Transport(TransportError::Timeout(500)));
                }
            }
            Ok(self.handle_download(entity, since))
        })
    }

    fn notify(&self, entity: &str, device_id: &str) -> Result<()> {
        self.lock().notifications.push((entity.to_string(), device_id.to_string()));
        Ok(())
    }
}
