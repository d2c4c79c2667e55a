// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Connection lifecycle for remote peers.
//!
//! [`ConnectionResilienceService`] keeps one live transport per registered
//! peer. Each connection is owned by a background I/O task that writes
//! outbound messages and routes responses back to waiting requests by
//! `request_id`. When a connection drops, a single reconnection attempt per
//! peer runs with exponential backoff; concurrent callers share it. Messages
//! sent while a peer is down are queued and flushed, in order, before the
//! peer is reported connected again. The health check pings connected peers
//! and treats a missing pong like a lost connection.
//!
//! ```text
//! disconnected ──connect──▶ connected
//!      ▲                       │ link lost
//!      │ attempts exhausted    ▼
//!      └────────────────── reconnecting ──▶ connected
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures_util::future::{join_all, BoxFuture, FutureExt, Shared};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use drift_core::protocol::{ClientMessage, ServerMessage};

use crate::config::ConnectionConfig;
use crate::transport::Transport;

/// Creates a fresh, unconnected transport for each connection attempt.
pub type TransportFactory = Arc<dyn Fn() -> Box<dyn Transport> + Send + Sync>;

/// Error type for connection operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("unknown peer '{0}'")]
    UnknownPeer(String),

    #[error("peer '{0}' is not connected")]
    NotConnected(String),

    #[error("connection to '{peer}' failed: {reason}")]
    ConnectFailed { peer: String, reason: String },

    #[error("connection to '{0}' lost")]
    Lost(String),

    #[error("request to '{peer}' timeout after {ms}ms")]
    Timeout { peer: String, ms: u64 },

    #[error("reconnection to '{peer}' gave up after {attempts} attempts: {error}")]
    ReconnectExhausted { peer: String, attempts: u32, error: String },

    #[error("resilience service stopped")]
    Shutdown,
}

impl ConnectionError {
    /// Returns true if the same call may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectionError::NotConnected(_)
                | ConnectionError::ConnectFailed { .. }
                | ConnectionError::Lost(_)
                | ConnectionError::Timeout { .. }
        )
    }
}

/// Connection state of one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connected,
    Disconnected,
    Reconnecting,
}

/// Notifications from the service.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connected { peer: String },
    Disconnected { peer: String, reason: String },
    Reconnecting { peer: String, attempt: u32 },
    ReconnectFailed { peer: String, attempts: u32, error: String },
    /// Messages queued while disconnected were written to the new connection.
    Flushed { peer: String, count: usize },
    /// A server message that answers no pending request.
    Message { peer: String, message: ServerMessage },
}

/// Outcome of [`ConnectionResilienceService::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Held until the peer reconnects.
    Queued,
}

type PendingRequests = Arc<Mutex<HashMap<u64, oneshot::Sender<ServerMessage>>>>;
type Reconnection = Shared<BoxFuture<'static, Result<(), ConnectionError>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A live connection. Dropping it stops the I/O task.
struct Link {
    generation: u64,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    pending: PendingRequests,
    stop: CancellationToken,
}

impl Drop for Link {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

struct Peer {
    url: String,
    state: PeerState,
    /// False after an explicit disconnect; the health check leaves it alone.
    wanted: bool,
    link: Option<Link>,
    outbox: VecDeque<ClientMessage>,
}

struct Inner {
    config: ConnectionConfig,
    factory: TransportFactory,
    peers: Mutex<HashMap<String, Peer>>,
    reconnecting: Mutex<HashMap<String, Reconnection>>,
    events: mpsc::Sender<ConnectionEvent>,
    cancel: CancellationToken,
    next_request_id: AtomicU64,
    next_generation: AtomicU64,
}

/// Connection manager for all remote peers.
///
/// Cloning is cheap; clones share peers, links and the event channel.
#[derive(Clone)]
pub struct ConnectionResilienceService {
    inner: Arc<Inner>,
}

impl ConnectionResilienceService {
    /// Create a new service.
    ///
    /// Returns the service and a receiver for connection events.
    pub fn new(
        config: ConnectionConfig,
        factory: TransportFactory,
    ) -> (Self, mpsc::Receiver<ConnectionEvent>) {
        let (events, event_rx) = mpsc::channel(64);
        let service = ConnectionResilienceService {
            inner: Arc::new(Inner {
                config,
                factory,
                peers: Mutex::new(HashMap::new()),
                reconnecting: Mutex::new(HashMap::new()),
                events,
                cancel: CancellationToken::new(),
                next_request_id: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
            }),
        };
        (service, event_rx)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Cancellation token stopping every connection, backoff and health check.
    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Register a peer, or update its URL if already known.
    pub fn register_peer(&self, peer_id: &str, url: &str) {
        let mut peers = lock(&self.inner.peers);
        match peers.get_mut(peer_id) {
            Some(peer) => peer.url = url.to_string(),
            None => {
                peers.insert(
                    peer_id.to_string(),
                    Peer {
                        url: url.to_string(),
                        state: PeerState::Disconnected,
                        wanted: true,
                        link: None,
                        outbox: VecDeque::new(),
                    },
                );
            }
        }
    }

    pub fn remove_peer(&self, peer_id: &str) -> bool {
        lock(&self.inner.peers).remove(peer_id).is_some()
    }

    pub fn peer_state(&self, peer_id: &str) -> Option<PeerState> {
        lock(&self.inner.peers).get(peer_id).map(|p| p.state)
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.peer_state(peer_id) == Some(PeerState::Connected)
    }

    /// Number of messages waiting for the peer to reconnect.
    pub fn queued_messages(&self, peer_id: &str) -> usize {
        lock(&self.inner.peers).get(peer_id).map_or(0, |p| p.outbox.len())
    }

    /// Connect a peer with a single attempt.
    pub async fn connect(&self, peer_id: &str) -> Result<(), ConnectionError> {
        if self.is_connected(peer_id) {
            return Ok(());
        }
        {
            let mut peers = lock(&self.inner.peers);
            let peer = peers
                .get_mut(peer_id)
                .ok_or_else(|| ConnectionError::UnknownPeer(peer_id.to_string()))?;
            peer.wanted = true;
        }
        let result = self.establish(peer_id).await;
        if let Err(e) = &result {
            warn!(peer = peer_id, error = %e, "connect failed");
        }
        result
    }

    /// Close a peer's connection without reconnecting.
    pub fn disconnect(&self, peer_id: &str) -> Result<(), ConnectionError> {
        let mut peers = lock(&self.inner.peers);
        let peer = peers
            .get_mut(peer_id)
            .ok_or_else(|| ConnectionError::UnknownPeer(peer_id.to_string()))?;
        peer.wanted = false;
        peer.link = None;
        peer.state = PeerState::Disconnected;
        Ok(())
    }

    /// Send a fire-and-forget message, queueing it while the peer is down.
    pub fn send(&self, peer_id: &str, msg: ClientMessage) -> Result<Delivery, ConnectionError> {
        let mut peers = lock(&self.inner.peers);
        let peer = peers
            .get_mut(peer_id)
            .ok_or_else(|| ConnectionError::UnknownPeer(peer_id.to_string()))?;

        let msg = match (&peer.state, &peer.link) {
            (PeerState::Connected, Some(link)) => match link.outbound.send(msg) {
                Ok(()) => return Ok(Delivery::Sent),
                // I/O task is gone; keep the message for the next connection
                Err(mpsc::error::SendError(msg)) => msg,
            },
            _ => msg,
        };

        peer.outbox.push_back(msg);
        debug!(peer = peer_id, queued = peer.outbox.len(), "message queued while disconnected");
        Ok(Delivery::Queued)
    }

    /// Send a request and wait for the response carrying the same `request_id`.
    ///
    /// `build` receives the allocated request id. Requests are never queued:
    /// a disconnected peer fails fast with [`ConnectionError::NotConnected`].
    pub async fn request<F>(
        &self,
        peer_id: &str,
        build: F,
        timeout: Duration,
    ) -> Result<ServerMessage, ConnectionError>
    where
        F: FnOnce(u64) -> ClientMessage,
    {
        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let pending = {
            let peers = lock(&self.inner.peers);
            let peer = peers
                .get(peer_id)
                .ok_or_else(|| ConnectionError::UnknownPeer(peer_id.to_string()))?;
            let link = match (&peer.state, &peer.link) {
                (PeerState::Connected, Some(link)) => link,
                _ => return Err(ConnectionError::NotConnected(peer_id.to_string())),
            };

            lock(&link.pending).insert(request_id, tx);
            if link.outbound.send(build(request_id)).is_err() {
                lock(&link.pending).remove(&request_id);
                return Err(ConnectionError::Lost(peer_id.to_string()));
            }
            Arc::clone(&link.pending)
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(msg)) => Ok(msg),
            // Sender dropped: the link died with the request in flight
            Ok(Err(_)) => Err(ConnectionError::Lost(peer_id.to_string())),
            Err(_) => {
                lock(&pending).remove(&request_id);
                Err(ConnectionError::Timeout {
                    peer: peer_id.to_string(),
                    ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// React to a lost connection by reconnecting.
    ///
    /// If a reconnection for `peer_id` is already running, the caller waits
    /// on that one instead of starting another.
    pub async fn handle_disconnection(&self, peer_id: &str) -> Result<(), ConnectionError> {
        if self.inner.cancel.is_cancelled() {
            return Err(ConnectionError::Shutdown);
        }

        let reconnection = {
            let mut reconnecting = lock(&self.inner.reconnecting);
            match reconnecting.get(peer_id) {
                Some(existing) => {
                    debug!(peer = peer_id, "joining in-flight reconnection");
                    existing.clone()
                }
                None => {
                    {
                        let mut peers = lock(&self.inner.peers);
                        let peer = peers
                            .get_mut(peer_id)
                            .ok_or_else(|| ConnectionError::UnknownPeer(peer_id.to_string()))?;
                        peer.link = None;
                        peer.state = PeerState::Reconnecting;
                    }

                    let service = self.clone();
                    let peer = peer_id.to_string();
                    let task = tokio::spawn(async move {
                        let result = service.attempt_reconnection(&peer).await;
                        lock(&service.inner.reconnecting).remove(&peer);
                        result
                    });
                    let shared = async move { task.await.unwrap_or(Err(ConnectionError::Shutdown)) }
                        .boxed()
                        .shared();
                    reconnecting.insert(peer_id.to_string(), shared.clone());
                    shared
                }
            }
        };

        reconnection.await
    }

    /// Whether a reconnection for `peer_id` is currently running.
    pub fn is_reconnecting(&self, peer_id: &str) -> bool {
        lock(&self.inner.reconnecting).contains_key(peer_id)
    }

    /// Retry [`establish`](Self::establish) with exponential backoff.
    async fn attempt_reconnection(&self, peer_id: &str) -> Result<(), ConnectionError> {
        let config = &self.inner.config;
        let max_attempts = config.max_reconnect_attempts;
        let mut delay_ms = config.initial_delay_ms;
        let mut last_error = "no reconnect attempts configured".to_string();

        for attempt in 1..=max_attempts {
            self.emit(ConnectionEvent::Reconnecting { peer: peer_id.to_string(), attempt });

            match self.establish(peer_id).await {
                Ok(()) => {
                    info!(peer = peer_id, attempt, "reconnected");
                    return Ok(());
                }
                Err(e @ (ConnectionError::Shutdown | ConnectionError::UnknownPeer(_))) => {
                    self.settle_disconnected(peer_id);
                    return Err(e);
                }
                Err(e) => {
                    warn!(peer = peer_id, attempt, max_attempts, error = %e, "reconnection attempt failed");
                    last_error = e.to_string();
                }
            }

            if attempt < max_attempts {
                tokio::select! {
                    _ = self.inner.cancel.cancelled() => {
                        self.settle_disconnected(peer_id);
                        return Err(ConnectionError::Shutdown);
                    }
                    _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                }
                delay_ms = delay_ms.saturating_mul(2).min(config.max_delay_ms);
            }
        }

        self.settle_disconnected(peer_id);
        self.emit(ConnectionEvent::ReconnectFailed {
            peer: peer_id.to_string(),
            attempts: max_attempts,
            error: last_error.clone(),
        });
        Err(ConnectionError::ReconnectExhausted {
            peer: peer_id.to_string(),
            attempts: max_attempts,
            error: last_error,
        })
    }

    /// One connect attempt. On success the outbox is flushed into the new
    /// link before the peer is marked connected.
    async fn establish(&self, peer_id: &str) -> Result<(), ConnectionError> {
        let url = lock(&self.inner.peers)
            .get(peer_id)
            .map(|p| p.url.clone())
            .ok_or_else(|| ConnectionError::UnknownPeer(peer_id.to_string()))?;

        let mut transport = (self.inner.factory)();
        let connected = tokio::select! {
            _ = self.inner.cancel.cancelled() => return Err(ConnectionError::Shutdown),
            result = transport.connect(&url) => result,
        };
        connected.map_err(|e| ConnectionError::ConnectFailed {
            peer: peer_id.to_string(),
            reason: e.to_string(),
        })?;

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let pending = PendingRequests::default();
        let stop = self.inner.cancel.child_token();

        let flushed = {
            let mut peers = lock(&self.inner.peers);
            if self.inner.cancel.is_cancelled() {
                return Err(ConnectionError::Shutdown);
            }
            let peer = peers
                .get_mut(peer_id)
                .ok_or_else(|| ConnectionError::UnknownPeer(peer_id.to_string()))?;

            let flushed = peer.outbox.len();
            for msg in peer.outbox.drain(..) {
                // Receiver is alive until the link is dropped
                let _ = outbound.send(msg);
            }
            peer.link = Some(Link {
                generation,
                outbound,
                pending: Arc::clone(&pending),
                stop: stop.clone(),
            });
            peer.state = PeerState::Connected;
            flushed
        };

        tokio::spawn(run_link(
            Arc::downgrade(&self.inner),
            peer_id.to_string(),
            generation,
            transport,
            outbound_rx,
            pending,
            stop,
        ));

        info!(peer = peer_id, url = %url, flushed, "peer connected");
        self.emit(ConnectionEvent::Connected { peer: peer_id.to_string() });
        if flushed > 0 {
            self.emit(ConnectionEvent::Flushed { peer: peer_id.to_string(), count: flushed });
        }
        Ok(())
    }

    /// Called by the I/O task when its connection ends unexpectedly.
    fn link_lost(&self, peer_id: &str, generation: u64, reason: String) {
        {
            let mut peers = lock(&self.inner.peers);
            let Some(peer) = peers.get_mut(peer_id) else {
                return;
            };
            // A newer link already replaced this one
            if peer.link.as_ref().map(|l| l.generation) != Some(generation) {
                return;
            }
            peer.link = None;
            peer.state = PeerState::Disconnected;
        }

        warn!(peer = peer_id, reason = %reason, "connection lost");
        self.emit(ConnectionEvent::Disconnected { peer: peer_id.to_string(), reason });

        if self.inner.cancel.is_cancelled() {
            return;
        }
        let service = self.clone();
        let peer = peer_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = service.handle_disconnection(&peer).await {
                warn!(peer = %peer, error = %e, "automatic reconnection failed");
            }
        });
    }

    fn settle_disconnected(&self, peer_id: &str) {
        if let Some(peer) = lock(&self.inner.peers).get_mut(peer_id) {
            if peer.state == PeerState::Reconnecting {
                peer.state = PeerState::Disconnected;
            }
        }
    }

    /// Reconnect every wanted peer that is down, whose I/O task died, or
    /// that did not answer a ping within the heartbeat timeout.
    ///
    /// Failures are logged, never returned. Returns how many peers needed a
    /// reconnection.
    pub async fn check_health(&self) -> usize {
        let mut stale = Vec::new();
        let mut live = Vec::new();
        for (id, peer) in lock(&self.inner.peers).iter().filter(|(_, p)| p.wanted) {
            match (&peer.state, &peer.link) {
                (PeerState::Connected, Some(link)) if !link.outbound.is_closed() => {
                    live.push(id.clone())
                }
                (PeerState::Disconnected, _) | (PeerState::Connected, _) => stale.push(id.clone()),
                (PeerState::Reconnecting, _) => {}
            }
        }

        let timeout = self.inner.config.heartbeat_timeout();
        let pings = live.iter().map(|peer| async move {
            (peer, self.request(peer, ClientMessage::ping, timeout).await)
        });
        for (peer, result) in join_all(pings).await {
            match result {
                Ok(_) => {}
                // A dropped link reconnects on its own
                Err(e @ ConnectionError::Timeout { .. }) => {
                    warn!(peer = %peer, error = %e, "heartbeat unanswered");
                    self.emit(ConnectionEvent::Disconnected {
                        peer: peer.clone(),
                        reason: format!("no pong within {}ms", timeout.as_millis()),
                    });
                    stale.push(peer.clone());
                }
                Err(e) => debug!(peer = %peer, error = %e, "heartbeat not delivered"),
            }
        }

        if stale.is_empty() {
            return 0;
        }

        debug!(peers = stale.len(), "health check found disconnected peers");
        let attempts = stale.iter().map(|peer| async move {
            if let Err(e) = self.handle_disconnection(peer).await {
                warn!(peer = %peer, error = %e, "health check reconnection failed");
            }
        });
        join_all(attempts).await;
        stale.len()
    }

    /// Run [`check_health`](Self::check_health) on the configured interval
    /// until the service shuts down.
    pub fn start_health_check(&self) -> JoinHandle<()> {
        let service = self.clone();
        let period = self.inner.config.health_check_interval().max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = service.inner.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        service.check_health().await;
                    }
                }
            }
            debug!("health check stopped");
        })
    }

    /// Close every connection and stop all background work.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        let mut peers = lock(&self.inner.peers);
        for peer in peers.values_mut() {
            peer.link = None;
            peer.state = PeerState::Disconnected;
        }
        info!(peers = peers.len(), "connection service shut down");
    }

    fn emit(&self, event: ConnectionEvent) {
        if let Err(e) = self.inner.events.try_send(event) {
            debug!(error = %e, "connection event dropped");
        }
    }

    fn emit_from_link(inner: &Weak<Inner>, event: ConnectionEvent) {
        if let Some(inner) = inner.upgrade() {
            ConnectionResilienceService { inner }.emit(event);
        }
    }
}

/// I/O task owning one connection's transport.
async fn run_link(
    inner: Weak<Inner>,
    peer: String,
    generation: u64,
    mut transport: Box<dyn Transport>,
    mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
    pending: PendingRequests,
    stop: CancellationToken,
) {
    let lost = loop {
        tokio::select! {
            _ = stop.cancelled() => break None,
            msg = outbound.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = transport.send(msg).await {
                        break Some(e.to_string());
                    }
                }
                None => break None,
            },
            incoming = transport.recv() => match incoming {
                Ok(Some(msg)) => dispatch(&inner, &peer, &pending, msg),
                Ok(None) => break Some("closed by remote".to_string()),
                Err(e) => break Some(e.to_string()),
            },
        }
    };

    let _ = transport.disconnect().await;
    // Dropping the senders fails every request still in flight
    lock(&pending).clear();

    if let Some(reason) = lost {
        if let Some(inner) = inner.upgrade() {
            ConnectionResilienceService { inner }.link_lost(&peer, generation, reason);
        }
    }
}

fn dispatch(inner: &Weak<Inner>, peer: &str, pending: &PendingRequests, msg: ServerMessage) {
    let correlation = match &msg {
        ServerMessage::Pong { id } => Some(*id),
        other => other.request_id(),
    };
    let waiter = correlation.and_then(|id| lock(pending).remove(&id));
    match waiter {
        Some(tx) => {
            // Requester may have timed out already
            let _ = tx.send(msg);
        }
        None => ConnectionResilienceService::emit_from_link(
            inner,
            ConnectionEvent::Message { peer: peer.to_string(), message: msg },
        ),
    }
}

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;
