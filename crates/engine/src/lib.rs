// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! driftsync: the async half of the drift sync engine.
//!
//! Data flows from an application write through the [`ChangeTracker`] into
//! the local store, then out through the [`SyncOrchestrator`]: records are
//! mapped to the wire format, scheduled on the [`SyncQueue`], retried by the
//! [`RetryPolicy`] and delivered over a [`ConnectionResilienceService`] peer.
//! Downloads come back the same way and are checked for conflicts before
//! they touch the store.

pub mod config;
pub mod connection;
pub mod error;
pub mod orchestrator;
pub mod queue;
pub mod remote;
pub mod retry;
pub mod tracker;
pub mod transport;

#[cfg(test)]
mod test_helpers;

pub use config::{Config, ConflictPolicy};
pub use connection::{ConnectionError, ConnectionEvent, ConnectionResilienceService, PeerState};
pub use error::{Error, Result};
pub use orchestrator::{
    ConflictResolver, CycleReport, CycleState, LastWriterWins, LocalWins, RecordFailure,
    Resolution, SyncEvent, SyncOrchestrator,
};
pub use queue::{QueueError, QueueStats, SyncQueue, TaskHandle};
pub use remote::{PeerRemote, RemoteApi};
pub use retry::{RetryOptions, RetryPolicy};
pub use tracker::{ChangeTracker, SyncNowOptions};
pub use transport::{Transport, TransportError, WebSocketTransport};
