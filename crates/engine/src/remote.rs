// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! The remote API consumed by the orchestrator.
//!
//! [`RemoteApi`] is the client side of the server contract: server time,
//! upload, download and change notifications. [`PeerRemote`] implements it as request/response
//! messages over a [`ConnectionResilienceService`] peer.

use std::time::Duration;

use futures_util::future::BoxFuture;
use tracing::debug;

use drift_core::protocol::{ClientMessage, DownloadResponse, ServerMessage, UploadResponse};
use drift_core::record::RemoteRecord;

use crate::connection::ConnectionResilienceService;
use crate::error::{Error, Result};

/// Boxed future returned by [`RemoteApi`] methods.
pub type RemoteFuture<'a, T> = BoxFuture<'a, Result<T>>;

/// Server operations the sync engine depends on.
pub trait RemoteApi: Send + Sync {
    /// Make sure the server is reachable, connecting if needed.
    fn ensure_connected(&self) -> RemoteFuture<'_, ()>;

    /// Current server time in epoch milliseconds.
    fn server_time(&self) -> RemoteFuture<'_, i64>;

    fn upload<'a>(
        &'a self,
        entity: &'a str,
        records: Vec<RemoteRecord>,
    ) -> RemoteFuture<'a, UploadResponse>;

    /// Records changed after cursor sequence `since`.
    fn download<'a>(&'a self, entity: &'a str, since: u64) -> RemoteFuture<'a, DownloadResponse>;

    /// Tell the server `entity` changed on this device. Fire-and-forget:
    /// nothing answers it, and it may be held until the server is reachable.
    fn notify(&self, entity: &str, device_id: &str) -> Result<()>;
}

/// [`RemoteApi`] over one peer of the connection service.
#[derive(Clone)]
pub struct PeerRemote {
    service: ConnectionResilienceService,
    peer_id: String,
    timeout: Duration,
}

impl PeerRemote {
    pub fn new(service: ConnectionResilienceService, peer_id: impl Into<String>, timeout: Duration) -> Self {
        PeerRemote { service, peer_id: peer_id.into(), timeout }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    async fn call<F>(&self, what: &str, build: F) -> Result<ServerMessage>
    where
        F: FnOnce(u64) -> ClientMessage + Send,
    {
        let response = self.service.request(&self.peer_id, build, self.timeout).await?;
        match response {
            ServerMessage::Error { message, .. } => {
                debug!(peer = %self.peer_id, request = what, error = %message, "server returned error");
                Err(Error::Remote(message))
            }
            other => Ok(other),
        }
    }
}

fn unexpected(what: &str, msg: &ServerMessage) -> Error {
    Error::Remote(format!("unexpected response to {what}: {msg:?}"))
}

impl RemoteApi for PeerRemote {
    fn ensure_connected(&self) -> RemoteFuture<'_, ()> {
        Box::pin(async move {
            if self.service.is_connected(&self.peer_id) {
                return Ok(());
            }
            self.service.handle_disconnection(&self.peer_id).await?;
            Ok(())
        })
    }

    fn server_time(&self) -> RemoteFuture<'_, i64> {
        Box::pin(async move {
            match self.call("server_time", ClientMessage::server_time).await? {
                ServerMessage::ServerTime { timestamp, .. } => Ok(timestamp),
                other => Err(unexpected("server_time", &other)),
            }
        })
    }

    fn upload<'a>(
        &'a self,
        entity: &'a str,
        records: Vec<RemoteRecord>,
    ) -> RemoteFuture<'a, UploadResponse> {
        Box::pin(async move {
            let build = move |id| ClientMessage::upload(id, entity, records);
            match self.call("upload", build).await? {
                ServerMessage::UploadAck { accepted, rejected, .. } => {
                    Ok(UploadResponse { accepted, rejected })
                }
                other => Err(unexpected("upload", &other)),
            }
        })
    }

    fn download<'a>(&'a self, entity: &'a str, since: u64) -> RemoteFuture<'a, DownloadResponse> {
        Box::pin(async move {
            let build = move |id| ClientMessage::download(id, entity, since);
            match self.call("download", build).await? {
                ServerMessage::Download { records, next_cursor, .. } => {
                    Ok(DownloadResponse { records, next_cursor })
                }
                other => Err(unexpected("download", &other)),
            }
        })
    }

    fn notify(&self, entity: &str, device_id: &str) -> Result<()> {
        let delivery = self.service.send(&self.peer_id, ClientMessage::notify(entity, device_id))?;
        debug!(peer = %self.peer_id, entity, ?delivery, "change notification");
        Ok(())
    }
}

#[cfg(test)]
#[path = "remote_tests.rs"]
mod tests;
