// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Wire protocol messages for client-server communication.
//!
//! The protocol is request/response over a message transport:
//! - Client sends requests tagged with a `request_id`
//! - Server answers each request with a message echoing that `request_id`
//! - `Notify`/`Changed` are fire-and-forget hints in either direction

use serde::{Deserialize, Serialize};

use crate::record::RemoteRecord;

/// A record the server refused to accept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRecord {
    pub id: String,
    pub reason: String,
}

/// Result of an upload request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub accepted: Vec<String>,
    pub rejected: Vec<RejectedRecord>,
}

impl UploadResponse {
    pub fn is_accepted(&self, id: &str) -> bool {
        self.accepted.iter().any(|a| a == id)
    }

    pub fn rejection(&self, id: &str) -> Option<&RejectedRecord> {
        self.rejected.iter().find(|r| r.id == id)
    }
}

/// Result of a download request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadResponse {
    pub records: Vec<RemoteRecord>,
    pub next_cursor: u64,
}

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Ask for the server's current time (epoch ms).
    ServerTime { request_id: u64 },

    /// Submit local changes for one entity.
    Upload { request_id: u64, entity: String, records: Vec<RemoteRecord> },

    /// Request remote records changed after `since`.
    Download { request_id: u64, entity: String, since: u64 },

    /// Tell the server this device has new changes for an entity.
    ///
    /// Fire-and-forget; queued while disconnected.
    Notify { entity: String, device_id: String },

    /// Ping message for keepalive.
    Ping {
        /// Client-chosen ID echoed in Pong.
        id: u64,
    },
}

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ServerTime { request_id: u64, timestamp: i64 },

    UploadAck { request_id: u64, accepted: Vec<String>, rejected: Vec<RejectedRecord> },

    Download { request_id: u64, records: Vec<RemoteRecord>, next_cursor: u64 },

    /// Another device changed an entity.
    Changed { entity: String },

    /// Pong response to client Ping.
    Pong {
        /// Echoed from the Ping message.
        id: u64,
    },

    /// Error message, optionally tied to a request.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        /// Human-readable error description.
        message: String,
    },
}

impl ClientMessage {
    pub fn server_time(request_id: u64) -> Self {
        ClientMessage::ServerTime { request_id }
    }

    pub fn upload(request_id: u64, entity: impl Into<String>, records: Vec<RemoteRecord>) -> Self {
        ClientMessage::Upload { request_id, entity: entity.into(), records }
    }

    pub fn download(request_id: u64, entity: impl Into<String>, since: u64) -> Self {
        ClientMessage::Download { request_id, entity: entity.into(), since }
    }

    pub fn notify(entity: impl Into<String>, device_id: impl Into<String>) -> Self {
        ClientMessage::Notify { entity: entity.into(), device_id: device_id.into() }
    }

    /// Creates a Ping message.
    pub fn ping(id: u64) -> Self {
        ClientMessage::Ping { id }
    }

    /// The request this message expects an answer to, if any.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            ClientMessage::ServerTime { request_id }
            | ClientMessage::Upload { request_id, .. }
            | ClientMessage::Download { request_id, .. } => Some(*request_id),
            ClientMessage::Notify { .. } | ClientMessage::Ping { .. } => None,
        }
    }

    /// Serializes the message to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserializes the message from JSON.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    pub fn upload_ack(request_id: u64, response: UploadResponse) -> Self {
        ServerMessage::UploadAck {
            request_id,
            accepted: response.accepted,
            rejected: response.rejected,
        }
    }

    pub fn download(request_id: u64, response: DownloadResponse) -> Self {
        ServerMessage::Download {
            request_id,
            records: response.records,
            next_cursor: response.next_cursor,
        }
    }

    /// Creates a Pong message.
    pub fn pong(id: u64) -> Self {
        ServerMessage::Pong { id }
    }

    /// Creates an Error message answering a request.
    pub fn error(request_id: Option<u64>, message: impl Into<String>) -> Self {
        ServerMessage::Error { request_id, message: message.into() }
    }

    /// The request this message answers, if any.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            ServerMessage::ServerTime { request_id, .. }
            | ServerMessage::UploadAck { request_id, .. }
            | ServerMessage::Download { request_id, .. } => Some(*request_id),
            ServerMessage::Error { request_id, .. } => *request_id,
            ServerMessage::Changed { .. } | ServerMessage::Pong { .. } => None,
        }
    }

    /// Serializes the message to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserializes the message from JSON.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
