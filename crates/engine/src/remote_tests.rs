// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]

use super::*;
use crate::config::ConnectionConfig;
use crate::connection::ConnectionError;
use crate::test_helpers::{remote_note, MockRemote, MockServer};

fn connection_config() -> ConnectionConfig {
    ConnectionConfig {
        max_reconnect_attempts: 2,
        initial_delay_ms: 10,
        max_delay_ms: 100,
        health_check_interval_ms: 1_000,
        heartbeat_timeout_ms: 500,
    }
}

/// A `PeerRemote` backed by an in-process server answering like `backend`.
fn peer_remote(backend: &MockRemote) -> (PeerRemote, MockServer) {
    let server = MockServer::new();
    let backend = backend.clone();
    server.respond_with(move |msg| backend.respond(msg));
    let (service, _events) = ConnectionResilienceService::new(connection_config(), server.factory());
    service.register_peer("hub", "ws://mock");
    (PeerRemote::new(service, "hub", Duration::from_millis(500)), server)
}

#[tokio::test]
async fn ensure_connected_connects_on_demand() {
    let backend = MockRemote::new(0);
    let (remote, server) = peer_remote(&backend);

    remote.ensure_connected().await.unwrap();
    remote.ensure_connected().await.unwrap();

    assert_eq!(server.connects(), 1);
    assert_eq!(remote.peer_id(), "hub");
}

#[tokio::test]
async fn unreachable_server_fails_after_reconnect_attempts() {
    let backend = MockRemote::new(0);
    let (remote, server) = peer_remote(&backend);
    server.refuse_all(true);

    let err = remote.ensure_connected().await.unwrap_err();

    assert!(matches!(
        err,
        Error::Connection(ConnectionError::ReconnectExhausted { attempts: 2, .. })
    ));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn server_time_round_trip() {
    let backend = MockRemote::new(1_700_000_000_000);
    let (remote, _server) = peer_remote(&backend);
    remote.ensure_connected().await.unwrap();

    assert_eq!(remote.server_time().await.unwrap(), 1_700_000_000_000);
}

#[tokio::test]
async fn upload_reports_accepted_and_rejected() {
    let backend = MockRemote::new(0);
    backend.reject("n2", "title too long");
    let (remote, _server) = peer_remote(&backend);
    remote.ensure_connected().await.unwrap();

    let response = remote
        .upload("notes", vec![remote_note("n1", "one", 1_000), remote_note("n2", "two", 2_000)])
        .await
        .unwrap();

    assert!(response.is_accepted("n1"));
    assert_eq!(response.rejection("n2").unwrap().reason, "title too long");
    assert_eq!(backend.records("notes").len(), 1);
}

#[tokio::test]
async fn download_returns_records_after_cursor() {
    let backend = MockRemote::new(0);
    backend.seed("notes", remote_note("n1", "one", 1_000));
    let second = backend.seed("notes", remote_note("n2", "two", 2_000));
    let (remote, _server) = peer_remote(&backend);
    remote.ensure_connected().await.unwrap();

    let all = remote.download("notes", 0).await.unwrap();
    assert_eq!(all.records.len(), 2);
    assert_eq!(all.next_cursor, second);

    let tail = remote.download("notes", second - 1).await.unwrap();
    assert_eq!(tail.records.len(), 1);
    assert_eq!(tail.records[0].id, "n2");

    let empty = remote.download("notes", second).await.unwrap();
    assert!(empty.records.is_empty());
    assert_eq!(empty.next_cursor, second);
}

#[tokio::test]
async fn server_error_becomes_remote_error() {
    let server = MockServer::new();
    server.respond_with(|msg| Some(ServerMessage::error(msg.request_id(), "entity locked")));
    let (service, _events) = ConnectionResilienceService::new(connection_config(), server.factory());
    service.register_peer("hub", "ws://mock");
    let remote = PeerRemote::new(service, "hub", Duration::from_millis(500));
    remote.ensure_connected().await.unwrap();

    let err = remote.download("notes", 0).await.unwrap_err();

    assert!(matches!(&err, Error::Remote(message) if message == "entity locked"));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn mismatched_response_is_rejected() {
    let server = MockServer::new();
    server.respond_with(|msg| {
        msg.request_id().map(|id| ServerMessage::download(id, DownloadResponse::default()))
    });
    let (service, _events) = ConnectionResilienceService::new(connection_config(), server.factory());
    service.register_peer("hub", "ws://mock");
    let remote = PeerRemote::new(service, "hub", Duration::from_millis(500));
    remote.ensure_connected().await.unwrap();

    let err = remote.server_time().await.unwrap_err();

    assert!(err.to_string().contains("unexpected response to server_time"));
}

#[tokio::test(start_paused = true)]
async fn silent_server_times_out_as_transient() {
    let server = MockServer::new();
    let (service, _events) = ConnectionResilienceService::new(connection_config(), server.factory());
    service.register_peer("hub", "ws://mock");
    let remote = PeerRemote::new(service, "hub", Duration::from_millis(500));
    remote.ensure_connected().await.unwrap();

    let err = remote.server_time().await.unwrap_err();

    assert!(matches!(err, Error::Connection(ConnectionError::Timeout { ms: 500, .. })));
    assert!(err.is_transient());
}

#[tokio::test]
async fn notify_waits_for_the_connection_then_flushes() {
    let backend = MockRemote::new(0);
    let (remote, server) = peer_remote(&backend);

    remote.notify("notes", "laptop").unwrap();
    assert!(server.received().is_empty());

    remote.ensure_connected().await.unwrap();
    remote.notify("tasks", "laptop").unwrap();

    for _ in 0..100 {
        if server.received().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        server.received(),
        vec![ClientMessage::notify("notes", "laptop"), ClientMessage::notify("tasks", "laptop")]
    );
}

#[test]
fn notify_to_unknown_peer_fails() {
    let server = MockServer::new();
    let (service, _events) = ConnectionResilienceService::new(connection_config(), server.factory());
    let remote = PeerRemote::new(service, "nowhere", Duration::from_millis(500));

    let err = remote.notify("notes", "laptop").unwrap_err();

    assert!(matches!(err, Error::Connection(ConnectionError::UnknownPeer(_))));
}
