// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]

use super::*;
use yare::parameterized;

#[parameterized(
    transport = { Error::Transport(TransportError::ConnectionClosed), true },
    timeout = { Error::Transport(TransportError::Timeout(500)), true },
    lost = { Error::Connection(ConnectionError::Lost("hub".into())), true },
    busy = { Error::Core(drift_core::Error::Busy("database is locked".into())), true },
    unknown_peer = { Error::Connection(ConnectionError::UnknownPeer("hub".into())), false },
    rejected = { Error::Rejected { id: "n1".into(), reason: "invalid title".into() }, false },
    remote = { Error::Remote("unauthorized".into()), false },
    setup = { Error::Setup("unreachable".into()), false },
)]
fn transient_classification(err: Error, transient: bool) {
    assert_eq!(err.is_transient(), transient);
}

#[test]
fn fatal_errors() {
    assert!(Error::NotInitialized.is_fatal());
    assert!(Error::Setup("x".into()).is_fatal());
    assert!(Error::ClockQuery("x".into()).is_fatal());
    assert!(!Error::Remote("x".into()).is_fatal());
}

#[test]
fn core_errors_display_transparently() {
    let err = Error::from(drift_core::Error::Busy("database is locked".into()));
    assert_eq!(err.to_string(), "storage deadlock: database is locked");
}

#[test]
fn rejected_display_names_record() {
    let err = Error::Rejected { id: "n1".into(), reason: "title required".into() };
    assert_eq!(err.to_string(), "record 'n1' rejected by server: title required");
}
