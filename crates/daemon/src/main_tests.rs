// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]

use super::*;
use clap::CommandFactory;
use tempfile::TempDir;

fn p(s: &str) -> Option<PathBuf> {
    Some(PathBuf::from(s))
}

#[test]
fn state_dir_flag_wins() {
    let dir = resolve_state_dir(p("/flag"), p("/env"), p("/xdg"), p("/home/u"));
    assert_eq!(dir, PathBuf::from("/flag"));
}

#[test]
fn state_dir_env_beats_xdg() {
    let dir = resolve_state_dir(None, p("/env"), p("/xdg"), p("/home/u"));
    assert_eq!(dir, PathBuf::from("/env"));
}

#[test]
fn state_dir_falls_back_to_xdg_then_home() {
    assert_eq!(
        resolve_state_dir(None, None, p("/xdg"), p("/home/u")),
        PathBuf::from("/xdg/drift")
    );
    assert_eq!(
        resolve_state_dir(None, None, None, p("/home/u")),
        PathBuf::from("/home/u/.local/state/drift")
    );
    assert_eq!(resolve_state_dir(None, None, None, None), PathBuf::from(".local/state/drift"));
}

#[test]
fn second_lock_on_same_dir_fails() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(LOCK_NAME);

    let first = acquire_lock(&path).unwrap();
    let err = acquire_lock(&path).unwrap_err();
    assert!(err.to_string().contains("another driftd instance"));

    drop(first);
    assert!(acquire_lock(&path).is_ok());
}

#[test]
fn pid_file_holds_current_pid() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(PID_NAME);

    write_pid_file(&path).unwrap();

    assert_eq!(fs::read_to_string(&path).unwrap(), std::process::id().to_string());
}

#[test]
fn args_parse() {
    Args::command().debug_assert();

    let args = Args::try_parse_from(["driftd", "-c", "drift.toml", "--once", "-v"]).unwrap();
    assert_eq!(args.config, p("drift.toml"));
    assert!(args.once);
    assert!(args.verbose);
    assert_eq!(args.state_dir, None);
}
