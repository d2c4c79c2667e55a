// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Environment lookups for driftd.

use std::path::PathBuf;

pub mod names {
    include!(concat!(env!("OUT_DIR"), "/env_names.rs"));
}

fn non_empty_path(key: &str) -> Option<PathBuf> {
    std::env::var_os(key).filter(|v| !v.is_empty()).map(PathBuf::from)
}

/// `DRIFT_STATE_DIR`, if set and non-empty.
pub fn state_dir() -> Option<PathBuf> {
    non_empty_path(names::DRIFT_STATE_DIR)
}

/// `DRIFT_CONFIG`, if set and non-empty.
pub fn config_path() -> Option<PathBuf> {
    non_empty_path(names::DRIFT_CONFIG)
}

pub fn xdg_state_home() -> Option<PathBuf> {
    non_empty_path(names::XDG_STATE_HOME)
}

#[cfg(test)]
#[path = "env_tests.rs"]
mod tests;
