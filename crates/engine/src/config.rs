// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Engine configuration.
//!
//! Configuration is read from a TOML file. Every section and every field is
//! optional; missing values fall back to the defaults below.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

const DB_FILE_NAME: &str = "drift.db";

/// Top-level configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Device identifier. Generated and persisted in the store when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Local store path, relative to the state directory unless absolute.
    #[serde(default = "default_database")]
    pub database: PathBuf,
    /// Entities to sync, in registration order.
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

fn default_database() -> PathBuf {
    PathBuf::from(DB_FILE_NAME)
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device_id: None,
            database: default_database(),
            entities: Vec::new(),
            remote: RemoteConfig::default(),
            queue: QueueConfig::default(),
            retry: RetryConfig::default(),
            connection: ConnectionConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

/// Remote server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// WebSocket URL of the sync server.
    #[serde(default = "default_url")]
    pub url: String,
    /// Deadline for a single request/response round trip.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_url() -> String {
    "ws://localhost:7890".to_string()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Default for RemoteConfig {
    fn default() -> Self {
        RemoteConfig { url: default_url(), request_timeout_ms: default_request_timeout_ms() }
    }
}

impl RemoteConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Outbound task queue settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

fn default_max_concurrency() -> usize {
    3
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig { max_concurrency: default_max_concurrency() }
    }
}

/// Retry and backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Relative spread applied to each delay, in `[0, 1)`.
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
    /// Retry budget for storage deadlocks, separate from `max_retries`.
    #[serde(default = "default_deadlock_max_retries")]
    pub deadlock_max_retries: u32,
    #[serde(default = "default_deadlock_min_delay_ms")]
    pub deadlock_min_delay_ms: u64,
    #[serde(default = "default_deadlock_max_delay_ms")]
    pub deadlock_max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter_factor() -> f64 {
    0.3
}

fn default_deadlock_max_retries() -> u32 {
    10
}

fn default_deadlock_min_delay_ms() -> u64 {
    10
}

fn default_deadlock_max_delay_ms() -> u64 {
    250
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_factor: default_jitter_factor(),
            deadlock_max_retries: default_deadlock_max_retries(),
            deadlock_min_delay_ms: default_deadlock_min_delay_ms(),
            deadlock_max_delay_ms: default_deadlock_max_delay_ms(),
        }
    }
}

/// Reconnection and health-check settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    /// How long a connected peer may take to answer a health check ping.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

fn default_health_check_interval_ms() -> u64 {
    15_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    10_000
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            max_reconnect_attempts: default_max_reconnect_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_reconnect_max_delay_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
        }
    }
}

impl ConnectionConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

/// Sync scheduling.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Seconds between background cycles. 0 = on demand only.
    #[serde(default)]
    pub interval_secs: u64,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
}

/// What to do with a conflict found during download.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Leave it in the conflict table for the application.
    #[default]
    Surface,
    LastWriterWins,
    LocalWins,
}

impl Config {
    /// Parses and validates a config from TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Writes the config as TOML.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Resolves the store path against `state_dir`.
    pub fn database_path(&self, state_dir: &Path) -> PathBuf {
        if self.database.is_absolute() {
            self.database.clone()
        } else {
            state_dir.join(&self.database)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue.max_concurrency == 0 {
            return Err(Error::Config("queue.max_concurrency must be at least 1".to_string()));
        }
        let retry = &self.retry;
        if !(0.0..1.0).contains(&retry.jitter_factor) {
            return Err(Error::Config(format!(
                "retry.jitter_factor must be in [0, 1), got {}",
                retry.jitter_factor
            )));
        }
        if retry.backoff_multiplier < 1.0 {
            return Err(Error::Config(format!(
                "retry.backoff_multiplier must be >= 1, got {}",
                retry.backoff_multiplier
            )));
        }
        if retry.deadlock_min_delay_ms > retry.deadlock_max_delay_ms {
            return Err(Error::Config(
                "retry.deadlock_min_delay_ms exceeds retry.deadlock_max_delay_ms".to_string(),
            ));
        }
        if let Some(id) = &self.device_id {
            if id.trim().is_empty() {
                return Err(Error::Config("device_id cannot be empty".to_string()));
            }
        }
        if !(self.remote.url.starts_with("ws://") || self.remote.url.starts_with("wss://")) {
            return Err(Error::Config(format!(
                "invalid remote URL '{}': must be ws:// or wss://",
                self.remote.url
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
