// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Wiring of the sync engine and the daemon event loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use drift_core::{EntityRegistry, EntitySchema, LocalStore, ServerMessage, SqliteStore, SystemClock};
use driftsync::connection::TransportFactory;
use driftsync::{
    Config, ConflictPolicy, ConflictResolver, ConnectionEvent, ConnectionResilienceService,
    CycleReport, LastWriterWins, LocalWins, PeerRemote, Result, RetryPolicy, SyncEvent,
    SyncOrchestrator, SyncQueue, Transport, WebSocketTransport,
};

/// Config file looked up in the state directory when no path is given.
pub const CONFIG_NAME: &str = "config.toml";

/// Peer id of the sync server in the connection service.
const SERVER_PEER: &str = "server";

/// Load the config from `path`, or from the state directory.
///
/// A missing config in the state directory means defaults.
pub fn load_config(path: Option<&Path>, state_dir: &Path) -> Result<Config> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => {
            let fallback = state_dir.join(CONFIG_NAME);
            if !fallback.exists() {
                let config = Config::default();
                config.validate()?;
                return Ok(config);
            }
            fallback
        }
    };
    Config::load(&path)
}

/// Device id from the config, else the store, else a fresh one saved to the store.
pub fn resolve_device_id(config: &Config, store: &dyn LocalStore) -> Result<String> {
    if let Some(id) = &config.device_id {
        return Ok(id.clone());
    }
    if let Some(id) = store.device_id()? {
        return Ok(id);
    }
    let id = format!("device-{:016x}", rand::random::<u64>());
    store.set_device_id(&id)?;
    info!(device_id = %id, "generated device id");
    Ok(id)
}

pub fn resolver_for(policy: ConflictPolicy) -> Option<Arc<dyn ConflictResolver>> {
    match policy {
        ConflictPolicy::Surface => None,
        ConflictPolicy::LastWriterWins => Some(Arc::new(LastWriterWins)),
        ConflictPolicy::LocalWins => Some(Arc::new(LocalWins)),
    }
}

/// Registry with one pass-through schema per configured entity.
pub fn build_registry(entities: &[String]) -> Result<EntityRegistry> {
    let mut registry = EntityRegistry::new();
    for name in entities {
        // Schemas hold static names; config entities live for the whole process
        let name: &'static str = Box::leak(name.clone().into_boxed_str());
        registry.register(EntitySchema::new(name, &[]))?;
    }
    Ok(registry)
}

/// Whether the server link went down since the last catch-up sync.
#[derive(Debug, Default)]
struct Outage {
    seen: bool,
}

impl Outage {
    /// Record `event`. Returns true when it ends an outage.
    fn observe(&mut self, event: &ConnectionEvent) -> bool {
        match event {
            ConnectionEvent::Disconnected { .. } | ConnectionEvent::ReconnectFailed { .. } => {
                self.seen = true;
                false
            }
            ConnectionEvent::Connected { .. } => std::mem::take(&mut self.seen),
            _ => false,
        }
    }
}

enum Wake {
    Shutdown,
    Tick,
    Connection(ConnectionEvent),
    Sync(SyncEvent),
}

pub struct Daemon {
    orchestrator: SyncOrchestrator,
    service: ConnectionResilienceService,
    device_id: String,
    initialized: bool,
    outage: Outage,
    interval: Option<Duration>,
    sync_events: mpsc::Receiver<SyncEvent>,
    connection_events: mpsc::Receiver<ConnectionEvent>,
}

impl Daemon {
    /// Open the store and build the engine. Nothing touches the network yet.
    pub fn build(config: &Config, state_dir: &Path) -> Result<Self> {
        let db_path: PathBuf = config.database_path(state_dir);
        let store = Arc::new(SqliteStore::open(&db_path)?);
        let device_id = resolve_device_id(config, store.as_ref())?;
        let registry = build_registry(&config.entities)?;
        if registry.is_empty() {
            warn!("no entities configured, nothing will sync");
        }

        let factory: TransportFactory =
            Arc::new(|| Box::new(WebSocketTransport::new()) as Box<dyn Transport>);
        let (service, connection_events) =
            ConnectionResilienceService::new(config.connection.clone(), factory);
        service.register_peer(SERVER_PEER, &config.remote.url);
        let remote = PeerRemote::new(service.clone(), SERVER_PEER, config.remote.request_timeout());

        let (orchestrator, sync_events) = SyncOrchestrator::new(
            store,
            Arc::new(remote),
            registry,
            SyncQueue::new(config.queue.max_concurrency),
            RetryPolicy::new(config.retry.clone()),
            Arc::new(SystemClock),
        );
        orchestrator.set_resolver(resolver_for(config.sync.conflict_policy));

        let interval = match config.sync.interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        info!(
            database = %db_path.display(),
            device_id = %device_id,
            url = %config.remote.url,
            entities = config.entities.len(),
            conflict_policy = ?config.sync.conflict_policy,
            "sync engine ready"
        );
        Ok(Daemon {
            orchestrator,
            service,
            device_id,
            initialized: false,
            outage: Outage::default(),
            interval,
            sync_events,
            connection_events,
        })
    }

    /// Initialize and run a single cycle over every entity.
    pub async fn run_once(mut self) -> Result<CycleReport> {
        let result = self.sync_all().await;
        self.stop().await;
        result
    }

    /// Sync until Ctrl-C: on the interval, on reconnect and on server hints.
    pub async fn run(mut self) -> Result<()> {
        let health = self.service.start_health_check();
        let mut ticker = self.interval.map(|period| {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        if let Err(e) = self.sync_all().await {
            warn!(error = %e, "initial sync failed");
        }

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);
        loop {
            let wake = tokio::select! {
                signal = &mut shutdown => {
                    if let Err(e) = signal {
                        error!(error = %e, "failed to listen for ctrl-c");
                    }
                    Wake::Shutdown
                }
                _ = tick(&mut ticker) => Wake::Tick,
                Some(event) = self.connection_events.recv() => Wake::Connection(event),
                Some(event) = self.sync_events.recv() => Wake::Sync(event),
            };

            match wake {
                Wake::Shutdown => {
                    info!("shutdown requested");
                    break;
                }
                Wake::Tick => {
                    if let Err(e) = self.sync_all().await {
                        warn!(error = %e, "scheduled sync failed");
                    }
                }
                Wake::Connection(event) => self.on_connection_event(event).await,
                Wake::Sync(event) => log_sync_event(&event),
            }
        }

        self.stop().await;
        if let Err(e) = health.await {
            debug!(error = %e, "health check task ended abnormally");
        }
        Ok(())
    }

    async fn ensure_initialized(&mut self) -> Result<()> {
        if !self.initialized {
            let offset = self.orchestrator.initialize(&self.device_id).await?;
            debug!(offset_ms = offset, "clock offset measured");
            self.initialized = true;
        }
        Ok(())
    }

    async fn sync_all(&mut self) -> Result<CycleReport> {
        self.ensure_initialized().await?;
        let report = self.orchestrator.sync_incremental().await?;
        log_report("all", &report);
        Ok(report)
    }

    async fn on_connection_event(&mut self, event: ConnectionEvent) {
        let reconnected = self.outage.observe(&event);
        match event {
            ConnectionEvent::Message { message: ServerMessage::Changed { entity }, .. } => {
                if !self.orchestrator.is_registered(&entity) {
                    debug!(entity, "change hint for unsynced entity ignored");
                    return;
                }
                if let Err(e) = self.ensure_initialized().await {
                    warn!(error = %e, "not initialized, change hint dropped");
                    return;
                }
                match self.orchestrator.sync_entity(&entity).await {
                    Ok(report) => log_report(&entity, &report),
                    Err(e) => warn!(entity, error = %e, "hinted sync failed"),
                }
            }
            ConnectionEvent::Connected { peer } => {
                info!(peer, "connected");
                // The first connection belongs to the sync that opened it
                if reconnected {
                    if let Err(e) = self.sync_all().await {
                        warn!(error = %e, "sync after reconnect failed");
                    }
                }
            }
            ConnectionEvent::Disconnected { peer, reason } => {
                warn!(peer, reason, "server connection lost");
            }
            ConnectionEvent::ReconnectFailed { peer, attempts, error } => {
                warn!(peer, attempts, error, "gave up reconnecting until next health check");
            }
            other => debug!(event = ?other, "connection event"),
        }
    }

    async fn stop(&mut self) {
        self.orchestrator.drain().await;
        let rejected = self.orchestrator.shutdown();
        self.service.shutdown();
        while let Ok(event) = self.sync_events.try_recv() {
            log_sync_event(&event);
        }
        info!(rejected, "sync engine stopped");
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn log_report(scope: &str, report: &CycleReport) {
    info!(
        scope,
        success = report.success,
        failed = report.failed,
        conflicts = report.conflicts,
        resolved = report.resolved,
        "sync finished"
    );
    for failure in &report.failures {
        warn!(
            entity = %failure.entity,
            record = failure.record_id.as_deref().unwrap_or("-"),
            error = %failure.error,
            "sync failure"
        );
    }
}

fn log_sync_event(event: &SyncEvent) {
    match event {
        SyncEvent::ConflictDetected(conflict) => warn!(
            entity = %conflict.entity,
            id = %conflict.entity_id,
            "conflict needs resolution"
        ),
        SyncEvent::CycleFailed { entity, error } => error!(entity, error, "cycle failed"),
        other => debug!(event = ?other, "sync event"),
    }
}

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
