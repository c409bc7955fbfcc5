//! Startup/shutdown sequencing and the three periodic background loops:
//! timeout scan, metrics snapshot, and retention cleanup.
//!
//! Each loop is an independent task ticking on its own `tokio::time::interval`
//! and watching a shared shutdown signal so it exits at its next checkpoint
//! rather than mid-iteration.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bus::Bus;
use crate::registry::{now_unix, Registry};
use crate::store::{DeviceMetricsRow, Store};

pub const TIMEOUT_SCAN_INTERVAL: Duration = Duration::from_secs(60);
pub const METRICS_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const RETENTION_CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
pub const SHUTDOWN_DRAIN_DEADLINE: Duration = Duration::from_secs(5);

pub struct Supervisor {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Supervisor {
    /// Spawns the three background loops. Per-device message/error counts
    /// live on the Registry's `Device` rows themselves (advanced by the
    /// Router as it handles traffic); `bus` supplies the one genuinely
    /// process-wide figure, connection failures, since every device shares
    /// the same broker connection.
    pub fn start(
        registry: Registry,
        store: Store,
        bus: Arc<Bus>,
        device_timeout: Duration,
        retention_days: i64,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let uptime_start = now_unix();

        let mut handles = Vec::with_capacity(3);
        handles.push(spawn_timeout_scan(
            registry.clone(),
            store.clone(),
            device_timeout,
            shutdown_rx.clone(),
        ));
        handles.push(spawn_metrics_snapshot(
            registry,
            store.clone(),
            bus,
            uptime_start,
            shutdown_rx.clone(),
        ));
        handles.push(spawn_retention_cleanup(store, retention_days, shutdown_rx));

        Self { shutdown_tx, handles }
    }

    /// Signals all loops to stop at their next checkpoint and waits up to
    /// [`SHUTDOWN_DRAIN_DEADLINE`] for them to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let drain = async {
            for handle in self.handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "supervisor task ended with an error during shutdown");
                }
            }
        };
        if tokio::time::timeout(SHUTDOWN_DRAIN_DEADLINE, drain).await.is_err() {
            warn!("supervisor shutdown drain deadline exceeded, proceeding anyway");
        }
    }
}

fn spawn_timeout_scan(
    registry: Registry,
    store: Store,
    device_timeout: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(TIMEOUT_SCAN_INTERVAL);
        let timeout_seconds = device_timeout.as_secs() as i64;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = now_unix();
                    let flipped = registry.scan_timeouts(now, timeout_seconds).await;
                    for device_id in &flipped {
                        if let Err(e) = store.update_device_status(device_id, "offline", now).await {
                            error!(device_id, error = %e, "failed to persist offline flip from timeout scan");
                        }
                    }
                    if !flipped.is_empty() {
                        info!(count = flipped.len(), "timeout scan flipped devices offline");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

fn spawn_metrics_snapshot(
    registry: Registry,
    store: Store,
    bus: Arc<Bus>,
    uptime_start: i64,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(METRICS_SNAPSHOT_INTERVAL);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let devices = registry.list().await;
                    let connection_failures = bus.connection_failures() as i64;

                    for device in &devices {
                        let row = DeviceMetricsRow {
                            device_id: device.device_id.clone(),
                            messages_sent: device.messages_sent as i64,
                            messages_received: device.messages_received as i64,
                            connection_failures,
                            sensor_read_errors: device.sensor_read_errors as i64,
                            last_activity: device.last_seen,
                            uptime_start,
                        };
                        if let Err(e) = store.upsert_metrics(&row).await {
                            error!(device_id = %device.device_id, error = %e, "failed to persist metrics snapshot");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

fn spawn_retention_cleanup(
    store: Store,
    retention_days: i64,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RETENTION_CLEANUP_INTERVAL);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match store.cleanup(retention_days).await {
                        Ok(counts) => info!(
                            sensor_data_deleted = counts.sensor_data_deleted,
                            device_errors_deleted = counts.device_errors_deleted,
                            "retention cleanup complete"
                        ),
                        Err(e) => error!(error = %e, "retention cleanup failed, will retry next cycle"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DeviceStatus;

    async fn test_setup() -> (Registry, Store) {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        (Registry::new(100), store)
    }

    #[tokio::test]
    async fn timeout_scan_flips_and_persists_offline() {
        let (registry, store) = test_setup().await;
        store.register_device("d1", None, &[], &[], None, None).await.unwrap();
        registry.set_status("d1", DeviceStatus::Online, 0).await;

        let flipped = registry.scan_timeouts(1000, 60).await;
        assert_eq!(flipped, vec!["d1".to_string()]);

        for device_id in &flipped {
            store.update_device_status(device_id, "offline", 1000).await.unwrap();
        }

        let row = store.get_device("d1").await.unwrap().unwrap();
        assert_eq!(row.status, "offline");
    }

    #[tokio::test]
    async fn supervisor_shuts_down_within_drain_deadline() {
        let (registry, store) = test_setup().await;
        let (bus, _rx) = Bus::connect("127.0.0.1", 1, None, None, "supervisor-test").unwrap();
        let supervisor = Supervisor::start(
            registry,
            store,
            Arc::new(bus),
            Duration::from_secs(600),
            30,
        );

        let start = tokio::time::Instant::now();
        supervisor.shutdown().await;
        assert!(start.elapsed() < SHUTDOWN_DRAIN_DEADLINE + Duration::from_secs(1));
    }
}
