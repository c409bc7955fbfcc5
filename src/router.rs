//! Parses incoming topics/payloads and forwards to Registry + Store.
//!
//! A bounded pool of worker tasks drains the Bus's inbound channel; each
//! worker processes one message end to end (parse -> Registry -> Store).
//! A bad payload or a Store failure is logged and counted, never allowed
//! to take down a worker.

use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::bus::InboundMessage;
use crate::registry::{DeviceErrorEvent, Registry, SensorPayload};
use crate::store::{CapabilitySnapshotRow, Store};

#[derive(Debug, Default)]
pub struct RouterMetrics {
    pub parse_errors: AtomicU64,
    pub store_errors: AtomicU64,
    pub messages_processed: AtomicU64,
}

#[derive(Clone)]
pub struct Router {
    registry: Registry,
    store: Store,
    metrics: Arc<RouterMetrics>,
}

#[derive(Debug, Deserialize)]
struct CapabilitiesPayload {
    #[allow(dead_code)]
    device_id: Option<String>,
    firmware_version: Option<String>,
    hardware_version: Option<String>,
    #[serde(default)]
    sensors: Vec<String>,
    #[serde(default)]
    actuators: Vec<String>,
    #[serde(default)]
    metadata: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct StatusPayload {
    value: String,
    timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorPayload {
    Wrapped { value: ErrorValue, timestamp: Option<i64> },
    Flat(ErrorValue),
}

#[derive(Debug, Deserialize)]
struct ErrorValue {
    error_type: String,
    message: String,
    #[serde(default)]
    severity: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SensorEnvelope {
    timestamp: Option<i64>,
    #[serde(flatten)]
    payload: SensorPayload,
}

impl Router {
    pub fn new(registry: Registry, store: Store) -> Self {
        Self {
            registry,
            store,
            metrics: Arc::new(RouterMetrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<RouterMetrics> {
        self.metrics.clone()
    }

    /// Spawns `worker_count` tasks draining `rx`. Each message is dispatched
    /// to the handler matching the pattern the Bus already resolved.
    pub fn spawn_workers(&self, mut rx: mpsc::Receiver<InboundMessage>, worker_count: usize) {
        // A single shared receiver can't be cloned; instead we spawn one
        // dispatcher that hands work to a bounded pool via per-worker
        // channels, round-robin.
        let mut worker_txs = Vec::with_capacity(worker_count.max(1));
        for _ in 0..worker_count.max(1) {
            let (tx, mut wrx) = mpsc::channel::<InboundMessage>(64);
            let router = self.clone();
            tokio::spawn(async move {
                while let Some(msg) = wrx.recv().await {
                    router.handle(msg).await;
                }
            });
            worker_txs.push(tx);
        }

        tokio::spawn(async move {
            let mut next = 0usize;
            while let Some(msg) = rx.recv().await {
                let idx = next % worker_txs.len();
                next = next.wrapping_add(1);
                if worker_txs[idx].send(msg).await.is_err() {
                    break;
                }
            }
        });
    }

    pub async fn handle(&self, msg: InboundMessage) {
        self.metrics.messages_processed.fetch_add(1, Ordering::Relaxed);
        let result = match msg.pattern {
            "devices/+/sensors/+/data" => self.handle_sensor_data(&msg).await,
            "devices/+/actuators/+/status" => self.handle_actuator_status(&msg).await,
            "devices/+/capabilities" => self.handle_capabilities(&msg).await,
            "devices/+/status" => self.handle_device_status(&msg).await,
            "devices/+/error" => self.handle_device_error(&msg).await,
            other => {
                warn!(pattern = other, "no handler registered for matched pattern");
                Ok(())
            }
        };

        if let Err(e) = result {
            self.metrics.parse_errors.fetch_add(1, Ordering::Relaxed);
            debug!(topic = %msg.topic, error = %e, "dropping message");
        }
    }

    fn segment(topic: &str, idx: usize) -> Option<&str> {
        topic.split('/').nth(idx)
    }

    async fn ensure_device_registered(&self, device_id: &str) {
        if self.store.get_device(device_id).await.ok().flatten().is_none() {
            if let Err(e) = self
                .store
                .register_device(device_id, None, &[], &[], None, None)
                .await
            {
                self.metrics.store_errors.fetch_add(1, Ordering::Relaxed);
                warn!(device_id, error = %e, "failed to backfill device catalog entry");
            }
        }
    }

    async fn handle_sensor_data(&self, msg: &InboundMessage) -> anyhow::Result<()> {
        let device_id = Self::segment(&msg.topic, 1).ok_or_else(|| anyhow::anyhow!("missing device id"))?;
        let sensor_type = Self::segment(&msg.topic, 3).ok_or_else(|| anyhow::anyhow!("missing sensor name"))?;

        let envelope: SensorEnvelope = serde_json::from_value(msg.payload.clone())?;
        let value = envelope.payload.into_value();
        let now = crate::registry::now_unix();
        let ts = envelope.timestamp.unwrap_or(now);

        self.ensure_device_registered(device_id).await;
        self.registry
            .record_sensor_reading(device_id, sensor_type, value.clone(), ts, now)
            .await;

        if let Err(e) = self
            .store
            .store_sensor_data(device_id, sensor_type, &value, ts)
            .await
        {
            self.metrics.store_errors.fetch_add(1, Ordering::Relaxed);
            self.registry.record_sensor_read_error(device_id).await;
            warn!(device_id, sensor_type, error = %e, "failed to persist sensor reading");
        }
        Ok(())
    }

    async fn handle_actuator_status(&self, msg: &InboundMessage) -> anyhow::Result<()> {
        let device_id = Self::segment(&msg.topic, 1).ok_or_else(|| anyhow::anyhow!("missing device id"))?;
        let actuator_type = Self::segment(&msg.topic, 3).ok_or_else(|| anyhow::anyhow!("missing actuator name"))?;

        let value = msg
            .payload
            .get("value")
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("missing value field"))?;
        let now = crate::registry::now_unix();

        self.ensure_device_registered(device_id).await;
        self.registry
            .record_actuator_state(device_id, actuator_type, value, now)
            .await;
        Ok(())
    }

    async fn handle_capabilities(&self, msg: &InboundMessage) -> anyhow::Result<()> {
        let device_id = Self::segment(&msg.topic, 1).ok_or_else(|| anyhow::anyhow!("missing device id"))?;
        let caps: CapabilitiesPayload = serde_json::from_value(msg.payload.clone())?;
        let now = crate::registry::now_unix();

        self.registry
            .upsert_capabilities(
                device_id,
                None,
                caps.sensors.clone(),
                caps.actuators.clone(),
                caps.firmware_version.clone(),
                None,
                now,
            )
            .await;

        if let Err(e) = self
            .store
            .register_device(
                device_id,
                None,
                &caps.sensors,
                &caps.actuators,
                caps.firmware_version.as_deref(),
                None,
            )
            .await
        {
            self.metrics.store_errors.fetch_add(1, Ordering::Relaxed);
            warn!(device_id, error = %e, "failed to backfill device catalog on capabilities");
        }

        let snapshot = CapabilitySnapshotRow {
            device_id: device_id.to_string(),
            sensors: caps.sensors,
            actuators: caps.actuators,
            metadata: caps.metadata,
            firmware_version: caps.firmware_version,
            hardware_version: caps.hardware_version,
            last_updated: now,
        };
        if let Err(e) = self.store.upsert_capabilities(&snapshot).await {
            self.metrics.store_errors.fetch_add(1, Ordering::Relaxed);
            warn!(device_id, error = %e, "failed to persist capability snapshot");
        }
        Ok(())
    }

    async fn handle_device_status(&self, msg: &InboundMessage) -> anyhow::Result<()> {
        let device_id = Self::segment(&msg.topic, 1).ok_or_else(|| anyhow::anyhow!("missing device id"))?;
        let status: StatusPayload = serde_json::from_value(msg.payload.clone())?;
        let now = crate::registry::now_unix();
        let ts = status.timestamp.unwrap_or(now);

        let online = status.value.eq_ignore_ascii_case("online");
        let registry_status = if online {
            crate::registry::DeviceStatus::Online
        } else {
            crate::registry::DeviceStatus::Offline
        };

        self.ensure_device_registered(device_id).await;
        self.registry.set_status(device_id, registry_status, now).await;

        // The Store keeps the literal reported string (spec §4.4); only the
        // Registry's binary online/offline flag collapses "not online" down
        // to Offline for lifecycle/filtering purposes.
        if let Err(e) = self.store.update_device_status(device_id, &status.value, ts).await {
            self.metrics.store_errors.fetch_add(1, Ordering::Relaxed);
            warn!(device_id, error = %e, "failed to persist device status");
        }
        Ok(())
    }

    async fn handle_device_error(&self, msg: &InboundMessage) -> anyhow::Result<()> {
        let device_id = Self::segment(&msg.topic, 1).ok_or_else(|| anyhow::anyhow!("missing device id"))?;
        let parsed: ErrorPayload = serde_json::from_value(msg.payload.clone())?;
        let (value, explicit_ts) = match parsed {
            ErrorPayload::Wrapped { value, timestamp } => (value, timestamp),
            ErrorPayload::Flat(value) => (value, None),
        };
        let now = crate::registry::now_unix();
        let ts = explicit_ts.unwrap_or(now);
        let severity = value.severity.unwrap_or(2);

        self.ensure_device_registered(device_id).await;
        self.registry
            .record_error(
                device_id,
                DeviceErrorEvent {
                    error_type: value.error_type.clone(),
                    message: value.message.clone(),
                    severity,
                    timestamp: ts,
                },
                now,
            )
            .await;

        if let Err(e) = self
            .store
            .log_device_error(device_id, &value.error_type, &value.message, severity, ts)
            .await
        {
            self.metrics.store_errors.fetch_add(1, Ordering::Relaxed);
            warn!(device_id, error = %e, "failed to persist device error");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    async fn router() -> Router {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        Router::new(Registry::new(100), store)
    }

    fn msg(topic: &str, pattern: &'static str, payload: serde_json::Value) -> InboundMessage {
        InboundMessage { topic: topic.to_string(), pattern, payload }
    }

    #[tokio::test]
    async fn sensor_data_rich_shape_updates_registry_and_store() {
        let r = router().await;
        r.handle(msg(
            "devices/esp32_a/sensors/temp/data",
            "devices/+/sensors/+/data",
            serde_json::json!({"device_id":"esp32_a","timestamp":1700000000,"value":{"reading":23.5,"unit":"C","quality":100}}),
        ))
        .await;

        let d = r.registry.get("esp32_a").await.unwrap();
        assert_eq!(d.sensor_readings["temp"].reading, 23.5);

        let rows = r.store.get_sensor_data("esp32_a", "temp", None, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].timestamp, 1700000000);
    }

    #[tokio::test]
    async fn sensor_data_legacy_flat_shape_decodes() {
        let r = router().await;
        r.handle(msg(
            "devices/esp32_a/sensors/temp/data",
            "devices/+/sensors/+/data",
            serde_json::json!({"device_id":"esp32_a","value": 19.0}),
        ))
        .await;

        let d = r.registry.get("esp32_a").await.unwrap();
        assert_eq!(d.sensor_readings["temp"].reading, 19.0);
        assert!(d.sensor_readings["temp"].unit.is_none());
    }

    #[tokio::test]
    async fn capabilities_backfills_catalog_and_is_latest_wins() {
        let r = router().await;
        r.handle(msg(
            "devices/esp32_a/capabilities",
            "devices/+/capabilities",
            serde_json::json!({"device_id":"esp32_a","sensors":["temp","humidity"],"actuators":["led"],"metadata":{}}),
        ))
        .await;
        r.handle(msg(
            "devices/esp32_a/capabilities",
            "devices/+/capabilities",
            serde_json::json!({"device_id":"esp32_a","sensors":["temp"],"actuators":[],"metadata":{}}),
        ))
        .await;

        let d = r.registry.get("esp32_a").await.unwrap();
        assert_eq!(d.sensors, vec!["temp".to_string()]);
        assert!(d.actuators.is_empty());
        assert_eq!(d.status, crate::registry::DeviceStatus::Online);

        let stored = r.store.get_device("esp32_a").await.unwrap().unwrap();
        assert_eq!(stored.sensors, vec!["temp".to_string()]);
    }

    #[tokio::test]
    async fn device_status_offline_flips_registry_and_store() {
        let r = router().await;
        r.handle(msg(
            "devices/esp32_a/status",
            "devices/+/status",
            serde_json::json!({"value":"offline"}),
        ))
        .await;

        let d = r.registry.get("esp32_a").await.unwrap();
        assert_eq!(d.status, crate::registry::DeviceStatus::Offline);

        let stored = r.store.get_device("esp32_a").await.unwrap().unwrap();
        assert_eq!(stored.status, "offline");
    }

    #[tokio::test]
    async fn device_status_arbitrary_value_stored_verbatim() {
        let r = router().await;
        r.handle(msg(
            "devices/esp32_a/status",
            "devices/+/status",
            serde_json::json!({"value":"maintenance"}),
        ))
        .await;

        // Registry's binary flag treats anything but "online" as offline...
        let d = r.registry.get("esp32_a").await.unwrap();
        assert_eq!(d.status, crate::registry::DeviceStatus::Offline);

        // ...but the Store keeps the literal string the device reported.
        let stored = r.store.get_device("esp32_a").await.unwrap().unwrap();
        assert_eq!(stored.status, "maintenance");
    }

    #[tokio::test]
    async fn device_error_defaults_severity_to_two() {
        let r = router().await;
        r.handle(msg(
            "devices/esp32_a/error",
            "devices/+/error",
            serde_json::json!({"device_id":"esp32_a","value":{"error_type":"sensor_fail","message":"timeout"}}),
        ))
        .await;

        let d = r.registry.get("esp32_a").await.unwrap();
        assert_eq!(d.recent_errors.back().unwrap().severity, 2);

        let errs = r.store.get_device_errors(Some("esp32_a"), None, None, 10).await.unwrap();
        assert_eq!(errs[0].severity, 2);
    }

    #[tokio::test]
    async fn device_error_accepts_flat_shape() {
        let r = router().await;
        r.handle(msg(
            "devices/esp32_a/error",
            "devices/+/error",
            serde_json::json!({"error_type":"x","message":"y","severity":3}),
        ))
        .await;
        let d = r.registry.get("esp32_a").await.unwrap();
        assert_eq!(d.recent_errors.back().unwrap().severity, 3);
    }

    #[tokio::test]
    async fn malformed_payload_is_dropped_and_counted() {
        let r = router().await;
        r.handle(msg(
            "devices/esp32_a/sensors/temp/data",
            "devices/+/sensors/+/data",
            serde_json::json!({"not_value": true}),
        ))
        .await;

        assert!(r.registry.get("esp32_a").await.is_none());
        assert_eq!(r.metrics.parse_errors.load(Ordering::Relaxed), 1);
    }
}
