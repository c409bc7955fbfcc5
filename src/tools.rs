//! MCP tool surface: the operations an AI client can call. Every result is
//! JSON-serializable; every failure is a [`BridgeError`], never a raw
//! `sqlx`/`rumqttc` type. All tools except `control_actuator` are pure reads.

use rumqttc::QoS;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use crate::bus::{actuator_cmd_topic, Bus};
use crate::error::BridgeError;
use crate::registry::{DeviceStatus, Registry};
use crate::router::RouterMetrics;
use crate::store::Store;

#[derive(Clone)]
pub struct Tools {
    registry: Registry,
    store: Store,
    bus: Arc<Bus>,
    router_metrics: Arc<RouterMetrics>,
    deadline: Duration,
    started_at: i64,
}

#[derive(Debug, Serialize)]
pub struct DeviceSummary {
    pub device_id: String,
    pub is_online: bool,
    pub last_seen: i64,
    pub sensors: Vec<String>,
    pub actuators: Vec<String>,
    pub capabilities: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct SensorHistoryEntry {
    pub value: f64,
    pub timestamp: i64,
    pub unit: Option<String>,
    pub quality: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ReadSensorResult {
    pub device_id: String,
    pub sensor_type: String,
    pub current_value: f64,
    pub unit: Option<String>,
    pub timestamp: i64,
    pub quality: Option<i64>,
    pub history: Option<Vec<SensorHistoryEntry>>,
}

#[derive(Debug, Serialize)]
pub struct ControlActuatorResult {
    pub device_id: String,
    pub actuator_type: String,
    pub action: String,
    pub value: Option<serde_json::Value>,
    pub timestamp: i64,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub is_online: bool,
    pub last_seen: i64,
    pub sensors: Vec<String>,
    pub actuators: Vec<String>,
    pub sensor_readings: serde_json::Value,
    pub actuator_states: serde_json::Value,
    pub recent_error_count: usize,
    pub capabilities: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub devices_total: usize,
    pub devices_online: usize,
    pub bus_connected: bool,
    pub store_accessible: bool,
    pub uptime_seconds: i64,
}

impl Tools {
    pub fn new(
        registry: Registry,
        store: Store,
        bus: Arc<Bus>,
        router_metrics: Arc<RouterMetrics>,
        deadline: Duration,
        started_at: i64,
    ) -> Self {
        Self {
            registry,
            store,
            bus,
            router_metrics,
            deadline,
            started_at,
        }
    }

    async fn with_deadline<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, BridgeError>>,
    ) -> Result<T, BridgeError> {
        match timeout(self.deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::DeadlineExceeded),
        }
    }

    pub async fn list_devices(&self, online_only: bool) -> Result<Vec<DeviceSummary>, BridgeError> {
        self.with_deadline(async {
            let devices = self.registry.list().await;
            Ok(devices
                .into_iter()
                .filter(|d| !online_only || d.status == DeviceStatus::Online)
                .map(|d| DeviceSummary {
                    device_id: d.device_id,
                    is_online: d.status == DeviceStatus::Online,
                    last_seen: d.last_seen,
                    sensors: d.sensors,
                    actuators: d.actuators,
                    capabilities: serde_json::json!({
                        "device_type": d.device_type,
                        "firmware_version": d.firmware_version,
                        "location": d.location,
                    }),
                })
                .collect())
        })
        .await
    }

    pub async fn read_sensor(
        &self,
        device_id: &str,
        sensor_type: &str,
        history_minutes: Option<i64>,
    ) -> Result<ReadSensorResult, BridgeError> {
        self.with_deadline(async {
            let device = self
                .registry
                .get(device_id)
                .await
                .ok_or_else(|| BridgeError::DeviceNotFound(device_id.to_string()))?;

            let current = device.sensor_readings.get(sensor_type).cloned().ok_or_else(|| {
                BridgeError::SensorNotFound {
                    device_id: device_id.to_string(),
                    sensor_type: sensor_type.to_string(),
                }
            })?;

            let history = if let Some(minutes) = history_minutes {
                let rows = self
                    .store
                    .get_sensor_data(device_id, sensor_type, Some(minutes), 1000)
                    .await?;
                Some(
                    rows.into_iter()
                        .map(|r| SensorHistoryEntry {
                            value: r.value,
                            timestamp: r.timestamp,
                            unit: r.unit,
                            quality: r.quality,
                        })
                        .collect(),
                )
            } else {
                None
            };

            Ok(ReadSensorResult {
                device_id: device_id.to_string(),
                sensor_type: sensor_type.to_string(),
                current_value: current.reading,
                unit: current.unit,
                timestamp: current.timestamp,
                quality: current.quality,
                history,
            })
        })
        .await
    }

    pub async fn control_actuator(
        &self,
        device_id: &str,
        actuator_type: &str,
        action: &str,
        value: Option<serde_json::Value>,
    ) -> Result<ControlActuatorResult, BridgeError> {
        self.with_deadline(async {
            let device = self
                .registry
                .get(device_id)
                .await
                .ok_or_else(|| BridgeError::DeviceNotFound(device_id.to_string()))?;

            if device.status != DeviceStatus::Online {
                return Err(BridgeError::DeviceOffline(device_id.to_string()));
            }
            if !device.actuators.iter().any(|a| a == actuator_type) {
                return Err(BridgeError::UnknownActuator {
                    device_id: device_id.to_string(),
                    actuator_type: actuator_type.to_string(),
                });
            }

            let timestamp = crate::registry::now_unix();
            let payload = serde_json::json!({
                "action": action,
                "value": value,
                "timestamp": timestamp,
            });
            let topic = actuator_cmd_topic(device_id, actuator_type);

            self.bus
                .publish_json(&topic, &payload, QoS::AtLeastOnce, false)
                .await
                .map_err(|_| BridgeError::BusNotReady)?;

            self.registry.record_message_sent(device_id).await;

            Ok(ControlActuatorResult {
                device_id: device_id.to_string(),
                actuator_type: actuator_type.to_string(),
                action: action.to_string(),
                value,
                timestamp,
                status: "command_sent".to_string(),
            })
        })
        .await
    }

    pub async fn get_device_info(&self, device_id: &str) -> Result<DeviceInfo, BridgeError> {
        self.with_deadline(async {
            let device = self
                .registry
                .get(device_id)
                .await
                .ok_or_else(|| BridgeError::DeviceNotFound(device_id.to_string()))?;

            let capabilities = self
                .store
                .get_capabilities(device_id)
                .await?
                .map(|c| {
                    serde_json::json!({
                        "sensors": c.sensors,
                        "actuators": c.actuators,
                        "metadata": c.metadata,
                        "firmware_version": c.firmware_version,
                        "hardware_version": c.hardware_version,
                        "last_updated": c.last_updated,
                    })
                });

            Ok(DeviceInfo {
                device_id: device.device_id,
                is_online: device.status == DeviceStatus::Online,
                last_seen: device.last_seen,
                sensors: device.sensors,
                actuators: device.actuators,
                sensor_readings: serde_json::to_value(&device.sensor_readings)
                    .unwrap_or(serde_json::json!({})),
                actuator_states: serde_json::to_value(&device.actuator_states)
                    .unwrap_or(serde_json::json!({})),
                recent_error_count: device.recent_errors.len(),
                capabilities,
            })
        })
        .await
    }

    pub async fn query_devices(
        &self,
        sensor_type: Option<&str>,
        actuator_type: Option<&str>,
        online_only: bool,
    ) -> Result<Vec<DeviceSummary>, BridgeError> {
        self.with_deadline(async {
            let devices = self.registry.filter_by_capability(sensor_type, actuator_type).await;
            Ok(devices
                .into_iter()
                .filter(|d| !online_only || d.status == DeviceStatus::Online)
                .map(|d| DeviceSummary {
                    device_id: d.device_id,
                    is_online: d.status == DeviceStatus::Online,
                    last_seen: d.last_seen,
                    sensors: d.sensors,
                    actuators: d.actuators,
                    capabilities: serde_json::json!({
                        "device_type": d.device_type,
                        "firmware_version": d.firmware_version,
                        "location": d.location,
                    }),
                })
                .collect())
        })
        .await
    }

    pub async fn get_alerts(
        &self,
        device_id: Option<&str>,
        severity_min: Option<i64>,
        since_minutes: Option<i64>,
        limit: Option<i64>,
    ) -> Result<Vec<crate::store::DeviceErrorRow>, BridgeError> {
        self.with_deadline(async {
            self.store
                .get_device_errors(device_id, severity_min, since_minutes, limit.unwrap_or(100))
                .await
        })
        .await
    }

    pub async fn get_system_status(&self) -> Result<SystemStatus, BridgeError> {
        self.with_deadline(async {
            let devices = self.registry.list().await;
            let devices_online = devices.iter().filter(|d| d.status == DeviceStatus::Online).count();
            let store_accessible = self.store.health_check().await;
            let uptime_seconds = crate::registry::now_unix() - self.started_at;

            Ok(SystemStatus {
                devices_total: devices.len(),
                devices_online,
                bus_connected: self.bus.is_connected(),
                store_accessible,
                uptime_seconds,
            })
        })
        .await
    }

    pub async fn get_device_metrics(
        &self,
        device_id: Option<&str>,
    ) -> Result<Vec<crate::store::DeviceMetricsRow>, BridgeError> {
        self.with_deadline(async { self.store.get_device_metrics(device_id).await })
            .await
    }

    /// Exposed for diagnostics/tests; not itself a named MCP tool.
    pub fn router_metrics(&self) -> Arc<RouterMetrics> {
        self.router_metrics.clone()
    }
}
