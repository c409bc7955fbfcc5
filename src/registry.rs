//! In-memory device registry: the fast read path for the Tools layer.
//!
//! The Store is the durable source of truth; the Registry is a cache of
//! current device state rebuilt from MQTT traffic as it arrives. Nothing
//! here talks to SQLite — `Router` keeps both in step on every inbound
//! message.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// Sensor payloads arrive in two shapes on the wire:
/// `{"value": 21.5}` (legacy, flat) or
/// `{"value": {"reading": 21.5, "unit": "C", "quality": 98}}` (rich).
/// Both decode into this one struct.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SensorPayload {
    Rich { value: SensorValue },
    Flat { value: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SensorValue {
    pub reading: f64,
    pub unit: Option<String>,
    pub quality: Option<i64>,
}

impl SensorPayload {
    pub fn into_value(self) -> SensorValue {
        match self {
            SensorPayload::Rich { value } => value,
            SensorPayload::Flat { value } => SensorValue {
                reading: value,
                unit: None,
                quality: None,
            },
        }
    }
}

/// A `SensorValue` plus the timestamp it was reported at, as stored in the
/// Registry. The timestamp is the reading's own declared/event time (the
/// envelope's `timestamp` field, or arrival time if absent) — never the
/// device's general `last_seen` — so `read_sensor` can answer "when was
/// this reading taken" and not just "when did the device last talk to us".
#[derive(Debug, Clone, Serialize, Default)]
pub struct SensorReading {
    pub reading: f64,
    pub unit: Option<String>,
    pub quality: Option<i64>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Unknown,
    Online,
    Offline,
}

impl Default for DeviceStatus {
    fn default() -> Self {
        DeviceStatus::Unknown
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceErrorEvent {
    pub error_type: String,
    pub message: String,
    pub severity: i64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct Device {
    pub device_id: String,
    pub device_type: Option<String>,
    pub status: DeviceStatus,
    pub sensors: Vec<String>,
    pub actuators: Vec<String>,
    pub firmware_version: Option<String>,
    pub location: Option<String>,
    pub last_seen: i64,
    /// Latest reading per sensor type, resolved by the reading's own
    /// timestamp rather than arrival order.
    pub sensor_readings: HashMap<String, SensorReading>,
    /// Latest reported state per actuator type (opaque JSON, device-defined).
    pub actuator_states: HashMap<String, serde_json::Value>,
    /// Bounded ring of the most recent errors, newest last.
    pub recent_errors: VecDeque<DeviceErrorEvent>,
    /// Bridge-derived counters (never device-reported) backing the
    /// per-device rows in the `device_metrics` table.
    pub messages_received: u64,
    pub messages_sent: u64,
    pub sensor_read_errors: u64,
}

impl Device {
    fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            status: DeviceStatus::Unknown,
            ..Default::default()
        }
    }
}

#[derive(Clone)]
pub struct Registry {
    inner: Arc<RwLock<HashMap<String, Device>>>,
    error_ring_bound: usize,
}

impl Registry {
    pub fn new(error_ring_bound: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            error_ring_bound,
        }
    }

    async fn with_device_mut<F, R>(&self, device_id: &str, f: F) -> R
    where
        F: FnOnce(&mut Device) -> R,
    {
        let mut guard = self.inner.write().await;
        let device = guard
            .entry(device_id.to_string())
            .or_insert_with(|| Device::new(device_id));
        f(device)
    }

    pub async fn upsert_capabilities(
        &self,
        device_id: &str,
        device_type: Option<String>,
        sensors: Vec<String>,
        actuators: Vec<String>,
        firmware_version: Option<String>,
        location: Option<String>,
        now: i64,
    ) {
        self.with_device_mut(device_id, |d| {
            if device_type.is_some() {
                d.device_type = device_type;
            }
            d.sensors = sensors;
            d.actuators = actuators;
            if firmware_version.is_some() {
                d.firmware_version = firmware_version;
            }
            if location.is_some() {
                d.location = location;
            }
            d.status = DeviceStatus::Online;
            d.last_seen = now;
            d.messages_received += 1;
        })
        .await;
    }

    /// Records a sensor reading, resolving conflicts by the reading's own
    /// `timestamp` rather than arrival order: a reading only replaces the
    /// stored one for its sensor if its timestamp is not older. `last_seen`
    /// and the message counter still advance on every arrival, since those
    /// track device activity, not any one sensor's latest value.
    ///
    /// Deliberately never changes `status`: per the device lifecycle, only
    /// capabilities and status=online messages bring a device online.
    pub async fn record_sensor_reading(
        &self,
        device_id: &str,
        sensor_type: &str,
        value: SensorValue,
        timestamp: i64,
        now: i64,
    ) {
        self.with_device_mut(device_id, |d| {
            let replace = match d.sensor_readings.get(sensor_type) {
                Some(existing) => timestamp >= existing.timestamp,
                None => true,
            };
            if replace {
                d.sensor_readings.insert(
                    sensor_type.to_string(),
                    SensorReading {
                        reading: value.reading,
                        unit: value.unit,
                        quality: value.quality,
                        timestamp,
                    },
                );
            }
            d.last_seen = now;
            d.messages_received += 1;
        })
        .await;
    }

    pub async fn record_sensor_read_error(&self, device_id: &str) {
        self.with_device_mut(device_id, |d| {
            d.sensor_read_errors += 1;
        })
        .await;
    }

    pub async fn record_message_sent(&self, device_id: &str) {
        self.with_device_mut(device_id, |d| {
            d.messages_sent += 1;
        })
        .await;
    }

    pub async fn record_actuator_state(
        &self,
        device_id: &str,
        actuator_type: &str,
        state: serde_json::Value,
        now: i64,
    ) {
        self.with_device_mut(device_id, |d| {
            d.actuator_states.insert(actuator_type.to_string(), state);
            d.last_seen = now;
            d.messages_received += 1;
        })
        .await;
    }

    pub async fn record_error(&self, device_id: &str, event: DeviceErrorEvent, now: i64) {
        let bound = self.error_ring_bound;
        self.with_device_mut(device_id, |d| {
            if d.recent_errors.len() >= bound {
                d.recent_errors.pop_front();
            }
            d.recent_errors.push_back(event);
            d.last_seen = now;
            d.messages_received += 1;
        })
        .await;
    }

    pub async fn set_status(&self, device_id: &str, status: DeviceStatus, now: i64) {
        self.with_device_mut(device_id, |d| {
            d.status = status;
            d.last_seen = now;
            d.messages_received += 1;
        })
        .await;
    }

    pub async fn get(&self, device_id: &str) -> Option<Device> {
        self.inner.read().await.get(device_id).cloned()
    }

    pub async fn list(&self) -> Vec<Device> {
        self.inner.read().await.values().cloned().collect()
    }

    pub async fn filter_by_capability(&self, sensor_type: Option<&str>, actuator_type: Option<&str>) -> Vec<Device> {
        self.inner
            .read()
            .await
            .values()
            .filter(|d| {
                sensor_type.map_or(true, |s| d.sensors.iter().any(|x| x == s))
                    && actuator_type.map_or(true, |a| d.actuators.iter().any(|x| x == a))
            })
            .cloned()
            .collect()
    }

    /// Flips any device whose `last_seen` is older than `timeout` from
    /// online to offline. Returns the device IDs that changed so the
    /// caller can mirror the flip into the Store.
    pub async fn scan_timeouts(&self, now: i64, timeout_seconds: i64) -> Vec<String> {
        let mut guard = self.inner.write().await;
        let mut changed = Vec::new();
        for (id, device) in guard.iter_mut() {
            if device.status == DeviceStatus::Online && now - device.last_seen > timeout_seconds {
                device.status = DeviceStatus::Offline;
                changed.push(id.clone());
            }
        }
        changed
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}
