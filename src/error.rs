//! Structured error taxonomy for tool-facing failures.
//!
//! Internal setup/IO failures (store open, config load, bus connect) stay on
//! `anyhow::Result` and bail out of `main`. Anything a `Tool` call can
//! surface to an MCP caller goes through [`BridgeError`] instead, so callers
//! never see a raw `sqlx`/`rumqttc` type.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BridgeError {
    #[error("bus is not ready")]
    BusNotReady,

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("sensor not found: {device_id}/{sensor_type}")]
    SensorNotFound {
        device_id: String,
        sensor_type: String,
    },

    #[error("device offline: {0}")]
    DeviceOffline(String),

    #[error("unknown actuator: {device_id}/{actuator_type}")]
    UnknownActuator {
        device_id: String,
        actuator_type: String,
    },

    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl BridgeError {
    /// Stable machine-readable kind, used as the `error` field of the MCP
    /// error payload. Never includes message text that could leak internal
    /// detail beyond what the variant already carries.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::BusNotReady => "bus-not-ready",
            BridgeError::StorageUnavailable(_) => "storage-unavailable",
            BridgeError::InvalidPayload(_) => "invalid-payload",
            BridgeError::DeviceNotFound(_) => "device-not-found",
            BridgeError::SensorNotFound { .. } => "sensor-not-found",
            BridgeError::DeviceOffline(_) => "device-offline",
            BridgeError::UnknownActuator { .. } => "unknown-actuator",
            BridgeError::DeadlineExceeded => "deadline-exceeded",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_error_family() {
        assert_eq!(BridgeError::BusNotReady.kind(), "bus-not-ready");
        assert_eq!(
            BridgeError::DeviceNotFound("x".into()).kind(),
            "device-not-found"
        );
        assert_eq!(
            BridgeError::SensorNotFound {
                device_id: "x".into(),
                sensor_type: "temp".into()
            }
            .kind(),
            "sensor-not-found"
        );
    }

    #[test]
    fn to_json_never_leaks_raw_debug() {
        let e = BridgeError::StorageUnavailable("sqlite busy".into());
        let v = e.to_json();
        assert_eq!(v["error"], "storage-unavailable");
        assert!(v["message"].as_str().unwrap().contains("storage unavailable"));
    }
}
