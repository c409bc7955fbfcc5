//! Pub/sub client wrapper around `rumqttc`: connection lifecycle, topic
//! pattern table, dispatch, and publish with per-topic QoS/retain policy.

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, Publish, QoS};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// The five topic patterns the bridge subscribes to (spec §4.3/§6), in the
/// order dispatch tries them. `+` matches exactly one segment.
pub const TOPIC_PATTERNS: &[&str] = &[
    "devices/+/sensors/+/data",
    "devices/+/actuators/+/status",
    "devices/+/capabilities",
    "devices/+/status",
    "devices/+/error",
];

/// Payloads larger than this are dropped before JSON decoding even runs —
/// a malformed or malicious publisher should not make the bridge spend
/// effort parsing an unbounded byte string.
const MAX_PAYLOAD_BYTES: usize = 64 * 1024;

/// A decoded inbound message, handed to the Router.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub pattern: &'static str,
    pub payload: serde_json::Value,
}

/// True/false segment-wise match of a concrete topic against a `+`-wildcard
/// pattern. No multi-level `#` wildcard is used by this bridge.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let p: Vec<&str> = pattern.split('/').collect();
    let t: Vec<&str> = topic.split('/').collect();
    if p.len() != t.len() {
        return false;
    }
    p.iter().zip(t.iter()).all(|(ps, ts)| *ps == "+" || ps == ts)
}

/// First pattern (in `TOPIC_PATTERNS` order) that matches `topic`, if any.
pub fn match_pattern(topic: &str) -> Option<&'static str> {
    TOPIC_PATTERNS.iter().copied().find(|p| topic_matches(p, topic))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Disconnected,
    Connecting,
    Connected,
}

pub struct Bus {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    connection_failures: Arc<AtomicU64>,
}

impl Bus {
    /// Connects to the broker and spawns the event-loop polling task.
    /// Returns the `Bus` handle plus a channel of decoded inbound messages
    /// for the Router's worker pool to consume.
    pub fn connect(
        broker: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        client_id: &str,
    ) -> Result<(Self, mpsc::Receiver<InboundMessage>)> {
        let mut options = MqttOptions::new(client_id, broker, port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(u), Some(p)) = (username, password) {
            options.set_credentials(u, p);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 256);
        let (tx, rx) = mpsc::channel(1024);
        let connected = Arc::new(AtomicBool::new(false));
        let connection_failures = Arc::new(AtomicU64::new(0));

        let sub_client = client.clone();
        let sub_connected = connected.clone();
        let sub_failures = connection_failures.clone();
        tokio::spawn(async move {
            let mut backoff = Duration::from_millis(500);
            const MAX_BACKOFF: Duration = Duration::from_secs(30);

            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("bus connected, resubscribing to topic patterns");
                        sub_connected.store(true, Ordering::SeqCst);
                        backoff = Duration::from_millis(500);
                        for pattern in TOPIC_PATTERNS {
                            if let Err(e) = sub_client.subscribe(*pattern, QoS::AtLeastOnce).await {
                                warn!(pattern, error = %e, "resubscribe failed");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if let Some(msg) = decode_publish(&publish) {
                            if tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        sub_connected.store(false, Ordering::SeqCst);
                        sub_failures.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        sub_connected.store(false, Ordering::SeqCst);
                        sub_failures.fetch_add(1, Ordering::Relaxed);
                        warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "bus event loop error, backing off");
                        tokio::time::sleep(backoff).await;
                        backoff = std::cmp::min(backoff * 2, MAX_BACKOFF);
                    }
                }
            }
        });

        Ok((
            Self {
                client,
                connected,
                connection_failures,
            },
            rx,
        ))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Count of broker disconnects/event-loop errors since connect. Shared
    /// across all devices — there is exactly one bus connection — so every
    /// device's metrics row gets the same value for this field.
    pub fn connection_failures(&self) -> u64 {
        self.connection_failures.load(Ordering::Relaxed)
    }

    /// Publishes a JSON payload. Fails with a bus-not-ready style error when
    /// the connection is currently down — callers (Tools) surface that as
    /// `BridgeError::BusNotReady`.
    pub async fn publish_json(
        &self,
        topic: &str,
        payload: &serde_json::Value,
        qos: QoS,
        retain: bool,
    ) -> Result<()> {
        if !self.is_connected() {
            anyhow::bail!("bus not connected");
        }
        let bytes = serde_json::to_vec(payload).context("serialize outbound payload")?;
        self.client
            .publish(topic, qos, retain, bytes)
            .await
            .context("publish failed")?;
        Ok(())
    }
}

fn decode_publish(publish: &Publish) -> Option<InboundMessage> {
    let topic = publish.topic.clone();
    let pattern = match match_pattern(&topic) {
        Some(p) => p,
        None => {
            debug!(topic, "unmatched topic, dropping");
            return None;
        }
    };

    if publish.payload.len() > MAX_PAYLOAD_BYTES {
        warn!(topic, bytes = publish.payload.len(), "oversized payload, dropping");
        return None;
    }

    let payload = match std::str::from_utf8(&publish.payload) {
        Ok(s) => s,
        Err(_) => {
            warn!(topic, "non-utf8 payload, dropping");
            return None;
        }
    };

    match serde_json::from_str::<serde_json::Value>(payload) {
        Ok(v) => Some(InboundMessage { topic, pattern, payload: v }),
        Err(e) => {
            warn!(topic, error = %e, "invalid json payload, dropping");
            None
        }
    }
}

/// Topic for the actuator command the bridge publishes.
pub fn actuator_cmd_topic(device_id: &str, actuator_type: &str) -> String {
    format!("devices/{device_id}/actuators/{actuator_type}/cmd")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_matches_single_wildcard_segment() {
        assert!(topic_matches(
            "devices/+/sensors/+/data",
            "devices/esp32_a/sensors/temp/data"
        ));
    }

    #[test]
    fn topic_rejects_extra_trailing_segments() {
        assert!(!topic_matches(
            "devices/+/status",
            "devices/esp32_a/status/extra"
        ));
    }

    #[test]
    fn topic_rejects_too_few_segments() {
        assert!(!topic_matches("devices/+/capabilities", "devices/capabilities"));
    }

    #[test]
    fn match_pattern_picks_first_match_in_order() {
        assert_eq!(
            match_pattern("devices/esp32_a/sensors/temp/data"),
            Some("devices/+/sensors/+/data")
        );
        assert_eq!(match_pattern("devices/esp32_a/status"), Some("devices/+/status"));
        assert_eq!(match_pattern("garbage/topic"), None);
    }

    #[test]
    fn actuator_cmd_topic_formats_correctly() {
        assert_eq!(
            actuator_cmd_topic("esp32_a", "led"),
            "devices/esp32_a/actuators/led/cmd"
        );
    }
}
