//! Entry point: reads CLI/env config, opens the store, connects the bus,
//! starts the router workers and supervisor loops, then exposes the MCP
//! tool surface on the configured transport.
//!
//! Startup order mirrors §4.6: Store open -> Registry instantiate -> Bus
//! connect -> Router subscribe handlers -> Supervisor tasks start -> Tools
//! exposed. Shutdown reverses it: stop taking new tool calls, drain the
//! Supervisor loops, then exit.

mod bus;
mod config;
mod error;
mod mcp;
mod registry;
mod router;
mod store;
mod supervisor;
mod tools;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use bus::Bus;
use config::{Config, McpTransport};
use registry::{now_unix, Registry};
use router::Router;
use store::Store;
use supervisor::Supervisor;
use tools::Tools;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&cfg.log_level)
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    info!(
        mqtt_broker = %cfg.mqtt_broker,
        mqtt_port = cfg.mqtt_port,
        db_path = %cfg.db_path,
        transport = ?cfg.mcp_transport,
        "starting iot-mcp-bridge"
    );

    // ── Store ───────────────────────────────────────────────────────
    let store = Store::connect(&cfg.db_url())
        .await
        .context("failed to open store")?;
    store.migrate().await.context("failed to run migrations")?;

    // ── Registry ────────────────────────────────────────────────────
    let registry = Registry::new(cfg.error_ring_bound);

    // ── Bus ─────────────────────────────────────────────────────────
    let (bus, inbound_rx) = Bus::connect(
        &cfg.mqtt_broker,
        cfg.mqtt_port,
        cfg.mqtt_username.as_deref(),
        cfg.mqtt_password.as_deref(),
        "iot-mcp-bridge",
    )
    .context("failed to construct bus client")?;
    let bus = Arc::new(bus);

    // ── Router ──────────────────────────────────────────────────────
    let router = Router::new(registry.clone(), store.clone());
    let router_metrics = router.metrics();
    router.spawn_workers(inbound_rx, cfg.router_workers);
    info!(workers = cfg.router_workers, "router worker pool started");

    // ── Supervisor ──────────────────────────────────────────────────
    let supervisor = Supervisor::start(
        registry.clone(),
        store.clone(),
        bus.clone(),
        cfg.device_timeout().unsigned_abs(),
        cfg.retention_days,
    );
    info!("supervisor background loops started");

    // ── Tools ───────────────────────────────────────────────────────
    let started_at = now_unix();
    let tools = Tools::new(
        registry,
        store,
        bus,
        router_metrics,
        Duration::from_millis(cfg.tool_deadline_ms),
        started_at,
    );

    // ── Transport + shutdown ────────────────────────────────────────
    let transport_result = match cfg.mcp_transport {
        McpTransport::Stdio => run_with_shutdown(mcp::run_stdio(tools)).await,
        McpTransport::Http => {
            let app = mcp::http_router(tools);
            let addr = format!("0.0.0.0:{}", cfg.mcp_http_port);
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("failed to bind mcp http transport on {addr}"))?;
            info!(%addr, "mcp http transport listening");
            run_with_shutdown(async move {
                axum::serve(listener, app)
                    .await
                    .context("mcp http server error")
            })
            .await
        }
    };

    if let Err(e) = transport_result {
        error!(error = %e, "mcp transport exited with an error");
    }

    warn!("shutting down");
    supervisor.shutdown().await;
    info!("shutdown complete");

    Ok(())
}

/// Runs `fut` to completion, but returns early if SIGINT/SIGTERM arrives
/// first so shutdown can proceed without waiting on an open transport.
async fn run_with_shutdown<F>(fut: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    tokio::pin!(fut);

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = &mut fut => result,
            _ = &mut ctrl_c => {
                info!("received SIGINT");
                Ok(())
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                Ok(())
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            result = &mut fut => result,
            _ = &mut ctrl_c => {
                info!("received ctrl-c");
                Ok(())
            }
        }
    }
}

/// End-to-end exercises of the seed scenarios in spec.md §8 (S1-S6): Router
/// ingest feeding Registry/Store, then Tools reading back the same state a
/// real MCP caller would see. Component-level tests colocated with each
/// module cover the narrower cases; these wire the whole pipeline together.
#[cfg(test)]
mod seed_scenarios {
    use crate::bus::{Bus, InboundMessage};
    use crate::registry::Registry;
    use crate::router::Router;
    use crate::store::Store;
    use crate::tools::Tools;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    async fn harness() -> (Router, Tools, Registry) {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        let registry = Registry::new(100);
        let router = Router::new(registry.clone(), store.clone());
        let (bus, _rx) = Bus::connect("127.0.0.1", 1, None, None, "seed-test").unwrap();
        let tools = Tools::new(
            registry.clone(),
            store,
            Arc::new(bus),
            router.metrics(),
            Duration::from_secs(5),
            0,
        );
        (router, tools, registry)
    }

    fn inbound(topic: &str, pattern: &'static str, payload: serde_json::Value) -> InboundMessage {
        InboundMessage { topic: topic.to_string(), pattern, payload }
    }

    #[tokio::test]
    async fn s1_first_sight_device_appears_online_with_capabilities() {
        let (router, tools, _registry) = harness().await;
        router
            .handle(inbound(
                "devices/esp32_aa11bb/capabilities",
                "devices/+/capabilities",
                json!({
                    "device_id": "esp32_aa11bb",
                    "firmware_version": "1.0.0",
                    "sensors": ["temperature"],
                    "actuators": ["led"],
                    "metadata": {"temperature": {"unit": "°C"}}
                }),
            ))
            .await;

        let devices = tools.list_devices(false).await.unwrap();
        let d = devices.iter().find(|d| d.device_id == "esp32_aa11bb").unwrap();
        assert_eq!(d.sensors, vec!["temperature".to_string()]);
        assert_eq!(d.actuators, vec!["led".to_string()]);
        assert!(d.is_online);
    }

    #[tokio::test]
    async fn s2_sensor_reading_round_trips_through_read_sensor() {
        let (router, tools, _registry) = harness().await;
        router
            .handle(inbound(
                "devices/esp32_aa11bb/capabilities",
                "devices/+/capabilities",
                json!({"device_id": "esp32_aa11bb", "sensors": ["temperature"], "actuators": []}),
            ))
            .await;
        router
            .handle(inbound(
                "devices/esp32_aa11bb/sensors/temperature/data",
                "devices/+/sensors/+/data",
                json!({
                    "device_id": "esp32_aa11bb",
                    "timestamp": 1700000000,
                    "value": {"reading": 23.5, "unit": "°C", "quality": 100}
                }),
            ))
            .await;

        let result = tools.read_sensor("esp32_aa11bb", "temperature", None).await.unwrap();
        assert_eq!(result.current_value, 23.5);
        assert_eq!(result.unit.as_deref(), Some("°C"));
        assert_eq!(result.quality, Some(100));
        assert_eq!(result.timestamp, 1700000000);
    }

    #[tokio::test]
    async fn s3_history_sorted_descending() {
        let (router, tools, _registry) = harness().await;
        router
            .handle(inbound(
                "devices/esp32_aa11bb/capabilities",
                "devices/+/capabilities",
                json!({"device_id": "esp32_aa11bb", "sensors": ["temperature"], "actuators": []}),
            ))
            .await;

        for (ts, v) in [
            (1700000000, 23.5),
            (1700000010, 23.6),
            (1700000020, 23.7),
            (1700000030, 23.8),
            (1700000040, 23.9),
        ] {
            router
                .handle(inbound(
                    "devices/esp32_aa11bb/sensors/temperature/data",
                    "devices/+/sensors/+/data",
                    json!({"device_id": "esp32_aa11bb", "timestamp": ts, "value": {"reading": v}}),
                ))
                .await;
        }

        let result = tools
            .read_sensor("esp32_aa11bb", "temperature", Some(60))
            .await
            .unwrap();
        let history = result.history.unwrap();
        assert_eq!(history.len(), 5);
        let values: Vec<f64> = history.iter().map(|h| h.value).collect();
        assert_eq!(values, vec![23.9, 23.8, 23.7, 23.6, 23.5]);
    }

    #[tokio::test]
    async fn s4_control_actuator_fails_without_connected_bus_but_validates_first() {
        let (router, tools, _registry) = harness().await;
        router
            .handle(inbound(
                "devices/esp32_aa11bb/capabilities",
                "devices/+/capabilities",
                json!({"device_id": "esp32_aa11bb", "sensors": [], "actuators": ["led"]}),
            ))
            .await;

        // No real broker in this harness, so the bus never reaches Connected;
        // the precondition checks (device present, online, actuator known)
        // still run before the publish attempt, matching control_actuator's
        // ordering in tools.rs.
        let err = tools
            .control_actuator("esp32_aa11bb", "led", "toggle", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "bus-not-ready");
    }

    #[tokio::test]
    async fn s5_offline_timeout_excludes_device_from_online_only_listing() {
        let (router, tools, registry) = harness().await;
        router
            .handle(inbound(
                "devices/esp32_aa11bb/capabilities",
                "devices/+/capabilities",
                json!({"device_id": "esp32_aa11bb", "sensors": ["temperature"], "actuators": []}),
            ))
            .await;

        let info = tools.get_device_info("esp32_aa11bb").await.unwrap();
        assert!(info.is_online);

        // Simulate the 60s periodic timeout scan firing after a 2s timeout
        // with no further traffic.
        let flipped = registry.scan_timeouts(info.last_seen + 3, 2).await;
        assert_eq!(flipped, vec!["esp32_aa11bb".to_string()]);

        let online = tools.list_devices(true).await.unwrap();
        assert!(online.iter().all(|d| d.device_id != "esp32_aa11bb"));
    }

    #[tokio::test]
    async fn s6_error_propagates_to_alerts_and_device_info() {
        let (router, tools, _registry) = harness().await;
        router
            .handle(inbound(
                "devices/esp32_aa11bb/capabilities",
                "devices/+/capabilities",
                json!({"device_id": "esp32_aa11bb", "sensors": [], "actuators": []}),
            ))
            .await;
        router
            .handle(inbound(
                "devices/esp32_aa11bb/error",
                "devices/+/error",
                json!({
                    "device_id": "esp32_aa11bb",
                    "timestamp": 1700000100,
                    "value": {"error_type": "sensor_fail", "message": "timeout", "severity": 2}
                }),
            ))
            .await;

        let alerts = tools
            .get_alerts(Some("esp32_aa11bb"), Some(2), None, None)
            .await
            .unwrap();
        assert!(alerts.iter().any(|a| a.error_type == "sensor_fail" && a.message == "timeout"));

        let info = tools.get_device_info("esp32_aa11bb").await.unwrap();
        assert_eq!(info.recent_error_count, 1);
    }
}
