//! CLI + environment configuration.
//!
//! Flags win over environment variables, which win over defaults — `clap`'s
//! `env` feature gives us that precedence for free on every field below.

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "iot-mcp-bridge", about = "MQTT-to-MCP device bridge")]
pub struct Config {
    #[arg(long, env = "MQTT_BROKER", default_value = "127.0.0.1")]
    pub mqtt_broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    pub mqtt_port: u16,

    #[arg(long, env = "MQTT_USERNAME")]
    pub mqtt_username: Option<String>,

    #[arg(long, env = "MQTT_PASSWORD")]
    pub mqtt_password: Option<String>,

    #[arg(long, env = "DB_PATH", default_value = "bridge.db")]
    pub db_path: String,

    #[arg(long, env = "DEVICE_TIMEOUT_MINUTES", default_value_t = 10)]
    pub device_timeout_minutes: i64,

    #[arg(long, env = "RETENTION_DAYS", default_value_t = 30)]
    pub retention_days: i64,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Which MCP transport to expose. The transport is a thin shim over the
    /// tool registry — see `mcp.rs`.
    #[arg(long, env = "MCP_TRANSPORT", default_value = "stdio")]
    pub mcp_transport: McpTransport,

    #[arg(long, env = "MCP_HTTP_PORT", default_value_t = 7890)]
    pub mcp_http_port: u16,

    /// Bound on the Registry's recent-errors ring per device.
    #[arg(long, env = "ERROR_RING_BOUND", default_value_t = 100)]
    pub error_ring_bound: usize,

    /// Bound on the Router worker pool (spec §5: "a bounded pool of Router
    /// worker tasks").
    #[arg(long, env = "ROUTER_WORKERS", default_value_t = 8)]
    pub router_workers: usize,

    /// Default per-tool-call deadline, in milliseconds.
    #[arg(long, env = "TOOL_DEADLINE_MS", default_value_t = 5000)]
    pub tool_deadline_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[clap(rename_all = "lowercase")]
pub enum McpTransport {
    Stdio,
    Http,
}

impl Config {
    pub fn db_url(&self) -> String {
        format!("sqlite:{}?mode=rwc", self.db_path)
    }

    pub fn device_timeout(&self) -> time::Duration {
        time::Duration::minutes(self.device_timeout_minutes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_args() {
        let cfg = Config::parse_from(["bridge"]);
        assert_eq!(cfg.mqtt_broker, "127.0.0.1");
        assert_eq!(cfg.mqtt_port, 1883);
        assert_eq!(cfg.retention_days, 30);
        assert_eq!(cfg.mcp_transport, McpTransport::Stdio);
    }

    #[test]
    fn flags_override_defaults() {
        let cfg = Config::parse_from([
            "bridge",
            "--mqtt-broker",
            "broker.local",
            "--mqtt-port",
            "8883",
            "--retention-days",
            "7",
            "--mcp-transport",
            "http",
        ]);
        assert_eq!(cfg.mqtt_broker, "broker.local");
        assert_eq!(cfg.mqtt_port, 8883);
        assert_eq!(cfg.retention_days, 7);
        assert_eq!(cfg.mcp_transport, McpTransport::Http);
    }

    #[test]
    fn db_url_wraps_path() {
        let cfg = Config::parse_from(["bridge", "--db-path", "/tmp/x.db"]);
        assert_eq!(cfg.db_url(), "sqlite:/tmp/x.db?mode=rwc");
    }
}
