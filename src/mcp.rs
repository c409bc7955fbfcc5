//! Thin MCP transport shim over the [`Tools`] registry.
//!
//! Two interchangeable transports, selected by `Config.mcp_transport`:
//! stdio, a line-delimited JSON-RPC-ish request/response loop over
//! stdin/stdout; and HTTP, one POST endpoint per tool via axum. Neither
//! transport holds any bridge state itself — both just decode a request,
//! call into `Tools`, and serialize the result or the `BridgeError`.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::post;
use axum::Router as AxumRouter;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

use crate::error::BridgeError;
use crate::tools::Tools;

#[derive(Debug, Deserialize)]
struct StdioRequest {
    id: Option<Value>,
    tool: String,
    #[serde(default)]
    args: Value,
}

/// Dispatches a single tool invocation by name against a JSON args object.
/// Shared by both transports so the mapping from tool name to `Tools`
/// method lives in exactly one place.
async fn dispatch(tools: &Tools, tool: &str, args: &Value) -> Result<Value, BridgeError> {
    match tool {
        "list_devices" => {
            let online_only = args.get("online_only").and_then(Value::as_bool).unwrap_or(false);
            let result = tools.list_devices(online_only).await?;
            Ok(serde_json::to_value(result).unwrap_or(Value::Null))
        }
        "read_sensor" => {
            let device_id = arg_str(args, "device_id")?;
            let sensor_type = arg_str(args, "sensor_type")?;
            let history_minutes = args.get("history_minutes").and_then(Value::as_i64);
            let result = tools.read_sensor(device_id, sensor_type, history_minutes).await?;
            Ok(serde_json::to_value(result).unwrap_or(Value::Null))
        }
        "control_actuator" => {
            let device_id = arg_str(args, "device_id")?;
            let actuator_type = arg_str(args, "actuator_type")?;
            let action = arg_str(args, "action")?;
            let value = args.get("value").cloned();
            let result = tools.control_actuator(device_id, actuator_type, action, value).await?;
            Ok(serde_json::to_value(result).unwrap_or(Value::Null))
        }
        "get_device_info" => {
            let device_id = arg_str(args, "device_id")?;
            let result = tools.get_device_info(device_id).await?;
            Ok(serde_json::to_value(result).unwrap_or(Value::Null))
        }
        "query_devices" => {
            let sensor_type = args.get("sensor_type").and_then(Value::as_str);
            let actuator_type = args.get("actuator_type").and_then(Value::as_str);
            let online_only = args.get("online_only").and_then(Value::as_bool).unwrap_or(false);
            let result = tools.query_devices(sensor_type, actuator_type, online_only).await?;
            Ok(serde_json::to_value(result).unwrap_or(Value::Null))
        }
        "get_alerts" => {
            let device_id = args.get("device_id").and_then(Value::as_str);
            let severity_min = args.get("severity_min").and_then(Value::as_i64);
            let since_minutes = args.get("since_minutes").and_then(Value::as_i64);
            let limit = args.get("limit").and_then(Value::as_i64);
            let result = tools.get_alerts(device_id, severity_min, since_minutes, limit).await?;
            Ok(serde_json::to_value(result).unwrap_or(Value::Null))
        }
        "get_system_status" => {
            let result = tools.get_system_status().await?;
            Ok(serde_json::to_value(result).unwrap_or(Value::Null))
        }
        "get_device_metrics" => {
            let device_id = args.get("device_id").and_then(Value::as_str);
            let result = tools.get_device_metrics(device_id).await?;
            Ok(serde_json::to_value(result).unwrap_or(Value::Null))
        }
        other => Err(BridgeError::InvalidPayload(format!("unknown tool '{other}'"))),
    }
}

fn arg_str<'a>(args: &'a Value, field: &str) -> Result<&'a str, BridgeError> {
    args.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| BridgeError::InvalidPayload(format!("missing or non-string field '{field}'")))
}

/// Runs the stdio transport until stdin closes. Each input line is one
/// `{"id"?, "tool", "args"?}` request; each output line is one JSON
/// response written to stdout, newline-terminated.
pub async fn run_stdio(tools: Tools) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(stdin).lines();

    info!("mcp stdio transport ready");

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<StdioRequest>(&line) {
            Ok(req) => {
                let result = dispatch(&tools, &req.tool, &req.args).await;
                encode_response(req.id, result)
            }
            Err(e) => {
                warn!(error = %e, "malformed mcp stdio request");
                json!({ "error": "invalid-payload", "message": e.to_string() })
            }
        };

        let mut bytes = serde_json::to_vec(&response)?;
        bytes.push(b'\n');
        stdout.write_all(&bytes).await?;
        stdout.flush().await?;
    }

    Ok(())
}

fn encode_response(id: Option<Value>, result: Result<Value, BridgeError>) -> Value {
    match result {
        Ok(value) => json!({ "id": id, "result": value }),
        Err(e) => json!({ "id": id, "error": e.to_json() }),
    }
}

#[derive(Clone)]
struct HttpState {
    tools: Tools,
}

/// Builds the axum router: one POST endpoint per tool, named after the
/// tool itself (`POST /tools/list_devices`, etc).
pub fn http_router(tools: Tools) -> AxumRouter {
    let state = HttpState { tools };
    AxumRouter::new()
        .route("/tools/list_devices", post(handle_tool))
        .route("/tools/read_sensor", post(handle_tool))
        .route("/tools/control_actuator", post(handle_tool))
        .route("/tools/get_device_info", post(handle_tool))
        .route("/tools/query_devices", post(handle_tool))
        .route("/tools/get_alerts", post(handle_tool))
        .route("/tools/get_system_status", post(handle_tool))
        .route("/tools/get_device_metrics", post(handle_tool))
        .with_state(state)
}

async fn handle_tool(
    State(state): State<HttpState>,
    uri: axum::http::Uri,
    body: Option<Json<Value>>,
) -> impl IntoResponse {
    let tool = uri
        .path()
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string();
    let args = body.map(|Json(v)| v).unwrap_or(Value::Null);

    match dispatch(&state.tools, &tool, &args).await {
        Ok(value) => (StatusCode::OK, Json(json!({ "result": value }))),
        Err(e) => {
            let status = match e {
                BridgeError::DeviceNotFound(_) | BridgeError::SensorNotFound { .. } => StatusCode::NOT_FOUND,
                BridgeError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
                BridgeError::DeviceOffline(_) | BridgeError::UnknownActuator { .. } => StatusCode::CONFLICT,
                BridgeError::BusNotReady | BridgeError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                BridgeError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            };
            (status, Json(e.to_json()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use crate::registry::Registry;
    use crate::router::RouterMetrics;
    use crate::store::Store;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn test_tools() -> Tools {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        let registry = Registry::new(100);
        let (bus, _rx) = Bus::connect("127.0.0.1", 1, None, None, "test").unwrap();
        Tools::new(
            registry,
            store,
            Arc::new(bus),
            Arc::new(RouterMetrics::default()),
            Duration::from_secs(5),
            0,
        )
    }

    #[tokio::test]
    async fn dispatch_unknown_tool_is_invalid_payload() {
        let tools = test_tools().await;
        let err = dispatch(&tools, "nonexistent", &Value::Null).await.unwrap_err();
        assert_eq!(err.kind(), "invalid-payload");
    }

    #[tokio::test]
    async fn dispatch_read_sensor_requires_device_id_field() {
        let tools = test_tools().await;
        let err = dispatch(&tools, "read_sensor", &json!({})).await.unwrap_err();
        assert_eq!(err.kind(), "invalid-payload");
    }

    #[tokio::test]
    async fn http_get_system_status_returns_ok() {
        let tools = test_tools().await;
        let app = http_router(tools);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/tools/get_system_status")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["result"]["devices_total"], 0);
    }

    #[tokio::test]
    async fn http_read_sensor_missing_device_returns_not_found() {
        let tools = test_tools().await;
        let app = http_router(tools);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/tools/read_sensor")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(
                        json!({"device_id": "ghost", "sensor_type": "temp"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
