//! JSON-RPC tool surface for the orchestration client.
//!
//! `POST /mcp` speaks a minimal JSON-RPC 2.0: `initialize`,
//! `tools/list` and `tools/call` over the three tool families. Tool
//! results wrap their JSON payload in a text content block; tool
//! failures set `isError` and carry the structured `{error, message,
//! retry}` body. A panicking handler is caught and reported as an
//! `internal` error instead of tearing the daemon down.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use futures::FutureExt;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::dispatch::{self, ConfigureArgs, InteractArgs};
use crate::errors::ToolError;
use crate::observe::{self, ObserveArgs};
use crate::AppState;

pub const PROTOCOL_VERSION: &str = "2025-06-18";

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

fn rpc_result(id: Option<Value>, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn rpc_error(id: Option<Value>, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}

/// Wrap a tool payload into the content-block envelope.
fn tool_result(payload: &Value) -> Value {
    json!({
        "content": [{
            "type": "text",
            "text": payload.to_string(),
        }],
    })
}

fn tool_error(err: &ToolError) -> Value {
    json!({
        "content": [{
            "type": "text",
            "text": err.to_json().to_string(),
        }],
        "isError": true,
    })
}

pub async fn handle(
    State(state): State<AppState>,
    payload: Result<Json<RpcRequest>, axum::extract::rejection::JsonRejection>,
) -> axum::response::Response {
    let request = match payload {
        Ok(Json(r)) => r,
        Err(rejection) => {
            let err = ToolError::InvalidJson(rejection.body_text());
            tracing::debug!(error = %err, "malformed JSON-RPC body");
            return (
                StatusCode::OK,
                Json(rpc_error(None, -32700, &err.to_string())),
            )
                .into_response();
        }
    };

    let id = request.id.clone();
    let response = match request.method.as_str() {
        "initialize" => rpc_result(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": "gasoline",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        ),
        "notifications/initialized" => rpc_result(id, json!({})),
        "tools/list" => rpc_result(id, json!({ "tools": tool_descriptors() })),
        "tools/call" => {
            let name = request
                .params
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("");
            let arguments = request
                .params
                .get("arguments")
                .cloned()
                .unwrap_or_else(|| json!({}));
            match call_tool(&state, name, arguments).await {
                Ok(payload) => rpc_result(id, tool_result(&payload)),
                Err(err) => {
                    state.metrics.note_tool_error();
                    rpc_result(id, tool_error(&err))
                }
            }
        }
        other => rpc_error(id, -32601, &format!("method {other:?} not found")),
    };
    (StatusCode::OK, Json(response)).into_response()
}

async fn call_tool(state: &AppState, name: &str, arguments: Value) -> Result<Value, ToolError> {
    let fut = async {
        match name {
            "observe" => {
                let args: ObserveArgs = parse_args(arguments)?;
                observe::observe(state, args).await
            }
            "interact" => {
                let args: InteractArgs = parse_args(arguments)?;
                dispatch::interact(state, args).await
            }
            "configure" => {
                let args: ConfigureArgs = parse_args(arguments)?;
                dispatch::configure(state, args).await
            }
            other => Err(ToolError::InvalidParam {
                param: "name".into(),
                reason: format!("unknown tool {other:?}"),
            }),
        }
    };
    // A handler panic must never take the daemon down with it.
    match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            tracing::error!(tool = name, panic = %detail, "tool handler panicked");
            Err(ToolError::Internal("tool handler panicked".into()))
        }
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(arguments: Value) -> Result<T, ToolError> {
    serde_json::from_value(arguments).map_err(|e| ToolError::InvalidParam {
        param: "arguments".into(),
        reason: e.to_string(),
    })
}

fn tool_descriptors() -> Vec<Value> {
    vec![
        json!({
            "name": "observe",
            "description": "Read captured browser telemetry: console logs, network \
                waterfalls and bodies, WebSocket events, user actions, performance \
                vitals, plus command results and recordings.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "what": {
                        "type": "string",
                        "enum": [
                            "errors", "logs", "extension_logs", "network_waterfall",
                            "network_bodies", "websocket_events", "websocket_status",
                            "actions", "vitals", "page", "tabs", "pilot", "performance",
                            "api", "accessibility", "changes", "timeline",
                            "error_clusters", "error_bundles", "history",
                            "security_audit", "third_party_audit", "security_diff",
                            "command_result", "pending_commands", "failed_commands",
                            "recordings", "recording_actions", "playback_results",
                            "log_diff_report", "saved_videos"
                        ],
                    },
                    "cursor": { "type": "string" },
                    "limit": { "type": "integer" },
                    "level": { "type": "string" },
                    "url": { "type": "string" },
                    "correlation_id": { "type": "string" },
                    "tab_id": { "type": "integer" },
                    "name": { "type": "string" },
                    "since": { "type": "string" },
                },
                "required": ["what"],
            },
        }),
        json!({
            "name": "interact",
            "description": "Queue an action for the tracked tab: navigation, DOM \
                interaction, script execution, recording control, or the staged \
                file-upload ladder.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": [
                            "highlight", "navigate", "execute_js", "refresh", "back",
                            "forward", "new_tab", "subtitle", "click", "type", "select",
                            "check", "get_text", "get_value", "get_attribute",
                            "set_attribute", "focus", "scroll_to", "wait_for",
                            "key_press", "open_composer", "submit_active_composer",
                            "confirm_top_dialog", "dismiss_top_overlay",
                            "list_interactive", "save_state", "list_states", "upload",
                            "screenshot", "record_start", "record_stop"
                        ],
                    },
                    "selector": { "type": "string" },
                    "url": { "type": "string" },
                    "script": { "type": "string" },
                    "world": { "type": "string", "enum": ["auto", "main", "isolated"] },
                    "text": { "type": "string" },
                    "value": { "type": "string" },
                    "name": { "type": "string" },
                    "snapshot_name": { "type": "string" },
                    "attribute": { "type": "string" },
                    "key": { "type": "string" },
                    "file_path": { "type": "string" },
                    "submit": { "type": "boolean" },
                    "escalation_timeout_ms": { "type": "integer" },
                    "browser_pid": { "type": "integer" },
                    "method": { "type": "string" },
                    "cookie": { "type": "string" },
                    "csrf_token": { "type": "string" },
                    "fields": {
                        "type": "object",
                        "additionalProperties": { "type": "string" },
                    },
                    "tab_id": { "type": "integer" },
                    "wait": { "type": "boolean" },
                    "timeout_ms": { "type": "integer" },
                },
                "required": ["action"],
            },
        }),
        json!({
            "name": "configure",
            "description": "Manage saved interaction macros and fetch usage help.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": [
                            "save_macro", "get_macro", "list_macros", "delete_macro",
                            "replay_macro", "tutorial", "examples"
                        ],
                    },
                    "name": { "type": "string" },
                    "steps": { "type": "array" },
                    "tags": { "type": "array", "items": { "type": "string" } },
                    "tag": { "type": "string" },
                    "override_steps": { "type": "array" },
                },
                "required": ["action"],
            },
        }),
    ]
}
