//! REST endpoints for the browser extension.
//!
//! The extension pushes telemetry batches in, long-polls for queued
//! commands, reports command results, and exercises the upload plane.
//! All of these sit behind the extension client gate in addition to the
//! shared host/origin/key checks.

use std::time::Duration;

use axum::extract::{Multipart, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::buffer::LogEntry;
use crate::errors::ToolError;
use crate::tracked::SyncPayload;
use crate::upload::dialog::{self, DialogInjectRequest};
use crate::upload::file_read::{self, FileReadRequest};
use crate::upload::form_submit::{self, FormSubmitRequest};
use crate::upload::os_automation::{self, OsAutomationRequest};
use crate::AppState;

/// Telemetry batches arrive either as a bare array or wrapped in
/// `{entries: [...]}`; both are accepted.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum EntryBatch {
    Wrapped { entries: Vec<LogEntry> },
    Bare(Vec<LogEntry>),
}

impl EntryBatch {
    fn into_entries(self) -> Vec<LogEntry> {
        match self {
            EntryBatch::Wrapped { entries } => entries,
            EntryBatch::Bare(entries) => entries,
        }
    }
}

fn error_response(err: ToolError) -> Response {
    (err.http_status(), Json(err.to_json())).into_response()
}

macro_rules! telemetry_endpoint {
    ($name:ident, $buffer:ident) => {
        pub async fn $name(
            State(state): State<AppState>,
            Json(batch): Json<EntryBatch>,
        ) -> Response {
            let outcome = state.buffers.$buffer.append_many(batch.into_entries());
            (StatusCode::OK, Json(json!({ "status": "ok", "outcome": outcome }))).into_response()
        }
    };
}

telemetry_endpoint!(post_network_waterfall, network_waterfall);
telemetry_endpoint!(post_network_bodies, network_bodies);
telemetry_endpoint!(post_websocket_events, websocket_events);
telemetry_endpoint!(post_enhanced_actions, actions);
telemetry_endpoint!(post_extension_logs, extension_logs);

/// Console logs take the distinct path through the JSONL forwarder.
pub async fn post_logs(State(state): State<AppState>, Json(batch): Json<EntryBatch>) -> Response {
    let outcome = state.buffers.ingest_logs(batch.into_entries());
    (StatusCode::OK, Json(json!({ "status": "ok", "outcome": outcome }))).into_response()
}

pub async fn post_sync(
    State(state): State<AppState>,
    Json(payload): Json<SyncPayload>,
) -> Response {
    state.tracked.apply_sync(payload);
    (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
}

#[derive(Debug, Deserialize)]
pub struct CommandsQuery {
    #[serde(default)]
    pub tab_id: Option<i64>,
    #[serde(default)]
    pub max: Option<usize>,
    #[serde(default)]
    pub wait_ms: Option<u64>,
}

/// Long-poll ceiling so a dead extension cannot pin a worker forever.
const MAX_LONG_POLL: Duration = Duration::from_secs(25);

pub async fn get_commands(
    State(state): State<AppState>,
    Query(query): Query<CommandsQuery>,
) -> Response {
    let max = query.max.unwrap_or(10).clamp(1, 100);
    let wait = Duration::from_millis(query.wait_ms.unwrap_or(0)).min(MAX_LONG_POLL);
    let commands = if wait.is_zero() {
        state.pending.drain_for_extension(query.tab_id, max)
    } else {
        state.pending.long_poll_drain(query.tab_id, max, wait).await
    };
    (StatusCode::OK, Json(json!({ "commands": commands }))).into_response()
}

#[derive(Debug, Deserialize)]
pub struct CommandResult {
    pub correlation_id: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
}

pub async fn post_command_result(
    State(state): State<AppState>,
    Json(report): Json<CommandResult>,
) -> Response {
    let applied = if report.success {
        state
            .pending
            .complete(&report.correlation_id, report.result.unwrap_or(Value::Null))
    } else {
        state.pending.fail(
            &report.correlation_id,
            report
                .error
                .unwrap_or_else(|| "extension reported failure".into()),
            report.error_code,
        )
    };
    // A late result after expiry is acknowledged but discarded.
    (
        StatusCode::OK,
        Json(json!({ "status": "ok", "applied": applied })),
    )
        .into_response()
}

pub async fn post_recording_save(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Response {
    let mut name: Option<String> = None;
    let mut video: Option<Vec<u8>> = None;
    let mut meta: Option<Value> = None;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(f)) => f,
            Ok(None) => break,
            Err(e) => {
                return error_response(ToolError::InvalidParam {
                    param: "multipart".into(),
                    reason: e.to_string(),
                })
            }
        };
        match field.name().unwrap_or("") {
            "name" => match field.text().await {
                Ok(v) => name = Some(v),
                Err(e) => {
                    return error_response(ToolError::InvalidParam {
                        param: "name".into(),
                        reason: e.to_string(),
                    })
                }
            },
            "meta" => match field.text().await {
                Ok(raw) => match serde_json::from_str(&raw) {
                    Ok(v) => meta = Some(v),
                    Err(e) => return error_response(ToolError::InvalidJson(e.to_string())),
                },
                Err(e) => {
                    return error_response(ToolError::InvalidParam {
                        param: "meta".into(),
                        reason: e.to_string(),
                    })
                }
            },
            "video" => match field.bytes().await {
                Ok(bytes) => video = Some(bytes.to_vec()),
                Err(e) => {
                    return error_response(ToolError::TooLarge(e.to_string()));
                }
            },
            other => {
                tracing::debug!(field = other, "ignoring unknown multipart field");
            }
        }
    }
    let Some(name) = name else {
        return error_response(ToolError::MissingParam("name".into()));
    };
    let Some(video) = video else {
        return error_response(ToolError::MissingParam("video".into()));
    };
    match state.recordings.save(&name, &video, meta.as_ref()) {
        Ok(info) => (StatusCode::OK, Json(json!({ "status": "ok", "recording": info })))
            .into_response(),
        Err(err) => error_response(err),
    }
}

// Upload plane. Stage handlers do their own validation; these endpoints
// only adapt HTTP.

pub async fn post_file_read(
    State(state): State<AppState>,
    Json(req): Json<FileReadRequest>,
) -> Response {
    match file_read::read_file(&state.security, &req).await {
        Ok(resp) => (StatusCode::OK, Json(resp.to_value())).into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn post_dialog_inject(
    State(state): State<AppState>,
    Json(req): Json<DialogInjectRequest>,
) -> Response {
    match dialog::inject_dialog(&state.security, &state.pending, &req) {
        Ok(resp) => (StatusCode::OK, Json(resp.to_value())).into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn post_form_submit(
    State(state): State<AppState>,
    Json(req): Json<FormSubmitRequest>,
) -> Response {
    match form_submit::submit_form(&state.security, &state.http_client, &req).await {
        // Stage 3 reports HTTP rejections in-band with success=false.
        Ok(resp) => (StatusCode::OK, Json(resp.to_value())).into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn post_os_automation_inject(
    State(state): State<AppState>,
    Json(req): Json<OsAutomationRequest>,
) -> Response {
    if !state.config.os_automation_enabled {
        return error_response(ToolError::Forbidden);
    }
    match os_automation::inject_os_automation(&state.security, &state.automation, &req).await {
        Ok(resp) => (StatusCode::OK, Json(resp.to_value())).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
pub struct DismissRequest {
    #[serde(default)]
    pub browser_pid: u32,
}

pub async fn post_os_automation_dismiss(
    State(state): State<AppState>,
    Json(req): Json<DismissRequest>,
) -> Response {
    if !state.config.os_automation_enabled {
        return error_response(ToolError::Forbidden);
    }
    match os_automation::dismiss_dialog(&state.automation, req.browser_pid).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response(),
        Err(err) => error_response(err),
    }
}
