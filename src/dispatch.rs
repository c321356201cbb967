//! The `interact` and `configure` tools.
//!
//! Every interaction is either answered immediately or becomes a queued
//! command the extension executes asynchronously. The dispatcher is the
//! only place correlation-id prefixes are minted, owns the fast-path
//! wait budget, and drives the upload escalation ladder.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::errors::ToolError;
use crate::pending::QueryState;
use crate::upload::{
    self, dialog::DialogInjectRequest, failure_is_recoverable, file_read,
    file_read::FileReadRequest, form_submit, form_submit::FormSubmitRequest, os_automation,
    os_automation::OsAutomationRequest, StageResponse, UploadStage,
};
use crate::AppState;

/// Closed set of correlation-id prefixes. Stable wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandFamily {
    Navigate,
    Dom,
    DomList,
    Exec,
    Highlight,
    Upload,
    Subtitle,
    Refresh,
    Back,
    Forward,
    NewTab,
    RecordStart,
    RecordStop,
}

impl CommandFamily {
    pub fn prefix(self) -> &'static str {
        match self {
            CommandFamily::Navigate => "nav_",
            CommandFamily::Dom => "dom_",
            CommandFamily::DomList => "dom_list_",
            CommandFamily::Exec => "exec_",
            CommandFamily::Highlight => "highlight_",
            CommandFamily::Upload => "upload_",
            CommandFamily::Subtitle => "subtitle_",
            CommandFamily::Refresh => "refresh_",
            CommandFamily::Back => "back_",
            CommandFamily::Forward => "forward_",
            CommandFamily::NewTab => "newtab_",
            CommandFamily::RecordStart => "record_start_",
            CommandFamily::RecordStop => "record_stop_",
        }
    }
}

/// How long a tool call lingers hoping the extension answers before it
/// degrades to a queued response.
const FAST_PATH_BUDGET: Duration = Duration::from_secs(2);
/// Default lifetime of a queued command before the sweeper expires it.
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of dispatching one tool call: either the final answer or a
/// handle the caller polls via `observe command_result`.
#[derive(Debug)]
pub enum DispatchOutcome {
    Immediate(Value),
    Queued { correlation_id: String },
}

impl DispatchOutcome {
    pub fn to_value(self) -> Value {
        match self {
            DispatchOutcome::Immediate(mut v) => {
                if let Some(obj) = v.as_object_mut() {
                    obj.entry("final").or_insert(Value::Bool(true));
                }
                v
            }
            DispatchOutcome::Queued { correlation_id } => json!({
                "status": "queued",
                "correlation_id": correlation_id,
                "final": false,
            }),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InteractArgs {
    pub action: String,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub world: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub snapshot_name: Option<String>,
    #[serde(default)]
    pub attribute: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub submit: Option<bool>,
    #[serde(default)]
    pub escalation_timeout_ms: Option<u64>,
    #[serde(default)]
    pub browser_pid: Option<u32>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub cookie: Option<String>,
    #[serde(default)]
    pub csrf_token: Option<String>,
    #[serde(default)]
    pub fields: Option<HashMap<String, String>>,
    #[serde(default)]
    pub tab_id: Option<i64>,
    #[serde(default)]
    pub wait: Option<bool>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl InteractArgs {
    fn require<'a>(&self, field: &'static str, value: &'a Option<String>) -> Result<&'a str, ToolError> {
        value
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ToolError::MissingParam(field.into()))
    }
}

/// DOM-targeting actions sharing the `dom_` family and a selector.
const DOM_ACTIONS: [&str; 16] = [
    "click",
    "type",
    "select",
    "check",
    "get_text",
    "get_value",
    "get_attribute",
    "set_attribute",
    "focus",
    "scroll_to",
    "wait_for",
    "key_press",
    "open_composer",
    "submit_active_composer",
    "confirm_top_dialog",
    "dismiss_top_overlay",
];

pub async fn interact(state: &AppState, args: InteractArgs) -> Result<Value, ToolError> {
    if args.action == "upload" {
        return run_upload(state, &args).await;
    }

    let (family, command_type, params) = plan_command(&args)?;

    // Pilot gates every queued interaction; everything except opening a
    // fresh tab also needs a tracked tab to land in.
    let tracked = state.tracked.snapshot();
    if !tracked.pilot {
        return Err(ToolError::PilotDisabled);
    }
    let needs_tab = family != CommandFamily::NewTab;
    if needs_tab && tracked.tab_id.is_none() {
        // The screenshot alias reports missing data rather than a missing
        // tab, matching its read-only flavor.
        if args.action == "screenshot" {
            return Err(ToolError::NoData("no tracked tab to capture".into()));
        }
        return Err(ToolError::NoTrackedTab);
    }
    if command_type == "record_stop"
        && tracked.recording_state.as_deref() == Some("awaiting_gesture")
    {
        return Err(ToolError::InvalidParam {
            param: "action".into(),
            reason: "recording is awaiting the user gesture and cannot stop yet".into(),
        });
    }

    let tab_id = args.tab_id.or(tracked.tab_id);
    let timeout = args
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_COMMAND_TIMEOUT);
    let correlation_id = state
        .pending
        .enqueue(family.prefix(), &command_type, tab_id, params, timeout);
    state.metrics.note_command();

    let outcome = if args.wait.unwrap_or(true) {
        wait_fast_path(state, correlation_id).await?
    } else {
        DispatchOutcome::Queued { correlation_id }
    };
    Ok(outcome.to_value())
}

/// Map an action onto its command family, wire type and parameters.
fn plan_command(args: &InteractArgs) -> Result<(CommandFamily, String, Value), ToolError> {
    let action = args.action.as_str();
    let world = match args.world.as_deref() {
        None => "auto",
        Some(w @ ("auto" | "main" | "isolated")) => w,
        Some(other) => {
            return Err(ToolError::InvalidParam {
                param: "world".into(),
                reason: format!("{other:?} not in auto/main/isolated"),
            })
        }
    };

    let planned = match action {
        "navigate" => {
            let raw = args.require("url", &args.url)?;
            let url = url::Url::parse(raw).map_err(|e| ToolError::InvalidParam {
                param: "url".into(),
                reason: format!("{raw:?}: {e}"),
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ToolError::InvalidParam {
                    param: "url".into(),
                    reason: format!("scheme {:?} cannot be navigated to", url.scheme()),
                });
            }
            (
                CommandFamily::Navigate,
                "navigate".to_string(),
                json!({ "url": url.as_str() }),
            )
        }
        "refresh" => (CommandFamily::Refresh, "refresh".into(), json!({})),
        "back" => (CommandFamily::Back, "back".into(), json!({})),
        "forward" => (CommandFamily::Forward, "forward".into(), json!({})),
        "new_tab" => (
            CommandFamily::NewTab,
            "new_tab".into(),
            json!({ "url": args.url }),
        ),
        "highlight" => {
            let selector = args.require("selector", &args.selector)?;
            (
                CommandFamily::Highlight,
                "highlight".into(),
                json!({ "selector": selector }),
            )
        }
        "subtitle" => {
            let text = args.require("text", &args.text)?;
            (
                CommandFamily::Subtitle,
                "subtitle".into(),
                json!({ "text": text }),
            )
        }
        "execute_js" => {
            let script = args.require("script", &args.script)?;
            (
                CommandFamily::Exec,
                "execute_js".into(),
                json!({ "script": script, "world": world }),
            )
        }
        "screenshot" => (CommandFamily::Dom, "screenshot".into(), json!({})),
        "save_state" => (
            CommandFamily::Dom,
            "save_state".into(),
            json!({ "snapshotName": args.snapshot_name }),
        ),
        "list_interactive" => (
            CommandFamily::DomList,
            "list_interactive".into(),
            json!({ "selector": args.selector }),
        ),
        "list_states" => (CommandFamily::DomList, "list_states".into(), json!({})),
        "record_start" => (
            CommandFamily::RecordStart,
            "record_start".into(),
            json!({ "name": args.name }),
        ),
        "record_stop" => (
            CommandFamily::RecordStop,
            "record_stop".into(),
            json!({ "name": args.name }),
        ),
        dom if DOM_ACTIONS.contains(&dom) => {
            // Dialog/overlay/composer actions target implicit elements;
            // the rest need a selector.
            let implicit_target = matches!(
                dom,
                "confirm_top_dialog" | "dismiss_top_overlay" | "submit_active_composer" | "key_press"
            );
            if !implicit_target {
                args.require("selector", &args.selector)?;
            }
            if dom == "type" {
                args.require("text", &args.text)?;
            }
            if matches!(dom, "get_attribute" | "set_attribute") {
                args.require("attribute", &args.attribute)?;
            }
            if dom == "key_press" {
                args.require("key", &args.key)?;
            }
            (
                CommandFamily::Dom,
                dom.to_string(),
                json!({
                    "selector": args.selector,
                    "text": args.text,
                    "value": args.value,
                    "attribute": args.attribute,
                    "key": args.key,
                    "world": world,
                }),
            )
        }
        other => return Err(ToolError::UnknownAction(other.to_string())),
    };
    Ok(planned)
}

async fn wait_fast_path(
    state: &AppState,
    correlation_id: String,
) -> Result<DispatchOutcome, ToolError> {
    let snapshot = state
        .pending
        .wait(&correlation_id, FAST_PATH_BUDGET)
        .await
        .ok_or_else(|| ToolError::Internal("pending query vanished".into()))?;
    match snapshot.state {
        QueryState::Complete => Ok(DispatchOutcome::Immediate(json!({
            "status": "complete",
            "correlation_id": snapshot.correlation_id,
            "result": snapshot.result,
        }))),
        QueryState::Expired => Err(ToolError::CommandTimeout {
            command: snapshot.command_type,
        }),
        QueryState::Error => Err(ToolError::from_extension(
            snapshot.error_kind.as_deref(),
            snapshot
                .error
                .unwrap_or_else(|| "extension reported failure".into()),
        )),
        // Still queued or in flight after the budget: hand back the id.
        _ => Ok(DispatchOutcome::Queued {
            correlation_id: snapshot.correlation_id,
        }),
    }
}

/// The four-stage upload ladder. Each stage either finishes the session,
/// fails it terminally, or records a reason and escalates.
async fn run_upload(state: &AppState, args: &InteractArgs) -> Result<Value, ToolError> {
    let file_path = args.require("file_path", &args.file_path)?.to_string();
    let correlation_id = crate::clock::correlation_id(CommandFamily::Upload.prefix());
    let file_name = std::path::Path::new(&file_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_path.clone());
    let size_hint = std::fs::metadata(&file_path).map(|m| m.len()).unwrap_or(0);
    state
        .uploads
        .start(&correlation_id, &file_path, &file_name, size_hint);

    let wait_budget = args
        .escalation_timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_secs(10));

    // Stage 1: read and hand the payload to the extension as a synthetic
    // drag-drop.
    state
        .uploads
        .advance(&correlation_id, UploadStage::DragDrop, "initial attempt")?;
    match stage1_drag_drop(state, args, &correlation_id, &file_path, wait_budget).await {
        Ok(resp) => {
            state
                .uploads
                .advance(&correlation_id, UploadStage::Complete, "drag-drop accepted")?;
            return Ok(finish_upload(state, &correlation_id, resp));
        }
        Err(err) if !failure_is_recoverable(&err) => {
            let _ = state
                .uploads
                .advance(&correlation_id, UploadStage::Error, &err.to_string());
            return Err(err);
        }
        Err(err) => {
            state.uploads.advance(
                &correlation_id,
                UploadStage::FileDialog,
                &format!("drag-drop failed: {err}"),
            )?;
        }
    }

    // Stage 2: drive the page's file dialog through the extension.
    match stage2_dialog(state, args, &file_path, wait_budget).await {
        Ok(resp) => {
            state
                .uploads
                .advance(&correlation_id, UploadStage::Complete, "dialog accepted")?;
            return Ok(finish_upload(state, &correlation_id, resp));
        }
        Err(ToolError::UploadDirRequired) => {
            // Stages 3 and 4 need the scoped directory too, so this is
            // terminal rather than recoverable.
            let _ = state.uploads.advance(
                &correlation_id,
                UploadStage::Error,
                "upload directory not configured",
            );
            return Err(ToolError::UploadDirRequired);
        }
        Err(err) if !failure_is_recoverable(&err) => {
            let _ = state
                .uploads
                .advance(&correlation_id, UploadStage::Error, &err.to_string());
            return Err(err);
        }
        Err(err) => {
            state.uploads.advance(
                &correlation_id,
                UploadStage::FormIntercept,
                &format!("dialog failed: {err}"),
            )?;
        }
    }

    // Stage 3: submit the form over HTTP directly, if a target is known.
    match stage3_form(state, args, &file_path).await {
        Ok(Some(resp)) if resp.success => {
            state
                .uploads
                .advance(&correlation_id, UploadStage::Complete, "form accepted")?;
            return Ok(finish_upload(state, &correlation_id, resp));
        }
        Ok(Some(resp)) => {
            // A classified HTTP rejection needs operator action, not a
            // louder stage.
            let reason = resp
                .error
                .clone()
                .unwrap_or_else(|| "form submission rejected".into());
            let _ = state
                .uploads
                .advance(&correlation_id, UploadStage::Error, &reason);
            return Ok(finish_upload(state, &correlation_id, resp));
        }
        Ok(None) => {
            state.uploads.advance(
                &correlation_id,
                UploadStage::OsAutomation,
                "no form target URL supplied",
            )?;
        }
        Err(err) if !failure_is_recoverable(&err) => {
            let _ = state
                .uploads
                .advance(&correlation_id, UploadStage::Error, &err.to_string());
            return Err(err);
        }
        Err(err) => {
            state.uploads.advance(
                &correlation_id,
                UploadStage::OsAutomation,
                &format!("form submission failed: {err}"),
            )?;
        }
    }

    // Stage 4: OS-level keystroke injection, only when explicitly enabled.
    if !state.config.os_automation_enabled {
        let err = ToolError::Forbidden;
        let _ = state.uploads.advance(
            &correlation_id,
            UploadStage::Error,
            "OS automation disabled by configuration",
        );
        return Err(err);
    }
    match os_automation::inject_os_automation(
        &state.security,
        &state.automation,
        &OsAutomationRequest {
            file_path: file_path.clone(),
            browser_pid: args.browser_pid.unwrap_or(0),
        },
    )
    .await
    {
        Ok(resp) => {
            state
                .uploads
                .advance(&correlation_id, UploadStage::Complete, "keystrokes injected")?;
            Ok(finish_upload(state, &correlation_id, resp))
        }
        Err(err) => {
            let _ = state
                .uploads
                .advance(&correlation_id, UploadStage::Error, &err.to_string());
            Err(err)
        }
    }
}

async fn stage1_drag_drop(
    state: &AppState,
    args: &InteractArgs,
    correlation_id: &str,
    file_path: &str,
    wait_budget: Duration,
) -> Result<StageResponse, ToolError> {
    let read = file_read::read_file(
        &state.security,
        &FileReadRequest {
            file_path: file_path.to_string(),
        },
    )
    .await?;

    let tracked = state.tracked.snapshot();
    if tracked.tab_id.is_none() {
        return Err(ToolError::NoData("no tracked tab for drag-drop".into()));
    }
    let command_id = state.pending.enqueue(
        CommandFamily::Upload.prefix(),
        "upload_drag_drop",
        tracked.tab_id,
        json!({
            "sessionId": correlation_id,
            "fileName": read.file_name,
            "fileSizeBytes": read.file_size_bytes,
            "mimeType": read.mime_type,
            "dataBase64": read.data_base64,
            "selector": args.selector,
            "submit": args.submit.unwrap_or(false),
        }),
        wait_budget,
    );
    await_extension(state, &command_id, wait_budget).await?;
    Ok(StageResponse {
        status: "dropped".into(),
        data_base64: None,
        ..read
    })
}

async fn stage2_dialog(
    state: &AppState,
    args: &InteractArgs,
    file_path: &str,
    wait_budget: Duration,
) -> Result<StageResponse, ToolError> {
    let pid = args.browser_pid.unwrap_or(0);
    let resp = upload::dialog::inject_dialog(
        &state.security,
        &state.pending,
        &DialogInjectRequest {
            file_path: file_path.to_string(),
            browser_pid: pid,
            tab_id: state.tracked.snapshot().tab_id,
            selector: args.selector.clone(),
        },
    )?;
    if let Some(command_id) = &resp.correlation_id {
        await_extension(state, command_id, wait_budget).await?;
    }
    Ok(StageResponse {
        status: "dialog_accepted".into(),
        ..resp
    })
}

async fn stage3_form(
    state: &AppState,
    args: &InteractArgs,
    file_path: &str,
) -> Result<Option<StageResponse>, ToolError> {
    let Some(url) = args.url.as_deref().filter(|u| !u.trim().is_empty()) else {
        return Ok(None);
    };
    let resp = form_submit::submit_form(
        &state.security,
        &state.http_client,
        &FormSubmitRequest {
            file_path: file_path.to_string(),
            url: url.to_string(),
            method: args.method.clone().unwrap_or_else(|| "POST".into()),
            field_name: args.name.clone().unwrap_or_else(|| "file".into()),
            cookie: args.cookie.clone(),
            csrf_token: args.csrf_token.clone(),
            fields: args.fields.clone().unwrap_or_default(),
            timeout_ms: None,
        },
    )
    .await?;
    Ok(Some(resp))
}

/// Wait for the extension to act on a queued stage command; maps an
/// expiry onto a recoverable timeout so the ladder can climb.
async fn await_extension(
    state: &AppState,
    command_id: &str,
    wait_budget: Duration,
) -> Result<Value, ToolError> {
    let snapshot = state
        .pending
        .wait(command_id, wait_budget)
        .await
        .ok_or_else(|| ToolError::Internal("pending query vanished".into()))?;
    match snapshot.state {
        QueryState::Complete => Ok(snapshot.result.unwrap_or(Value::Null)),
        QueryState::Error => Err(ToolError::from_extension(
            snapshot.error_kind.as_deref(),
            snapshot
                .error
                .unwrap_or_else(|| "extension reported failure".into()),
        )),
        // Queued, in flight, or expired: the extension never answered.
        _ => Err(ToolError::Timeout),
    }
}

fn finish_upload(state: &AppState, correlation_id: &str, resp: StageResponse) -> Value {
    let mut value = resp.to_value();
    if let Some(obj) = value.as_object_mut() {
        obj.insert(
            "correlation_id".into(),
            Value::String(correlation_id.to_string()),
        );
        if let Some(session) = state.uploads.get(correlation_id) {
            obj.insert(
                "escalation_log".into(),
                serde_json::to_value(&session.escalation_log).unwrap_or(Value::Null),
            );
            obj.insert(
                "progress_tier".into(),
                serde_json::to_value(session.progress_tier).unwrap_or(Value::Null),
            );
        }
        obj.insert("final".into(), Value::Bool(true));
    }
    value
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigureArgs {
    pub action: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub steps: Option<Vec<Value>>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub override_steps: Option<Vec<Value>>,
}

pub async fn configure(state: &AppState, args: ConfigureArgs) -> Result<Value, ToolError> {
    match args.action.as_str() {
        "save_macro" => {
            let name = args
                .name
                .as_deref()
                .ok_or_else(|| ToolError::MissingParam("name".into()))?;
            let steps = args
                .steps
                .clone()
                .ok_or_else(|| ToolError::MissingParam("steps".into()))?;
            let saved = state
                .macros
                .save(name, steps, args.tags.clone().unwrap_or_default())?;
            Ok(json!({ "saved": saved }))
        }
        "get_macro" => {
            let name = args
                .name
                .as_deref()
                .ok_or_else(|| ToolError::MissingParam("name".into()))?;
            Ok(json!({ "macro": state.macros.get(name)? }))
        }
        "list_macros" => Ok(json!({ "macros": state.macros.list(args.tag.as_deref()) })),
        "delete_macro" => {
            let name = args
                .name
                .as_deref()
                .ok_or_else(|| ToolError::MissingParam("name".into()))?;
            state.macros.delete(name)?;
            Ok(json!({ "deleted": name }))
        }
        "replay_macro" => replay_macro(state, &args).await,
        "tutorial" => Ok(tutorial()),
        "examples" => Ok(examples()),
        other => Err(ToolError::UnknownAction(other.to_string())),
    }
}

/// Expand a macro into queued commands, in step order, without waiting.
async fn replay_macro(state: &AppState, args: &ConfigureArgs) -> Result<Value, ToolError> {
    let name = args
        .name
        .as_deref()
        .ok_or_else(|| ToolError::MissingParam("name".into()))?;
    let stored = state.macros.get(name)?;
    let steps = args.override_steps.clone().unwrap_or(stored.steps);
    let mut queued = Vec::new();
    for (idx, step) in steps.into_iter().enumerate() {
        let mut step_args: InteractArgs =
            serde_json::from_value(step).map_err(|e| ToolError::InvalidParam {
                param: format!("steps[{idx}]"),
                reason: e.to_string(),
            })?;
        step_args.wait = Some(false);
        let result = interact(state, step_args).await?;
        queued.push(result);
    }
    Ok(json!({ "replayed": name, "commands": queued }))
}

fn tutorial() -> Value {
    json!({
        "tool_families": {
            "observe": "read captured telemetry and command results",
            "interact": "queue actions for the tracked tab",
            "configure": "manage macros and session settings",
        },
        "flow": [
            "observe pilot to confirm the extension is attached",
            "interact navigate / click / type to drive the page",
            "observe command_result with the returned correlation_id",
        ],
    })
}

fn examples() -> Value {
    json!({
        "observe": [
            { "what": "errors", "limit": 20 },
            { "what": "logs", "cursor": ":1", "level": "warn" },
            { "what": "command_result", "correlation_id": "nav_..." },
        ],
        "interact": [
            { "action": "navigate", "url": "https://example.com" },
            { "action": "click", "selector": "#submit" },
            { "action": "upload", "file_path": "/srv/uploads/report.pdf" },
        ],
        "configure": [
            { "action": "save_macro", "name": "login", "steps": [
                { "action": "type", "selector": "#user", "text": "dev" },
                { "action": "click", "selector": "#go" },
            ]},
            { "action": "replay_macro", "name": "login" },
        ],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_are_pinned() {
        let expected: [(CommandFamily, &str); 13] = [
            (CommandFamily::Navigate, "nav_"),
            (CommandFamily::Dom, "dom_"),
            (CommandFamily::DomList, "dom_list_"),
            (CommandFamily::Exec, "exec_"),
            (CommandFamily::Highlight, "highlight_"),
            (CommandFamily::Upload, "upload_"),
            (CommandFamily::Subtitle, "subtitle_"),
            (CommandFamily::Refresh, "refresh_"),
            (CommandFamily::Back, "back_"),
            (CommandFamily::Forward, "forward_"),
            (CommandFamily::NewTab, "newtab_"),
            (CommandFamily::RecordStart, "record_start_"),
            (CommandFamily::RecordStop, "record_stop_"),
        ];
        for (family, prefix) in expected {
            assert_eq!(family.prefix(), prefix);
        }
    }

    #[test]
    fn queued_outcome_shape() {
        let v = DispatchOutcome::Queued {
            correlation_id: "nav_abc".into(),
        }
        .to_value();
        assert_eq!(v["status"], "queued");
        assert_eq!(v["correlation_id"], "nav_abc");
        assert_eq!(v["final"], false);
    }

    #[test]
    fn unknown_interact_fields_are_rejected() {
        let err = serde_json::from_value::<InteractArgs>(serde_json::json!({
            "action": "click",
            "selector": "#x",
            "bogus": true,
        }))
        .unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn upload_args_carry_csrf_token_and_form_fields() {
        let args: InteractArgs = serde_json::from_value(serde_json::json!({
            "action": "upload",
            "file_path": "/srv/uploads/report.pdf",
            "url": "https://forms.example.com/submit",
            "csrf_token": "tok123",
            "fields": { "album": "holiday", "visibility": "private" },
        }))
        .unwrap();
        assert_eq!(args.csrf_token.as_deref(), Some("tok123"));
        let fields = args.fields.unwrap();
        assert_eq!(fields.get("album").map(String::as_str), Some("holiday"));
        assert_eq!(fields.len(), 2);
    }
}
