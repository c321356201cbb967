//! The `observe` tool: read-only views over captured telemetry and the
//! command plane.
//!
//! Buffer-backed modes page with cursors; analyzer modes are pure
//! functions over buffer snapshots and never mutate anything. Unknown
//! modes fail loudly with `unknown_mode`.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::buffer::{websocket_status, LogEntry, TelemetryBuffer};
use crate::cursor::{self, Cursor};
use crate::errors::ToolError;
use crate::pending::QueryState;
use crate::AppState;

const DEFAULT_LIMIT: usize = 100;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObserveArgs {
    pub what: String,
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub tab_id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub since: Option<String>,
}

pub async fn observe(state: &AppState, args: ObserveArgs) -> Result<Value, ToolError> {
    match args.what.as_str() {
        "logs" => read_buffer(&state.buffers.logs, &args, None),
        "errors" => read_buffer(
            &state.buffers.logs,
            &args,
            Some(&|e: &LogEntry| e.level == "error"),
        ),
        "extension_logs" => read_buffer(&state.buffers.extension_logs, &args, None),
        "network_waterfall" => read_buffer(&state.buffers.network_waterfall, &args, None),
        "network_bodies" => network_bodies(state, &args),
        "websocket_events" => read_buffer(&state.buffers.websocket_events, &args, None),
        "websocket_status" => Ok(websocket_status(&state.buffers.websocket_events)),
        "actions" => read_buffer(&state.buffers.actions, &args, None),
        "performance" => read_buffer(&state.buffers.performance, &args, None),
        "vitals" => vitals(state),
        "changes" => read_buffer(
            &state.buffers.actions,
            &args,
            Some(&|e: &LogEntry| e.field_str("type") == Some("dom_change")),
        ),
        "history" => read_buffer(
            &state.buffers.actions,
            &args,
            Some(&|e: &LogEntry| e.field_str("type") == Some("navigation")),
        ),
        "timeline" => timeline(state, &args),
        "page" => page(state),
        "tabs" => tabs(state),
        "pilot" => pilot(state),
        "accessibility" => accessibility(state),
        "api" => api_summary(state),
        "error_clusters" => error_clusters(state),
        "error_bundles" => error_bundles(state),
        "security_audit" => Ok(security_audit(state)),
        "third_party_audit" => third_party_audit(state),
        "security_diff" => security_diff(state),
        "log_diff_report" => log_diff_report(state, &args),
        "command_result" => command_result(state, &args),
        "pending_commands" => Ok(json!({
            "commands": state.pending.pending_snapshot(),
        })),
        "failed_commands" => Ok(json!({
            "commands": state.pending.failed_snapshot(),
        })),
        "recordings" | "saved_videos" => Ok(json!({
            "recordings": state.recordings.list(),
            "legacyShadowed": state.recordings.legacy_shadowed(),
        })),
        "recording_actions" => recording_field(state, &args, "actions"),
        "playback_results" => recording_field(state, &args, "playback"),
        other => Err(ToolError::UnknownMode(other.to_string())),
    }
}

fn parse_cursor(args: &ObserveArgs) -> Result<Cursor, ToolError> {
    cursor::parse(args.cursor.as_deref().unwrap_or(""))
}

fn read_buffer(
    buffer: &TelemetryBuffer,
    args: &ObserveArgs,
    base_filter: Option<&dyn Fn(&LogEntry) -> bool>,
) -> Result<Value, ToolError> {
    let cur = parse_cursor(args)?;
    let limit = args.limit.unwrap_or(DEFAULT_LIMIT);
    let level = args.level.clone();
    let tab_id = args.tab_id;
    let combined = |e: &LogEntry| -> bool {
        if let Some(f) = base_filter {
            if !f(e) {
                return false;
            }
        }
        if let Some(level) = &level {
            if &e.level != level {
                return false;
            }
        }
        if let Some(tab) = tab_id {
            if e.tab_id != Some(tab) {
                return false;
            }
        }
        true
    };
    let (entries, next) = buffer.read(&cur, limit, Some(&combined));
    Ok(json!({
        "entries": entries,
        "next_cursor": cursor::build(&next.ts, next.seq),
        "dropped": buffer.dropped(),
    }))
}

fn network_bodies(state: &AppState, args: &ObserveArgs) -> Result<Value, ToolError> {
    if let Some(url) = &args.url {
        return match state.buffers.body_for_url(url) {
            Some(entry) => Ok(json!({ "entries": [entry] })),
            None => Err(ToolError::NoData(format!("no captured body for {url}"))),
        };
    }
    read_buffer(&state.buffers.network_bodies, args, None)
}

fn vitals(state: &AppState) -> Result<Value, ToolError> {
    state
        .buffers
        .performance
        .last_where(|e| e.field("vitals").is_some())
        .map(|e| json!({ "vitals": e.field("vitals"), "ts": e.ts }))
        .ok_or_else(|| ToolError::NoData("no performance vitals captured yet".into()))
}

fn page(state: &AppState) -> Result<Value, ToolError> {
    let tracked = state.tracked.snapshot();
    if tracked.tab_id.is_none() {
        return Err(ToolError::NoTrackedTab);
    }
    Ok(json!({
        "tabId": tracked.tab_id,
        "url": tracked.url,
        "title": tracked.title,
        "page": tracked.page,
        "lastSyncAt": tracked.last_sync_at,
    }))
}

fn tabs(state: &AppState) -> Result<Value, ToolError> {
    let tracked = state.tracked.snapshot();
    Ok(json!({
        "trackedTabId": tracked.tab_id,
        "tabs": tracked.tabs,
    }))
}

fn pilot(state: &AppState) -> Result<Value, ToolError> {
    let tracked = state.tracked.snapshot();
    Ok(json!({
        "enabled": tracked.pilot,
        "trackedTabId": tracked.tab_id,
        "recordingState": tracked.recording_state,
    }))
}

fn accessibility(state: &AppState) -> Result<Value, ToolError> {
    let tracked = state.tracked.snapshot();
    match tracked.page.as_ref().and_then(|p| p.get("accessibility")) {
        Some(a11y) => Ok(json!({ "accessibility": a11y, "url": tracked.url })),
        None => Err(ToolError::NoData(
            "no accessibility snapshot in the last page sync".into(),
        )),
    }
}

/// Group the waterfall by method + normalized path and summarize timing.
fn api_summary(state: &AppState) -> Result<Value, ToolError> {
    let (entries, _) = state
        .buffers
        .network_waterfall
        .read(&Cursor::zero(), usize::MAX, None);
    if entries.is_empty() {
        return Err(ToolError::NoData("no network activity captured yet".into()));
    }
    let mut groups: BTreeMap<String, (u64, f64, u64)> = BTreeMap::new();
    for e in &entries {
        let method = e.field_str("method").unwrap_or("GET");
        let path = e
            .field_str("url")
            .and_then(|u| url::Url::parse(u).ok())
            .map(|u| u.path().to_string())
            .unwrap_or_else(|| "/".into());
        let duration = e.field("durationMs").and_then(Value::as_f64).unwrap_or(0.0);
        let failed = e
            .field("status")
            .and_then(Value::as_u64)
            .is_some_and(|s| s >= 400);
        let slot = groups.entry(format!("{method} {path}")).or_insert((0, 0.0, 0));
        slot.0 += 1;
        slot.1 += duration;
        if failed {
            slot.2 += 1;
        }
    }
    let endpoints: Vec<Value> = groups
        .into_iter()
        .map(|(endpoint, (count, total_ms, failures))| {
            json!({
                "endpoint": endpoint,
                "count": count,
                "avgDurationMs": total_ms / count as f64,
                "failures": failures,
            })
        })
        .collect();
    Ok(json!({ "endpoints": endpoints }))
}

/// Strip digits so retry storms of the same message cluster together.
fn normalize_message(msg: &str) -> String {
    msg.chars()
        .map(|c| if c.is_ascii_digit() { '#' } else { c })
        .take(160)
        .collect()
}

fn error_clusters(state: &AppState) -> Result<Value, ToolError> {
    let (entries, _) = state.buffers.logs.read(
        &Cursor::zero(),
        usize::MAX,
        Some(&|e: &LogEntry| e.level == "error"),
    );
    let mut clusters: BTreeMap<String, (u64, String)> = BTreeMap::new();
    for e in &entries {
        let key = normalize_message(&e.message);
        let slot = clusters.entry(key).or_insert((0, e.ts.clone()));
        slot.0 += 1;
        slot.1 = e.ts.clone();
    }
    let mut out: Vec<Value> = clusters
        .into_iter()
        .map(|(pattern, (count, last_seen))| {
            json!({ "pattern": pattern, "count": count, "lastSeen": last_seen })
        })
        .collect();
    out.sort_by(|a, b| b["count"].as_u64().cmp(&a["count"].as_u64()));
    Ok(json!({ "clusters": out }))
}

/// Attach network activity within a two-second window around each error.
fn error_bundles(state: &AppState) -> Result<Value, ToolError> {
    let (errors, _) = state.buffers.logs.read(
        &Cursor::zero(),
        usize::MAX,
        Some(&|e: &LogEntry| e.level == "error"),
    );
    let (network, _) = state
        .buffers
        .network_waterfall
        .read(&Cursor::zero(), usize::MAX, None);
    let bundles: Vec<Value> = errors
        .iter()
        .map(|err| {
            let err_ts = crate::clock::parse_rfc3339(&err.ts);
            let nearby: Vec<&LogEntry> = network
                .iter()
                .filter(|n| match (err_ts, crate::clock::parse_rfc3339(&n.ts)) {
                    (Some(a), Some(b)) => (a - b).num_seconds().abs() <= 2,
                    _ => false,
                })
                .collect();
            json!({
                "error": err,
                "nearbyNetwork": nearby,
            })
        })
        .collect();
    Ok(json!({ "bundles": bundles }))
}

/// Lightweight page-security findings from captured traffic.
fn security_audit(state: &AppState) -> Value {
    let (waterfall, _) = state
        .buffers
        .network_waterfall
        .read(&Cursor::zero(), usize::MAX, None);
    let mut findings: Vec<Value> = Vec::new();
    for e in &waterfall {
        if let Some(url) = e.field_str("url") {
            if url.starts_with("http://") {
                findings.push(json!({
                    "kind": "plaintext_http",
                    "url": url,
                }));
            }
            if let Ok(parsed) = url::Url::parse(url) {
                if parsed.query().is_some_and(|q| {
                    let q = q.to_ascii_lowercase();
                    q.contains("token=") || q.contains("key=") || q.contains("secret=")
                }) {
                    findings.push(json!({
                        "kind": "credential_in_query",
                        "url": url,
                    }));
                }
            }
        }
        if let Some(headers) = e.field("responseHeaders").and_then(Value::as_object) {
            let has_csp = headers
                .keys()
                .any(|k| k.eq_ignore_ascii_case("content-security-policy"));
            let is_document = e.field_str("resourceType") == Some("document");
            if is_document && !has_csp {
                findings.push(json!({
                    "kind": "missing_csp",
                    "url": e.field_str("url"),
                }));
            }
            for (k, v) in headers {
                if k.eq_ignore_ascii_case("set-cookie") {
                    let cookie = v.as_str().unwrap_or("").to_ascii_lowercase();
                    if !cookie.contains("httponly") || !cookie.contains("secure") {
                        findings.push(json!({
                            "kind": "weak_cookie_flags",
                            "url": e.field_str("url"),
                        }));
                    }
                }
            }
        }
    }
    json!({ "findings": findings, "scanned": waterfall.len() })
}

fn third_party_audit(state: &AppState) -> Result<Value, ToolError> {
    let tracked = state.tracked.snapshot();
    let page_host = tracked
        .url
        .as_deref()
        .and_then(|u| url::Url::parse(u).ok())
        .and_then(|u| u.host_str().map(|h| h.to_string()));
    let (waterfall, _) = state
        .buffers
        .network_waterfall
        .read(&Cursor::zero(), usize::MAX, None);
    if waterfall.is_empty() {
        return Err(ToolError::NoData("no network activity captured yet".into()));
    }
    let mut hosts: BTreeMap<String, u64> = BTreeMap::new();
    for e in &waterfall {
        if let Some(host) = e
            .field_str("url")
            .and_then(|u| url::Url::parse(u).ok())
            .and_then(|u| u.host_str().map(|h| h.to_string()))
        {
            if Some(&host) != page_host.as_ref() {
                *hosts.entry(host).or_insert(0) += 1;
            }
        }
    }
    let third_parties: Vec<Value> = hosts
        .into_iter()
        .map(|(host, count)| json!({ "host": host, "requests": count }))
        .collect();
    Ok(json!({
        "pageHost": page_host,
        "thirdParties": third_parties,
    }))
}

/// Diff the current audit against the previous call's, then store it.
fn security_diff(state: &AppState) -> Result<Value, ToolError> {
    let current = security_audit(state);
    let current_findings: Vec<Value> = current["findings"].as_array().cloned().unwrap_or_default();
    let previous = state.swap_last_audit(current_findings.clone());
    let added: Vec<&Value> = current_findings
        .iter()
        .filter(|f| !previous.contains(f))
        .collect();
    let resolved: Vec<&Value> = previous
        .iter()
        .filter(|f| !current_findings.contains(f))
        .collect();
    Ok(json!({
        "added": added,
        "resolved": resolved,
        "total": current_findings.len(),
    }))
}

/// Summarize log volume by level since a baseline cursor.
fn log_diff_report(state: &AppState, args: &ObserveArgs) -> Result<Value, ToolError> {
    let baseline = cursor::parse(args.since.as_deref().unwrap_or(""))?;
    let (entries, next) = state.buffers.logs.read(&baseline, usize::MAX, None);
    let mut by_level: BTreeMap<String, u64> = BTreeMap::new();
    for e in &entries {
        *by_level.entry(e.level.clone()).or_insert(0) += 1;
    }
    Ok(json!({
        "since": args.since.clone().unwrap_or_default(),
        "next_cursor": cursor::build(&next.ts, next.seq),
        "total": entries.len(),
        "byLevel": by_level,
    }))
}

fn command_result(state: &AppState, args: &ObserveArgs) -> Result<Value, ToolError> {
    let id = args
        .correlation_id
        .as_deref()
        .ok_or_else(|| ToolError::MissingParam("correlation_id".into()))?;
    let snap = state
        .pending
        .get(id)
        .ok_or_else(|| ToolError::NotFound(format!("correlation id {id}")))?;
    match snap.state {
        QueryState::Expired => Err(ToolError::CommandTimeout {
            command: snap.command_type.clone(),
        }),
        QueryState::Error => Err(ToolError::from_extension(
            snap.error_kind.as_deref(),
            snap.error.unwrap_or_else(|| "extension reported failure".into()),
        )),
        current => Ok(json!({
            "correlation_id": snap.correlation_id,
            "state": current,
            "result": snap.result,
            "final": current.is_terminal(),
        })),
    }
}

fn recording_field(state: &AppState, args: &ObserveArgs, field: &str) -> Result<Value, ToolError> {
    let name = args
        .name
        .as_deref()
        .ok_or_else(|| ToolError::MissingParam("name".into()))?;
    let meta = state.recordings.meta(name)?;
    match meta.get(field) {
        Some(v) => {
            let mut out = serde_json::Map::new();
            out.insert("name".into(), Value::String(name.to_string()));
            out.insert(field.to_string(), v.clone());
            Ok(Value::Object(out))
        }
        None => Err(ToolError::NoData(format!(
            "recording {name} has no {field} metadata"
        ))),
    }
}

/// Merge logs, actions and network activity into one chronological view.
fn timeline(state: &AppState, args: &ObserveArgs) -> Result<Value, ToolError> {
    let limit = args.limit.unwrap_or(DEFAULT_LIMIT);
    let mut merged: Vec<(String, &'static str, LogEntry)> = Vec::new();
    for (family, buffer) in [
        ("log", &state.buffers.logs),
        ("action", &state.buffers.actions),
        ("network", &state.buffers.network_waterfall),
    ] {
        let (entries, _) = buffer.read(&Cursor::zero(), usize::MAX, None);
        for e in entries {
            merged.push((e.ts.clone(), family, e));
        }
    }
    merged.sort_by(|a, b| a.0.cmp(&b.0));
    let events: Vec<Value> = merged
        .into_iter()
        .rev()
        .take(limit)
        .rev()
        .map(|(_, family, e)| json!({ "family": family, "entry": e }))
        .collect();
    Ok(json!({ "events": events }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_normalization_buckets_retries() {
        assert_eq!(
            normalize_message("failed after 3 retries (id 4812)"),
            "failed after # retries (id ####)"
        );
    }
}
