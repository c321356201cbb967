//! Core library for Gasoline. This module wires together the telemetry
//! buffers, the pending-command store, the upload escalation machinery
//! and the HTTP surface. It deliberately keeps every piece of mutable
//! state inside [`AppState`] so tests can build alternate worlds without
//! touching process globals.

mod config;
pub mod buffer;
pub mod clock;
pub mod cursor;
pub mod dispatch;
pub mod errors;
pub mod gate;
pub mod macros;
pub mod mcp;
pub mod observe;
pub mod pending;
pub mod platform;
pub mod recordings;
pub mod server;
pub mod tracked;
pub mod upload;

pub use config::AppConfig;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::buffer::{BufferSet, JsonlForwarder};
use crate::macros::MacroStore;
use crate::pending::PendingStore;
use crate::platform::{BrowserAutomation, NativeAutomation};
use crate::recordings::RecordingStore;
use crate::tracked::TrackedSession;
use crate::upload::security::UploadSecurityConfig;
use crate::upload::UploadCoordinator;

/// Request/error counters surfaced through `/health`.
#[derive(Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
    pub tool_errors_total: AtomicU64,
    pub commands_enqueued_total: AtomicU64,
}

impl Metrics {
    pub fn note_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_tool_error(&self) {
        self.tool_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_command(&self) {
        self.commands_enqueued_total.fetch_add(1, Ordering::Relaxed);
    }
}

/// Internal application state shared across handlers. Everything is
/// constructed once at startup by [`build_state`]; components receive
/// their configuration explicitly.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub security: Arc<UploadSecurityConfig>,
    pub buffers: Arc<BufferSet>,
    pub pending: Arc<PendingStore>,
    pub uploads: Arc<UploadCoordinator>,
    pub macros: Arc<MacroStore>,
    pub tracked: Arc<TrackedSession>,
    pub recordings: Arc<RecordingStore>,
    pub automation: Arc<dyn BrowserAutomation>,
    pub http_client: reqwest::Client,
    pub metrics: Arc<Metrics>,
    started: Instant,
    last_audit: Arc<Mutex<Vec<Value>>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl AppState {
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Store the latest security-audit findings, returning the previous
    /// batch for diffing.
    pub fn swap_last_audit(&self, findings: Vec<Value>) -> Vec<Value> {
        let mut guard = self.last_audit.lock().expect("audit mutex poisoned");
        std::mem::replace(&mut *guard, findings)
    }

    /// Stop background workers and drain the log forwarder.
    pub async fn shutdown(&self, deadline: Duration) {
        let _ = self.shutdown_tx.send(true);
        self.buffers.shutdown(deadline).await;
    }
}

/// Assemble the application state from a parsed configuration. The
/// automation backend is injectable so tests can substitute a scripted
/// double.
pub fn build_state_with_automation(
    config: AppConfig,
    automation: Arc<dyn BrowserAutomation>,
) -> anyhow::Result<AppState> {
    let security = Arc::new(config.upload_security()?);

    let forwarder = match JsonlForwarder::spawn(config.jsonl_path(), 1024) {
        Ok(fw) => Some(fw),
        Err(e) => {
            tracing::warn!(error = %e, "console log persistence disabled");
            None
        }
    };
    let buffers = Arc::new(BufferSet::new(config.max_log_entries, forwarder));

    let pending = Arc::new(PendingStore::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let _sweeper = pending::spawn_sweeper(pending.clone(), shutdown_rx);

    let macros = Arc::new(MacroStore::load(Some(config.macros_path())));
    let recordings = Arc::new(RecordingStore::new(
        config.recordings_dir(),
        config.legacy_recordings_dir(),
    ));

    let http_client = reqwest::Client::builder()
        .build()
        .map_err(|e| anyhow::anyhow!("failed to build HTTP client: {e}"))?;

    Ok(AppState {
        config: Arc::new(config),
        security,
        buffers,
        pending,
        uploads: Arc::new(UploadCoordinator::new()),
        macros,
        tracked: Arc::new(TrackedSession::new()),
        recordings,
        automation,
        http_client,
        metrics: Arc::new(Metrics::default()),
        started: Instant::now(),
        last_audit: Arc::new(Mutex::new(Vec::new())),
        shutdown_tx: Arc::new(shutdown_tx),
    })
}

pub fn build_state(config: AppConfig) -> anyhow::Result<AppState> {
    build_state_with_automation(config, Arc::new(NativeAutomation))
}

/// Build state from environment variables, mirroring the launcher's
/// exported flags.
pub fn build_state_from_env() -> anyhow::Result<AppState> {
    build_state(AppConfig::from_env()?)
}

const ONE_MIB: usize = 1024 * 1024;

/// Build the axum router. Extension-only routes sit behind the client
/// gate; everything shares the host/origin/key gate and the request
/// counters.
pub fn app(state: AppState) -> Router {
    let extension_routes = Router::new()
        .route("/logs", post(server::post_logs))
        .route("/network-waterfall", post(server::post_network_waterfall))
        .route("/network-bodies", post(server::post_network_bodies))
        .route("/websocket-events", post(server::post_websocket_events))
        .route("/enhanced-actions", post(server::post_enhanced_actions))
        .route("/extension-logs", post(server::post_extension_logs))
        .route("/sync", post(server::post_sync))
        .route("/commands", get(server::get_commands))
        .route("/command-result", post(server::post_command_result))
        .route(
            "/recordings/save",
            post(server::post_recording_save).layer(DefaultBodyLimit::max(64 * ONE_MIB)),
        )
        .route(
            "/api/file/read",
            post(server::post_file_read).layer(DefaultBodyLimit::max(ONE_MIB)),
        )
        .route(
            "/api/file/dialog/inject",
            post(server::post_dialog_inject).layer(DefaultBodyLimit::max(ONE_MIB)),
        )
        .route(
            "/api/form/submit",
            post(server::post_form_submit).layer(DefaultBodyLimit::max(10 * ONE_MIB)),
        )
        .route(
            "/api/os-automation/inject",
            post(server::post_os_automation_inject).layer(DefaultBodyLimit::max(ONE_MIB)),
        )
        .route(
            "/api/os-automation/dismiss",
            post(server::post_os_automation_dismiss).layer(DefaultBodyLimit::max(ONE_MIB)),
        )
        .layer(middleware::from_fn(gate::extension_gate));

    Router::new()
        .route("/mcp", post(mcp::handle))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .merge(extension_routes)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            gate::security_gate,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            count_requests,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(4 * ONE_MIB))
        .with_state(state)
}

async fn count_requests(State(state): State<AppState>, request: Request, next: Next) -> axum::response::Response {
    state.metrics.note_request();
    let response = next.run(request).await;
    if response.status().is_server_error() {
        state.metrics.note_error();
    }
    response
}

/// Health endpoint: liveness plus buffer utilization, drop counters,
/// command-plane counts and the startup warnings.
async fn health_handler(State(state): State<AppState>) -> axum::response::Response {
    let mut buffers = serde_json::Map::new();
    for buffer in state.buffers.all() {
        buffers.insert(
            buffer.name().to_string(),
            serde_json::json!({
                "len": buffer.len(),
                "capacity": buffer.capacity(),
                "utilization": buffer.utilization(),
                "dropped": buffer.dropped(),
                "totalAppended": buffer.total_appended(),
            }),
        );
    }
    let json = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": state.uptime().as_secs(),
        "port": state.config.port,
        "buffers": buffers,
        "forwarder": {
            "dropped": state.buffers.forwarder_dropped(),
            "writeErrors": state.buffers.forwarder_write_errors(),
        },
        "pending": state.pending.counts(),
        "requestsTotal": state.metrics.requests_total.load(Ordering::Relaxed),
        "errorsTotal": state.metrics.errors_total.load(Ordering::Relaxed),
        "toolErrorsTotal": state.metrics.tool_errors_total.load(Ordering::Relaxed),
        "commandsEnqueuedTotal": state.metrics.commands_enqueued_total.load(Ordering::Relaxed),
        "recordings": {
            "legacyShadowed": state.recordings.legacy_shadowed(),
        },
        "uploadDir": state.security.upload_dir_display(),
        "osAutomationEnabled": state.config.os_automation_enabled,
        "startupWarnings": state.config.startup_warnings.clone(),
    });
    (StatusCode::OK, Json(json)).into_response()
}

/// Prometheus-style metrics exposition. Text format with simple counters
/// and per-buffer gauges.
async fn metrics_handler(State(state): State<AppState>) -> axum::response::Response {
    let mut buf = String::new();
    use std::fmt::Write as _;
    let requests = state.metrics.requests_total.load(Ordering::Relaxed);
    let errors = state.metrics.errors_total.load(Ordering::Relaxed);
    let tool_errors = state.metrics.tool_errors_total.load(Ordering::Relaxed);
    let commands = state.metrics.commands_enqueued_total.load(Ordering::Relaxed);
    let pending = state.pending.counts();
    let uptime_secs = state.uptime().as_secs_f64();

    writeln!(
        &mut buf,
        "# HELP gasoline_requests_total Total HTTP requests received"
    )
    .ok();
    writeln!(&mut buf, "# TYPE gasoline_requests_total counter").ok();
    writeln!(&mut buf, "gasoline_requests_total {}", requests).ok();
    writeln!(
        &mut buf,
        "# HELP gasoline_errors_total Requests answered with a server error"
    )
    .ok();
    writeln!(&mut buf, "# TYPE gasoline_errors_total counter").ok();
    writeln!(&mut buf, "gasoline_errors_total {}", errors).ok();
    writeln!(
        &mut buf,
        "# HELP gasoline_tool_errors_total Tool calls answered with a structured error"
    )
    .ok();
    writeln!(&mut buf, "# TYPE gasoline_tool_errors_total counter").ok();
    writeln!(&mut buf, "gasoline_tool_errors_total {}", tool_errors).ok();
    writeln!(
        &mut buf,
        "# HELP gasoline_commands_enqueued_total Browser commands queued for the extension"
    )
    .ok();
    writeln!(&mut buf, "# TYPE gasoline_commands_enqueued_total counter").ok();
    writeln!(&mut buf, "gasoline_commands_enqueued_total {}", commands).ok();

    // Command plane state.
    writeln!(
        &mut buf,
        "# HELP gasoline_pending_commands Commands awaiting the extension by state\n# TYPE gasoline_pending_commands gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "gasoline_pending_commands{{state=\"queued\"}} {}",
        pending.queued
    )
    .ok();
    writeln!(
        &mut buf,
        "gasoline_pending_commands{{state=\"in_flight\"}} {}",
        pending.in_flight
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP gasoline_commands_completed_total Commands completed by the extension\n# TYPE gasoline_commands_completed_total counter"
    )
    .ok();
    writeln!(
        &mut buf,
        "gasoline_commands_completed_total {}",
        pending.completed_total
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP gasoline_commands_expired_total Commands expired by the timeout sweeper\n# TYPE gasoline_commands_expired_total counter"
    )
    .ok();
    writeln!(
        &mut buf,
        "gasoline_commands_expired_total {}",
        pending.expired_total
    )
    .ok();

    // Per-buffer gauges (HELP/TYPE once per family).
    writeln!(
        &mut buf,
        "# HELP gasoline_buffer_entries Entries currently held per telemetry buffer\n# TYPE gasoline_buffer_entries gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP gasoline_buffer_dropped_total Entries evicted per telemetry buffer\n# TYPE gasoline_buffer_dropped_total counter"
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP gasoline_buffer_utilization Fill ratio per telemetry buffer\n# TYPE gasoline_buffer_utilization gauge"
    )
    .ok();
    for buffer in state.buffers.all() {
        writeln!(
            &mut buf,
            "gasoline_buffer_entries{{buffer=\"{}\"}} {}",
            buffer.name(),
            buffer.len()
        )
        .ok();
        writeln!(
            &mut buf,
            "gasoline_buffer_dropped_total{{buffer=\"{}\"}} {}",
            buffer.name(),
            buffer.dropped()
        )
        .ok();
        writeln!(
            &mut buf,
            "gasoline_buffer_utilization{{buffer=\"{}\"}} {}",
            buffer.name(),
            buffer.utilization()
        )
        .ok();
    }

    // Forwarder and recordings.
    writeln!(
        &mut buf,
        "# HELP gasoline_forwarder_dropped_total Console lines dropped by the JSONL forwarder\n# TYPE gasoline_forwarder_dropped_total counter"
    )
    .ok();
    writeln!(
        &mut buf,
        "gasoline_forwarder_dropped_total {}",
        state.buffers.forwarder_dropped()
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP gasoline_forwarder_write_errors_total JSONL line write failures\n# TYPE gasoline_forwarder_write_errors_total counter"
    )
    .ok();
    writeln!(
        &mut buf,
        "gasoline_forwarder_write_errors_total {}",
        state.buffers.forwarder_write_errors()
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP gasoline_recordings_legacy_shadowed Legacy recordings hidden by a primary entry\n# TYPE gasoline_recordings_legacy_shadowed gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "gasoline_recordings_legacy_shadowed {}",
        state.recordings.legacy_shadowed()
    )
    .ok();

    // Build info gauge (value 1) and uptime.
    writeln!(
        &mut buf,
        "# HELP gasoline_build_info Build information\n# TYPE gasoline_build_info gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "gasoline_build_info{{version=\"{}\"}} 1",
        env!("CARGO_PKG_VERSION")
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP gasoline_process_uptime_seconds Process uptime seconds\n# TYPE gasoline_process_uptime_seconds gauge"
    )
    .ok();
    writeln!(&mut buf, "gasoline_process_uptime_seconds {}", uptime_secs).ok();

    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        buf,
    )
        .into_response()
}
