//! Request gates shared by every endpoint.
//!
//! Four checks run in order: loopback Host allowlist, Origin allowlist,
//! constant-time API-key comparison, and (on privileged routes) the
//! extension client header. Failures answer with a uniform JSON body so
//! callers never learn which check tripped beyond the status code.

use axum::extract::{Request, State};
use axum::http::header::{self, HeaderValue};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::AppState;

pub const API_KEY_HEADER: &str = "x-gasoline-key";
pub const CLIENT_HEADER: &str = "x-gasoline-client";
pub const EXTENSION_CLIENT: &str = "gasoline-extension";

fn unauthorized_body() -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": "unauthorized"}))
}

fn deny(status: StatusCode) -> Response {
    (status, unauthorized_body()).into_response()
}

/// Strip an optional `:port` suffix, handling bracketed IPv6 literals.
fn host_without_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        match rest.find(']') {
            Some(end) => return &host[..end + 2],
            None => return host,
        }
    }
    match host.rfind(':') {
        Some(idx) => &host[..idx],
        None => host,
    }
}

/// Only loopback hosts may address the daemon.
pub fn host_allowed(host: &str) -> bool {
    matches!(
        host_without_port(host.trim()),
        "localhost" | "127.0.0.1" | "[::1]"
    )
}

/// Origin policy: absent origins (curl, CLI tools) pass, localhost
/// variants pass, browser extensions pass, and a configured extension id
/// must match exactly.
pub fn origin_allowed(
    origin: &str,
    extension_id: Option<&str>,
    firefox_extension_id: Option<&str>,
) -> bool {
    if origin.is_empty() || origin == "null" {
        return true;
    }
    if let Some(rest) = origin
        .strip_prefix("http://")
        .or_else(|| origin.strip_prefix("https://"))
    {
        return host_allowed(rest);
    }
    if let Some(id) = origin.strip_prefix("chrome-extension://") {
        return match extension_id {
            Some(expected) => id == expected,
            None => !id.is_empty(),
        };
    }
    if let Some(id) = origin.strip_prefix("moz-extension://") {
        return match firefox_extension_id {
            Some(expected) => id == expected,
            None => !id.is_empty(),
        };
    }
    false
}

/// Constant-time equality over byte strings. Differing lengths fail, but
/// the loop still walks the longer input so timing does not reveal the
/// prefix length that matched.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let mut diff = a.len() ^ b.len();
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= (x ^ y) as usize;
    }
    diff == 0
}

fn api_key_ok(headers: &HeaderMap, configured: Option<&str>) -> bool {
    let Some(expected) = configured else {
        return true;
    };
    match headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        Some(presented) if !presented.is_empty() => {
            constant_time_eq(expected.as_bytes(), presented.as_bytes())
        }
        _ => false,
    }
}

/// Extension client gate: exact product token, optionally versioned.
pub fn extension_client_ok(value: Option<&str>) -> bool {
    match value {
        Some(v) => {
            v == EXTENSION_CLIENT
                || v
                    .strip_prefix("gasoline-extension/")
                    .is_some_and(|ver| !ver.is_empty())
        }
        None => false,
    }
}

/// Outer gate applied to every route.
pub async fn security_gate(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let headers = request.headers().clone();

    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !host_allowed(host) {
        tracing::debug!(host = %host, "rejected non-loopback host");
        return deny(StatusCode::FORBIDDEN);
    }

    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    if !origin_allowed(
        &origin,
        state.config.extension_id.as_deref(),
        state.config.firefox_extension_id.as_deref(),
    ) {
        tracing::debug!(origin = %origin, "rejected origin");
        return deny(StatusCode::FORBIDDEN);
    }

    // Preflight carries no custom headers; answer it once host and origin
    // pass, echoing only the accepted origin.
    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors(&mut response, &origin);
        return response;
    }

    if !api_key_ok(&headers, state.config.api_key.as_deref()) {
        return deny(StatusCode::UNAUTHORIZED);
    }

    let mut response = next.run(request).await;
    apply_cors(&mut response, &origin);
    response
}

fn apply_cors(response: &mut Response, origin: &str) {
    if origin.is_empty() || origin == "null" {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(origin) {
        let headers = response.headers_mut();
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, POST, OPTIONS"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("content-type, x-gasoline-key, x-gasoline-client"),
        );
    }
}

/// Inner gate for telemetry ingestion, command draining and the upload
/// plane: only the extension may call these.
pub async fn extension_gate(request: Request, next: Next) -> Response {
    let client = request
        .headers()
        .get(CLIENT_HEADER)
        .and_then(|v| v.to_str().ok());
    if !extension_client_ok(client) {
        return deny(StatusCode::FORBIDDEN);
    }
    next.run(request).await
}
