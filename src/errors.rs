//! Error taxonomy for the daemon.
//!
//! Every user-visible failure carries a stable string code so the
//! orchestration client can branch on it without parsing prose. The
//! HTTP layer maps codes onto statuses; the tool layer wraps them into
//! `{error, message, retry}` payloads.

use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("invalid JSON payload: {0}")]
    InvalidJson(String),
    #[error("missing required parameter: {0}")]
    MissingParam(String),
    #[error("invalid parameter {param}: {reason}")]
    InvalidParam { param: String, reason: String },
    #[error("unknown observe mode: {0}")]
    UnknownMode(String),
    #[error("unknown interact action: {0}")]
    UnknownAction(String),
    #[error("pilot is disabled in the extension")]
    PilotDisabled,
    #[error("no tracked tab")]
    NoTrackedTab,
    #[error("no data: {0}")]
    NoData(String),
    #[error("stale element id: {0}")]
    StaleElementId(String),
    #[error("element not found: {0}")]
    ElementNotFound(String),
    #[error("ambiguous target: {0}")]
    AmbiguousTarget(String),
    #[error("scope not found: {0}")]
    ScopeNotFound(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("path denied by {pattern}")]
    PathDenied {
        pattern: String,
        upload_dir: Option<String>,
    },
    #[error("upload directory not configured")]
    UploadDirRequired,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("too large: {0}")]
    TooLarge(String),
    #[error("blocked by SSRF policy: {0}")]
    SsrfBlocked(String),
    #[error("header injection detected in {0}")]
    HeaderInjection(String),
    #[error("timed out")]
    Timeout,
    #[error("{command} command timed out")]
    CommandTimeout { command: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("unsupported operating system: {0}")]
    UnsupportedOs(String),
    #[error("browser process not found: {0}")]
    PidNotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ToolError {
    /// Rehydrate an error the extension reported for a queued command.
    /// Known state codes keep their identity; everything else lands in
    /// the generic network bucket.
    pub fn from_extension(code: Option<&str>, message: String) -> ToolError {
        match code {
            Some("stale_element_id") => ToolError::StaleElementId(message),
            Some("element_not_found") => ToolError::ElementNotFound(message),
            Some("ambiguous_target") => ToolError::AmbiguousTarget(message),
            Some("scope_not_found") => ToolError::ScopeNotFound(message),
            Some("pilot_disabled") => ToolError::PilotDisabled,
            Some("no_tracked_tab") => ToolError::NoTrackedTab,
            Some("no_data") => ToolError::NoData(message),
            _ => ToolError::Network(message),
        }
    }

    /// Stable machine-readable code. These strings are part of the wire
    /// contract and must never change.
    pub fn code(&self) -> &'static str {
        match self {
            ToolError::InvalidJson(_) => "invalid_json",
            ToolError::MissingParam(_) => "missing_param",
            ToolError::InvalidParam { .. } => "invalid_param",
            ToolError::UnknownMode(_) => "unknown_mode",
            ToolError::UnknownAction(_) => "unknown_action",
            ToolError::PilotDisabled => "pilot_disabled",
            ToolError::NoTrackedTab => "no_tracked_tab",
            ToolError::NoData(_) => "no_data",
            ToolError::StaleElementId(_) => "stale_element_id",
            ToolError::ElementNotFound(_) => "element_not_found",
            ToolError::AmbiguousTarget(_) => "ambiguous_target",
            ToolError::ScopeNotFound(_) => "scope_not_found",
            ToolError::Unauthorized => "unauthorized",
            ToolError::Forbidden => "forbidden",
            ToolError::PathDenied { .. } => "path_denied",
            ToolError::UploadDirRequired => "upload_dir_required",
            ToolError::NotFound(_) => "not_found",
            ToolError::PermissionDenied(_) => "permission_denied",
            ToolError::TooLarge(_) => "too_large",
            ToolError::SsrfBlocked(_) => "ssrf_blocked",
            ToolError::HeaderInjection(_) => "header_injection",
            ToolError::Timeout => "timeout",
            ToolError::CommandTimeout { .. } => "timeout",
            ToolError::Network(_) => "network",
            ToolError::UnsupportedOs(_) => "unsupported_os",
            ToolError::PidNotFound(_) => "pid_not_found",
            ToolError::Internal(_) => "internal",
        }
    }

    /// Short operational hint for the caller. Kept imperative and brief.
    pub fn retry_hint(&self) -> Option<String> {
        let hint = match self {
            ToolError::InvalidJson(_) => "fix the request body and retry",
            ToolError::MissingParam(p) => return Some(format!("supply {} and retry", p)),
            ToolError::InvalidParam { param, .. } => {
                return Some(format!("correct {} and retry", param))
            }
            ToolError::UnknownMode(_) => "pick a mode from tools/list",
            ToolError::UnknownAction(_) => "pick an action from tools/list",
            ToolError::PilotDisabled => "enable pilot in the extension",
            ToolError::NoTrackedTab => "open a page with the extension attached",
            ToolError::StaleElementId(_) | ToolError::ElementNotFound(_) => "element re-query",
            ToolError::AmbiguousTarget(_) => "narrow the selector and retry",
            ToolError::ScopeNotFound(_) => "re-list scopes and retry",
            ToolError::PathDenied { .. } => "choose a file outside protected locations",
            ToolError::UploadDirRequired => "check --upload-dir",
            ToolError::NotFound(_) => "verify the path exists",
            ToolError::PermissionDenied(_) => "check file permissions",
            ToolError::TooLarge(_) => "reduce the payload size",
            ToolError::SsrfBlocked(_) => "target a public, non-internal host",
            ToolError::HeaderInjection(_) => "strip control characters and retry",
            ToolError::Timeout => "reissue the command",
            ToolError::CommandTimeout { command } => {
                return Some(format!("reissue {command}"))
            }
            ToolError::Network(_) => "check connectivity and retry",
            ToolError::UnsupportedOs(_) => "use a supported platform or an earlier stage",
            ToolError::PidNotFound(_) => "pass browser_pid explicitly",
            _ => return None,
        };
        Some(hint.to_string())
    }

    /// HTTP status for the REST surface.
    pub fn http_status(&self) -> StatusCode {
        match self {
            ToolError::InvalidJson(_)
            | ToolError::MissingParam(_)
            | ToolError::InvalidParam { .. }
            | ToolError::UnknownMode(_)
            | ToolError::UnknownAction(_) => StatusCode::BAD_REQUEST,
            ToolError::Unauthorized => StatusCode::UNAUTHORIZED,
            ToolError::Forbidden
            | ToolError::PathDenied { .. }
            | ToolError::UploadDirRequired
            | ToolError::SsrfBlocked(_)
            | ToolError::HeaderInjection(_) => StatusCode::FORBIDDEN,
            ToolError::NotFound(_) => StatusCode::NOT_FOUND,
            ToolError::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ToolError::PilotDisabled
            | ToolError::NoTrackedTab
            | ToolError::NoData(_)
            | ToolError::StaleElementId(_)
            | ToolError::ElementNotFound(_)
            | ToolError::AmbiguousTarget(_)
            | ToolError::ScopeNotFound(_)
            | ToolError::Timeout
            | ToolError::CommandTimeout { .. } => StatusCode::CONFLICT,
            ToolError::UnsupportedOs(_) | ToolError::PidNotFound(_) => {
                StatusCode::NOT_IMPLEMENTED
            }
            ToolError::PermissionDenied(_)
            | ToolError::Network(_)
            | ToolError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Structured payload carried to the tool caller.
    pub fn to_json(&self) -> serde_json::Value {
        let mut body = serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
        });
        if let Some(retry) = self.retry_hint() {
            body["retry"] = serde_json::Value::String(retry);
        }
        if let ToolError::PathDenied {
            pattern,
            upload_dir,
        } = self
        {
            body["pattern"] = serde_json::Value::String(pattern.clone());
            if let Some(dir) = upload_dir {
                body["upload_dir"] = serde_json::Value::String(dir.clone());
            }
        }
        body
    }
}
