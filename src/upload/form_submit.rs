//! Stage 3: direct multipart form submission.
//!
//! The file is streamed into the request body through a producer task
//! feeding a byte stream the HTTP client consumes, so uploads never
//! buffer in memory. Dropping the caller's future cancels both ends.
//! Non-2xx statuses are classified into operator-actionable messages.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio_util::io::ReaderStream;

use crate::errors::ToolError;
use crate::upload::security::{self, UploadSecurityConfig};
use crate::upload::{progress_tier, StageResponse, UploadStage};

#[derive(Debug, Deserialize)]
pub struct FormSubmitRequest {
    pub file_path: String,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_field_name")]
    pub field_name: String,
    #[serde(default)]
    pub cookie: Option<String>,
    #[serde(default)]
    pub csrf_token: Option<String>,
    #[serde(default)]
    pub fields: HashMap<String, String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_field_name() -> String {
    "file".to_string()
}

const DEFAULT_SUBMIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Map a non-2xx status onto the message surfaced to the caller.
fn classify_status(status: reqwest::StatusCode) -> String {
    match status.as_u16() {
        401 => "HTTP 401: not authenticated".to_string(),
        403 => "HTTP 403: CSRF/forbidden".to_string(),
        422 => "HTTP 422: validation".to_string(),
        code => format!("HTTP {code}"),
    }
}

pub async fn submit_form(
    cfg: &UploadSecurityConfig,
    client: &reqwest::Client,
    req: &FormSubmitRequest,
) -> Result<StageResponse, ToolError> {
    let started = Instant::now();
    let validated = security::validate_path(cfg, &req.file_path, true)?;
    let url = security::validate_url(cfg, &req.url).await?;
    let method = security::validate_method(&req.method)?;
    if let Some(cookie) = &req.cookie {
        security::validate_cookie_header(cookie)?;
    }

    let file = tokio::fs::File::open(&validated.resolved)
        .await
        .map_err(|_| ToolError::NotFound(validated.resolved.display().to_string()))?;
    let meta = file
        .metadata()
        .await
        .map_err(|e| ToolError::Internal(format!("fstat failed: {e}")))?;
    let size = meta.len();
    let raw_name = validated
        .resolved
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload.bin".to_string());
    let file_name = security::sanitize_disposition(&raw_name);
    let field_name = security::sanitize_disposition(&req.field_name);
    let mime_type = mime_guess::from_path(&validated.resolved)
        .first_or_octet_stream()
        .essence_str()
        .to_string();

    // Producer: ReaderStream chunks the file; consumer: reqwest drains it
    // into the socket. Cancellation drops both sides together.
    let stream = ReaderStream::new(file);
    let part = reqwest::multipart::Part::stream_with_length(
        reqwest::Body::wrap_stream(stream),
        size,
    )
    .file_name(file_name.clone())
    .mime_str(&mime_type)
    .map_err(|e| ToolError::InvalidParam {
        param: "file_path".into(),
        reason: format!("unusable MIME type: {e}"),
    })?;

    let mut form = reqwest::multipart::Form::new();
    for (key, value) in &req.fields {
        form = form.text(security::sanitize_disposition(key), value.clone());
    }
    if let Some(token) = &req.csrf_token {
        form = form.text("csrf_token", token.clone());
    }
    let form = form.part(field_name, part);

    let timeout = req
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_SUBMIT_TIMEOUT);
    let mut request = client
        .request(method, url)
        .multipart(form)
        .timeout(timeout);
    if let Some(cookie) = &req.cookie {
        request = request.header(reqwest::header::COOKIE, cookie);
    }

    let response = match request.send().await {
        Ok(r) => r,
        Err(e) if e.is_timeout() => return Err(ToolError::Timeout),
        Err(e) => return Err(ToolError::Network(e.to_string())),
    };

    let status = response.status();
    if status.is_success() {
        Ok(StageResponse {
            success: true,
            stage: UploadStage::FormIntercept.number(),
            status: format!("HTTP {}", status.as_u16()),
            file_name,
            file_size_bytes: size,
            duration_ms: started.elapsed().as_millis() as u64,
            progress_tier: progress_tier(size),
            correlation_id: None,
            mime_type: Some(mime_type),
            data_base64: None,
            error: None,
            suggestions: None,
        })
    } else {
        let error = classify_status(status);
        let suggestions = match status.as_u16() {
            401 => Some(vec!["authenticate and retry".to_string()]),
            403 => Some(vec!["refresh the CSRF token and retry".to_string()]),
            422 => Some(vec!["check required form fields".to_string()]),
            _ => None,
        };
        Ok(StageResponse {
            success: false,
            stage: UploadStage::FormIntercept.number(),
            status: "failed".into(),
            file_name,
            file_size_bytes: size,
            duration_ms: started.elapsed().as_millis() as u64,
            progress_tier: progress_tier(size),
            correlation_id: None,
            mime_type: Some(mime_type),
            data_base64: None,
            error: Some(error),
            suggestions,
        })
    }
}
