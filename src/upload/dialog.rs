//! Stage 2: synthetic file-dialog injection driven by the extension.
//!
//! The daemon validates the path under the scoped upload directory,
//! then queues a command for the extension to intercept the page's file
//! input and feed it the file. The heavy lifting happens in the page;
//! this side only gates and enqueues.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::json;

use crate::errors::ToolError;
use crate::pending::PendingStore;
use crate::upload::security::{self, UploadSecurityConfig};
use crate::upload::{progress_tier, StageResponse, UploadStage};

#[derive(Debug, Deserialize)]
pub struct DialogInjectRequest {
    pub file_path: String,
    #[serde(default)]
    pub browser_pid: u32,
    #[serde(default)]
    pub tab_id: Option<i64>,
    #[serde(default)]
    pub selector: Option<String>,
}

const DIALOG_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

pub fn inject_dialog(
    cfg: &UploadSecurityConfig,
    pending: &Arc<PendingStore>,
    req: &DialogInjectRequest,
) -> Result<StageResponse, ToolError> {
    let started = Instant::now();
    let validated = security::validate_path(cfg, &req.file_path, true)?;
    if req.browser_pid == 0 {
        return Err(ToolError::PidNotFound(
            "stage 2 requires a positive browser_pid".into(),
        ));
    }

    let meta = std::fs::metadata(&validated.resolved)
        .map_err(|_| ToolError::NotFound(validated.resolved.display().to_string()))?;
    let size = meta.len();
    let file_name = validated
        .resolved
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| req.file_path.clone());

    let correlation_id = pending.enqueue(
        "upload_",
        "upload_dialog_inject",
        req.tab_id,
        json!({
            "filePath": validated.resolved.display().to_string(),
            "fileName": file_name,
            "fileSizeBytes": size,
            "browserPid": req.browser_pid,
            "selector": req.selector,
        }),
        DIALOG_COMMAND_TIMEOUT,
    );

    Ok(StageResponse {
        success: true,
        stage: UploadStage::FileDialog.number(),
        status: "queued".into(),
        file_name,
        file_size_bytes: size,
        duration_ms: started.elapsed().as_millis() as u64,
        progress_tier: progress_tier(size),
        correlation_id: Some(correlation_id),
        mime_type: None,
        data_base64: None,
        error: None,
        suggestions: None,
    })
}
