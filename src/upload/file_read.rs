//! Stage 1: validated file read.
//!
//! The pipeline runs without the scoped upload directory here; Stage 1
//! only reads. The open handle is fstat-ed so the checks and the read
//! target the same inode, closing the classic check-then-open race.

use std::time::Instant;

use base64::Engine;
use serde::Deserialize;
use tokio::io::AsyncReadExt;

use crate::errors::ToolError;
use crate::upload::security::{self, UploadSecurityConfig};
use crate::upload::{progress_tier, StageResponse, UploadStage, INLINE_BASE64_MAX};

#[derive(Debug, Deserialize)]
pub struct FileReadRequest {
    pub file_path: String,
}

/// Read a file for the synthetic drag-drop stage. Files up to the inline
/// cap come back base64-encoded; larger files return metadata only.
pub async fn read_file(
    cfg: &UploadSecurityConfig,
    req: &FileReadRequest,
) -> Result<StageResponse, ToolError> {
    let started = Instant::now();
    let validated = security::validate_path(cfg, &req.file_path, false)?;

    let mut file = tokio::fs::File::open(&validated.resolved)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => {
                ToolError::PermissionDenied(validated.resolved.display().to_string())
            }
            _ => ToolError::NotFound(validated.resolved.display().to_string()),
        })?;
    // fstat on the handle we will read from, not the path.
    let meta = file
        .metadata()
        .await
        .map_err(|e| ToolError::Internal(format!("fstat failed: {e}")))?;
    if meta.is_dir() {
        return Err(ToolError::InvalidParam {
            param: "file_path".into(),
            reason: "is a directory".into(),
        });
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        if meta.nlink() > 1 {
            return Err(ToolError::PathDenied {
                pattern: "hardlinked file".into(),
                upload_dir: cfg.upload_dir_display(),
            });
        }
    }

    let size = meta.len();
    let file_name = validated
        .resolved
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| req.file_path.clone());
    let mime_type = mime_guess::from_path(&validated.resolved)
        .first_or_octet_stream()
        .essence_str()
        .to_string();

    let data_base64 = if size <= INLINE_BASE64_MAX {
        let mut buf = Vec::with_capacity(size as usize);
        file.read_to_end(&mut buf)
            .await
            .map_err(|e| ToolError::Internal(format!("read failed: {e}")))?;
        Some(base64::engine::general_purpose::STANDARD.encode(&buf))
    } else {
        None
    };

    Ok(StageResponse {
        success: true,
        stage: UploadStage::DragDrop.number(),
        status: if data_base64.is_some() {
            "read".into()
        } else {
            "metadata_only".into()
        },
        file_name,
        file_size_bytes: size,
        duration_ms: started.elapsed().as_millis() as u64,
        progress_tier: progress_tier(size),
        correlation_id: None,
        mime_type: Some(mime_type),
        data_base64,
        error: None,
        suggestions: None,
    })
}
