//! Stage 4: OS-level keystroke injection.
//!
//! The most invasive stage: type the validated path straight into the
//! browser's native file dialog. Gated behind an explicit config flag,
//! stricter path character rules, and the full security pipeline with
//! the scoped upload directory.

use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;

use crate::errors::ToolError;
use crate::platform::BrowserAutomation;
use crate::upload::security::{self, UploadSecurityConfig};
use crate::upload::{progress_tier, StageResponse, UploadStage};

#[derive(Debug, Deserialize)]
pub struct OsAutomationRequest {
    pub file_path: String,
    #[serde(default)]
    pub browser_pid: u32,
}

pub async fn inject_os_automation(
    cfg: &UploadSecurityConfig,
    automation: &Arc<dyn BrowserAutomation>,
    req: &OsAutomationRequest,
) -> Result<StageResponse, ToolError> {
    let started = Instant::now();
    security::validate_automation_path(&req.file_path)?;
    let validated = security::validate_path(cfg, &req.file_path, true)?;

    let pid = if req.browser_pid > 0 {
        req.browser_pid
    } else {
        automation.detect_browser_pid().await?
    };

    let meta = std::fs::metadata(&validated.resolved)
        .map_err(|_| ToolError::NotFound(validated.resolved.display().to_string()))?;
    let size = meta.len();
    let file_name = validated
        .resolved
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| req.file_path.clone());

    automation
        .inject_path(pid, &validated.resolved.to_string_lossy())
        .await?;

    Ok(StageResponse {
        success: true,
        stage: UploadStage::OsAutomation.number(),
        status: "injected".into(),
        file_name,
        file_size_bytes: size,
        duration_ms: started.elapsed().as_millis() as u64,
        progress_tier: progress_tier(size),
        correlation_id: None,
        mime_type: None,
        data_base64: None,
        error: None,
        suggestions: None,
    })
}

pub async fn dismiss_dialog(
    automation: &Arc<dyn BrowserAutomation>,
    browser_pid: u32,
) -> Result<(), ToolError> {
    let pid = if browser_pid > 0 {
        browser_pid
    } else {
        automation.detect_browser_pid().await?
    };
    automation.dismiss_dialog(pid).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::ScriptedAutomation;

    fn setup() -> (tempfile::TempDir, UploadSecurityConfig) {
        let tmp = tempfile::tempdir().unwrap();
        let uploads = tmp.path().canonicalize().unwrap().join("uploads");
        std::fs::create_dir_all(&uploads).unwrap();
        let cfg = UploadSecurityConfig::new(
            Some(uploads),
            &[],
            Vec::new(),
            Some(tmp.path().to_path_buf()),
        )
        .unwrap();
        (tmp, cfg)
    }

    #[tokio::test]
    async fn injects_with_detected_pid() {
        let (_tmp, cfg) = setup();
        let path = cfg.upload_dir.clone().unwrap().join("report.csv");
        std::fs::write(&path, "a,b").unwrap();
        let automation: Arc<dyn BrowserAutomation> = Arc::new(ScriptedAutomation {
            pid: Some(77),
            ..Default::default()
        });
        let resp = inject_os_automation(
            &cfg,
            &automation,
            &OsAutomationRequest {
                file_path: path.to_string_lossy().into_owned(),
                browser_pid: 0,
            },
        )
        .await
        .unwrap();
        assert!(resp.success);
        assert_eq!(resp.stage, 4);
        assert_eq!(resp.file_name, "report.csv");
    }

    #[tokio::test]
    async fn backtick_paths_never_reach_the_pipeline() {
        let (_tmp, cfg) = setup();
        let automation: Arc<dyn BrowserAutomation> =
            Arc::new(ScriptedAutomation::default());
        let err = inject_os_automation(
            &cfg,
            &automation,
            &OsAutomationRequest {
                file_path: "/srv/uploads/evil`rm -rf`.txt".into(),
                browser_pid: 5,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "invalid_param");
    }

    #[tokio::test]
    async fn missing_pid_detection_surfaces_guidance() {
        let (_tmp, cfg) = setup();
        let path = cfg.upload_dir.clone().unwrap().join("a.txt");
        std::fs::write(&path, "x").unwrap();
        let automation: Arc<dyn BrowserAutomation> =
            Arc::new(ScriptedAutomation::default());
        let err = inject_os_automation(
            &cfg,
            &automation,
            &OsAutomationRequest {
                file_path: path.to_string_lossy().into_owned(),
                browser_pid: 0,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "pid_not_found");
    }
}
