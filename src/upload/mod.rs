//! Four-stage file-upload escalation.
//!
//! Stage 1 reads the file and hands it to the extension for a synthetic
//! drag-drop; Stage 2 drives the page's file dialog; Stage 3 submits the
//! form over HTTP directly; Stage 4 falls back to OS-level keystroke
//! injection. The coordinator escalates only on failures classified as
//! recoverable at the current stage and keeps a per-session log of every
//! forward move.

pub mod dialog;
pub mod file_read;
pub mod form_submit;
pub mod os_automation;
pub mod security;

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value;

use crate::clock::now_rfc3339_nanos;
use crate::errors::ToolError;

/// One MiB of slack keeps the arithmetic readable below.
const MIB: u64 = 1024 * 1024;
/// Inline base64 is included up to and including this size.
pub const INLINE_BASE64_MAX: u64 = 100 * MIB;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStage {
    Idle,
    DragDrop,
    FileDialog,
    FormIntercept,
    OsAutomation,
    Complete,
    Error,
}

impl UploadStage {
    pub fn number(self) -> u8 {
        match self {
            UploadStage::Idle => 0,
            UploadStage::DragDrop => 1,
            UploadStage::FileDialog => 2,
            UploadStage::FormIntercept => 3,
            UploadStage::OsAutomation => 4,
            UploadStage::Complete | UploadStage::Error => 0,
        }
    }

    fn rank(self) -> u8 {
        match self {
            UploadStage::Idle => 0,
            UploadStage::DragDrop => 1,
            UploadStage::FileDialog => 2,
            UploadStage::FormIntercept => 3,
            UploadStage::OsAutomation => 4,
            UploadStage::Complete | UploadStage::Error => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, UploadStage::Complete | UploadStage::Error)
    }
}

/// Reporting granularity for the extension's progress UI, fixed per
/// session from the file size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressTier {
    Simple,
    Periodic,
    Detailed,
}

/// Size below 100 MiB reports once, below 2 GiB periodically, anything
/// larger gets detailed progress.
pub fn progress_tier(size: u64) -> ProgressTier {
    if size < 100 * MIB {
        ProgressTier::Simple
    } else if size < 2048 * MIB {
        ProgressTier::Periodic
    } else {
        ProgressTier::Detailed
    }
}

/// Uniform response envelope for every stage handler. `stage` always
/// carries the handler's own number, even on failure.
#[derive(Debug, Clone, Serialize)]
pub struct StageResponse {
    pub success: bool,
    pub stage: u8,
    pub status: String,
    pub file_name: String,
    pub file_size_bytes: u64,
    pub duration_ms: u64,
    pub progress_tier: ProgressTier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_base64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestions: Option<Vec<String>>,
}

impl StageResponse {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Null)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EscalationStep {
    pub from_stage: UploadStage,
    pub to_stage: UploadStage,
    pub reason: String,
    pub at: String,
}

/// Live state for one upload attempt.
#[derive(Debug, Clone, Serialize)]
pub struct UploadSession {
    pub correlation_id: String,
    pub stage: UploadStage,
    pub file_path: String,
    pub file_name: String,
    pub file_size_bytes: u64,
    pub progress_tier: ProgressTier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub escalation_log: Vec<EscalationStep>,
    pub started_at: String,
}

/// Session registry keyed by correlation id. Transitions are monotonic:
/// a session never moves to a lower-ranked stage, and terminal states
/// stick.
#[derive(Default)]
pub struct UploadCoordinator {
    sessions: Mutex<HashMap<String, UploadSession>>,
}

impl UploadCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self, correlation_id: &str, file_path: &str, file_name: &str, size: u64) -> UploadSession {
        let session = UploadSession {
            correlation_id: correlation_id.to_string(),
            stage: UploadStage::Idle,
            file_path: file_path.to_string(),
            file_name: file_name.to_string(),
            file_size_bytes: size,
            progress_tier: progress_tier(size),
            last_error: None,
            escalation_log: Vec::new(),
            started_at: now_rfc3339_nanos(),
        };
        self.sessions
            .lock()
            .expect("upload mutex poisoned")
            .insert(correlation_id.to_string(), session.clone());
        session
    }

    /// Move a session forward, recording the reason. Regressions and
    /// transitions out of a terminal state are rejected.
    pub fn advance(
        &self,
        correlation_id: &str,
        to: UploadStage,
        reason: &str,
    ) -> Result<(), ToolError> {
        let mut sessions = self.sessions.lock().expect("upload mutex poisoned");
        let session = sessions
            .get_mut(correlation_id)
            .ok_or_else(|| ToolError::NotFound(format!("upload session {correlation_id}")))?;
        if session.stage.is_terminal() {
            return Err(ToolError::InvalidParam {
                param: "correlation_id".into(),
                reason: format!("session already terminal in {:?}", session.stage),
            });
        }
        if to.rank() <= session.stage.rank() && !to.is_terminal() {
            return Err(ToolError::InvalidParam {
                param: "stage".into(),
                reason: format!("cannot regress from {:?} to {to:?}", session.stage),
            });
        }
        session.escalation_log.push(EscalationStep {
            from_stage: session.stage,
            to_stage: to,
            reason: reason.to_string(),
            at: now_rfc3339_nanos(),
        });
        if to == UploadStage::Error {
            session.last_error = Some(reason.to_string());
        }
        session.stage = to;
        Ok(())
    }

    pub fn get(&self, correlation_id: &str) -> Option<UploadSession> {
        self.sessions
            .lock()
            .expect("upload mutex poisoned")
            .get(correlation_id)
            .cloned()
    }

    pub fn snapshot(&self) -> Vec<UploadSession> {
        let sessions = self.sessions.lock().expect("upload mutex poisoned");
        let mut out: Vec<UploadSession> = sessions.values().cloned().collect();
        out.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        out
    }
}

/// Decide whether a stage failure may escalate to the next stage.
/// Security refusals and caller mistakes never escalate; transport and
/// environment failures do.
pub fn failure_is_recoverable(err: &ToolError) -> bool {
    matches!(
        err,
        ToolError::Timeout
            | ToolError::Network(_)
            | ToolError::PidNotFound(_)
            | ToolError::UnsupportedOs(_)
            | ToolError::Internal(_)
            | ToolError::NoData(_)
            // Page-state misses mean this stage's vehicle is wrong, not
            // that the upload itself is forbidden.
            | ToolError::ElementNotFound(_)
            | ToolError::StaleElementId(_)
            | ToolError::AmbiguousTarget(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_numbers_match_the_ladder() {
        assert_eq!(UploadStage::DragDrop.number(), 1);
        assert_eq!(UploadStage::FileDialog.number(), 2);
        assert_eq!(UploadStage::FormIntercept.number(), 3);
        assert_eq!(UploadStage::OsAutomation.number(), 4);
    }

    #[test]
    fn tier_boundaries() {
        assert_eq!(progress_tier(99 * MIB), ProgressTier::Simple);
        assert_eq!(progress_tier(100 * MIB), ProgressTier::Periodic);
        assert_eq!(progress_tier(2048 * MIB), ProgressTier::Detailed);
        assert_eq!(progress_tier(11), ProgressTier::Simple);
    }

    #[test]
    fn inline_base64_boundary_is_inclusive() {
        assert!(100 * MIB <= INLINE_BASE64_MAX);
        assert!(100 * MIB + 1 > INLINE_BASE64_MAX);
    }

    #[test]
    fn stage_transitions_are_monotonic() {
        let coord = UploadCoordinator::new();
        coord.start("upload_1", "/tmp/a.txt", "a.txt", 10);
        coord
            .advance("upload_1", UploadStage::DragDrop, "initial attempt")
            .unwrap();
        coord
            .advance("upload_1", UploadStage::FileDialog, "drag-drop rejected")
            .unwrap();
        // No going back.
        assert!(coord
            .advance("upload_1", UploadStage::DragDrop, "retry")
            .is_err());
        coord
            .advance("upload_1", UploadStage::Complete, "dialog accepted")
            .unwrap();
        // Terminal sticks.
        assert!(coord
            .advance("upload_1", UploadStage::OsAutomation, "late")
            .is_err());
        let session = coord.get("upload_1").unwrap();
        assert_eq!(session.stage, UploadStage::Complete);
        assert_eq!(session.escalation_log.len(), 3);
        assert_eq!(session.escalation_log[1].reason, "drag-drop rejected");
    }

    #[test]
    fn recoverable_classification() {
        assert!(failure_is_recoverable(&ToolError::Timeout));
        assert!(failure_is_recoverable(&ToolError::Network("reset".into())));
        assert!(!failure_is_recoverable(&ToolError::PathDenied {
            pattern: ".ssh".into(),
            upload_dir: None
        }));
        assert!(!failure_is_recoverable(&ToolError::UploadDirRequired));
        assert!(!failure_is_recoverable(&ToolError::SsrfBlocked("x".into())));
    }
}
