//! Recording persistence.
//!
//! Saved recordings live under `<state_dir>/recordings` as a `.webm`
//! with a sibling `<name>_meta.json`. A legacy directory from older
//! builds is read during listing but never written; on a name collision
//! the primary entry wins and the shadowed legacy entry is counted for
//! health reporting.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde_json::Value;

use crate::errors::ToolError;

pub struct RecordingStore {
    primary: PathBuf,
    legacy: PathBuf,
    legacy_shadowed: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingInfo {
    pub name: String,
    pub video_path: String,
    pub size_bytes: u64,
    pub from_legacy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// Names must stay inside the recordings directory; anything that could
/// traverse out is refused outright.
fn validate_name(name: &str) -> Result<(), ToolError> {
    if name.is_empty() {
        return Err(ToolError::MissingParam("name".into()));
    }
    let ok = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if !ok || name.contains("..") || name.starts_with('.') {
        return Err(ToolError::InvalidParam {
            param: "name".into(),
            reason: format!("{name:?} may only contain [A-Za-z0-9._-] and no traversal"),
        });
    }
    Ok(())
}

impl RecordingStore {
    pub fn new(primary: PathBuf, legacy: PathBuf) -> Self {
        RecordingStore {
            primary,
            legacy,
            legacy_shadowed: AtomicU64::new(0),
        }
    }

    pub fn save(&self, name: &str, video: &[u8], meta: Option<&Value>) -> Result<RecordingInfo, ToolError> {
        validate_name(name)?;
        std::fs::create_dir_all(&self.primary)
            .map_err(|e| ToolError::Internal(format!("recordings dir: {e}")))?;
        let video_path = self.primary.join(format!("{name}.webm"));
        std::fs::write(&video_path, video)
            .map_err(|e| ToolError::Internal(format!("write recording: {e}")))?;
        if let Some(meta) = meta {
            let meta_path = self.primary.join(format!("{name}_meta.json"));
            let body = serde_json::to_vec_pretty(meta)
                .map_err(|e| ToolError::Internal(e.to_string()))?;
            std::fs::write(&meta_path, body)
                .map_err(|e| ToolError::Internal(format!("write metadata: {e}")))?;
        }
        Ok(RecordingInfo {
            name: name.to_string(),
            video_path: video_path.display().to_string(),
            size_bytes: video.len() as u64,
            from_legacy: false,
            meta: meta.cloned(),
        })
    }

    /// Union of primary and legacy, deduped by name, primary first.
    pub fn list(&self) -> Vec<RecordingInfo> {
        let mut out = scan_dir(&self.primary, false);
        let mut shadowed = 0u64;
        for legacy in scan_dir(&self.legacy, true) {
            if out.iter().any(|r| r.name == legacy.name) {
                shadowed += 1;
            } else {
                out.push(legacy);
            }
        }
        if shadowed > 0 {
            self.legacy_shadowed.store(shadowed, Ordering::Relaxed);
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn meta(&self, name: &str) -> Result<Value, ToolError> {
        validate_name(name)?;
        for dir in [&self.primary, &self.legacy] {
            let path = dir.join(format!("{name}_meta.json"));
            if let Ok(raw) = std::fs::read_to_string(&path) {
                return serde_json::from_str(&raw)
                    .map_err(|e| ToolError::Internal(format!("corrupt metadata: {e}")));
            }
        }
        Err(ToolError::NotFound(format!("recording {name}")))
    }

    pub fn legacy_shadowed(&self) -> u64 {
        self.legacy_shadowed.load(Ordering::Relaxed)
    }
}

fn scan_dir(dir: &Path, from_legacy: bool) -> Vec<RecordingInfo> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_none_or(|e| e != "webm") {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        let meta = std::fs::read_to_string(dir.join(format!("{name}_meta.json")))
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok());
        out.push(RecordingInfo {
            name: name.to_string(),
            video_path: path.display().to_string(),
            size_bytes: size,
            from_legacy,
            meta,
        });
    }
    out
}
