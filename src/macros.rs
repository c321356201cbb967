//! Named macro store for the `configure` tool.
//!
//! A macro is an ordered list of interaction steps with optional tags.
//! Mutations persist best-effort to `<state_dir>/macros.json`; a corrupt
//! or missing file just means an empty store at startup.

use std::path::PathBuf;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::now_rfc3339_nanos;
use crate::errors::ToolError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Macro {
    pub name: String,
    pub steps: Vec<Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub struct MacroStore {
    macros: DashMap<String, Macro>,
    path: Option<PathBuf>,
}

impl MacroStore {
    /// Load existing macros from disk; unreadable state starts empty.
    pub fn load(path: Option<PathBuf>) -> Self {
        let macros = DashMap::new();
        if let Some(p) = &path {
            if let Ok(raw) = std::fs::read_to_string(p) {
                match serde_json::from_str::<Vec<Macro>>(&raw) {
                    Ok(list) => {
                        for m in list {
                            macros.insert(m.name.clone(), m);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(path = %p.display(), error = %e, "ignoring corrupt macro file");
                    }
                }
            }
        }
        MacroStore { macros, path }
    }

    pub fn save(
        &self,
        name: &str,
        steps: Vec<Value>,
        tags: Vec<String>,
    ) -> Result<Macro, ToolError> {
        if name.trim().is_empty() {
            return Err(ToolError::MissingParam("name".into()));
        }
        if steps.is_empty() {
            return Err(ToolError::MissingParam("steps".into()));
        }
        let now = now_rfc3339_nanos();
        let created_at = self
            .macros
            .get(name)
            .map(|m| m.created_at.clone())
            .unwrap_or_else(|| now.clone());
        let m = Macro {
            name: name.to_string(),
            steps,
            tags,
            created_at,
            updated_at: now,
        };
        self.macros.insert(name.to_string(), m.clone());
        self.persist();
        Ok(m)
    }

    pub fn get(&self, name: &str) -> Result<Macro, ToolError> {
        self.macros
            .get(name)
            .map(|m| m.clone())
            .ok_or_else(|| ToolError::NotFound(format!("macro {name}")))
    }

    pub fn delete(&self, name: &str) -> Result<(), ToolError> {
        let removed = self.macros.remove(name).is_some();
        if !removed {
            return Err(ToolError::NotFound(format!("macro {name}")));
        }
        self.persist();
        Ok(())
    }

    pub fn list(&self, tag: Option<&str>) -> Vec<Macro> {
        let mut out: Vec<Macro> = self
            .macros
            .iter()
            .filter(|m| tag.is_none_or(|t| m.tags.iter().any(|x| x == t)))
            .map(|m| m.clone())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    fn persist(&self) {
        let Some(path) = &self.path else { return };
        let list = self.list(None);
        let write = || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let body = serde_json::to_vec_pretty(&list)?;
            std::fs::write(path, body)
        };
        if let Err(e) = write() {
            tracing::warn!(path = %path.display(), error = %e, "failed to persist macros");
        }
    }
}
