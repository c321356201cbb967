//! Extension-reported session state.
//!
//! The extension periodically POSTs a sync payload describing the tab it
//! is bound to, the pilot capability flag, known sibling tabs and the
//! latest page snapshot. Interactive commands consult this before
//! queueing anything.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::now_rfc3339_nanos;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPayload {
    #[serde(default)]
    pub tab_id: Option<i64>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub pilot: bool,
    #[serde(default)]
    pub recording_state: Option<String>,
    #[serde(default)]
    pub tabs: Vec<Value>,
    #[serde(default)]
    pub page: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct TrackedState {
    pub tab_id: Option<i64>,
    pub url: Option<String>,
    pub title: Option<String>,
    pub pilot: bool,
    pub recording_state: Option<String>,
    pub tabs: Vec<Value>,
    pub page: Option<Value>,
    pub last_sync_at: Option<String>,
}

pub struct TrackedSession {
    state: Mutex<TrackedState>,
}

impl Default for TrackedSession {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackedSession {
    pub fn new() -> Self {
        TrackedSession {
            state: Mutex::new(TrackedState::default()),
        }
    }

    pub fn apply_sync(&self, payload: SyncPayload) {
        let mut state = self.state.lock().expect("tracked mutex poisoned");
        state.tab_id = payload.tab_id;
        state.url = payload.url;
        state.title = payload.title;
        state.pilot = payload.pilot;
        state.recording_state = payload.recording_state;
        if !payload.tabs.is_empty() {
            state.tabs = payload.tabs;
        }
        if payload.page.is_some() {
            state.page = payload.page;
        }
        state.last_sync_at = Some(now_rfc3339_nanos());
    }

    pub fn snapshot(&self) -> TrackedState {
        self.state.lock().expect("tracked mutex poisoned").clone()
    }
}
