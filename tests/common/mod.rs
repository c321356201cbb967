use std::collections::HashMap;

use tokio::net::TcpListener as TokioTcpListener;
use tokio::task::JoinHandle;

use gasoline::{app, build_state_from_env, AppState};

/// Tracks environment variable mutations and restores originals on drop.
pub struct EnvGuard {
    originals: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn new() -> Self {
        Self {
            originals: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.capture(key);
        std::env::set_var(key, value);
    }

    #[allow(dead_code)]
    pub fn set_many(&mut self, entries: &[(&str, &str)]) {
        for (key, value) in entries {
            self.set(key, value);
        }
    }

    #[allow(dead_code)]
    pub fn remove(&mut self, key: &str) {
        self.capture(key);
        std::env::remove_var(key);
    }

    fn capture(&mut self, key: &str) {
        if self.originals.contains_key(key) {
            return;
        }
        let original = std::env::var(key).ok();
        self.originals.insert(key.to_string(), original);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original) in self.originals.drain() {
            match original {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

/// Clear every gasoline variable so one test's config cannot leak into
/// the next, then point the state dir at a fresh temp directory.
#[allow(dead_code)]
pub fn reset_env(guard: &mut EnvGuard, state_dir: &std::path::Path) {
    for var in [
        "GASOLINE_PORT",
        "GASOLINE_MAX_LOG_ENTRIES",
        "GASOLINE_API_KEY",
        "GASOLINE_EXTENSION_ID",
        "GASOLINE_FIREFOX_EXTENSION_ID",
        "GASOLINE_STATE_DIR",
        "GASOLINE_UPLOAD_DIR",
        "GASOLINE_UPLOAD_DENY",
        "GASOLINE_SSRF_ALLOW_HOSTS",
        "GASOLINE_ENABLE_OS_AUTOMATION",
    ] {
        guard.remove(var);
    }
    guard.set("GASOLINE_STATE_DIR", state_dir.to_str().unwrap());
}

/// Spawn the daemon on an ephemeral loopback port and return its base
/// URL, the serve task, and the state for in-test inspection.
#[allow(dead_code)]
pub async fn spawn_app() -> (String, JoinHandle<()>, AppState) {
    let listener = TokioTcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = build_state_from_env().unwrap();
    let app = app(state.clone());
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), handle, state)
}

/// Header value every extension-plane request needs.
#[allow(dead_code)]
pub const EXTENSION_CLIENT: &str = "gasoline-extension/1.0.0";
