#[path = "common/mod.rs"]
mod common;

use common::{reset_env, spawn_app, EnvGuard, EXTENSION_CLIENT};
use once_cell::sync::Lazy;
use reqwest::multipart;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::Mutex;

static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

#[tokio::test]
async fn health_reports_buffer_drops_and_warnings() {
    let _lock = ENV_MUTEX.lock().await;
    let tmp = tempfile::tempdir().unwrap();
    let mut env = EnvGuard::new();
    reset_env(&mut env, tmp.path());
    env.set("GASOLINE_MAX_LOG_ENTRIES", "2");

    let (addr, handle, _state) = spawn_app().await;
    let client = Client::new();

    // Three entries into a two-slot buffer: one drop.
    let resp = client
        .post(format!("{addr}/logs"))
        .header("X-Gasoline-Client", EXTENSION_CLIENT)
        .json(&json!([
            { "level": "info", "message": "a", "source": "console" },
            { "level": "info", "message": "b", "source": "console" },
            { "level": "info", "message": "c", "source": "console" },
        ]))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);

    let health: Value = client
        .get(format!("{addr}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["buffers"]["logs"]["len"], 2);
    assert_eq!(health["buffers"]["logs"]["capacity"], 2);
    assert_eq!(health["buffers"]["logs"]["dropped"], 1);
    assert_eq!(health["buffers"]["logs"]["totalAppended"], 3);
    // No API key configured: the startup warning shows up here.
    assert!(health["startupWarnings"]
        .as_array()
        .unwrap()
        .iter()
        .any(|w| w.as_str().unwrap().contains("API key")));

    handle.abort();
}

#[tokio::test]
async fn metrics_exposition_tracks_buffers_and_commands() {
    let _lock = ENV_MUTEX.lock().await;
    let tmp = tempfile::tempdir().unwrap();
    let mut env = EnvGuard::new();
    reset_env(&mut env, tmp.path());

    let (addr, handle, _state) = spawn_app().await;
    let client = Client::new();

    client
        .post(format!("{addr}/logs"))
        .header("X-Gasoline-Client", EXTENSION_CLIENT)
        .json(&json!([{ "level": "info", "message": "a", "source": "console" }]))
        .send()
        .await
        .unwrap();

    let body = client
        .get(format!("{addr}/metrics"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("# TYPE gasoline_requests_total counter"));
    assert!(body.contains("gasoline_buffer_entries{buffer=\"logs\"} 1"));
    assert!(body.contains("gasoline_build_info{version="));
    assert!(body.contains("gasoline_pending_commands{state=\"queued\"} 0"));

    handle.abort();
}

#[tokio::test]
async fn recordings_round_trip_over_multipart() {
    let _lock = ENV_MUTEX.lock().await;
    let tmp = tempfile::tempdir().unwrap();
    let mut env = EnvGuard::new();
    reset_env(&mut env, tmp.path());

    let (addr, handle, _state) = spawn_app().await;
    let client = Client::new();

    let form = multipart::Form::new()
        .text("name", "session-1")
        .text("meta", r#"{"actions":[{"type":"click"}],"playback":{"ok":true}}"#)
        .part(
            "video",
            multipart::Part::bytes(b"webm-data".to_vec()).file_name("session-1.webm"),
        );
    let resp = client
        .post(format!("{addr}/recordings/save"))
        .header("X-Gasoline-Client", EXTENSION_CLIENT)
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);

    // The saved file lands inside the state dir.
    let saved = tmp.path().join("recordings/session-1.webm");
    assert_eq!(std::fs::read(&saved).unwrap(), b"webm-data");

    // Listing and metadata come back through observe.
    let rpc: Value = client
        .post(format!("{addr}/mcp"))
        .json(&json!({
            "jsonrpc": "2.0", "id": 1, "method": "tools/call",
            "params": { "name": "observe", "arguments": { "what": "recordings" } },
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let payload: Value =
        serde_json::from_str(rpc["result"]["content"][0]["text"].as_str().unwrap()).unwrap();
    let recordings = payload["recordings"].as_array().unwrap();
    assert_eq!(recordings.len(), 1);
    assert_eq!(recordings[0]["name"], "session-1");

    let rpc: Value = client
        .post(format!("{addr}/mcp"))
        .json(&json!({
            "jsonrpc": "2.0", "id": 2, "method": "tools/call",
            "params": { "name": "observe", "arguments": {
                "what": "recording_actions", "name": "session-1",
            }},
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let payload: Value =
        serde_json::from_str(rpc["result"]["content"][0]["text"].as_str().unwrap()).unwrap();
    assert_eq!(payload["actions"][0]["type"], "click");

    handle.abort();
}

#[tokio::test]
async fn traversal_recording_names_rejected() {
    let _lock = ENV_MUTEX.lock().await;
    let tmp = tempfile::tempdir().unwrap();
    let mut env = EnvGuard::new();
    reset_env(&mut env, tmp.path());

    let (addr, handle, _state) = spawn_app().await;
    let form = multipart::Form::new()
        .text("name", "../escape")
        .part("video", multipart::Part::bytes(b"x".to_vec()));
    let resp = Client::new()
        .post(format!("{addr}/recordings/save"))
        .header("X-Gasoline-Client", EXTENSION_CLIENT)
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    handle.abort();
}

#[tokio::test]
async fn configure_macro_lifecycle() {
    let _lock = ENV_MUTEX.lock().await;
    let tmp = tempfile::tempdir().unwrap();
    let mut env = EnvGuard::new();
    reset_env(&mut env, tmp.path());

    let (addr, handle, _state) = spawn_app().await;
    let client = Client::new();

    // The extension must be attached before a replay can queue anything.
    client
        .post(format!("{addr}/sync"))
        .header("X-Gasoline-Client", EXTENSION_CLIENT)
        .json(&json!({ "tabId": 4, "pilot": true }))
        .send()
        .await
        .unwrap();

    let call = |args: Value| {
        let client = client.clone();
        let addr = addr.clone();
        async move {
            let rpc: Value = client
                .post(format!("{addr}/mcp"))
                .json(&json!({
                    "jsonrpc": "2.0", "id": 1, "method": "tools/call",
                    "params": { "name": "configure", "arguments": args },
                }))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            let payload: Value =
                serde_json::from_str(rpc["result"]["content"][0]["text"].as_str().unwrap())
                    .unwrap();
            (rpc, payload)
        }
    };

    let (_, saved) = call(json!({
        "action": "save_macro",
        "name": "login",
        "tags": ["auth"],
        "steps": [
            { "action": "type", "selector": "#user", "text": "dev" },
            { "action": "click", "selector": "#go" },
        ],
    }))
    .await;
    assert_eq!(saved["saved"]["name"], "login");

    let (_, listed) = call(json!({ "action": "list_macros", "tag": "auth" })).await;
    assert_eq!(listed["macros"].as_array().unwrap().len(), 1);

    let (_, replayed) = call(json!({ "action": "replay_macro", "name": "login" })).await;
    let commands = replayed["commands"].as_array().unwrap();
    assert_eq!(commands.len(), 2);
    assert!(commands[0]["correlation_id"]
        .as_str()
        .unwrap()
        .starts_with("dom_"));

    let (_, _) = call(json!({ "action": "delete_macro", "name": "login" })).await;
    let (rpc, payload) = call(json!({ "action": "get_macro", "name": "login" })).await;
    assert!(rpc["result"]["isError"].as_bool().unwrap());
    assert_eq!(payload["error"], "not_found");

    handle.abort();
}
