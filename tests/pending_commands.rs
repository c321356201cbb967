#[path = "common/mod.rs"]
mod common;

use std::time::Duration;

use common::{reset_env, spawn_app, EnvGuard, EXTENSION_CLIENT};
use once_cell::sync::Lazy;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::Mutex;

static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

async fn call_tool(client: &Client, addr: &str, name: &str, arguments: Value) -> Value {
    client
        .post(format!("{addr}/mcp"))
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": { "name": name, "arguments": arguments },
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

fn tool_payload(rpc: &Value) -> Value {
    let text = rpc["result"]["content"][0]["text"].as_str().unwrap();
    serde_json::from_str(text).unwrap()
}

/// Bind the extension to a tab with pilot enabled so interactions pass
/// the gates.
async fn sync_tracked_tab(client: &Client, addr: &str) {
    let resp = client
        .post(format!("{addr}/sync"))
        .header("X-Gasoline-Client", EXTENSION_CLIENT)
        .json(&json!({
            "tabId": 11,
            "url": "https://example.com",
            "title": "Example",
            "pilot": true,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
}

#[tokio::test]
async fn queued_navigate_times_out_with_retry_hint() {
    let _lock = ENV_MUTEX.lock().await;
    let tmp = tempfile::tempdir().unwrap();
    let mut env = EnvGuard::new();
    reset_env(&mut env, tmp.path());

    let (addr, handle, _state) = spawn_app().await;
    let client = Client::new();
    sync_tracked_tab(&client, &addr).await;

    // Nothing drains the queue, so the command can only expire.
    let rpc = call_tool(
        &client,
        &addr,
        "interact",
        json!({
            "action": "navigate",
            "url": "https://example.com",
            "wait": false,
            "timeout_ms": 100,
        }),
    )
    .await;
    let queued = tool_payload(&rpc);
    assert_eq!(queued["status"], "queued");
    assert_eq!(queued["final"], false);
    let id = queued["correlation_id"].as_str().unwrap().to_string();
    assert!(id.starts_with("nav_"), "got {id}");

    // The sweeper runs on a one-second tick; poll until it fires.
    let mut last = Value::Null;
    for _ in 0..40 {
        let rpc = call_tool(
            &client,
            &addr,
            "observe",
            json!({ "what": "command_result", "correlation_id": id }),
        )
        .await;
        last = rpc.clone();
        if rpc["result"]["isError"].as_bool().unwrap_or(false) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(
        last["result"]["isError"].as_bool().unwrap_or(false),
        "command never expired: {last}"
    );
    let payload = tool_payload(&last);
    assert_eq!(payload["error"], "timeout");
    assert_eq!(payload["retry"], "reissue navigate");

    handle.abort();
}

#[tokio::test]
async fn extension_drains_in_order_and_fast_path_returns_final() {
    let _lock = ENV_MUTEX.lock().await;
    let tmp = tempfile::tempdir().unwrap();
    let mut env = EnvGuard::new();
    reset_env(&mut env, tmp.path());

    let (addr, handle, _state) = spawn_app().await;
    let client = Client::new();
    sync_tracked_tab(&client, &addr).await;

    // Queue two commands without waiting.
    let first = tool_payload(
        &call_tool(
            &client,
            &addr,
            "interact",
            json!({ "action": "highlight", "selector": "#a", "wait": false }),
        )
        .await,
    );
    let second = tool_payload(
        &call_tool(
            &client,
            &addr,
            "interact",
            json!({ "action": "click", "selector": "#b", "wait": false }),
        )
        .await,
    );
    let first_id = first["correlation_id"].as_str().unwrap();
    let second_id = second["correlation_id"].as_str().unwrap();
    assert!(first_id.starts_with("highlight_"));
    assert!(second_id.starts_with("dom_"));

    // Drain as the extension: enqueue order must hold within the tab.
    let drained: Value = client
        .get(format!("{addr}/commands?tab_id=11&max=10"))
        .header("X-Gasoline-Client", EXTENSION_CLIENT)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let commands = drained["commands"].as_array().unwrap();
    assert_eq!(commands.len(), 2);
    assert_eq!(commands[0]["correlation_id"], *first_id);
    assert_eq!(commands[1]["correlation_id"], *second_id);

    // Report a result and read it back through the fast path.
    let resp = client
        .post(format!("{addr}/command-result"))
        .header("X-Gasoline-Client", EXTENSION_CLIENT)
        .json(&json!({
            "correlation_id": first_id,
            "success": true,
            "result": { "highlighted": 1 },
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);

    let observed = tool_payload(
        &call_tool(
            &client,
            &addr,
            "observe",
            json!({ "what": "command_result", "correlation_id": first_id }),
        )
        .await,
    );
    assert_eq!(observed["state"], "complete");
    assert_eq!(observed["result"]["highlighted"], 1);

    // A second, conflicting report is ignored.
    let resp = client
        .post(format!("{addr}/command-result"))
        .header("X-Gasoline-Client", EXTENSION_CLIENT)
        .json(&json!({
            "correlation_id": first_id,
            "success": false,
            "error": "late failure",
        }))
        .send()
        .await
        .unwrap();
    let ack: Value = resp.json().await.unwrap();
    assert_eq!(ack["applied"], false);

    let still = tool_payload(
        &call_tool(
            &client,
            &addr,
            "observe",
            json!({ "what": "command_result", "correlation_id": first_id }),
        )
        .await,
    );
    assert_eq!(still["state"], "complete");

    handle.abort();
}

#[tokio::test]
async fn fast_path_returns_final_result_when_extension_is_quick() {
    let _lock = ENV_MUTEX.lock().await;
    let tmp = tempfile::tempdir().unwrap();
    let mut env = EnvGuard::new();
    reset_env(&mut env, tmp.path());

    let (addr, handle, _state) = spawn_app().await;
    let client = Client::new();
    sync_tracked_tab(&client, &addr).await;

    // Simulated extension: long-poll, execute, report.
    let ext_addr = addr.clone();
    let extension = tokio::spawn(async move {
        let client = Client::new();
        let drained: Value = client
            .get(format!("{ext_addr}/commands?tab_id=11&max=1&wait_ms=3000"))
            .header("X-Gasoline-Client", EXTENSION_CLIENT)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let commands = drained["commands"].as_array().unwrap();
        assert_eq!(commands.len(), 1);
        let id = commands[0]["correlation_id"].as_str().unwrap();
        client
            .post(format!("{ext_addr}/command-result"))
            .header("X-Gasoline-Client", EXTENSION_CLIENT)
            .json(&json!({
                "correlation_id": id,
                "success": true,
                "result": { "url": "https://example.com/next" },
            }))
            .send()
            .await
            .unwrap();
    });

    let rpc = call_tool(
        &client,
        &addr,
        "interact",
        json!({ "action": "navigate", "url": "https://example.com/next" }),
    )
    .await;
    let payload = tool_payload(&rpc);
    assert_eq!(payload["status"], "complete");
    assert_eq!(payload["final"], true);
    assert_eq!(payload["result"]["url"], "https://example.com/next");

    extension.await.unwrap();
    handle.abort();
}

#[tokio::test]
async fn record_stop_refused_while_awaiting_gesture() {
    let _lock = ENV_MUTEX.lock().await;
    let tmp = tempfile::tempdir().unwrap();
    let mut env = EnvGuard::new();
    reset_env(&mut env, tmp.path());

    let (addr, handle, _state) = spawn_app().await;
    let client = Client::new();
    client
        .post(format!("{addr}/sync"))
        .header("X-Gasoline-Client", EXTENSION_CLIENT)
        .json(&json!({
            "tabId": 11,
            "pilot": true,
            "recordingState": "awaiting_gesture",
        }))
        .send()
        .await
        .unwrap();

    let rpc = call_tool(&client, &addr, "interact", json!({ "action": "record_stop" })).await;
    assert!(rpc["result"]["isError"].as_bool().unwrap());
    let payload = tool_payload(&rpc);
    // A non-timeout refusal: the recording has not started yet.
    assert_eq!(payload["error"], "invalid_param");
    assert!(payload["message"]
        .as_str()
        .unwrap()
        .contains("awaiting the user gesture"));

    handle.abort();
}

#[tokio::test]
async fn pilot_and_tab_gates_apply() {
    let _lock = ENV_MUTEX.lock().await;
    let tmp = tempfile::tempdir().unwrap();
    let mut env = EnvGuard::new();
    reset_env(&mut env, tmp.path());

    let (addr, handle, _state) = spawn_app().await;
    let client = Client::new();

    // No sync at all: pilot is off.
    let rpc = call_tool(
        &client,
        &addr,
        "interact",
        json!({ "action": "click", "selector": "#x" }),
    )
    .await;
    assert!(rpc["result"]["isError"].as_bool().unwrap());
    assert_eq!(tool_payload(&rpc)["error"], "pilot_disabled");

    // Pilot on but no tab: screenshot degrades to no_data, click to
    // no_tracked_tab.
    client
        .post(format!("{addr}/sync"))
        .header("X-Gasoline-Client", EXTENSION_CLIENT)
        .json(&json!({ "pilot": true }))
        .send()
        .await
        .unwrap();

    let rpc = call_tool(&client, &addr, "interact", json!({ "action": "screenshot" })).await;
    assert_eq!(tool_payload(&rpc)["error"], "no_data");

    let rpc = call_tool(
        &client,
        &addr,
        "interact",
        json!({ "action": "click", "selector": "#x" }),
    )
    .await;
    assert_eq!(tool_payload(&rpc)["error"], "no_tracked_tab");

    handle.abort();
}
