#[path = "common/mod.rs"]
mod common;

use common::{reset_env, spawn_app, EnvGuard, EXTENSION_CLIENT};
use once_cell::sync::Lazy;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::Mutex;

static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

#[tokio::test]
async fn stage1_reads_small_file_inline() {
    let _lock = ENV_MUTEX.lock().await;
    let tmp = tempfile::tempdir().unwrap();
    let mut env = EnvGuard::new();
    reset_env(&mut env, tmp.path());

    let doc_dir = tempfile::tempdir().unwrap();
    let doc = doc_dir.path().join("doc.txt");
    std::fs::write(&doc, "hello world").unwrap();

    let (addr, handle, _state) = spawn_app().await;
    let resp = Client::new()
        .post(format!("{addr}/api/file/read"))
        .header("X-Gasoline-Client", EXTENSION_CLIENT)
        .json(&json!({ "file_path": doc.to_str().unwrap() }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["stage"], 1);
    assert_eq!(body["file_name"], "doc.txt");
    assert_eq!(body["file_size_bytes"], 11);
    assert_eq!(body["mime_type"], "text/plain");
    assert_eq!(body["data_base64"], "aGVsbG8gd29ybGQ=");
    assert_eq!(body["progress_tier"], "simple");

    handle.abort();
}

#[tokio::test]
async fn denylist_echoes_pattern_and_upload_dir() {
    let _lock = ENV_MUTEX.lock().await;
    let tmp = tempfile::tempdir().unwrap();
    let mut env = EnvGuard::new();
    reset_env(&mut env, tmp.path());

    // Steer HOME into a temp dir holding a planted SSH key.
    let home = tempfile::tempdir().unwrap();
    let ssh = home.path().join(".ssh");
    std::fs::create_dir_all(&ssh).unwrap();
    std::fs::write(ssh.join("id_rsa"), "private").unwrap();
    env.set("HOME", home.path().to_str().unwrap());

    let uploads = tempfile::tempdir().unwrap();
    env.set("GASOLINE_UPLOAD_DIR", uploads.path().to_str().unwrap());

    let (addr, handle, _state) = spawn_app().await;
    let target = home.path().join(".ssh/id_rsa");
    let resp = Client::new()
        .post(format!("{addr}/api/file/read"))
        .header("X-Gasoline-Client", EXTENSION_CLIENT)
        .json(&json!({ "file_path": target.to_str().unwrap() }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::FORBIDDEN);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "path_denied");
    assert!(body["pattern"].as_str().unwrap().contains(".ssh"));
    let echoed_dir = body["upload_dir"].as_str().unwrap();
    assert_eq!(
        echoed_dir,
        uploads.path().canonicalize().unwrap().to_str().unwrap()
    );

    handle.abort();
}

#[tokio::test]
async fn stage2_requires_upload_dir_and_pid() {
    let _lock = ENV_MUTEX.lock().await;
    let tmp = tempfile::tempdir().unwrap();
    let mut env = EnvGuard::new();
    reset_env(&mut env, tmp.path());

    let doc_dir = tempfile::tempdir().unwrap();
    let doc = doc_dir.path().join("a.txt");
    std::fs::write(&doc, "x").unwrap();

    let (addr, handle, _state) = spawn_app().await;
    let resp = Client::new()
        .post(format!("{addr}/api/file/dialog/inject"))
        .header("X-Gasoline-Client", EXTENSION_CLIENT)
        .json(&json!({ "file_path": doc.to_str().unwrap(), "browser_pid": 99 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::FORBIDDEN);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "upload_dir_required");
    assert!(body["retry"].as_str().unwrap().contains("--upload-dir"));

    handle.abort();
}

#[tokio::test]
async fn stage3_classifies_unauthorized_target() {
    let _lock = ENV_MUTEX.lock().await;
    let tmp = tempfile::tempdir().unwrap();
    let mut env = EnvGuard::new();
    reset_env(&mut env, tmp.path());

    // An in-process target that always answers 401.
    let target_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_addr = target_listener.local_addr().unwrap();
    let target_app = axum::Router::new().route(
        "/upload",
        axum::routing::post(|| async {
            (
                axum::http::StatusCode::UNAUTHORIZED,
                "missing session cookie",
            )
        }),
    );
    let target = tokio::spawn(async move {
        axum::serve(target_listener, target_app).await.unwrap();
    });

    let uploads = tempfile::tempdir().unwrap();
    let doc = uploads.path().join("report.bin");
    std::fs::write(&doc, vec![0u8; 4096]).unwrap();
    env.set("GASOLINE_UPLOAD_DIR", uploads.path().to_str().unwrap());
    // Loopback targets need the test-only allow list.
    env.set("GASOLINE_SSRF_ALLOW_HOSTS", "127.0.0.1");

    let (addr, handle, _state) = spawn_app().await;
    let resp = Client::new()
        .post(format!("{addr}/api/form/submit"))
        .header("X-Gasoline-Client", EXTENSION_CLIENT)
        .json(&json!({
            "file_path": doc.to_str().unwrap(),
            "url": format!("http://127.0.0.1:{}/upload", target_addr.port()),
            "method": "POST",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["stage"], 3);
    assert!(
        body["error"].as_str().unwrap().starts_with("HTTP 401"),
        "got {}",
        body["error"]
    );

    target.abort();
    handle.abort();
}

#[tokio::test]
async fn stage3_blocks_internal_targets_without_allow_list() {
    let _lock = ENV_MUTEX.lock().await;
    let tmp = tempfile::tempdir().unwrap();
    let mut env = EnvGuard::new();
    reset_env(&mut env, tmp.path());

    let uploads = tempfile::tempdir().unwrap();
    let doc = uploads.path().join("report.bin");
    std::fs::write(&doc, "x").unwrap();
    env.set("GASOLINE_UPLOAD_DIR", uploads.path().to_str().unwrap());

    let (addr, handle, _state) = spawn_app().await;
    let resp = Client::new()
        .post(format!("{addr}/api/form/submit"))
        .header("X-Gasoline-Client", EXTENSION_CLIENT)
        .json(&json!({
            "file_path": doc.to_str().unwrap(),
            "url": "http://127.0.0.1:9/upload",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::FORBIDDEN);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "ssrf_blocked");

    handle.abort();
}

#[tokio::test]
async fn os_automation_endpoints_are_gated_by_config() {
    let _lock = ENV_MUTEX.lock().await;
    let tmp = tempfile::tempdir().unwrap();
    let mut env = EnvGuard::new();
    reset_env(&mut env, tmp.path());

    let (addr, handle, _state) = spawn_app().await;
    let resp = Client::new()
        .post(format!("{addr}/api/os-automation/inject"))
        .header("X-Gasoline-Client", EXTENSION_CLIENT)
        .json(&json!({ "file_path": "/tmp/whatever.txt", "browser_pid": 1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::FORBIDDEN);

    let resp = Client::new()
        .post(format!("{addr}/api/os-automation/dismiss"))
        .header("X-Gasoline-Client", EXTENSION_CLIENT)
        .json(&json!({ "browser_pid": 1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::FORBIDDEN);

    handle.abort();
}
