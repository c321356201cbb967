//! Bounded telemetry buffers.
//!
//! Each telemetry family (console logs, network waterfall, network
//! bodies, WebSocket events, enhanced actions, performance snapshots,
//! extension logs) is held in its own ring buffer guarded by one mutex.
//! Overflow evicts the oldest entry and bumps a drop counter; readers
//! copy entries out so no shared mutation escapes the lock.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::clock::now_rfc3339_nanos;
use crate::cursor::{self, Cursor};
use crate::errors::ToolError;

/// Serialized size cap per entry. Larger entries are rejected, not
/// truncated.
pub const MAX_ENTRY_BYTES: usize = 64 * 1024;

const VALID_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "log"];

/// One telemetry entry. The fixed fields cover every family; family
/// specific payloads ride in the flattened remainder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    #[serde(default, deserialize_with = "de_timestamp")]
    pub ts: String,
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<i64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

fn default_level() -> String {
    "log".to_string()
}

/// Producers send timestamps as RFC3339 strings or epoch milliseconds;
/// anything unusable is cleared and restamped at ingest.
fn de_timestamp<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    if value.is_null() {
        return Ok(String::new());
    }
    Ok(crate::clock::normalize_timestamp(&value).unwrap_or_default())
}

impl LogEntry {
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }
}

/// Outcome of a batch append, reported back to the extension.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct AppendOutcome {
    pub appended: usize,
    pub rejected: usize,
    pub evicted: usize,
}

struct BufferInner {
    entries: VecDeque<Arc<LogEntry>>,
    next_seq: i64,
    dropped: u64,
    total_appended: u64,
}

/// A bounded, drop-tracking ring buffer for one telemetry family.
pub struct TelemetryBuffer {
    name: &'static str,
    capacity: usize,
    inner: Mutex<BufferInner>,
}

impl TelemetryBuffer {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        TelemetryBuffer {
            name,
            capacity: capacity.max(1),
            inner: Mutex::new(BufferInner {
                entries: VecDeque::new(),
                next_seq: 0,
                dropped: 0,
                total_appended: 0,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append one entry. Oversized entries are rejected whole; missing
    /// timestamps and invalid levels are normalized at ingest. Returns the
    /// assigned sequence number.
    pub fn append(&self, mut entry: LogEntry) -> Result<i64, ToolError> {
        if entry.ts.is_empty() {
            entry.ts = now_rfc3339_nanos();
        }
        if !VALID_LEVELS.contains(&entry.level.as_str()) {
            entry.level = default_level();
        }
        let size = serde_json::to_vec(&entry)
            .map_err(|e| ToolError::Internal(e.to_string()))?
            .len();
        if size > MAX_ENTRY_BYTES {
            return Err(ToolError::TooLarge(format!(
                "entry of {size} bytes exceeds the {MAX_ENTRY_BYTES}-byte cap"
            )));
        }
        let mut inner = self.inner.lock().expect("buffer mutex poisoned");
        inner.next_seq += 1;
        let seq = inner.next_seq;
        entry.sequence = Some(seq);
        inner.entries.push_back(Arc::new(entry));
        inner.total_appended += 1;
        while inner.entries.len() > self.capacity {
            inner.entries.pop_front();
            inner.dropped += 1;
        }
        Ok(seq)
    }

    /// Append a batch, counting rejected oversized entries instead of
    /// failing the whole batch.
    pub fn append_many(&self, entries: Vec<LogEntry>) -> AppendOutcome {
        let mut outcome = AppendOutcome::default();
        let before = self.dropped();
        for entry in entries {
            match self.append(entry) {
                Ok(_) => outcome.appended += 1,
                Err(err) => {
                    tracing::debug!(buffer = self.name, error = %err, "entry rejected");
                    outcome.rejected += 1;
                }
            }
        }
        outcome.evicted = (self.dropped() - before) as usize;
        outcome
    }

    /// Read entries past `cursor`, oldest first, at most `limit`, through
    /// an optional pure filter. Returns the copied entries and the cursor
    /// to resume from.
    pub fn read(
        &self,
        cursor: &Cursor,
        limit: usize,
        filter: Option<&dyn Fn(&LogEntry) -> bool>,
    ) -> (Vec<LogEntry>, Cursor) {
        let inner = self.inner.lock().expect("buffer mutex poisoned");
        let mut out = Vec::new();
        for entry in inner.entries.iter() {
            if out.len() >= limit {
                break;
            }
            let seq = entry.sequence.unwrap_or(0);
            if !cursor::is_newer(&entry.ts, seq, cursor) {
                continue;
            }
            if let Some(pred) = filter {
                if !pred(entry) {
                    continue;
                }
            }
            out.push(entry.as_ref().clone());
        }
        let next = out
            .last()
            .map(|e| Cursor {
                ts: e.ts.clone(),
                seq: e.sequence.unwrap_or(0),
            })
            .unwrap_or_else(|| cursor.clone());
        (out, next)
    }

    /// Most recent entry matching a predicate, if any.
    pub fn last_where(&self, pred: impl Fn(&LogEntry) -> bool) -> Option<LogEntry> {
        let inner = self.inner.lock().expect("buffer mutex poisoned");
        inner
            .entries
            .iter()
            .rev()
            .find(|e| pred(e))
            .map(|e| e.as_ref().clone())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("buffer mutex poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.inner.lock().expect("buffer mutex poisoned").dropped
    }

    pub fn total_appended(&self) -> u64 {
        self.inner
            .lock()
            .expect("buffer mutex poisoned")
            .total_appended
    }

    pub fn utilization(&self) -> f64 {
        self.len() as f64 / self.capacity as f64
    }
}

/// Forwards console-log lines to an append-only JSONL file through a
/// bounded channel. A full channel drops the line and bumps the counter;
/// ingestion never blocks on disk.
pub struct JsonlForwarder {
    tx: Mutex<Option<mpsc::Sender<String>>>,
    dropped: Arc<AtomicU64>,
    write_errors: Arc<AtomicU64>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl JsonlForwarder {
    pub fn spawn(path: PathBuf, channel_capacity: usize) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let (tx, mut rx) = mpsc::channel::<String>(channel_capacity.max(1));
        let write_errors = Arc::new(AtomicU64::new(0));
        let errors = write_errors.clone();
        let handle = tokio::spawn(async move {
            let file = match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "log forwarder disabled: cannot open file");
                    while rx.recv().await.is_some() {}
                    return;
                }
            };
            let mut writer = tokio::io::BufWriter::new(file);
            while let Some(line) = rx.recv().await {
                if writer.write_all(line.as_bytes()).await.is_err()
                    || writer.write_all(b"\n").await.is_err()
                {
                    errors.fetch_add(1, Ordering::Relaxed);
                }
            }
            let _ = writer.flush().await;
        });
        Ok(JsonlForwarder {
            tx: Mutex::new(Some(tx)),
            dropped: Arc::new(AtomicU64::new(0)),
            write_errors,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Enqueue one serialized line. Never blocks; a full (or closed)
    /// channel counts a drop and moves on.
    pub fn forward(&self, entry: &LogEntry) {
        let line = match serde_json::to_string(entry) {
            Ok(l) => l,
            Err(_) => return,
        };
        let guard = self.tx.lock().expect("forwarder mutex poisoned");
        let sent = guard
            .as_ref()
            .map(|tx| tx.try_send(line).is_ok())
            .unwrap_or(false);
        if !sent {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn write_errors(&self) -> u64 {
        self.write_errors.load(Ordering::Relaxed)
    }

    /// Close the channel and wait for the consumer to drain, bounded by
    /// `deadline`. Dropping the last sender ends the consumer loop.
    pub async fn shutdown(&self, deadline: Duration) {
        drop(self.tx.lock().expect("forwarder mutex poisoned").take());
        let handle = self.handle.lock().expect("forwarder mutex poisoned").take();
        if let Some(handle) = handle {
            if tokio::time::timeout(deadline, handle).await.is_err() {
                tracing::warn!("log forwarder did not drain before the shutdown deadline");
            }
        }
    }
}

/// The full set of telemetry buffers plus the optional console forwarder.
pub struct BufferSet {
    pub logs: TelemetryBuffer,
    pub network_waterfall: TelemetryBuffer,
    pub network_bodies: TelemetryBuffer,
    pub websocket_events: TelemetryBuffer,
    pub actions: TelemetryBuffer,
    pub performance: TelemetryBuffer,
    pub extension_logs: TelemetryBuffer,
    forwarder: Option<JsonlForwarder>,
}

impl BufferSet {
    pub fn new(max_entries: usize, forwarder: Option<JsonlForwarder>) -> Self {
        BufferSet {
            logs: TelemetryBuffer::new("logs", max_entries),
            network_waterfall: TelemetryBuffer::new("network_waterfall", max_entries),
            network_bodies: TelemetryBuffer::new("network_bodies", max_entries),
            websocket_events: TelemetryBuffer::new("websocket_events", max_entries),
            actions: TelemetryBuffer::new("actions", max_entries),
            performance: TelemetryBuffer::new("performance", max_entries),
            extension_logs: TelemetryBuffer::new("extension_logs", max_entries),
            forwarder,
        }
    }

    pub fn all(&self) -> [&TelemetryBuffer; 7] {
        [
            &self.logs,
            &self.network_waterfall,
            &self.network_bodies,
            &self.websocket_events,
            &self.actions,
            &self.performance,
            &self.extension_logs,
        ]
    }

    /// Ingest console logs, mirroring each accepted entry to the JSONL
    /// forwarder when one is configured.
    pub fn ingest_logs(&self, entries: Vec<LogEntry>) -> AppendOutcome {
        let mut outcome = AppendOutcome::default();
        let before = self.logs.dropped();
        for entry in entries {
            match self.logs.append(entry.clone()) {
                Ok(seq) => {
                    outcome.appended += 1;
                    if let Some(fw) = &self.forwarder {
                        let mut mirrored = entry;
                        mirrored.sequence = Some(seq);
                        if mirrored.ts.is_empty() {
                            mirrored.ts = now_rfc3339_nanos();
                        }
                        fw.forward(&mirrored);
                    }
                }
                Err(_) => outcome.rejected += 1,
            }
        }
        outcome.evicted = (self.logs.dropped() - before) as usize;
        outcome
    }

    /// Network-body lookup for the analyzers.
    pub fn body_for_url(&self, url: &str) -> Option<LogEntry> {
        self.network_bodies
            .last_where(|e| e.field_str("url") == Some(url))
    }

    pub fn forwarder_dropped(&self) -> u64 {
        self.forwarder.as_ref().map(|f| f.dropped()).unwrap_or(0)
    }

    pub fn forwarder_write_errors(&self) -> u64 {
        self.forwarder.as_ref().map(|f| f.write_errors()).unwrap_or(0)
    }

    pub async fn shutdown(&self, deadline: Duration) {
        if let Some(fw) = &self.forwarder {
            fw.shutdown(deadline).await;
        }
    }
}

/// Summarize logical WebSocket connections from the raw event stream.
/// Events are grouped by connection id; a close event with a code and a
/// reason finishes the connection.
pub fn websocket_status(events: &TelemetryBuffer) -> Value {
    let (all, _) = events.read(&Cursor::zero(), usize::MAX, None);
    let mut connections: Vec<Value> = Vec::new();
    let mut index: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    for e in &all {
        let id = e
            .field_str("connectionId")
            .unwrap_or("unknown")
            .to_string();
        let slot = *index.entry(id.clone()).or_insert_with(|| {
            connections.push(serde_json::json!({
                "connectionId": id,
                "url": e.field_str("url"),
                "state": "open",
                "events": 0,
            }));
            connections.len() - 1
        });
        let conn = &mut connections[slot];
        conn["events"] = Value::from(conn["events"].as_u64().unwrap_or(0) + 1);
        conn["lastEventTs"] = Value::from(e.ts.clone());
        if e.field_str("event") == Some("close") {
            conn["state"] = Value::from("closed");
            if let Some(code) = e.field("code") {
                conn["closeCode"] = code.clone();
            }
            if let Some(reason) = e.field("reason") {
                conn["closeReason"] = reason.clone();
            }
        }
    }
    serde_json::json!({ "connections": connections })
}
