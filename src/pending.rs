//! Correlation store for queued browser commands.
//!
//! A tool call enqueues a command here; the extension long-polls it out,
//! executes it in the page, and posts the result back by correlation id.
//! One mutex serializes every state transition, a store-level signal
//! wakes long-pollers on enqueue, and a per-query signal wakes waiters
//! on the terminal transition. A background sweeper expires overdue
//! queries.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{watch, Notify};

use crate::clock::{correlation_id, now_rfc3339_nanos};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryState {
    Queued,
    InFlight,
    Complete,
    Error,
    Expired,
}

impl QueryState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            QueryState::Complete | QueryState::Error | QueryState::Expired
        )
    }
}

/// Read-only view of a pending query, copied out under the lock.
#[derive(Debug, Clone, Serialize)]
pub struct QuerySnapshot {
    pub correlation_id: String,
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<i64>,
    pub params: Value,
    pub created_at: String,
    pub state: QueryState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

struct PendingQuery {
    snapshot: QuerySnapshot,
    deadline: Instant,
    terminal_at: Option<Instant>,
    done: Arc<Notify>,
}

/// Terminal queries linger long enough for the caller to read the
/// result, then the sweeper drops them.
const TERMINAL_RETENTION: Duration = Duration::from_secs(600);

struct StoreInner {
    queries: HashMap<String, PendingQuery>,
    // Enqueue order, drained FIFO per tab.
    queue: VecDeque<String>,
}

pub struct PendingStore {
    inner: Mutex<StoreInner>,
    // watch latches the change bit, so an enqueue landing between a
    // drain attempt and the subsequent await is never lost.
    enqueued_signal: watch::Sender<u64>,
    metric_enqueued: AtomicU64,
    metric_completed: AtomicU64,
    metric_failed: AtomicU64,
    metric_expired: AtomicU64,
}

impl Default for PendingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingStore {
    pub fn new() -> Self {
        PendingStore {
            inner: Mutex::new(StoreInner {
                queries: HashMap::new(),
                queue: VecDeque::new(),
            }),
            enqueued_signal: watch::Sender::new(0),
            metric_enqueued: AtomicU64::new(0),
            metric_completed: AtomicU64::new(0),
            metric_failed: AtomicU64::new(0),
            metric_expired: AtomicU64::new(0),
        }
    }

    /// Queue a command for the extension and return its correlation id.
    pub fn enqueue(
        &self,
        prefix: &str,
        command_type: &str,
        tab_id: Option<i64>,
        params: Value,
        timeout: Duration,
    ) -> String {
        let id = correlation_id(prefix);
        let query = PendingQuery {
            snapshot: QuerySnapshot {
                correlation_id: id.clone(),
                command_type: command_type.to_string(),
                tab_id,
                params,
                created_at: now_rfc3339_nanos(),
                state: QueryState::Queued,
                result: None,
                error: None,
                error_kind: None,
            },
            deadline: Instant::now() + timeout,
            terminal_at: None,
            done: Arc::new(Notify::new()),
        };
        {
            let mut inner = self.inner.lock().expect("pending mutex poisoned");
            inner.queue.push_back(id.clone());
            inner.queries.insert(id.clone(), query);
        }
        self.metric_enqueued.fetch_add(1, Ordering::Relaxed);
        self.enqueued_signal.send_modify(|n| *n += 1);
        id
    }

    /// Atomically move up to `max` queued commands for `tab_id` (or any
    /// tab) into `in_flight`, preserving enqueue order.
    pub fn drain_for_extension(&self, tab_id: Option<i64>, max: usize) -> Vec<QuerySnapshot> {
        let mut inner = self.inner.lock().expect("pending mutex poisoned");
        let mut drained = Vec::new();
        let mut remaining = VecDeque::new();
        while let Some(id) = inner.queue.pop_front() {
            if drained.len() >= max {
                remaining.push_back(id);
                continue;
            }
            let take = match inner.queries.get(&id) {
                Some(q) => {
                    q.snapshot.state == QueryState::Queued
                        && (tab_id.is_none() || q.snapshot.tab_id.is_none() || q.snapshot.tab_id == tab_id)
                }
                None => false,
            };
            if take {
                let q = inner.queries.get_mut(&id).expect("checked above");
                q.snapshot.state = QueryState::InFlight;
                drained.push(q.snapshot.clone());
            } else if inner.queries.contains_key(&id) {
                remaining.push_back(id);
            }
        }
        inner.queue = remaining;
        drained
    }

    /// Long-poll variant of [`Self::drain_for_extension`]: waits up to
    /// `server_deadline` for something to drain.
    pub async fn long_poll_drain(
        &self,
        tab_id: Option<i64>,
        max: usize,
        server_deadline: Duration,
    ) -> Vec<QuerySnapshot> {
        let deadline = Instant::now() + server_deadline;
        let mut rx = self.enqueued_signal.subscribe();
        loop {
            rx.borrow_and_update();
            let batch = self.drain_for_extension(tab_id, max);
            if !batch.is_empty() {
                return batch;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Vec::new();
            }
            if tokio::time::timeout(remaining, rx.changed()).await.is_err() {
                return Vec::new();
            }
        }
    }

    /// Terminal success transition. The first terminal transition wins;
    /// later calls (including a late extension result after a timeout)
    /// are no-ops.
    pub fn complete(&self, id: &str, result: Value) -> bool {
        self.finish(id, QueryState::Complete, Some(result), None, None)
    }

    /// Terminal failure transition, same idempotence as [`Self::complete`].
    /// `code` is the extension-reported error class, if any.
    pub fn fail(&self, id: &str, error: String, code: Option<String>) -> bool {
        self.finish(
            id,
            QueryState::Error,
            None,
            Some(error),
            Some(code.unwrap_or_else(|| "error".into())),
        )
    }

    fn finish(
        &self,
        id: &str,
        state: QueryState,
        result: Option<Value>,
        error: Option<String>,
        error_kind: Option<String>,
    ) -> bool {
        let done = {
            let mut inner = self.inner.lock().expect("pending mutex poisoned");
            let Some(q) = inner.queries.get_mut(id) else {
                return false;
            };
            if q.snapshot.state.is_terminal() {
                return false;
            }
            q.snapshot.state = state;
            q.snapshot.result = result;
            q.snapshot.error = error;
            q.snapshot.error_kind = error_kind;
            q.terminal_at = Some(Instant::now());
            q.done.clone()
        };
        match state {
            QueryState::Complete => self.metric_completed.fetch_add(1, Ordering::Relaxed),
            QueryState::Expired => self.metric_expired.fetch_add(1, Ordering::Relaxed),
            _ => self.metric_failed.fetch_add(1, Ordering::Relaxed),
        };
        done.notify_waiters();
        true
    }

    /// Non-blocking peek.
    pub fn get(&self, id: &str) -> Option<QuerySnapshot> {
        let inner = self.inner.lock().expect("pending mutex poisoned");
        inner.queries.get(id).map(|q| q.snapshot.clone())
    }

    /// Block until the query is terminal or `deadline` passes; returns
    /// the freshest snapshot either way.
    pub async fn wait(&self, id: &str, deadline: Duration) -> Option<QuerySnapshot> {
        let until = Instant::now() + deadline;
        loop {
            let (snapshot, done) = {
                let inner = self.inner.lock().expect("pending mutex poisoned");
                match inner.queries.get(id) {
                    Some(q) => (q.snapshot.clone(), q.done.clone()),
                    None => return None,
                }
            };
            if snapshot.state.is_terminal() {
                return Some(snapshot);
            }
            let remaining = until.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Some(snapshot);
            }
            // Register interest before the final state re-check so a
            // terminal transition in between cannot be missed.
            let notified = done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(snap) = self.get(id) {
                if snap.state.is_terminal() {
                    return Some(snap);
                }
            } else {
                return None;
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    /// Expire every query past its deadline and drop terminal queries
    /// past their retention. Returns the newly expired ids.
    pub fn sweep(&self) -> Vec<String> {
        let now = Instant::now();
        let overdue: Vec<String> = {
            let mut inner = self.inner.lock().expect("pending mutex poisoned");
            inner.queries.retain(|_, q| {
                q.terminal_at
                    .map(|at| now.duration_since(at) < TERMINAL_RETENTION)
                    .unwrap_or(true)
            });
            inner
                .queries
                .iter()
                .filter(|(_, q)| !q.snapshot.state.is_terminal() && q.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in &overdue {
            self.finish(
                id,
                QueryState::Expired,
                None,
                Some("command timed out before the extension reported a result".into()),
                Some("timeout".into()),
            );
            tracing::debug!(correlation_id = %id, "pending query expired");
        }
        overdue
    }

    /// Queries still awaiting the extension.
    pub fn pending_snapshot(&self) -> Vec<QuerySnapshot> {
        let inner = self.inner.lock().expect("pending mutex poisoned");
        let mut out: Vec<QuerySnapshot> = inner
            .queries
            .values()
            .filter(|q| !q.snapshot.state.is_terminal())
            .map(|q| q.snapshot.clone())
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    /// Terminally failed queries (errors and timeouts).
    pub fn failed_snapshot(&self) -> Vec<QuerySnapshot> {
        let inner = self.inner.lock().expect("pending mutex poisoned");
        let mut out: Vec<QuerySnapshot> = inner
            .queries
            .values()
            .filter(|q| matches!(q.snapshot.state, QueryState::Error | QueryState::Expired))
            .map(|q| q.snapshot.clone())
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    pub fn counts(&self) -> PendingCounts {
        let inner = self.inner.lock().expect("pending mutex poisoned");
        let mut queued = 0u64;
        let mut in_flight = 0u64;
        for q in inner.queries.values() {
            match q.snapshot.state {
                QueryState::Queued => queued += 1,
                QueryState::InFlight => in_flight += 1,
                _ => {}
            }
        }
        PendingCounts {
            queued,
            in_flight,
            enqueued_total: self.metric_enqueued.load(Ordering::Relaxed),
            completed_total: self.metric_completed.load(Ordering::Relaxed),
            failed_total: self.metric_failed.load(Ordering::Relaxed),
            expired_total: self.metric_expired.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PendingCounts {
    pub queued: u64,
    pub in_flight: u64,
    pub enqueued_total: u64,
    pub completed_total: u64,
    pub failed_total: u64,
    pub expired_total: u64,
}

/// Run the timeout sweeper until the shutdown channel flips. One-second
/// tick per the command-plane contract.
pub fn spawn_sweeper(
    store: Arc<PendingStore>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let expired = store.sweep();
                    if !expired.is_empty() {
                        tracing::info!(count = expired.len(), "expired pending queries");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
