//! In-process sync server.
//!
//! [`MemoryRemote`] answers `save` and `tasks` exactly as a deployed server
//! would, which makes it the reference peer for tests and the simulator.
//! Each stored row has two numbers: the server-assigned row version that
//! pull cursors range over, and the `version` carried inside the record
//! content, which is what an incoming save must beat to replace the row.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, trace};

use crate::clock::Clock;
use crate::error::SyncError;
use crate::sync::transport::SyncTransport;
use crate::sync::wire::{
    Endpoint, PullRequest, RESPONSE_SIGNIN, RESPONSE_UNKNOWN, SyncCursor, error_envelope,
    ok_envelope,
};

#[derive(Debug, Clone)]
struct Row {
    row_version: i64,
    claim: Option<i64>,
    content: String,
}

#[derive(Debug, Default)]
struct ServerState {
    rows: HashMap<String, Row>,
    last_version: i64,
    signed_out: bool,
    offline: bool,
    saves: usize,
    pulls: usize,
}

/// Counters for assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteStats {
    pub saves: usize,
    pub pulls: usize,
    pub rows: usize,
}

/// Reference server. Clones share state.
#[derive(Clone)]
pub struct MemoryRemote {
    clock: Rc<dyn Clock>,
    state: Rc<RefCell<ServerState>>,
    latency: Duration,
}

impl std::fmt::Debug for MemoryRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRemote")
            .field("stats", &self.stats())
            .field("latency", &self.latency)
            .finish_non_exhaustive()
    }
}

impl MemoryRemote {
    #[must_use]
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Rc::new(RefCell::new(ServerState::default())),
            latency: Duration::ZERO,
        }
    }

    /// Delay every async [`SyncTransport::send`] by `latency` of runtime
    /// time. [`MemoryRemote::handle`] is unaffected.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// While signed out every call answers `{"response": "signin"}`.
    pub fn set_signed_in(&self, signed_in: bool) {
        self.state.borrow_mut().signed_out = !signed_in;
    }

    /// While offline every async send fails with a transport error.
    pub fn set_offline(&self, offline: bool) {
        self.state.borrow_mut().offline = offline;
    }

    #[must_use]
    pub fn stats(&self) -> RemoteStats {
        let state = self.state.borrow();
        RemoteStats {
            saves: state.saves,
            pulls: state.pulls,
            rows: state.rows.len(),
        }
    }

    /// Stored record content by id, parsed.
    #[must_use]
    pub fn records(&self) -> HashMap<String, Value> {
        self.state
            .borrow()
            .rows
            .iter()
            .filter_map(|(id, row)| {
                serde_json::from_str(&row.content)
                    .ok()
                    .map(|value| (id.clone(), value))
            })
            .collect()
    }

    /// Answer one call synchronously.
    pub fn handle(&self, endpoint: Endpoint, body: &Value) -> Value {
        if self.state.borrow().signed_out {
            return error_envelope(RESPONSE_SIGNIN);
        }
        match endpoint {
            Endpoint::Save => self.save(body),
            Endpoint::Tasks => self.tasks(body),
        }
    }

    fn next_version(state: &mut ServerState, now: i64) -> i64 {
        let version = now.max(state.last_version + 1);
        state.last_version = version;
        version
    }

    fn save(&self, body: &Value) -> Value {
        let Some(tasks) = body.get("tasks").and_then(Value::as_array) else {
            return error_envelope(RESPONSE_UNKNOWN);
        };
        let now = self.clock.now_millis();
        let mut state = self.state.borrow_mut();
        state.saves += 1;

        for task in tasks {
            let Some(id) = task.get("id").and_then(Value::as_str) else {
                debug!("save: skipping record without id");
                continue;
            };
            let claim = task.get("version").and_then(Value::as_i64);
            let accept = state.rows.get(id).is_none_or(|row| row.claim < claim);
            if !accept {
                trace!(task = id, ?claim, "save: ignored stale record");
                continue;
            }

            let row_version = Self::next_version(&mut state, now);
            let content = task.to_string();
            trace!(task = id, row_version, "save: stored");
            state.rows.insert(
                id.to_string(),
                Row {
                    row_version,
                    claim,
                    content,
                },
            );
        }
        ok_envelope(Value::Null)
    }

    fn tasks(&self, body: &Value) -> Value {
        let since = serde_json::from_value::<PullRequest>(body.clone())
            .map_or(SyncCursor::BEGINNING, |req| req.since);
        let mut state = self.state.borrow_mut();
        state.pulls += 1;

        let mut rows: Vec<&Row> = state
            .rows
            .values()
            .filter(|row| row.row_version > since.0)
            .collect();
        rows.sort_by_key(|row| row.row_version);

        let next_since = rows.last().map_or(since, |row| SyncCursor(row.row_version));
        let tasks: Vec<String> = rows.iter().map(|row| row.content.clone()).collect();
        ok_envelope(serde_json::json!({
            "tasks": tasks,
            "next_since": next_since,
        }))
    }
}

#[async_trait(?Send)]
impl SyncTransport for MemoryRemote {
    async fn send(&self, endpoint: Endpoint, body: Value) -> Result<Value, SyncError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.state.borrow().offline {
            return Err(SyncError::Transport(format!("{endpoint}: connection refused")));
        }
        Ok(self.handle(endpoint, &body))
    }
}
