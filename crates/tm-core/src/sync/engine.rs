//! The differential synchronizer as a sans-io state machine.
//!
//! [`SyncEngine`] never performs I/O and never reads a clock. The owner
//! feeds it the current time, asks it what to send with
//! [`SyncEngine::poll`], performs the requests, and reports outcomes with
//! [`SyncEngine::push_settled`] and [`SyncEngine::pull_settled`].
//!
//! # Push channel
//!
//! ```text
//!  store event ──► touched ──(sync pass: diff vs snapshot)──► to_send
//!                                                               │ push_at = now + push_delay
//!                                                               ▼
//!            success: clear ◄── in_flight ◄──(poll at push_at)──┘
//!            failure: merge back into to_send, wait for the next trigger
//! ```
//!
//! # Pull channel
//!
//! One pull at attach time, then one `pull_interval` after every pull
//! settles, whatever the outcome. Incoming records apply only when the
//! local version is unset or strictly older; ties keep the local copy.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::rc::Rc;

use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{SyncError, TaskError};
use crate::events::{EventBus, Subscription};
use crate::model::record::{TaskPatch, TaskRecord};
use crate::model::task::TaskId;
use crate::store::TaskStore;
use crate::sync::wire::{PullRequest, PullResponse, PushRequest, SyncCursor};

/// Coarse synchronizer state for status displays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    /// Local changes noticed; a sync pass is due.
    Changed,
    /// Nothing left to send.
    Synchronized,
    /// A request failed. Sync carries on.
    Error(SyncError),
}

/// One batch of records for the `save` call.
#[derive(Debug, Clone, PartialEq)]
pub struct PushBatch {
    pub ids: Vec<TaskId>,
    pub request: PushRequest,
}

/// A request the owner should issue.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncAction {
    Push(PushBatch),
    Pull(PullRequest),
}

/// What one applied pull did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullReport {
    pub received: usize,
    pub applied: usize,
    pub ignored: usize,
    pub malformed: usize,
    pub placeholders: usize,
}

/// Differential synchronizer state.
pub struct SyncEngine {
    config: SyncConfig,

    touched: Rc<RefCell<BTreeSet<TaskId>>>,
    sync_due: Rc<Cell<bool>>,
    store_subscription: Option<Subscription>,

    snapshots: HashMap<TaskId, TaskRecord>,
    to_send: BTreeSet<TaskId>,
    in_flight: BTreeSet<TaskId>,
    push_at: Option<i64>,
    pushing: bool,

    cursor: SyncCursor,
    pull_at: Option<i64>,
    pulling: bool,

    status: EventBus<SyncStatus>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("to_send", &self.to_send.len())
            .field("in_flight", &self.in_flight.len())
            .field("push_at", &self.push_at)
            .field("pull_at", &self.pull_at)
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Start observing `store`. Tasks already in the store count as touched,
    /// and the first pull is due at `now`.
    #[must_use]
    pub fn attach(store: &TaskStore, config: SyncConfig, now: i64) -> Self {
        let touched: Rc<RefCell<BTreeSet<TaskId>>> =
            Rc::new(RefCell::new(store.tasks().map(|t| t.id().clone()).collect()));
        let sync_due = Rc::new(Cell::new(!touched.borrow().is_empty()));
        let status: EventBus<SyncStatus> = EventBus::new();

        let subscription = {
            let touched = Rc::clone(&touched);
            let sync_due = Rc::clone(&sync_due);
            let status = status.clone();
            store.subscribe(move |event, _| {
                touched.borrow_mut().insert(event.id().clone());
                if !sync_due.replace(true) {
                    status.dispatch(&SyncStatus::Changed, &());
                }
                Ok(())
            })
        };

        Self {
            config,
            touched,
            sync_due,
            store_subscription: Some(subscription),
            snapshots: HashMap::new(),
            to_send: BTreeSet::new(),
            in_flight: BTreeSet::new(),
            push_at: None,
            pushing: false,
            cursor: SyncCursor::BEGINNING,
            pull_at: Some(now),
            pulling: false,
            status,
        }
    }

    /// Stop observing the store.
    pub fn detach(mut self) {
        if let Some(subscription) = self.store_subscription.take() {
            subscription.unsubscribe();
        }
    }

    pub fn subscribe_status<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SyncStatus) -> anyhow::Result<()> + 'static,
    {
        self.status.subscribe(move |status, _| handler(status))
    }

    fn emit(&self, status: &SyncStatus) {
        self.status.dispatch(status, &());
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    #[must_use]
    pub const fn cursor(&self) -> SyncCursor {
        self.cursor
    }

    /// Ids with changes not yet acknowledged by the server.
    #[must_use]
    pub fn unsent(&self) -> usize {
        self.to_send.len() + self.in_flight.len()
    }

    #[must_use]
    pub fn snapshot(&self, id: &TaskId) -> Option<&TaskRecord> {
        self.snapshots.get(id)
    }

    #[must_use]
    pub fn sync_due(&self) -> bool {
        self.sync_due.get()
    }

    #[must_use]
    pub const fn push_in_flight(&self) -> bool {
        self.pushing
    }

    #[must_use]
    pub const fn pull_in_flight(&self) -> bool {
        self.pulling
    }

    /// Earliest instant at which [`SyncEngine::poll`] has timed work to do.
    /// A pending sync pass is not included: it is due immediately.
    #[must_use]
    pub fn next_deadline(&self) -> Option<i64> {
        let push = self.push_at.filter(|_| !self.pushing);
        let pull = self.pull_at.filter(|_| !self.pulling);
        match (push, pull) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // -----------------------------------------------------------------------
    // Driving
    // -----------------------------------------------------------------------

    /// Run a due sync pass and return the requests whose time has come.
    pub fn poll(&mut self, store: &mut TaskStore, now: i64) -> Vec<SyncAction> {
        if self.sync_due.get() {
            self.sync_pass(store, now);
        }

        let mut actions = Vec::new();
        if let Some(at) = self.push_at
            && at <= now
            && !self.pushing
        {
            self.push_at = None;
            if let Some(batch) = self.start_push(store) {
                actions.push(SyncAction::Push(batch));
            }
        }
        if let Some(at) = self.pull_at
            && at <= now
            && !self.pulling
        {
            self.pull_at = None;
            self.pulling = true;
            debug!(since = self.cursor.0, "pull requested");
            actions.push(SyncAction::Pull(PullRequest { since: self.cursor }));
        }
        actions
    }

    /// Diff every touched task against its snapshot. Changed tasks have
    /// their version claimed and are queued for the next push.
    fn sync_pass(&mut self, store: &mut TaskStore, now: i64) {
        self.sync_due.set(false);
        let touched = std::mem::take(&mut *self.touched.borrow_mut());

        let mut changed = 0usize;
        for id in touched {
            let Some(task) = store.by_id(&id) else {
                continue;
            };
            let record = task.to_record().without_version();
            if self.snapshots.get(&id) == Some(&record) {
                continue;
            }
            let claim = task.updated();
            store.claim_version(&id, claim);
            self.snapshots.insert(id.clone(), record);
            self.to_send.insert(id);
            changed += 1;
        }
        debug!(changed, unsent = self.to_send.len(), "sync pass");

        if self.to_send.is_empty() {
            if changed == 0 && !self.pushing {
                self.emit(&SyncStatus::Synchronized);
            }
        } else if self.push_at.is_none() && !self.pushing {
            self.push_at = Some(now.saturating_add(self.config.push_delay()));
        }
    }

    fn start_push(&mut self, store: &TaskStore) -> Option<PushBatch> {
        if self.to_send.is_empty() {
            return None;
        }
        let ids: Vec<TaskId> = std::mem::take(&mut self.to_send).into_iter().collect();
        let tasks: Vec<TaskRecord> = ids
            .iter()
            .filter_map(|id| {
                let snapshot = self.snapshots.get(id)?.clone();
                Some(snapshot.with_version(store.by_id(id).and_then(|t| t.version())))
            })
            .collect();
        self.in_flight.extend(ids.iter().cloned());
        self.pushing = true;
        debug!(records = tasks.len(), "push requested");
        Some(PushBatch {
            ids,
            request: PushRequest { tasks },
        })
    }

    /// Record the outcome of the push issued by the last `Push` action.
    pub fn push_settled(&mut self, result: Result<(), SyncError>, now: i64) {
        self.pushing = false;
        match result {
            Ok(()) => {
                info!(records = self.in_flight.len(), "push acknowledged");
                self.in_flight.clear();
                if self.to_send.is_empty() {
                    self.emit(&SyncStatus::Synchronized);
                } else if self.push_at.is_none() {
                    self.push_at = Some(now.saturating_add(self.config.push_delay()));
                }
            }
            Err(err) => {
                warn!(error = %err, code = %err.code(), "push failed");
                let failed = std::mem::take(&mut self.in_flight);
                self.to_send.extend(failed);
                self.emit(&SyncStatus::Error(err));
            }
        }
    }

    /// Apply the outcome of the pull issued by the last `Pull` action and
    /// schedule the next one.
    ///
    /// # Errors
    ///
    /// A [`TaskError`] here means a record could not be applied to the task
    /// it was resolved to, which is a bug rather than a sync failure.
    pub fn pull_settled(
        &mut self,
        store: &mut TaskStore,
        result: Result<PullResponse, SyncError>,
        now: i64,
    ) -> Result<PullReport, TaskError> {
        self.pulling = false;
        self.pull_at = Some(now.saturating_add(self.config.pull_interval()));

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, code = %err.code(), "pull failed");
                self.emit(&SyncStatus::Error(err));
                return Ok(PullReport::default());
            }
        };

        let known_before: HashSet<TaskId> = store.tasks().map(|t| t.id().clone()).collect();
        let mut report = PullReport {
            received: response.tasks.len(),
            ..PullReport::default()
        };

        for text in &response.tasks {
            let patch: TaskPatch = match serde_json::from_str(text) {
                Ok(patch) => patch,
                Err(err) => {
                    warn!(error = %err, "skipping undecodable record");
                    report.malformed += 1;
                    continue;
                }
            };

            let local = store.ensure_task(&patch.id).version();
            if local.is_some() && local >= patch.version {
                report.ignored += 1;
                continue;
            }
            store.edit(&patch.id)?.update_from_record(&patch)?;

            // Prefer the record exactly as received so that any local
            // adjustment made while applying it (tie-breaking the sibling
            // order) still diffs as a change.
            let received = match serde_json::from_str::<TaskRecord>(text) {
                Ok(record) => record,
                Err(_) => store.get(&patch.id)?.to_record(),
            };
            self.snapshots.insert(patch.id.clone(), received.without_version());
            report.applied += 1;
        }

        let placeholders: Vec<TaskRecord> = store
            .tasks()
            .filter(|t| !known_before.contains(t.id()) && !self.snapshots.contains_key(t.id()))
            .map(|t| t.to_record().without_version())
            .collect();
        report.placeholders = placeholders.len();
        for record in placeholders {
            self.snapshots.insert(record.id.clone(), record);
        }

        self.cursor = response.next_since;
        info!(
            received = report.received,
            applied = report.applied,
            ignored = report.ignored,
            cursor = self.cursor.0,
            "pull applied"
        );
        if report.malformed > 0 {
            self.emit(&SyncStatus::Error(SyncError::Decode(format!(
                "{} undecodable record(s) in pull",
                report.malformed
            ))));
        }
        Ok(report)
    }

    /// Re-examine every task and pull as soon as possible. Recovers changes
    /// stranded by a failed push.
    pub fn refresh(&mut self, store: &TaskStore, now: i64) {
        self.touched
            .borrow_mut()
            .extend(store.tasks().map(|t| t.id().clone()));
        self.sync_due.set(true);
        if !self.pulling {
            self.pull_at = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use serde_json::json;

    const T0: i64 = 1_760_000_000_000;

    struct Harness {
        clock: ManualClock,
        store: TaskStore,
        engine: SyncEngine,
        statuses: Rc<RefCell<Vec<SyncStatus>>>,
        _status_sub: Subscription,
    }

    impl Harness {
        fn new() -> Self {
            let clock = ManualClock::new(T0);
            let store = TaskStore::new(Rc::new(clock.clone()));
            let engine = SyncEngine::attach(&store, SyncConfig::default(), T0);
            let statuses = Rc::new(RefCell::new(Vec::new()));
            let sink = Rc::clone(&statuses);
            let sub = engine.subscribe_status(move |s| {
                sink.borrow_mut().push(s.clone());
                Ok(())
            });
            Self {
                clock,
                store,
                engine,
                statuses,
                _status_sub: sub,
            }
        }

        fn now(&self) -> i64 {
            self.clock.now_millis()
        }

        fn turn(&mut self) -> Vec<SyncAction> {
            self.store.flush();
            let now = self.now();
            self.engine.poll(&mut self.store, now)
        }

        fn settle_initial_pull(&mut self) {
            let actions = self.turn();
            assert!(matches!(actions.as_slice(), [SyncAction::Pull(_)]));
            let now = self.now();
            self.engine
                .pull_settled(
                    &mut self.store,
                    Ok(PullResponse { tasks: vec![], next_since: SyncCursor(0) }),
                    now,
                )
                .unwrap();
        }
    }

    #[test]
    fn first_poll_pulls_from_the_beginning() {
        let mut h = Harness::new();
        let actions = h.turn();
        assert_eq!(
            actions,
            vec![SyncAction::Pull(PullRequest { since: SyncCursor::BEGINNING })]
        );
        assert!(h.turn().is_empty(), "no second pull while one is in flight");
    }

    #[test]
    fn failed_pull_still_reschedules() {
        let mut h = Harness::new();
        h.turn();
        let now = h.now();
        h.engine
            .pull_settled(&mut h.store, Err(SyncError::Transport("down".into())), now)
            .unwrap();
        assert_eq!(h.engine.next_deadline(), Some(T0 + 20_000));
        assert_eq!(h.engine.cursor(), SyncCursor::BEGINNING);
        assert!(matches!(h.statuses.borrow().last(), Some(SyncStatus::Error(_))));

        h.clock.advance(20_000);
        assert!(matches!(h.turn().as_slice(), [SyncAction::Pull(_)]));
    }

    #[test]
    fn huge_intervals_saturate_instead_of_overflowing() {
        let clock = ManualClock::new(T0);
        let mut store = TaskStore::new(Rc::new(clock.clone()));
        let config = SyncConfig {
            push_delay_ms: u64::MAX,
            pull_interval_ms: u64::MAX,
        };
        let mut engine = SyncEngine::attach(&store, config, T0);

        assert!(matches!(engine.poll(&mut store, T0).as_slice(), [SyncAction::Pull(_)]));
        engine
            .pull_settled(&mut store, Err(SyncError::Transport("down".into())), T0)
            .unwrap();
        assert_eq!(engine.next_deadline(), Some(i64::MAX));

        let id = store.create_task();
        store.edit(&id).unwrap().set_title("later");
        store.flush();
        assert!(engine.poll(&mut store, T0).is_empty());
        assert_eq!(engine.next_deadline(), Some(i64::MAX));
        assert_eq!(engine.unsent(), 1);
    }

    #[test]
    fn edits_are_debounced_and_claimed() {
        let mut h = Harness::new();
        h.settle_initial_pull();

        let id = h.store.create_task();
        h.store.edit(&id).unwrap().set_title("A");
        assert!(h.turn().is_empty(), "push waits for the debounce");
        assert_eq!(h.statuses.borrow().first(), Some(&SyncStatus::Changed));

        let updated = h.store.get(&id).unwrap().updated();
        assert_eq!(h.store.get(&id).unwrap().version(), Some(updated));

        h.clock.advance(2_000);
        let actions = h.turn();
        let [SyncAction::Push(batch)] = actions.as_slice() else {
            panic!("expected one push, got {actions:?}");
        };
        assert_eq!(batch.ids, vec![id.clone()]);
        assert_eq!(batch.request.tasks[0].title, "A");
        assert_eq!(batch.request.tasks[0].version, Some(updated));

        h.engine.push_settled(Ok(()), h.now());
        assert_eq!(h.engine.unsent(), 0);
        assert_eq!(h.statuses.borrow().last(), Some(&SyncStatus::Synchronized));
    }

    #[test]
    fn failed_push_keeps_records_until_next_trigger() {
        let mut h = Harness::new();
        h.settle_initial_pull();

        let id = h.store.create_task();
        h.turn();
        h.clock.advance(2_000);
        assert_eq!(h.turn().len(), 1);
        h.engine
            .push_settled(Err(SyncError::Application { response: "signin".into() }), h.now());
        assert_eq!(h.engine.unsent(), 1);
        assert_eq!(h.engine.next_deadline(), Some(T0 + 20_000), "only the pull is scheduled");

        h.clock.advance(100);
        h.store.edit(&id).unwrap().set_notes("retry me");
        h.turn();
        h.clock.advance(2_000);
        let actions = h.turn();
        let [SyncAction::Push(batch)] = actions.as_slice() else {
            panic!("expected a retried push, got {actions:?}");
        };
        assert_eq!(batch.request.tasks[0].notes, "retry me");
    }

    #[test]
    fn edits_during_flight_get_their_own_push() {
        let mut h = Harness::new();
        h.settle_initial_pull();

        let a = h.store.create_task();
        h.turn();
        h.clock.advance(2_000);
        assert_eq!(h.turn().len(), 1);

        let b = h.store.create_task();
        h.turn();
        assert_eq!(h.engine.next_deadline(), Some(T0 + 20_000));

        h.engine.push_settled(Ok(()), h.now());
        h.clock.advance(2_000);
        let actions = h.turn();
        let [SyncAction::Push(batch)] = actions.as_slice() else {
            panic!("expected follow-up push, got {actions:?}");
        };
        assert_eq!(batch.ids, vec![b]);
        assert!(!batch.ids.contains(&a));
    }

    fn remote_record(id: &str, title: &str, version: i64) -> String {
        json!({
            "id": id, "title": title, "notes": "", "created": T0 - 5_000,
            "deleted": false, "parent": null, "project_type": null,
            "sort_order": 1.0, "starred": false, "status": null,
            "status_changed": null, "reviewed": false, "deferred": null,
            "deadline": null, "version": version,
        })
        .to_string()
    }

    #[test]
    fn pull_applies_by_version() {
        let mut h = Harness::new();
        h.turn();
        let now = h.now();
        let id = TaskId::from("shared");
        h.engine
            .pull_settled(
                &mut h.store,
                Ok(PullResponse { tasks: vec![remote_record("shared", "v5", 5)], next_since: SyncCursor(5) }),
                now,
            )
            .unwrap();
        assert_eq!(h.store.get(&id).unwrap().title(), "v5");

        let pull = |h: &mut Harness, title: &str, version: i64| {
            let now = h.now();
            h.engine
                .pull_settled(
                    &mut h.store,
                    Ok(PullResponse {
                        tasks: vec![remote_record("shared", title, version)],
                        next_since: SyncCursor(version),
                    }),
                    now,
                )
                .unwrap()
        };

        let report = pull(&mut h, "tie", 5);
        assert_eq!(report.ignored, 1);
        assert_eq!(h.store.get(&id).unwrap().title(), "v5");

        let report = pull(&mut h, "v6", 6);
        assert_eq!(report.applied, 1);
        assert_eq!(h.store.get(&id).unwrap().title(), "v6");
        assert_eq!(h.engine.snapshot(&id).unwrap().title, "v6");

        pull(&mut h, "stale", 4);
        assert_eq!(h.store.get(&id).unwrap().title(), "v6");
        assert_eq!(h.engine.cursor(), SyncCursor(4), "cursor follows the server");
    }

    #[test]
    fn pulled_records_are_not_echoed() {
        let mut h = Harness::new();
        h.turn();
        let now = h.now();
        let child = json!({"id": "child", "title": "leaf", "parent": "p", "sort_order": 0.0, "version": 7})
            .to_string();
        let report = h
            .engine
            .pull_settled(
                &mut h.store,
                Ok(PullResponse { tasks: vec![child, "{not json".into()], next_since: SyncCursor(7) }),
                now,
            )
            .unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.malformed, 1);
        assert_eq!(report.placeholders, 1);

        h.turn();
        h.clock.advance(5_000);
        let pushes: Vec<SyncAction> =
            h.turn().into_iter().filter(|a| matches!(a, SyncAction::Push(_))).collect();
        assert!(pushes.is_empty(), "nothing local to send, got {pushes:?}");
    }

    #[test]
    fn refresh_resends_stranded_changes() {
        let mut h = Harness::new();
        h.settle_initial_pull();
        h.store.create_task();
        h.turn();
        h.clock.advance(2_000);
        h.turn();
        h.engine.push_settled(Err(SyncError::Transport("reset".into())), h.now());

        let now = h.now();
        h.engine.refresh(&h.store, now);
        let actions = h.turn();
        assert!(matches!(actions.as_slice(), [SyncAction::Pull(_)]));
        h.clock.advance(2_000);
        assert!(h.turn().iter().any(|a| matches!(a, SyncAction::Push(_))));
    }
}
