//! A simulated user: a local task store, its synchronizer, and the random
//! actions the user takes.

use std::collections::BTreeMap;
use std::rc::Rc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tm_core::TaskStore;
use tm_core::clock::ManualClock;
use tm_core::config::SyncConfig;
use tm_core::error::SyncError;
use tm_core::model::{DeferBucket, Deferral, ProjectType, Status, TaskId, TaskRecord, When};
use tm_core::sync::wire::{decode_pull_response, decode_push_response};
use tm_core::sync::{SyncAction, SyncEngine};

use crate::rng::DeterministicRng;

/// Stable identifier for a simulated client.
pub type ClientId = usize;

const HOUR_MILLIS: i64 = 3_600_000;

/// Which field an edit touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EditKind {
    Title,
    Notes,
    Starred,
    Status,
    Deleted,
    Deferred,
    Deadline,
    ProjectType,
}

const EDIT_KINDS: [EditKind; 8] = [
    EditKind::Title,
    EditKind::Notes,
    EditKind::Starred,
    EditKind::Status,
    EditKind::Deleted,
    EditKind::Deferred,
    EditKind::Deadline,
    EditKind::ProjectType,
];

/// A local user action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientAction {
    CreateRoot { task: String },
    CreateSubtask { task: String, parent: String, first: bool },
    Edit { task: String, kind: EditKind },
}

/// Final local state of one client, for the oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientState {
    pub id: ClientId,
    /// Every task as a record without its version, keyed by task id.
    pub records: BTreeMap<String, TaskRecord>,
    /// Changes the client has not had acknowledged.
    pub unsent: usize,
}

/// One user with a local store and a synchronizer.
///
/// A client only edits tasks it created and only attaches new tasks under
/// its own tasks, so every task has a single writer.
pub struct SimulatedClient {
    id: ClientId,
    store: TaskStore,
    engine: SyncEngine,
    owned: Vec<TaskId>,
    edits: u64,
}

impl std::fmt::Debug for SimulatedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedClient")
            .field("id", &self.id)
            .field("tasks", &self.store.len())
            .field("owned", &self.owned.len())
            .field("engine", &self.engine)
            .finish()
    }
}

impl SimulatedClient {
    /// `ids` seeds the client's task ids, so a run depends only on its seed.
    #[must_use]
    pub fn new(
        id: ClientId,
        clock: &ManualClock,
        config: SyncConfig,
        now: i64,
        mut ids: DeterministicRng,
    ) -> Self {
        let store = TaskStore::new(Rc::new(clock.clone()))
            .with_id_source(move || TaskId::from(format!("c{id}-{:016x}", ids.next_u64())));
        let engine = SyncEngine::attach(&store, config, now);
        Self {
            id,
            store,
            engine,
            owned: Vec::new(),
            edits: 0,
        }
    }

    #[must_use]
    pub const fn id(&self) -> ClientId {
        self.id
    }

    #[must_use]
    pub const fn store(&self) -> &TaskStore {
        &self.store
    }

    #[must_use]
    pub const fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    /// Deliver queued store notifications and collect due requests.
    pub fn turn(&mut self, now: i64) -> Vec<SyncAction> {
        self.store.flush();
        self.engine.poll(&mut self.store, now)
    }

    pub fn refresh(&mut self, now: i64) {
        self.engine.refresh(&self.store, now);
    }

    /// Perform one random action on tasks this client owns.
    ///
    /// # Errors
    ///
    /// Fails only if the store rejects an operation on a task this client
    /// created, which is a bug.
    pub fn act(&mut self, rng: &mut DeterministicRng, now: i64) -> Result<ClientAction> {
        if self.owned.is_empty() || rng.hit_rate_percent(20) {
            return self.create_root();
        }
        if rng.hit_rate_percent(20) {
            let parent = self.owned[rng.index(self.owned.len())].clone();
            let first = rng.hit_rate_percent(30);
            return self.create_subtask(&parent, first);
        }

        let task = self.owned[rng.index(self.owned.len())].clone();
        let kind = EDIT_KINDS[rng.index(EDIT_KINDS.len())];
        self.edits += 1;
        let label = format!("c{} edit {}", self.id, self.edits);
        let current = self.store.get(&task)?.clone();
        let mut editor = self.store.edit(&task)?;
        match kind {
            EditKind::Title => {
                editor.set_title(label);
            }
            EditKind::Notes => {
                editor.set_notes(label);
            }
            EditKind::Starred => {
                editor.set_starred(!current.starred());
            }
            EditKind::Status => {
                let next = match current.status() {
                    Status::Open => Status::Done,
                    Status::Done => Status::Open,
                };
                editor.set_status(next);
            }
            EditKind::Deleted => {
                editor.set_deleted(!current.deleted());
            }
            EditKind::Deferred => {
                let deferred = match rng.next_bounded(5) {
                    0 => None,
                    1 => Some(Deferral::Bucket(DeferBucket::Later)),
                    2 => Some(Deferral::Bucket(DeferBucket::Someday)),
                    3 => Some(Deferral::Bucket(DeferBucket::Waiting)),
                    _ => Some(Deferral::Until(When::At(now + HOUR_MILLIS))),
                };
                editor.set_deferred(deferred);
            }
            EditKind::Deadline => {
                let days = i64::try_from(rng.next_bounded(6)).unwrap_or(0);
                let deadline = (days > 0).then(|| When::At(now + days * 24 * HOUR_MILLIS));
                editor.set_deadline(deadline);
            }
            EditKind::ProjectType => {
                let kinds = [
                    ProjectType::Plain,
                    ProjectType::SingleAction,
                    ProjectType::Parallel,
                    ProjectType::Sequential,
                ];
                editor.set_project_type(kinds[rng.index(kinds.len())]);
            }
        }
        Ok(ClientAction::Edit {
            task: task.to_string(),
            kind,
        })
    }

    fn new_task(&mut self) -> Result<TaskId> {
        let id = self.store.create_task();
        let title = format!("c{} task {}", self.id, self.owned.len());
        self.store.edit(&id)?.set_title(title);
        self.owned.push(id.clone());
        Ok(id)
    }

    fn create_root(&mut self) -> Result<ClientAction> {
        let id = self.new_task()?;
        Ok(ClientAction::CreateRoot {
            task: id.to_string(),
        })
    }

    fn create_subtask(&mut self, parent: &TaskId, first: bool) -> Result<ClientAction> {
        let hint = if first {
            self.store.first_sort_order(parent)?
        } else {
            self.store.last_sort_order(parent)?
        };
        let id = self.new_task()?;
        self.store.edit(&id)?.set_parent(parent, Some(hint))?;
        Ok(ClientAction::CreateSubtask {
            task: id.to_string(),
            parent: parent.to_string(),
            first,
        })
    }

    /// Hand the outcome of a request back to the synchronizer.
    ///
    /// # Errors
    ///
    /// Propagates a failure to apply pulled records to the store.
    pub fn settle(
        &mut self,
        action: &SyncAction,
        reply: Result<Value, SyncError>,
        now: i64,
    ) -> Result<()> {
        match action {
            SyncAction::Push(_) => {
                self.engine
                    .push_settled(reply.and_then(decode_push_response), now);
            }
            SyncAction::Pull(_) => {
                self.engine.pull_settled(
                    &mut self.store,
                    reply.and_then(decode_pull_response),
                    now,
                )?;
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn snapshot(&self) -> ClientState {
        ClientState {
            id: self.id,
            records: self
                .store
                .tasks()
                .map(|t| (t.id().to_string(), t.to_record().without_version()))
                .collect(),
            unsent: self.engine.unsent(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tm_core::clock::Clock;

    const T0: i64 = 1_760_000_000_000;

    #[test]
    fn actions_only_touch_owned_tasks() {
        let clock = ManualClock::new(T0);
        let mut client = SimulatedClient::new(0, &clock, SyncConfig::default(), T0, DeterministicRng::new(5));
        let mut rng = DeterministicRng::new(11);
        for step in 0..200 {
            clock.set(T0 + step * 100);
            let action = client.act(&mut rng, clock.now_millis()).unwrap();
            let touched = match &action {
                ClientAction::CreateRoot { task }
                | ClientAction::CreateSubtask { task, .. }
                | ClientAction::Edit { task, .. } => task.clone(),
            };
            assert!(client.owned.iter().any(|id| id.as_str() == touched));
        }
        assert_eq!(client.store().len(), client.owned.len());
    }

    #[test]
    fn task_ids_follow_the_id_stream() {
        let ids_for = |seed| {
            let clock = ManualClock::new(T0);
            let mut client =
                SimulatedClient::new(3, &clock, SyncConfig::default(), T0, DeterministicRng::new(seed));
            (0..4)
                .map(|_| client.new_task().unwrap().to_string())
                .collect::<Vec<_>>()
        };
        let first = ids_for(21);
        assert_eq!(first, ids_for(21));
        assert_ne!(first, ids_for(22));
        assert!(first.iter().all(|id| id.starts_with("c3-")));
    }

    #[test]
    fn subtasks_get_distinct_orders() {
        let clock = ManualClock::new(T0);
        let mut client = SimulatedClient::new(0, &clock, SyncConfig::default(), T0, DeterministicRng::new(5));
        let ClientAction::CreateRoot { task } = client.create_root().unwrap() else {
            panic!("expected a root");
        };
        let parent = TaskId::from(task.as_str());
        for first in [false, true, false, true] {
            client.create_subtask(&parent, first).unwrap();
        }
        let store = client.store();
        let mut orders: Vec<f64> = store
            .get(&parent)
            .unwrap()
            .subtasks()
            .iter()
            .map(|id| store.get(id).unwrap().sort_order().unwrap())
            .collect();
        assert_eq!(orders, vec![-2.0, -1.0, 0.0, 1.0]);
        orders.dedup();
        assert_eq!(orders.len(), 4);
    }
}
