//! The task store: identity map, factory, views, and change fan-out.
//!
//! The store owns every [`Task`]. Callers mutate through
//! [`TaskStore::edit`] or the graph operations in [`graph`]; each mutation
//! marks the task dirty and registers it with the [`UpdateQueue`]. Nothing
//! is delivered to subscribers until the owner calls [`TaskStore::flush`],
//! which turns a burst of synchronous edits into one event per task.
//!
//! # Turn model
//!
//! ```text
//!  edit / graph op ──► UpdateQueue ──(first registration)──► on_pending hook
//!                                                                   │
//!  subscribers ◄── StoreEvent::{Created, Updated} ◄── flush() ◄─────┘
//! ```

mod editor;
pub mod graph;
pub mod queue;

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use tracing::trace;

use crate::clock::Clock;
use crate::config::ViewConfig;
use crate::error::TaskError;
use crate::events::{EventBus, Subscription};
use crate::model::task::{ProjectType, Status, Task, TaskId, sibling_order};
use crate::model::when::DeadlineStatus;

pub use editor::TaskEditor;
pub use graph::AttachOutcome;
pub use queue::UpdateQueue;

/// Store-scope change notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StoreEvent {
    Created(TaskId),
    Updated(TaskId),
}

impl StoreEvent {
    #[must_use]
    pub const fn id(&self) -> &TaskId {
        match self {
            Self::Created(id) | Self::Updated(id) => id,
        }
    }
}

/// In-memory task database.
pub struct TaskStore {
    clock: Rc<dyn Clock>,
    tasks: HashMap<TaskId, Task>,
    creation_order: Vec<TaskId>,
    queue: UpdateQueue,
    bus: EventBus<StoreEvent, TaskStore>,
    on_pending: Option<Box<dyn Fn()>>,
    id_source: Option<Box<dyn FnMut() -> TaskId>>,
    view: ViewConfig,
}

impl std::fmt::Debug for TaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStore")
            .field("tasks", &self.tasks.len())
            .field("pending", &!self.queue.is_empty())
            .field("subscribers", &self.bus.len())
            .finish_non_exhaustive()
    }
}

impl TaskStore {
    #[must_use]
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self {
            clock,
            tasks: HashMap::new(),
            creation_order: Vec::new(),
            queue: UpdateQueue::new(),
            bus: EventBus::new(),
            on_pending: None,
            id_source: None,
            view: ViewConfig::default(),
        }
    }

    /// Mint ids for new tasks from `source` instead of random uuids. Ids
    /// must be unique across every store that syncs with this one.
    #[must_use]
    pub fn with_id_source(mut self, source: impl FnMut() -> TaskId + 'static) -> Self {
        self.id_source = Some(Box::new(source));
        self
    }

    #[must_use]
    pub fn with_view_config(mut self, view: ViewConfig) -> Self {
        self.view = view;
        self
    }

    /// Current time from the store's clock.
    #[must_use]
    pub fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    // -----------------------------------------------------------------------
    // Factory and lookup
    // -----------------------------------------------------------------------

    /// Create and register a blank root task.
    pub fn create_task(&mut self) -> TaskId {
        let task = self.create_free_task();
        let id = task.id.clone();
        self.register(task);
        id
    }

    /// Build a blank task with a fresh id without registering it. Hand it to
    /// [`TaskStore::add_task`] once it should become visible.
    #[must_use]
    pub fn create_free_task(&mut self) -> Task {
        let id = self.id_source.as_mut().map_or_else(TaskId::generate, |source| source());
        Task::fresh(id, self.now())
    }

    /// Register a task built with [`TaskStore::create_free_task`].
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::DuplicateId`] if a task with the same id is
    /// already registered.
    pub fn add_task(&mut self, task: Task) -> Result<TaskId, TaskError> {
        if self.tasks.contains_key(&task.id) {
            return Err(TaskError::DuplicateId(task.id));
        }
        let id = task.id.clone();
        self.register(task);
        Ok(id)
    }

    /// Return the task for `id`, registering a blank placeholder first if it
    /// is unknown.
    pub fn ensure_task(&mut self, id: &TaskId) -> &Task {
        if !self.tasks.contains_key(id) {
            trace!(task = %id, "registering placeholder task");
            self.register(Task::fresh(id.clone(), self.now()));
        }
        &self.tasks[id]
    }

    fn register(&mut self, task: Task) {
        let id = task.id.clone();
        self.creation_order.push(id.clone());
        self.tasks.insert(id.clone(), task);
        if self.queue.register_created(id) {
            self.notify_pending();
        }
    }

    #[must_use]
    pub fn by_id(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Lookup that fails with [`TaskError::NotFound`].
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::NotFound`] if `id` is not registered.
    pub fn get(&self, id: &TaskId) -> Result<&Task, TaskError> {
        self.tasks.get(id).ok_or_else(|| TaskError::NotFound(id.clone()))
    }

    #[must_use]
    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    /// Every task, deleted ones included, in creation order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.creation_order.iter().filter_map(|id| self.tasks.get(id))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Start editing `id`.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::NotFound`] if `id` is not registered.
    pub fn edit(&mut self, id: &TaskId) -> Result<TaskEditor<'_>, TaskError> {
        if !self.tasks.contains_key(id) {
            return Err(TaskError::NotFound(id.clone()));
        }
        Ok(TaskEditor::new(self, id.clone()))
    }

    // -----------------------------------------------------------------------
    // Views
    // -----------------------------------------------------------------------

    fn sorted_view<F>(&self, keep: F) -> Vec<&Task>
    where
        F: Fn(&Task) -> bool,
    {
        let cmp = sibling_order();
        let mut view: Vec<&Task> = self.tasks.values().filter(|t| keep(t)).collect();
        view.sort_by(|a, b| cmp(a, b));
        view
    }

    fn unfiled(&self, task: &Task, now: i64) -> bool {
        !task.deleted && task.status == Status::Open && task.parent.is_none() && !task.deferred_status(now)
    }

    /// Root, open, undeferred tasks that are not projects.
    #[must_use]
    pub fn inbox(&self) -> Vec<&Task> {
        let now = self.now();
        self.sorted_view(|t| self.unfiled(t, now) && t.project_type == ProjectType::Plain)
    }

    /// Root, open, undeferred projects.
    #[must_use]
    pub fn projects(&self) -> Vec<&Task> {
        let now = self.now();
        self.sorted_view(|t| self.unfiled(t, now) && t.project_type.is_project())
    }

    #[must_use]
    pub fn starred(&self) -> Vec<&Task> {
        self.sorted_view(|t| t.active() && t.starred)
    }

    /// Active tasks hidden by a deferral that has not elapsed.
    #[must_use]
    pub fn deferred(&self) -> Vec<&Task> {
        let now = self.now();
        self.sorted_view(|t| t.active() && t.deferred_status(now))
    }

    /// Active projects not yet marked reviewed.
    #[must_use]
    pub fn review(&self) -> Vec<&Task> {
        self.sorted_view(|t| t.active() && t.is_project() && !t.reviewed)
    }

    /// Parent chain of `id`, nearest first. Unknown ids have no ancestors.
    #[must_use]
    pub fn ancestors(&self, id: &TaskId) -> Vec<TaskId> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = self.tasks.get(id).and_then(|t| t.parent.clone());
        while let Some(pid) = cursor {
            if !seen.insert(pid.clone()) {
                break;
            }
            cursor = self.tasks.get(&pid).and_then(|t| t.parent.clone());
            chain.push(pid);
        }
        chain
    }

    /// Direct subtasks that are neither done nor deleted, in sibling order.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::NotFound`] if `id` is not registered.
    pub fn active_subtasks(&self, id: &TaskId) -> Result<Vec<&Task>, TaskError> {
        let task = self.get(id)?;
        Ok(task
            .subtasks
            .iter()
            .filter_map(|sid| self.tasks.get(sid))
            .filter(|t| t.active())
            .collect())
    }

    /// True when no direct subtask is still active. Callers confirm with the
    /// user before finishing or deleting when this is false.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::NotFound`] if `id` is not registered.
    pub fn safe_to_finish(&self, id: &TaskId) -> Result<bool, TaskError> {
        Ok(self.active_subtasks(id)?.is_empty())
    }

    /// Deadline urgency using the configured pushing-it window.
    #[must_use]
    pub fn deadline_status(&self, id: &TaskId) -> Option<DeadlineStatus> {
        self.tasks
            .get(id)
            .and_then(|t| t.deadline_status(self.now(), self.view.pushing_it_days))
    }

    // -----------------------------------------------------------------------
    // Notification
    // -----------------------------------------------------------------------

    /// Observe every task creation and mutation, delivered by
    /// [`TaskStore::flush`].
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&StoreEvent, &Self) -> anyhow::Result<()> + 'static,
    {
        self.bus.subscribe(handler)
    }

    /// Observe events for one task only.
    pub fn subscribe_task<F>(&self, id: &TaskId, handler: F) -> Subscription
    where
        F: Fn(&StoreEvent, &Self) -> anyhow::Result<()> + 'static,
    {
        let id = id.clone();
        self.bus.subscribe(move |event, store| {
            if event.id() == &id {
                handler(event, store)
            } else {
                Ok(())
            }
        })
    }

    /// Install the hook called whenever the update queue goes from empty to
    /// non-empty. The runtime uses it to schedule a [`TaskStore::flush`] on
    /// its next turn.
    pub fn on_pending<F>(&mut self, hook: F)
    where
        F: Fn() + 'static,
    {
        self.on_pending = Some(Box::new(hook));
    }

    fn notify_pending(&self) {
        if let Some(hook) = &self.on_pending {
            hook();
        }
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Deliver everything queued since the last flush: `Created` events
    /// first, then one `Updated` per touched task and per touched task's
    /// parent. Returns the number of events dispatched.
    pub fn flush(&mut self) -> usize {
        let drained = self.queue.drain();

        let mut updated: Vec<TaskId> = Vec::new();
        let mut seen: HashSet<TaskId> = HashSet::new();
        for id in &drained.dirty {
            let parent = self.tasks.get_mut(id).and_then(|task| {
                task.dirty = false;
                task.parent.clone()
            });
            if seen.insert(id.clone()) {
                updated.push(id.clone());
            }
            if let Some(pid) = parent
                && self.tasks.contains_key(&pid)
                && seen.insert(pid.clone())
            {
                updated.push(pid);
            }
        }

        let mut dispatched = 0;
        for id in drained.created {
            self.bus.dispatch(&StoreEvent::Created(id), self);
            dispatched += 1;
        }
        for id in updated {
            self.bus.dispatch(&StoreEvent::Updated(id), self);
            dispatched += 1;
        }
        dispatched
    }

    // -----------------------------------------------------------------------
    // Mutation plumbing
    // -----------------------------------------------------------------------

    fn mark_dirty(&mut self, id: &TaskId) {
        if let Some(task) = self.tasks.get_mut(id) {
            task.dirty = true;
        }
        if self.queue.register_dirty(id) {
            self.notify_pending();
        }
    }

    /// Run `change` on the task; if it reports a change, stamp `updated`,
    /// drop cached derived values and queue a notification.
    pub(crate) fn modify<F>(&mut self, id: &TaskId, change: F) -> bool
    where
        F: FnOnce(&mut Task) -> bool,
    {
        let now = self.now();
        let Some(task) = self.tasks.get_mut(id) else {
            return false;
        };
        if !change(task) {
            return false;
        }
        task.updated = now;
        task.invalidate();
        self.mark_dirty(id);
        true
    }

    /// Like [`TaskStore::modify`] for derived state: notifies without
    /// stamping `updated`.
    pub(crate) fn modify_derived<F>(&mut self, id: &TaskId, change: F) -> bool
    where
        F: FnOnce(&mut Task) -> bool,
    {
        let Some(task) = self.tasks.get_mut(id) else {
            return false;
        };
        if !change(task) {
            return false;
        }
        self.mark_dirty(id);
        true
    }
}

impl TaskStore {
    /// Stamp the sync version without queueing a notification. The version
    /// is invisible to views, so nothing needs to re-render.
    pub(crate) fn claim_version(&mut self, id: &TaskId, version: i64) {
        if let Some(task) = self.tasks.get_mut(id) {
            task.version = Some(version);
        }
    }
}

/// Assign `value` to `slot` if it differs. Returns whether it did.
pub(crate) fn assign<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}
