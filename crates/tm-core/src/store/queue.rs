//! Coalescing notification queue.
//!
//! Mutations register the touched task here instead of notifying anyone
//! directly. The owner drains the queue once per turn, so a burst of edits
//! to one task yields one `Updated` event, delivered after the burst.

use std::collections::HashSet;

use crate::model::task::TaskId;

/// What a drain hands back to the store for dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Drained {
    /// Newly registered tasks, in creation order.
    pub created: Vec<TaskId>,
    /// Tasks with at least one mutation since the last drain, in first-touch
    /// order, each listed once.
    pub dirty: Vec<TaskId>,
}

#[derive(Debug, Default)]
pub struct UpdateQueue {
    created: Vec<TaskId>,
    dirty: Vec<TaskId>,
    dirty_set: HashSet<TaskId>,
}

impl UpdateQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.dirty.is_empty()
    }

    /// Queue a `Created` notification. Returns true when the queue was empty
    /// before this call, i.e. a drain needs scheduling.
    pub fn register_created(&mut self, id: TaskId) -> bool {
        let was_empty = self.is_empty();
        self.created.push(id);
        was_empty
    }

    /// Queue an `Updated` notification unless one is already pending for
    /// `id`. Returns true when the queue was empty before this call.
    pub fn register_dirty(&mut self, id: &TaskId) -> bool {
        let was_empty = self.is_empty();
        if self.dirty_set.insert(id.clone()) {
            self.dirty.push(id.clone());
        }
        was_empty
    }

    /// Take everything pending and reset.
    pub fn drain(&mut self) -> Drained {
        self.dirty_set.clear();
        Drained {
            created: std::mem::take(&mut self.created),
            dirty: std::mem::take(&mut self.dirty),
        }
    }
}
