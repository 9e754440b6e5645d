//! Field setters for one task.
//!
//! Every setter compares before writing: an equal value is a no-op, so
//! re-applying the same value never produces a notification. A real change
//! stamps `updated` and queues one `Updated` event for the next flush.

use tracing::debug;

use crate::error::TaskError;
use crate::model::record::TaskPatch;
use crate::model::task::{ProjectType, Status, TaskId};
use crate::model::when::{Deferral, When};
use crate::store::{TaskStore, assign};

/// Mutable handle on one task, borrowed from [`TaskStore::edit`].
#[derive(Debug)]
pub struct TaskEditor<'a> {
    store: &'a mut TaskStore,
    id: TaskId,
}

impl<'a> TaskEditor<'a> {
    pub(super) fn new(store: &'a mut TaskStore, id: TaskId) -> Self {
        Self { store, id }
    }

    #[must_use]
    pub const fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn set_title(&mut self, title: impl Into<String>) -> &mut Self {
        let title = title.into();
        self.store.modify(&self.id, |t| assign(&mut t.title, title));
        self
    }

    pub fn set_notes(&mut self, notes: impl Into<String>) -> &mut Self {
        let notes = notes.into();
        self.store.modify(&self.id, |t| assign(&mut t.notes, notes));
        self
    }

    pub fn set_starred(&mut self, starred: bool) -> &mut Self {
        self.store.modify(&self.id, |t| assign(&mut t.starred, starred));
        self
    }

    pub fn set_reviewed(&mut self, reviewed: bool) -> &mut Self {
        self.store.modify(&self.id, |t| assign(&mut t.reviewed, reviewed));
        self
    }

    /// Soft delete. The record is kept for sync.
    pub fn set_deleted(&mut self, deleted: bool) -> &mut Self {
        if self.store.modify(&self.id, |t| assign(&mut t.deleted, deleted)) {
            self.refresh_parent();
        }
        self
    }

    pub fn set_deferred(&mut self, deferred: Option<Deferral>) -> &mut Self {
        self.store.modify(&self.id, |t| assign(&mut t.deferred, deferred));
        self
    }

    pub fn set_deadline(&mut self, deadline: Option<When>) -> &mut Self {
        self.store.modify(&self.id, |t| assign(&mut t.deadline, deadline));
        self
    }

    /// Move the task among its siblings. Prefer the graph helpers
    /// (`after_sort_order` and friends) for computing the value.
    pub fn set_sort_order(&mut self, sort_order: Option<f64>) -> &mut Self {
        if self.store.modify(&self.id, |t| assign(&mut t.sort_order, sort_order)) {
            self.refresh_parent();
        }
        self
    }

    pub fn set_project_type(&mut self, project_type: ProjectType) -> &mut Self {
        if self
            .store
            .modify(&self.id, |t| assign(&mut t.project_type, project_type))
        {
            self.store.update_subtask_availability(&self.id);
        }
        self
    }

    /// Parse and set the project type.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::InvalidEnumValue`] for an unknown name; the task
    /// is left untouched.
    pub fn set_project_type_named(&mut self, name: &str) -> Result<&mut Self, TaskError> {
        let project_type: ProjectType = name.parse()?;
        Ok(self.set_project_type(project_type))
    }

    /// User-initiated status transition: stamps `status_changed` and clears
    /// `reviewed` along with the status itself.
    pub fn set_status(&mut self, status: Status) -> &mut Self {
        if self.write_status(status) {
            let now = self.store.now();
            self.store
                .modify(&self.id, |t| assign(&mut t.status_changed, Some(now)));
            self.set_reviewed(false);
        }
        self
    }

    /// Parse and apply a status transition.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::InvalidEnumValue`] for an unknown name; the task
    /// is left untouched.
    pub fn set_status_named(&mut self, name: &str) -> Result<&mut Self, TaskError> {
        let status: Status = name.parse()?;
        Ok(self.set_status(status))
    }

    fn write_status(&mut self, status: Status) -> bool {
        let changed = self.store.modify(&self.id, |t| assign(&mut t.status, status));
        if changed {
            self.refresh_parent();
        }
        changed
    }

    /// Sync-private. Does not stamp `updated`.
    pub(crate) fn set_version(&mut self, version: Option<i64>) -> &mut Self {
        self.store
            .modify_derived(&self.id, |t| assign(&mut t.version, version));
        self
    }

    /// Attach under `parent`. See [`TaskStore::add_subtask`].
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::NotFound`] if `parent` is not registered.
    pub fn set_parent(
        &mut self,
        parent: &TaskId,
        sort_order_hint: Option<f64>,
    ) -> Result<&mut Self, TaskError> {
        self.store.add_subtask(parent, &self.id, sort_order_hint)?;
        Ok(self)
    }

    /// Become a root task. See [`TaskStore::detach_parent`].
    pub fn detach(&mut self) -> &mut Self {
        self.store.detach_parent(&self.id);
        self
    }

    fn refresh_parent(&mut self) {
        let parent = self.store.by_id(&self.id).and_then(|t| t.parent.clone());
        if let Some(parent) = parent {
            self.store.update_subtask_availability(&parent);
        }
    }

    /// Apply a sparse record from the server. Only keys that are present
    /// and differ from the local value are written. A `parent` key resolves
    /// the referenced task through [`TaskStore::ensure_task`], so parent
    /// links may arrive before the parent's own record.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::IdentityMismatch`] if the record names another
    /// task.
    pub fn update_from_record(&mut self, patch: &TaskPatch) -> Result<&mut Self, TaskError> {
        if patch.id != self.id {
            return Err(TaskError::IdentityMismatch {
                expected: self.id.clone(),
                got: patch.id.clone(),
            });
        }

        if let Some(title) = &patch.title {
            self.set_title(title.as_str());
        }
        if let Some(notes) = &patch.notes {
            self.set_notes(notes.as_str());
        }
        if let Some(created) = patch.created {
            self.store.modify(&self.id, |t| assign(&mut t.created, created));
        }
        if let Some(deleted) = patch.deleted {
            self.set_deleted(deleted);
        }
        if let Some(project_type) = patch.project_type {
            self.set_project_type(project_type);
        }
        if let Some(starred) = patch.starred {
            self.set_starred(starred);
        }
        if let Some(status) = patch.status {
            self.write_status(status);
        }
        if let Some(status_changed) = patch.status_changed {
            self.store
                .modify(&self.id, |t| assign(&mut t.status_changed, status_changed));
        }
        if let Some(reviewed) = patch.reviewed {
            self.set_reviewed(reviewed);
        }
        if let Some(deferred) = patch.deferred {
            self.set_deferred(deferred);
        }
        if let Some(deadline) = patch.deadline {
            self.set_deadline(deadline);
        }

        let current_parent = self.store.by_id(&self.id).and_then(|t| t.parent.clone());
        let mut attached = false;
        if let Some(parent) = &patch.parent
            && *parent != current_parent
        {
            match parent {
                Some(pid) => {
                    let hint = patch
                        .sort_order
                        .flatten()
                        .or_else(|| self.store.by_id(&self.id).and_then(|t| t.sort_order));
                    self.store.ensure_task(pid);
                    debug!(task = %self.id, parent = %pid, "applying remote parent");
                    self.store.add_subtask(pid, &self.id, hint)?;
                    attached = true;
                }
                None => {
                    self.store.detach_parent(&self.id);
                }
            }
        }
        // add_subtask already placed the task using the incoming order
        if let Some(sort_order) = patch.sort_order
            && !attached
        {
            self.set_sort_order(sort_order);
            // another writer may have picked an order a sibling already holds
            if let Some(parent) = self.store.by_id(&self.id).and_then(|t| t.parent.clone()) {
                self.store.correct_sort_order(&parent);
                self.store.update_subtask_availability(&parent);
            }
        }

        if let Some(version) = patch.version {
            self.set_version(Some(version));
        }
        Ok(self)
    }
}
