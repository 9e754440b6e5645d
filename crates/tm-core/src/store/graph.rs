//! Hierarchy and sibling-order operations.
//!
//! Siblings are ordered by `(sort_order, title, created)`. `sort_order` is a
//! real number so a task can be dropped between two siblings by taking the
//! midpoint of their orders without renumbering anyone else. Repeated
//! midpoints eventually run out of precision; [`renormalize`] then rewrites
//! the list as `0, 1, 2, ...`.
//!
//! The pure helpers in this module work on plain `f64` slices. The
//! [`TaskStore`] methods below resolve ids and write results back through
//! the store's notifying mutation path.

use std::cmp::Ordering;

use tracing::{debug, trace};

use crate::error::{ErrorCode, TaskError};
use crate::model::task::{ProjectType, Task, TaskId, sibling_order};
use crate::store::{TaskStore, assign};

/// Gap below which adjacent orders are considered collapsed.
pub const MIN_ORDER_GAP: f64 = 1e-9;

/// Result of [`TaskStore::add_subtask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    Attached,
    /// Already a subtask with an order and no new position requested.
    Unchanged,
    /// The parent is the task itself or one of its descendants.
    CycleRejected,
}

// ---------------------------------------------------------------------------
// Order arithmetic
// ---------------------------------------------------------------------------

fn min_of(orders: &[f64]) -> Option<f64> {
    orders.iter().copied().reduce(f64::min)
}

fn max_of(orders: &[f64]) -> Option<f64> {
    orders.iter().copied().reduce(f64::max)
}

/// An order that sorts before every existing one.
#[must_use]
pub fn first_sort_order(orders: &[f64]) -> f64 {
    min_of(orders).map_or(0.0, |m| m - 1.0)
}

/// An order that sorts after every existing one.
#[must_use]
pub fn last_sort_order(orders: &[f64]) -> f64 {
    max_of(orders).map_or(0.0, |m| m + 1.0)
}

/// Midpoint between `reference` and the next larger order, or
/// `reference + 1` when nothing is larger.
#[must_use]
pub fn after_sort_order(orders: &[f64], reference: f64) -> f64 {
    let larger: Vec<f64> = orders.iter().copied().filter(|o| *o > reference).collect();
    min_of(&larger).map_or(reference + 1.0, |next| reference + (next - reference) / 2.0)
}

/// Midpoint between `reference` and the next smaller order, or
/// `reference - 1` when nothing is smaller.
#[must_use]
pub fn before_sort_order(orders: &[f64], reference: f64) -> f64 {
    let smaller: Vec<f64> = orders.iter().copied().filter(|o| *o < reference).collect();
    max_of(&smaller).map_or(reference - 1.0, |prev| prev + (reference - prev) / 2.0)
}

/// Break exact ties in an already sorted list by pulling the earlier of
/// each tied pair halfway toward its (already corrected) predecessor.
pub fn collapse_ties(orders: &mut [f64]) {
    for i in 0..orders.len().saturating_sub(1) {
        if orders[i].total_cmp(&orders[i + 1]) == Ordering::Equal {
            let prev = if i == 0 { orders[0] - 1.0 } else { orders[i - 1] };
            orders[i] = prev + (orders[i] - prev) / 2.0;
        }
    }
}

/// Rewrite a sorted list as `0, 1, 2, ...` if any adjacent gap is below
/// [`MIN_ORDER_GAP`]. Returns whether it did.
#[allow(clippy::cast_precision_loss)]
pub fn renormalize(orders: &mut [f64]) -> bool {
    let collapsed = orders.windows(2).any(|w| w[1] - w[0] < MIN_ORDER_GAP);
    if collapsed {
        for (i, order) in orders.iter_mut().enumerate() {
            *order = i as f64;
        }
    }
    collapsed
}

/// `(next_task, available_task)` for the `index`-th active subtask.
#[must_use]
pub const fn availability(kind: ProjectType, index: usize) -> (bool, bool) {
    let first = index == 0;
    match kind {
        ProjectType::Parallel => (first, true),
        ProjectType::Sequential => (first, first),
        ProjectType::Plain | ProjectType::SingleAction => (true, true),
    }
}

// ---------------------------------------------------------------------------
// Store operations
// ---------------------------------------------------------------------------

impl TaskStore {
    fn child_orders(&self, parent: &TaskId) -> Result<Vec<f64>, TaskError> {
        Ok(self
            .get(parent)?
            .subtasks
            .iter()
            .filter_map(|id| self.tasks.get(id).and_then(|t| t.sort_order))
            .collect())
    }

    /// See [`first_sort_order`].
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::NotFound`] if `parent` is not registered.
    pub fn first_sort_order(&self, parent: &TaskId) -> Result<f64, TaskError> {
        Ok(first_sort_order(&self.child_orders(parent)?))
    }

    /// See [`last_sort_order`].
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::NotFound`] if `parent` is not registered.
    pub fn last_sort_order(&self, parent: &TaskId) -> Result<f64, TaskError> {
        Ok(last_sort_order(&self.child_orders(parent)?))
    }

    /// Order for dropping a task right after `reference` under `parent`.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::NotFound`] if either task is not registered.
    pub fn after_sort_order(&self, parent: &TaskId, reference: &TaskId) -> Result<f64, TaskError> {
        let orders = self.child_orders(parent)?;
        Ok(match self.get(reference)?.sort_order {
            Some(r) => after_sort_order(&orders, r),
            None => last_sort_order(&orders),
        })
    }

    /// Order for dropping a task right before `reference` under `parent`.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::NotFound`] if either task is not registered.
    pub fn before_sort_order(&self, parent: &TaskId, reference: &TaskId) -> Result<f64, TaskError> {
        let orders = self.child_orders(parent)?;
        Ok(match self.get(reference)?.sort_order {
            Some(r) => before_sort_order(&orders, r),
            None => first_sort_order(&orders),
        })
    }

    fn sort_ids(&self, ids: &mut [TaskId]) {
        let cmp = sibling_order();
        ids.sort_by(|a, b| match (self.tasks.get(a), self.tasks.get(b)) {
            (Some(a), Some(b)) => cmp(a, b),
            _ => Ordering::Equal,
        });
    }

    /// Make `child` a subtask of `parent`, positioned at `sort_order_hint`
    /// or after the existing subtasks.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::NotFound`] if either task is not registered.
    pub fn add_subtask(
        &mut self,
        parent: &TaskId,
        child: &TaskId,
        sort_order_hint: Option<f64>,
    ) -> Result<AttachOutcome, TaskError> {
        self.get(parent)?;
        let current = self.get(child)?;

        if current.parent.as_ref() == Some(parent)
            && current.sort_order.is_some()
            && sort_order_hint.is_none()
        {
            return Ok(AttachOutcome::Unchanged);
        }
        if parent == child || self.ancestors(parent).contains(child) {
            debug!(
                %parent,
                %child,
                code = %ErrorCode::CycleRejected,
                "refusing reparent: would create a cycle"
            );
            return Ok(AttachOutcome::CycleRejected);
        }

        if let Some(old) = current.parent.clone() {
            self.unlink(&old, child);
        }

        let order = match sort_order_hint {
            Some(hint) => hint,
            None => last_sort_order(&self.child_orders(parent)?),
        };
        let new_parent = Some(parent.clone());
        self.modify(child, |t| {
            assign(&mut t.parent, new_parent) | assign(&mut t.sort_order, Some(order))
        });
        if let Some(p) = self.tasks.get_mut(parent) {
            p.subtasks.push(child.clone());
        }

        self.correct_sort_order(parent);
        self.mark_dirty(parent);
        self.update_subtask_availability(parent);
        trace!(%parent, %child, order, "attached subtask");
        Ok(AttachOutcome::Attached)
    }

    /// Make `id` a root task. Returns false if it had no parent.
    #[allow(clippy::cast_precision_loss)]
    pub fn detach_parent(&mut self, id: &TaskId) -> bool {
        let Some(parent) = self.tasks.get(id).and_then(|t| t.parent.clone()) else {
            return false;
        };
        self.unlink(&parent, id);

        let fresh_order = self.now() as f64;
        self.modify(id, |t| {
            t.parent = None;
            t.sort_order = Some(fresh_order);
            true
        });
        self.modify_derived(id, |t| {
            assign(&mut t.next_task, true) | assign(&mut t.available_task, true)
        });
        true
    }

    fn unlink(&mut self, parent: &TaskId, child: &TaskId) {
        let removed = self.tasks.get_mut(parent).is_some_and(|p| {
            let before = p.subtasks.len();
            p.subtasks.retain(|id| id != child);
            p.subtasks.len() != before
        });
        if removed {
            self.mark_dirty(parent);
            self.update_subtask_availability(parent);
        }
    }

    /// Give unordered subtasks an order past the current maximum, sort the
    /// list, and break ties so every sibling has a distinct order.
    pub fn correct_sort_order(&mut self, parent: &TaskId) {
        let Some(p) = self.tasks.get_mut(parent) else {
            return;
        };
        let mut ids = std::mem::take(&mut p.subtasks);

        let known: Vec<f64> = ids
            .iter()
            .filter_map(|id| self.tasks.get(id).and_then(|t| t.sort_order))
            .collect();
        let mut next = last_sort_order(&known);
        for id in &ids {
            if self.tasks.get(id).is_some_and(|t| t.sort_order.is_none()) {
                self.modify(id, |t| assign(&mut t.sort_order, Some(next)));
                next += 1.0;
            }
        }

        self.sort_ids(&mut ids);
        let mut orders: Vec<f64> = ids
            .iter()
            .map(|id| self.tasks.get(id).and_then(|t| t.sort_order).unwrap_or_default())
            .collect();
        collapse_ties(&mut orders);
        if renormalize(&mut orders) {
            debug!(%parent, siblings = orders.len(), "renormalized sibling orders");
        }
        for (id, order) in ids.iter().zip(orders) {
            self.modify(id, |t| assign(&mut t.sort_order, Some(order)));
        }

        if let Some(p) = self.tasks.get_mut(parent) {
            p.subtasks = ids;
        }
    }

    /// Re-sort `parent`'s subtasks and recompute `next_task` and
    /// `available_task` for the active ones from its project type. Inactive
    /// subtasks keep their flags.
    pub fn update_subtask_availability(&mut self, parent: &TaskId) {
        let Some(p) = self.tasks.get_mut(parent) else {
            return;
        };
        let kind = p.project_type;
        let mut ids = std::mem::take(&mut p.subtasks);
        self.sort_ids(&mut ids);

        let active: Vec<TaskId> = ids
            .iter()
            .filter(|id| self.tasks.get(id).is_some_and(Task::active))
            .cloned()
            .collect();
        if let Some(p) = self.tasks.get_mut(parent) {
            p.subtasks = ids;
        }

        for (index, id) in active.iter().enumerate() {
            let (next, available) = availability(kind, index);
            self.modify_derived(id, |t| {
                assign(&mut t.next_task, next) | assign(&mut t.available_task, available)
            });
        }
    }
}
