//! Flat task records as they travel over the sync protocol.
//!
//! [`TaskRecord`] is the full serialization of a task (every key present).
//! [`TaskPatch`] is what arrives from the server: any subset of the keys,
//! where a key that is present with `null` is distinct from an absent key.

use serde::{Deserialize, Deserializer, Serialize};

use crate::model::task::{ProjectType, Status, TaskId};
use crate::model::when::{Deferral, When};

/// Every synced field of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub title: String,
    pub notes: String,
    pub created: i64,
    pub deleted: bool,
    pub parent: Option<TaskId>,
    pub project_type: ProjectType,
    pub sort_order: Option<f64>,
    pub starred: bool,
    pub status: Status,
    pub status_changed: Option<i64>,
    pub reviewed: bool,
    pub deferred: Option<Deferral>,
    pub deadline: Option<When>,
    pub version: Option<i64>,
}

impl TaskRecord {
    /// The record with its sync-private version cleared, as kept in
    /// last-known snapshots.
    #[must_use]
    pub fn without_version(mut self) -> Self {
        self.version = None;
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: Option<i64>) -> Self {
        self.version = version;
        self
    }
}

/// Wrap whatever is present in `Some`, so `null` survives as `Some(None)`
/// for nullable fields while absent keys stay `None` via `#[serde(default)]`.
fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

/// A sparse record: only the keys present are applied.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TaskPatch {
    pub id: TaskId,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub deleted: Option<bool>,
    #[serde(default, deserialize_with = "present")]
    pub parent: Option<Option<TaskId>>,
    #[serde(default, deserialize_with = "present")]
    pub project_type: Option<ProjectType>,
    #[serde(default, deserialize_with = "present")]
    pub sort_order: Option<Option<f64>>,
    #[serde(default)]
    pub starred: Option<bool>,
    #[serde(default, deserialize_with = "present")]
    pub status: Option<Status>,
    #[serde(default, deserialize_with = "present")]
    pub status_changed: Option<Option<i64>>,
    #[serde(default)]
    pub reviewed: Option<bool>,
    #[serde(default, deserialize_with = "present")]
    pub deferred: Option<Option<Deferral>>,
    #[serde(default, deserialize_with = "present")]
    pub deadline: Option<Option<When>>,
    #[serde(default)]
    pub version: Option<i64>,
}

impl TaskPatch {
    /// A patch that touches nothing but names the task.
    #[must_use]
    pub fn empty(id: TaskId) -> Self {
        Self {
            id,
            title: None,
            notes: None,
            created: None,
            deleted: None,
            parent: None,
            project_type: None,
            sort_order: None,
            starred: None,
            status: None,
            status_changed: None,
            reviewed: None,
            deferred: None,
            deadline: None,
            version: None,
        }
    }
}

impl From<TaskRecord> for TaskPatch {
    fn from(record: TaskRecord) -> Self {
        Self {
            id: record.id,
            title: Some(record.title),
            notes: Some(record.notes),
            created: Some(record.created),
            deleted: Some(record.deleted),
            parent: Some(record.parent),
            project_type: Some(record.project_type),
            sort_order: Some(record.sort_order),
            starred: Some(record.starred),
            status: Some(record.status),
            status_changed: Some(record.status_changed),
            reviewed: Some(record.reviewed),
            deferred: Some(record.deferred),
            deadline: Some(record.deadline),
            version: record.version,
        }
    }
}
