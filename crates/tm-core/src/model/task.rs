//! The task node.
//!
//! A [`Task`] is plain data owned by a [`crate::store::TaskStore`]. Reads go
//! straight through the getters here; every mutation goes through
//! [`crate::store::TaskEditor`] or the store's graph operations so that the
//! "no-op if unchanged, else stamp and notify" rule lives in one place.

use std::cell::OnceCell;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TaskError;
use crate::model::record::TaskRecord;
use crate::model::when::{DeadlineStatus, Deferral, When, deadline_status};
use crate::order::{by_key, by_real_key, by_ref_key, lexicographic};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Opaque, immutable task identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Mint a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Completion status. `Open` travels as `null` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "Option<String>", into = "Option<String>")]
pub enum Status {
    #[default]
    Open,
    Done,
}

impl Status {
    #[must_use]
    pub const fn wire_name(self) -> Option<&'static str> {
        match self {
            Self::Open => None,
            Self::Done => Some("done"),
        }
    }
}

impl FromStr for Status {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::Open),
            "done" => Ok(Self::Done),
            other => Err(TaskError::InvalidEnumValue {
                field: "status",
                got: other.to_string(),
            }),
        }
    }
}

impl TryFrom<Option<String>> for Status {
    type Error = TaskError;

    fn try_from(value: Option<String>) -> Result<Self, Self::Error> {
        value.map_or(Ok(Self::Open), |s| s.parse())
    }
}

impl From<Status> for Option<String> {
    fn from(status: Status) -> Self {
        status.wire_name().map(str::to_string)
    }
}

/// How a task gates its subtasks. `Plain` (not a project) travels as `null`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "Option<String>", into = "Option<String>")]
pub enum ProjectType {
    #[default]
    Plain,
    SingleAction,
    Parallel,
    Sequential,
}

impl ProjectType {
    #[must_use]
    pub const fn wire_name(self) -> Option<&'static str> {
        match self {
            Self::Plain => None,
            Self::SingleAction => Some("single action"),
            Self::Parallel => Some("parallel"),
            Self::Sequential => Some("sequential"),
        }
    }

    #[must_use]
    pub const fn is_project(self) -> bool {
        !matches!(self, Self::Plain)
    }
}

impl FromStr for ProjectType {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::Plain),
            "single action" | "single-action" => Ok(Self::SingleAction),
            "parallel" => Ok(Self::Parallel),
            "sequential" => Ok(Self::Sequential),
            other => Err(TaskError::InvalidEnumValue {
                field: "project_type",
                got: other.to_string(),
            }),
        }
    }
}

impl TryFrom<Option<String>> for ProjectType {
    type Error = TaskError;

    fn try_from(value: Option<String>) -> Result<Self, Self::Error> {
        value.map_or(Ok(Self::Plain), |s| s.parse())
    }
}

impl From<ProjectType> for Option<String> {
    fn from(kind: ProjectType) -> Self {
        kind.wire_name().map(str::to_string)
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Resolved instants, cached until the next mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DerivedDates {
    deferred_until: Option<i64>,
    deadline_at: Option<i64>,
}

/// A node in the task forest.
#[derive(Debug, Clone)]
pub struct Task {
    pub(crate) id: TaskId,
    pub(crate) title: String,
    pub(crate) notes: String,
    pub(crate) created: i64,
    pub(crate) updated: i64,
    pub(crate) version: Option<i64>,

    pub(crate) parent: Option<TaskId>,
    pub(crate) subtasks: Vec<TaskId>,
    pub(crate) sort_order: Option<f64>,
    pub(crate) project_type: ProjectType,

    pub(crate) status: Status,
    pub(crate) status_changed: Option<i64>,
    pub(crate) starred: bool,
    pub(crate) reviewed: bool,
    pub(crate) deleted: bool,
    pub(crate) deferred: Option<Deferral>,
    pub(crate) deadline: Option<When>,

    pub(crate) next_task: bool,
    pub(crate) available_task: bool,

    pub(crate) dirty: bool,
    dates: OnceCell<DerivedDates>,
}

impl Task {
    /// A blank root task. New tasks sort after everything created before
    /// them because their initial order is their creation time.
    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn fresh(id: TaskId, now_millis: i64) -> Self {
        Self {
            id,
            title: String::new(),
            notes: String::new(),
            created: now_millis,
            updated: now_millis,
            version: None,
            parent: None,
            subtasks: Vec::new(),
            sort_order: Some(now_millis as f64),
            project_type: ProjectType::Plain,
            status: Status::Open,
            status_changed: None,
            starred: false,
            reviewed: false,
            deleted: false,
            deferred: None,
            deadline: None,
            next_task: true,
            available_task: true,
            dirty: false,
            dates: OnceCell::new(),
        }
    }

    /// Drop cached derived values. Called on every field write.
    pub(crate) fn invalidate(&mut self) {
        self.dates = OnceCell::new();
    }

    fn dates(&self) -> DerivedDates {
        *self.dates.get_or_init(|| DerivedDates {
            deferred_until: self.deferred.as_ref().and_then(Deferral::until_millis),
            deadline_at: self.deadline.as_ref().and_then(When::resolve),
        })
    }

    // -- getters -----------------------------------------------------------

    #[must_use]
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    #[must_use]
    pub fn notes(&self) -> &str {
        &self.notes
    }

    #[must_use]
    pub fn created(&self) -> i64 {
        self.created
    }

    #[must_use]
    pub fn updated(&self) -> i64 {
        self.updated
    }

    /// Sync-private conflict marker. `None` until the synchronizer claims or
    /// receives the task.
    #[must_use]
    pub fn version(&self) -> Option<i64> {
        self.version
    }

    #[must_use]
    pub fn parent(&self) -> Option<&TaskId> {
        self.parent.as_ref()
    }

    /// All subtasks, active or not, in sibling order.
    #[must_use]
    pub fn subtasks(&self) -> &[TaskId] {
        &self.subtasks
    }

    #[must_use]
    pub fn sort_order(&self) -> Option<f64> {
        self.sort_order
    }

    #[must_use]
    pub fn project_type(&self) -> ProjectType {
        self.project_type
    }

    #[must_use]
    pub fn status(&self) -> Status {
        self.status
    }

    #[must_use]
    pub fn status_changed(&self) -> Option<i64> {
        self.status_changed
    }

    #[must_use]
    pub fn starred(&self) -> bool {
        self.starred
    }

    #[must_use]
    pub fn reviewed(&self) -> bool {
        self.reviewed
    }

    #[must_use]
    pub fn deleted(&self) -> bool {
        self.deleted
    }

    #[must_use]
    pub fn deferred(&self) -> Option<&Deferral> {
        self.deferred.as_ref()
    }

    #[must_use]
    pub fn deadline(&self) -> Option<&When> {
        self.deadline.as_ref()
    }

    /// First actionable subtask of its parent's project.
    #[must_use]
    pub fn next_task(&self) -> bool {
        self.next_task
    }

    /// Actionable now under the parent's project type.
    #[must_use]
    pub fn available_task(&self) -> bool {
        self.available_task
    }

    /// Whether a change notification is queued for this task.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    // -- derived -----------------------------------------------------------

    /// Not deleted and not done.
    #[must_use]
    pub fn active(&self) -> bool {
        !self.deleted && self.status != Status::Done
    }

    #[must_use]
    pub fn is_project(&self) -> bool {
        self.project_type.is_project()
    }

    /// True while deferred to a named bucket or to an instant after `now`.
    #[must_use]
    pub fn deferred_status(&self, now_millis: i64) -> bool {
        match &self.deferred {
            None => false,
            Some(Deferral::Bucket(_)) => true,
            Some(Deferral::Until(_)) => self.dates().deferred_until.is_some_and(|at| at > now_millis),
        }
    }

    /// Deadline urgency, or `None` when there is no (resolvable) deadline.
    #[must_use]
    pub fn deadline_status(&self, now_millis: i64, window_days: u32) -> Option<DeadlineStatus> {
        self.dates()
            .deadline_at
            .map(|at| deadline_status(at, now_millis, window_days))
    }

    /// Serialize every synced field. `version` is included as-is.
    #[must_use]
    pub fn to_record(&self) -> TaskRecord {
        TaskRecord {
            id: self.id.clone(),
            title: self.title.clone(),
            notes: self.notes.clone(),
            created: self.created,
            deleted: self.deleted,
            parent: self.parent.clone(),
            project_type: self.project_type,
            sort_order: self.sort_order,
            starred: self.starred,
            status: self.status,
            status_changed: self.status_changed,
            reviewed: self.reviewed,
            deferred: self.deferred,
            deadline: self.deadline,
            version: self.version,
        }
    }
}

/// Sibling order: `(sort_order, title, created)`, lexicographically.
pub fn sibling_order() -> impl Fn(&Task, &Task) -> Ordering {
    lexicographic::<Task>(vec![
        Box::new(by_real_key(|t: &Task| t.sort_order)),
        Box::new(by_ref_key(|t: &Task| t.title.as_str())),
        Box::new(by_key(|t: &Task| t.created)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::when::DeferBucket;

    const NOW: i64 = 1_760_000_000_000;

    fn task(id: &str) -> Task {
        Task::fresh(TaskId::from(id), NOW)
    }

    #[test]
    fn fresh_task_defaults() {
        let t = task("a");
        assert_eq!(t.created(), NOW);
        assert_eq!(t.sort_order(), Some(1_760_000_000_000.0));
        assert!(t.active());
        assert!(t.next_task() && t.available_task());
        assert_eq!(t.version(), None);
    }

    #[test]
    fn status_names_parse() {
        assert_eq!("done".parse::<Status>().unwrap(), Status::Done);
        assert_eq!("none".parse::<Status>().unwrap(), Status::Open);
        let err = "finished".parse::<Status>().unwrap_err();
        assert!(matches!(err, TaskError::InvalidEnumValue { field: "status", .. }));
    }

    #[test]
    fn project_type_names_parse() {
        assert_eq!("single action".parse::<ProjectType>().unwrap(), ProjectType::SingleAction);
        assert_eq!("sequential".parse::<ProjectType>().unwrap(), ProjectType::Sequential);
        assert!("serial".parse::<ProjectType>().is_err());
    }

    #[test]
    fn enums_travel_as_nullable_strings() {
        assert_eq!(serde_json::to_string(&Status::Open).unwrap(), "null");
        assert_eq!(serde_json::to_string(&ProjectType::SingleAction).unwrap(), "\"single action\"");
        let kind: ProjectType = serde_json::from_str("null").unwrap();
        assert_eq!(kind, ProjectType::Plain);
        assert!(serde_json::from_str::<Status>("\"archived\"").is_err());
    }

    #[test]
    fn active_excludes_done_and_deleted() {
        let mut t = task("a");
        t.status = Status::Done;
        assert!(!t.active());
        t.status = Status::Open;
        t.deleted = true;
        assert!(!t.active());
    }

    #[test]
    fn deferred_status_tracks_cache_invalidation() {
        let mut t = task("a");
        assert!(!t.deferred_status(NOW));

        t.deferred = Some(Deferral::Until(When::At(NOW + 1_000)));
        t.invalidate();
        assert!(t.deferred_status(NOW));
        assert!(!t.deferred_status(NOW + 1_000));

        t.deferred = Some(Deferral::Bucket(DeferBucket::Waiting));
        t.invalidate();
        assert!(t.deferred_status(NOW + 1_000_000));
    }

    #[test]
    fn sibling_order_breaks_ties_by_title_then_created() {
        let cmp = sibling_order();
        let mut a = task("a");
        let mut b = task("b");
        a.sort_order = Some(1.0);
        b.sort_order = Some(1.0);
        a.title = "beta".into();
        b.title = "alpha".into();
        assert_eq!(cmp(&a, &b), Ordering::Greater);

        b.title = "beta".into();
        b.created = NOW + 1;
        assert_eq!(cmp(&a, &b), Ordering::Less);
    }
}
