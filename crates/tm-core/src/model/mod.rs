//! Task data model: the node type, its synced record form, and the time
//! values used for deferral and deadlines.

pub mod record;
pub mod task;
pub mod when;

pub use record::{TaskPatch, TaskRecord};
pub use task::{ProjectType, Status, Task, TaskId, sibling_order};
pub use when::{DeadlineStatus, DeferBucket, Deferral, When};
