//! tm-core: task graph, change notification, and differential sync for the
//! tm task manager.
//!
//! - [`store::TaskStore`] owns every task and coalesces change notifications.
//! - [`store::graph`] keeps the hierarchy acyclic and siblings ordered.
//! - [`sync`] reconciles the store with a server, last writer wins by version.
//!
//! Everything runs on one thread. Mutation is synchronous; notifications
//! are delivered when the owner calls [`store::TaskStore::flush`].
//!
//! # Conventions
//!
//! - **Errors**: typed `thiserror` enums at the library seams
//!   ([`error::TaskError`], [`error::SyncError`]); `anyhow::Result` for
//!   config loading, subscriber callbacks, and the runtime driver.
//! - **Logging**: `tracing` macros (`info!`, `warn!`, `debug!`, `trace!`).

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod model;
pub mod order;
pub mod store;
pub mod sync;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ErrorCode, SyncError, TaskError};
pub use model::{ProjectType, Status, Task, TaskId, TaskPatch, TaskRecord};
pub use store::{AttachOutcome, StoreEvent, TaskEditor, TaskStore};
