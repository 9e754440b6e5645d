//! Differential synchronization with a task server.
//!
//! Local edits are diffed against the last state exchanged with the server
//! and pushed in debounced batches. The server is polled for records newer
//! than a cursor, which are merged last-writer-wins by version.
//!
//! The protocol is transport-agnostic: [`engine::SyncEngine`] is a pure
//! state machine, [`driver::SyncDriver`] runs it on tokio against any
//! [`transport::SyncTransport`], and [`memory::MemoryRemote`] is an
//! in-process server for tests and simulation.

pub mod driver;
pub mod engine;
pub mod memory;
pub mod transport;
pub mod wire;

pub use driver::{SyncDriver, TokioClock};
pub use engine::{PullReport, PushBatch, SyncAction, SyncEngine, SyncStatus};
pub use memory::MemoryRemote;
pub use transport::SyncTransport;
pub use wire::{Endpoint, PullRequest, PullResponse, PushRequest, SyncCursor};
