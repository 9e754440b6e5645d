//! Transport seam between the synchronizer and the server.

use std::rc::Rc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::SyncError;
use crate::sync::wire::Endpoint;

/// Delivers one request body to `endpoint` and returns the raw response
/// body, envelope included.
///
/// Failures below the protocol (no connection, timeout) are
/// [`SyncError::Transport`]. Envelope checking is left to the caller.
///
/// The runtime is single-threaded, so futures need not be `Send`.
#[async_trait(?Send)]
pub trait SyncTransport {
    async fn send(&self, endpoint: Endpoint, body: Value) -> Result<Value, SyncError>;
}

#[async_trait(?Send)]
impl<T: SyncTransport + ?Sized> SyncTransport for Rc<T> {
    async fn send(&self, endpoint: Endpoint, body: Value) -> Result<Value, SyncError> {
        (**self).send(endpoint, body).await
    }
}
