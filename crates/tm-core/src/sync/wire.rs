//! Request and response shapes of the sync protocol.
//!
//! Two calls exist. `save` takes a batch of full task records. `tasks`
//! takes a cursor and returns every record stored after it, each encoded as
//! a JSON string, plus the cursor to use next time.
//!
//! Every response carries a `response` discriminator. `"ok"` is success;
//! anything else (`"signin"`, `"unknown"`, ...) is an application-level
//! refusal. A body without the discriminator is treated as malformed.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;

pub use crate::model::record::{TaskPatch, TaskRecord};

pub const RESPONSE_KEY: &str = "response";
pub const RESPONSE_OK: &str = "ok";
pub const RESPONSE_SIGNIN: &str = "signin";
pub const RESPONSE_UNKNOWN: &str = "unknown";

/// The two server calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    Save,
    Tasks,
}

impl Endpoint {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Save => "save",
            Self::Tasks => "tasks",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque pull position handed out by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncCursor(pub i64);

impl SyncCursor {
    /// "Everything the server has."
    pub const BEGINNING: Self = Self(-1);
}

impl Default for SyncCursor {
    fn default() -> Self {
        Self::BEGINNING
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    pub tasks: Vec<TaskRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    #[serde(default)]
    pub since: SyncCursor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullResponse {
    /// Each entry is one record serialized as a JSON object string.
    pub tasks: Vec<String>,
    pub next_since: SyncCursor,
}

/// Wrap a success payload: `{"response": "ok", ...payload}`.
#[must_use]
pub fn ok_envelope(payload: Value) -> Value {
    let mut body = match payload {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    body.insert(RESPONSE_KEY.to_string(), Value::from(RESPONSE_OK));
    Value::Object(body)
}

/// An application-level refusal such as `{"response": "signin"}`.
#[must_use]
pub fn error_envelope(response: &str) -> Value {
    let mut body = serde_json::Map::new();
    body.insert(RESPONSE_KEY.to_string(), Value::from(response));
    Value::Object(body)
}

/// Check the discriminator and hand back the body on success.
///
/// # Errors
///
/// [`SyncError::Application`] for a non-ok discriminator,
/// [`SyncError::Decode`] when there is none.
pub fn open_envelope(body: Value) -> Result<Value, SyncError> {
    match body.get(RESPONSE_KEY).and_then(Value::as_str) {
        Some(RESPONSE_OK) => Ok(body),
        Some(other) => Err(SyncError::Application {
            response: other.to_string(),
        }),
        None => Err(SyncError::Decode(format!(
            "missing '{RESPONSE_KEY}' discriminator"
        ))),
    }
}

/// Decode the answer to a `save` call.
///
/// # Errors
///
/// See [`open_envelope`].
pub fn decode_push_response(body: Value) -> Result<(), SyncError> {
    open_envelope(body).map(|_| ())
}

/// Decode the answer to a `tasks` call.
///
/// # Errors
///
/// See [`open_envelope`]; also [`SyncError::Decode`] when the ok body does
/// not have the pull shape.
pub fn decode_pull_response(body: Value) -> Result<PullResponse, SyncError> {
    let body = open_envelope(body)?;
    serde_json::from_value(body).map_err(|err| SyncError::Decode(err.to_string()))
}

/// Serialize a request body.
///
/// # Errors
///
/// [`SyncError::Decode`] if the value cannot be represented as JSON (a
/// non-finite sort order, for instance).
pub fn encode<T: Serialize>(request: &T) -> Result<Value, SyncError> {
    serde_json::to_value(request).map_err(|err| SyncError::Decode(err.to_string()))
}
