use std::fmt;

use crate::model::task::TaskId;

/// Machine-readable error codes for logs and status surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    TaskNotFound,
    DuplicateTask,
    InvalidEnumValue,
    CycleRejected,
    IdentityMismatch,
    SyncTransport,
    SyncApplication,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "E1001",
            Self::TaskNotFound => "E2001",
            Self::DuplicateTask => "E2002",
            Self::InvalidEnumValue => "E2003",
            Self::CycleRejected => "E2004",
            Self::IdentityMismatch => "E3001",
            Self::SyncTransport => "E4001",
            Self::SyncApplication => "E4002",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and status output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Config file parse error",
            Self::TaskNotFound => "Task not found",
            Self::DuplicateTask => "Task id already registered",
            Self::InvalidEnumValue => "Invalid status/project type value",
            Self::CycleRejected => "Reparent would create a cycle",
            Self::IdentityMismatch => "Record id does not match local task",
            Self::SyncTransport => "Sync transport failure",
            Self::SyncApplication => "Sync server rejected the request",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in .tm/config.toml and retry."),
            Self::TaskNotFound | Self::DuplicateTask => None,
            Self::InvalidEnumValue => Some(
                "Use a documented value: status none|done, project type none|single action|parallel|sequential.",
            ),
            Self::CycleRejected => Some("Pick a parent that is not a descendant of the task."),
            Self::IdentityMismatch => Some("This is a bug; report it with logs."),
            Self::SyncTransport => Some("Sync retries on its own once the server is reachable."),
            Self::SyncApplication => Some("Sign in again, then refresh."),
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

// ---------------------------------------------------------------------------
// Task graph errors
// ---------------------------------------------------------------------------

/// Errors raised synchronously by task and store operations.
///
/// None of these leave a partial mutation behind: validation happens before
/// any field is touched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// A status or project type outside the fixed set.
    #[error("invalid {field}: '{got}'")]
    InvalidEnumValue { field: &'static str, got: String },

    /// No task with this id is registered.
    #[error("task not found: {0}")]
    NotFound(TaskId),

    /// `add_task` was handed a task whose id is already registered.
    #[error("task already registered: {0}")]
    DuplicateId(TaskId),

    /// A remote record was applied to a task with a different id.
    #[error("record for {got} applied to task {expected}")]
    IdentityMismatch { expected: TaskId, got: TaskId },
}

impl TaskError {
    /// Map to the stable error code.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidEnumValue { .. } => ErrorCode::InvalidEnumValue,
            Self::NotFound(_) => ErrorCode::TaskNotFound,
            Self::DuplicateId(_) => ErrorCode::DuplicateTask,
            Self::IdentityMismatch { .. } => ErrorCode::IdentityMismatch,
        }
    }
}

// ---------------------------------------------------------------------------
// Sync errors
// ---------------------------------------------------------------------------

/// Failures on the push or pull channel. Never fatal: surfaced as a status
/// event and retried by the owning loop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// The request never produced a response (timeout, connection error).
    #[error("transport error: {0}")]
    Transport(String),

    /// The server answered with a non-ok envelope.
    #[error("server responded '{response}'")]
    Application { response: String },

    /// The server answered with something that is not a valid envelope.
    #[error("malformed response: {0}")]
    Decode(String),
}

impl SyncError {
    /// Map to the stable error code. Decode failures count as application
    /// errors: the transport delivered a body.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Transport(_) => ErrorCode::SyncTransport,
            Self::Application { .. } | Self::Decode(_) => ErrorCode::SyncApplication,
        }
    }

    /// Whether the failure happened below the protocol layer.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn all_codes_are_unique() {
        let all = [
            ErrorCode::ConfigParseError,
            ErrorCode::TaskNotFound,
            ErrorCode::DuplicateTask,
            ErrorCode::InvalidEnumValue,
            ErrorCode::CycleRejected,
            ErrorCode::IdentityMismatch,
            ErrorCode::SyncTransport,
            ErrorCode::SyncApplication,
            ErrorCode::InternalUnexpected,
        ];

        let mut seen = HashSet::new();
        for code in all {
            assert!(seen.insert(code.code()), "duplicate code {}", code.code());
        }
    }

    #[test]
    fn code_format_is_machine_friendly() {
        let code = ErrorCode::IdentityMismatch.code();
        assert_eq!(code.len(), 5);
        assert!(code.starts_with('E'));
        assert!(code.chars().skip(1).all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn sync_errors_classify_transport_separately() {
        assert!(SyncError::Transport("timed out".into()).is_transport());
        assert!(!SyncError::Application { response: "signin".into() }.is_transport());
        assert_eq!(
            SyncError::Decode("no discriminator".into()).code(),
            ErrorCode::SyncApplication
        );
    }

    #[test]
    fn task_error_codes() {
        let err = TaskError::InvalidEnumValue { field: "status", got: "later".into() };
        assert_eq!(err.code(), ErrorCode::InvalidEnumValue);
        assert_eq!(err.to_string(), "invalid status: 'later'");
    }
}
