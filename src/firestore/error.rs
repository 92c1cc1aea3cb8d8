use std::error::Error;
use std::fmt::{Display, Formatter};

use crate::auth::AuthError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FirestoreErrorCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
    MissingProjectId,
}

impl FirestoreErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FirestoreErrorCode::Cancelled => "firestore/cancelled",
            FirestoreErrorCode::Unknown => "firestore/unknown",
            FirestoreErrorCode::InvalidArgument => "firestore/invalid-argument",
            FirestoreErrorCode::DeadlineExceeded => "firestore/deadline-exceeded",
            FirestoreErrorCode::NotFound => "firestore/not-found",
            FirestoreErrorCode::AlreadyExists => "firestore/already-exists",
            FirestoreErrorCode::PermissionDenied => "firestore/permission-denied",
            FirestoreErrorCode::ResourceExhausted => "firestore/resource-exhausted",
            FirestoreErrorCode::FailedPrecondition => "firestore/failed-precondition",
            FirestoreErrorCode::Aborted => "firestore/aborted",
            FirestoreErrorCode::OutOfRange => "firestore/out-of-range",
            FirestoreErrorCode::Unimplemented => "firestore/unimplemented",
            FirestoreErrorCode::Internal => "firestore/internal",
            FirestoreErrorCode::Unavailable => "firestore/unavailable",
            FirestoreErrorCode::DataLoss => "firestore/data-loss",
            FirestoreErrorCode::Unauthenticated => "firestore/unauthenticated",
            FirestoreErrorCode::MissingProjectId => "firestore/missing-project-id",
        }
    }

    /// Maps a canonical RPC status number onto an error code.
    pub fn from_rpc_status(code: i32) -> Self {
        match code {
            1 => FirestoreErrorCode::Cancelled,
            2 => FirestoreErrorCode::Unknown,
            3 => FirestoreErrorCode::InvalidArgument,
            4 => FirestoreErrorCode::DeadlineExceeded,
            5 => FirestoreErrorCode::NotFound,
            6 => FirestoreErrorCode::AlreadyExists,
            7 => FirestoreErrorCode::PermissionDenied,
            8 => FirestoreErrorCode::ResourceExhausted,
            9 => FirestoreErrorCode::FailedPrecondition,
            10 => FirestoreErrorCode::Aborted,
            11 => FirestoreErrorCode::OutOfRange,
            12 => FirestoreErrorCode::Unimplemented,
            13 => FirestoreErrorCode::Internal,
            14 => FirestoreErrorCode::Unavailable,
            15 => FirestoreErrorCode::DataLoss,
            16 => FirestoreErrorCode::Unauthenticated,
            _ => FirestoreErrorCode::Unknown,
        }
    }

    pub fn rpc_status(&self) -> i32 {
        match self {
            FirestoreErrorCode::Cancelled => 1,
            FirestoreErrorCode::Unknown => 2,
            FirestoreErrorCode::InvalidArgument => 3,
            FirestoreErrorCode::DeadlineExceeded => 4,
            FirestoreErrorCode::NotFound => 5,
            FirestoreErrorCode::AlreadyExists => 6,
            FirestoreErrorCode::PermissionDenied => 7,
            FirestoreErrorCode::ResourceExhausted => 8,
            FirestoreErrorCode::FailedPrecondition => 9,
            FirestoreErrorCode::Aborted => 10,
            FirestoreErrorCode::OutOfRange => 11,
            FirestoreErrorCode::Unimplemented => 12,
            FirestoreErrorCode::Internal => 13,
            FirestoreErrorCode::Unavailable => 14,
            FirestoreErrorCode::DataLoss => 15,
            FirestoreErrorCode::Unauthenticated => 16,
            FirestoreErrorCode::MissingProjectId => 3,
        }
    }

    /// Returns the code whose `as_str` form matches `value`.
    pub fn from_code_str(value: &str) -> Option<Self> {
        const ALL: [FirestoreErrorCode; 17] = [
            FirestoreErrorCode::Cancelled,
            FirestoreErrorCode::Unknown,
            FirestoreErrorCode::InvalidArgument,
            FirestoreErrorCode::DeadlineExceeded,
            FirestoreErrorCode::NotFound,
            FirestoreErrorCode::AlreadyExists,
            FirestoreErrorCode::PermissionDenied,
            FirestoreErrorCode::ResourceExhausted,
            FirestoreErrorCode::FailedPrecondition,
            FirestoreErrorCode::Aborted,
            FirestoreErrorCode::OutOfRange,
            FirestoreErrorCode::Unimplemented,
            FirestoreErrorCode::Internal,
            FirestoreErrorCode::Unavailable,
            FirestoreErrorCode::DataLoss,
            FirestoreErrorCode::Unauthenticated,
            FirestoreErrorCode::MissingProjectId,
        ];
        ALL.into_iter().find(|code| code.as_str() == value)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FirestoreError {
    pub code: FirestoreErrorCode,
    message: String,
}

impl FirestoreError {
    pub fn new(code: FirestoreErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Errors that will not go away by retrying the same request.
    pub fn is_permanent(&self) -> bool {
        is_permanent_error(self.code)
    }

    /// Errors that reject a write batch outright. `Aborted` is retried for writes.
    pub fn is_permanent_write_error(&self) -> bool {
        self.is_permanent() && self.code != FirestoreErrorCode::Aborted
    }
}

impl Display for FirestoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl Error for FirestoreError {}

impl From<rusqlite::Error> for FirestoreError {
    fn from(err: rusqlite::Error) -> Self {
        unavailable(format!("local persistence failure: {err}"))
    }
}

impl From<serde_json::Error> for FirestoreError {
    fn from(err: serde_json::Error) -> Self {
        data_loss(format!("failed to decode persisted JSON: {err}"))
    }
}

impl From<AuthError> for FirestoreError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidCredential(message) | AuthError::Rejected(message) => {
                unauthenticated(message)
            }
            AuthError::Network(message) => unavailable(message),
            AuthError::UserSignedOut => cancelled("user changed while fetching a token"),
            AuthError::App(app_error) => internal_error(app_error.to_string()),
        }
    }
}

pub type FirestoreResult<T> = Result<T, FirestoreError>;

pub fn is_permanent_error(code: FirestoreErrorCode) -> bool {
    !matches!(
        code,
        FirestoreErrorCode::Cancelled
            | FirestoreErrorCode::Unknown
            | FirestoreErrorCode::DeadlineExceeded
            | FirestoreErrorCode::ResourceExhausted
            | FirestoreErrorCode::Internal
            | FirestoreErrorCode::Unavailable
            | FirestoreErrorCode::Unauthenticated
            | FirestoreErrorCode::Aborted
    )
}

pub fn invalid_argument(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::InvalidArgument, message)
}

pub fn missing_project_id() -> FirestoreError {
    FirestoreError::new(
        FirestoreErrorCode::MissingProjectId,
        "App options must include a project_id to use the document store",
    )
}

pub fn internal_error(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Internal, message)
}

pub fn not_found(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::NotFound, message)
}

pub fn permission_denied(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::PermissionDenied, message)
}

pub fn unauthenticated(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Unauthenticated, message)
}

pub fn unavailable(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Unavailable, message)
}

pub fn deadline_exceeded(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::DeadlineExceeded, message)
}

pub fn resource_exhausted(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::ResourceExhausted, message)
}

pub fn failed_precondition(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::FailedPrecondition, message)
}

pub fn cancelled(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Cancelled, message)
}

pub fn data_loss(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::DataLoss, message)
}

/// Logs an invariant violation and returns it as an internal error.
pub fn assertion_failed(message: impl Into<String>) -> FirestoreError {
    let message = message.into();
    log::error!("internal assertion failed: {message}");
    internal_error(format!("INTERNAL ASSERTION FAILED: {message}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_permanent_errors() {
        assert!(permission_denied("nope").is_permanent());
        assert!(failed_precondition("stale").is_permanent_write_error());
        assert!(!unavailable("offline").is_permanent());
        assert!(!resource_exhausted("quota").is_permanent());
        let aborted = FirestoreError::new(FirestoreErrorCode::Aborted, "contention");
        assert!(!aborted.is_permanent_write_error());
    }

    #[test]
    fn rpc_status_roundtrip() {
        for status in 1..=16 {
            let code = FirestoreErrorCode::from_rpc_status(status);
            assert_eq!(code.rpc_status(), status);
        }
        assert_eq!(FirestoreErrorCode::from_rpc_status(99), FirestoreErrorCode::Unknown);
    }

    #[test]
    fn parses_code_strings() {
        assert_eq!(
            FirestoreErrorCode::from_code_str("firestore/aborted"),
            Some(FirestoreErrorCode::Aborted)
        );
        assert_eq!(FirestoreErrorCode::from_code_str("bogus"), None);
    }

    #[test]
    fn display_includes_code() {
        let err = not_found("missing doc");
        assert_eq!(err.to_string(), "missing doc (firestore/not-found)");
    }
}
