use std::fmt;

use crate::lock::LockError;

/// Machine-readable error codes for scripted callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotConfigured,
    ConfigParseError,
    AnnotationNotFound,
    NotOwner,
    ReviewClosed,
    InvalidAnnotation,
    OfflineRejected,
    StorageFailure,
    CorruptRecord,
    LockContention,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::NotConfigured => "E1001",
            Self::ConfigParseError => "E1002",
            Self::AnnotationNotFound => "E2001",
            Self::NotOwner => "E2002",
            Self::ReviewClosed => "E2003",
            Self::InvalidAnnotation => "E2004",
            Self::OfflineRejected => "E2005",
            Self::StorageFailure => "E3001",
            Self::CorruptRecord => "E3002",
            Self::LockContention => "E5002",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::NotConfigured => "Review session not configured",
            Self::ConfigParseError => "Config file parse error",
            Self::AnnotationNotFound => "Annotation not found",
            Self::NotOwner => "Annotation belongs to another reviewer",
            Self::ReviewClosed => "Review is closed",
            Self::InvalidAnnotation => "Invalid annotation",
            Self::OfflineRejected => "Request requires connectivity",
            Self::StorageFailure => "Local storage failure",
            Self::CorruptRecord => "Corrupt stored record",
            Self::LockContention => "Lock contention",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to reviewers and scripts.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::NotConfigured => {
                Some("Pass --review and set [server] url in .marginalia/config.toml.")
            }
            Self::ConfigParseError => Some("Fix syntax in .marginalia/config.toml and retry."),
            Self::AnnotationNotFound => Some("Run `mg sync` to refresh the local mirror."),
            Self::NotOwner => Some("Reply to the comment instead of editing it."),
            Self::ReviewClosed => Some("Ask the review owner to reopen the review."),
            Self::InvalidAnnotation => None,
            Self::OfflineRejected => Some("Retry once the server is reachable."),
            Self::StorageFailure => {
                Some("Check disk space and permissions of the marginalia data directory.")
            }
            Self::CorruptRecord => Some("Run `mg sync` to refetch authoritative state."),
            Self::LockContention => Some("Retry after the other `mg` process releases its lock."),
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Errors surfaced by the synchronization engine.
///
/// Delivery failures are not errors at this level: they are recorded on the
/// outbox entry and retried. Everything here is either a rejected local
/// action or a storage failure that breaks the durability guarantee.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("annotation {id} not found")]
    NotFound { id: String },

    #[error("annotation {id} was authored by another reviewer")]
    NotOwner { id: String },

    #[error("review {review} is closed to further comments")]
    ReviewClosed { review: String },

    #[error("invalid annotation: {reason}")]
    InvalidAnnotation { reason: String },

    #[error("{action} requires connectivity and the session is offline")]
    OfflineRejected { action: &'static str },

    #[error("local storage failure: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("corrupt stored record: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("review session engine has stopped")]
    Stopped,
}

impl SyncError {
    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound { .. } => ErrorCode::AnnotationNotFound,
            Self::NotOwner { .. } => ErrorCode::NotOwner,
            Self::ReviewClosed { .. } => ErrorCode::ReviewClosed,
            Self::InvalidAnnotation { .. } => ErrorCode::InvalidAnnotation,
            Self::OfflineRejected { .. } => ErrorCode::OfflineRejected,
            Self::Storage(_) => ErrorCode::StorageFailure,
            Self::Corrupt(_) => ErrorCode::CorruptRecord,
            Self::Lock(err) => err.code(),
            Self::Stopped => ErrorCode::InternalUnexpected,
        }
    }

    /// Optional remediation hint.
    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }

    /// Storage failures are fatal: the engine cannot uphold durability.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Lock(_) | Self::Stopped)
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidAnnotation {
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
