//! Crate-wide error taxonomy.
//!
//! Every fallible operation in the core returns an [`OrchestratorError`]. The
//! error carries a classified [`ErrorKind`] so that callers at a retry
//! boundary (C9) and callers at a public-verb boundary (C7) can make
//! decisions without string-matching on error messages.

use thiserror::Error;

/// Machine-readable classification of an [`OrchestratorError`].
///
/// Kinds describe *what kind of thing went wrong*, not which component
/// raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Could not reach the runtime daemon at all (refused, timed out, no such host).
    Connection,
    /// An operation exceeded its deadline.
    Timeout,
    /// A container referenced by id or label does not exist.
    ContainerNotFound,
    /// The requested image is not present and could not be pulled.
    ImageNotFound,
    /// A network-level failure distinct from a plain connection failure.
    Network,
    /// The runtime or filesystem denied the operation.
    Permission,
    /// Caller-supplied input failed validation before any task was enqueued.
    Validation,
    /// The requested resource already exists / the name is in use.
    Conflict,
    /// The entity is in a state that does not permit this operation
    /// (archived, busy, invalid transition).
    State,
    /// Catch-all for anything that doesn't classify into the above.
    Unknown,
}

impl ErrorKind {
    /// Machine-readable code surfaced to callers, independent of `Display`.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ContainerNotFound => "container_not_found",
            ErrorKind::ImageNotFound => "image_not_found",
            ErrorKind::Network => "network",
            ErrorKind::Permission => "permission",
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::State => "state",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Whether an operation that failed with this kind is worth retrying
    /// on its own, with no additional information.
    ///
    /// `Network` is conspicuously absent: network errors are only
    /// retryable when the underlying message carries a "temporary"
    /// marker, checked separately via [`OrchestratorError::is_temporary_network`].
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Connection | ErrorKind::Timeout)
    }
}

/// The crate-wide error type.
#[derive(Debug, Error)]
#[error("{kind_code}: {message}")]
pub struct OrchestratorError {
    kind: ErrorKind,
    kind_code: &'static str,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl OrchestratorError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            kind_code: kind.code(),
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            kind_code: kind.code(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// True for `network` errors whose underlying message indicates the
    /// failure is transient.
    pub fn is_temporary_network(&self) -> bool {
        self.kind == ErrorKind::Network && self.message.to_lowercase().contains("temporary")
    }

    /// Whether C9 should retry this error at all, given its kind and (for
    /// `network`) message content.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable() || self.is_temporary_network()
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ContainerNotFound, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::State, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permission, message)
    }
}

/// Classifies a raw `bollard` error into an [`OrchestratorError`], tagging it
/// with the operation name that was being attempted ("every runtime
/// call's raw error is wrapped with the operation name").
pub fn classify_bollard_error(op: &str, err: bollard::errors::Error) -> OrchestratorError {
    use bollard::errors::Error as BErr;

    match &err {
        BErr::DockerResponseServerError {
            status_code,
            message,
        } => {
            let kind = match *status_code {
                404 => ErrorKind::ContainerNotFound,
                409 => ErrorKind::Conflict,
                401 | 403 => ErrorKind::Permission,
                _ => ErrorKind::Unknown,
            };
            let msg = message.clone();
            OrchestratorError::with_source(kind, format!("{op}: {msg}"), err)
        }
        BErr::RequestTimeoutError => {
            OrchestratorError::with_source(ErrorKind::Timeout, format!("{op}: timed out"), err)
        }
        BErr::IOError {.. } | BErr::HyperResponseError {.. } => OrchestratorError::with_source(
            ErrorKind::Connection,
            format!("{op}: connection error"),
            err,
        ),
        _ => {
            let message = err.to_string();
            OrchestratorError::with_source(ErrorKind::Unknown, format!("{op}: {message}"), err)
        }
    }
}

/// Classifies a free-form error message by substring heuristics,
/// used when the failure did not originate as a typed `bollard` error (e.g.
/// it crossed a channel as a `String`, or came from the storage collaborator).
pub fn classify_message(op: &str, message: &str) -> OrchestratorError {
    let lower = message.to_lowercase();
    let kind = if lower.contains("connection refused")
        || lower.contains("connect")
        || lower.contains("no such host")
    {
        ErrorKind::Connection
    } else if lower.contains("timeout") || lower.contains("timed out") {
        ErrorKind::Timeout
    } else if lower.contains("no such container") || lower.contains("not found") {
        ErrorKind::ContainerNotFound
    } else if lower.contains("no such image") || lower.contains("pull access denied") {
        ErrorKind::ImageNotFound
    } else if lower.contains("network") {
        ErrorKind::Network
    } else if lower.contains("permission denied") || lower.contains("forbidden") {
        ErrorKind::Permission
    } else if lower.contains("already in use") || lower.contains("already exists") {
        ErrorKind::Conflict
    } else {
        ErrorKind::Unknown
    };
    OrchestratorError::new(kind, format!("{op}: {message}"))
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_network_temporary_as_retryable() {
        let err = OrchestratorError::new(ErrorKind::Network, "temporary DNS failure");
        assert!(err.is_retryable());
    }

    #[test]
    fn classifies_network_without_marker_as_not_retryable() {
        let err = OrchestratorError::new(ErrorKind::Network, "no route to host");
        assert!(!err.is_retryable());
    }

    #[test]
    fn connection_and_timeout_are_always_retryable() {
        assert!(ErrorKind::Connection.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(!ErrorKind::Validation.is_retryable());
    }

    #[test]
    fn classify_message_recognizes_not_found() {
        let err = classify_message("inspect", "No such container: abc123");
        assert_eq!(err.kind, ErrorKind::ContainerNotFound);
    }
}
