//! Error types for relay operations.
//!
//! Every fallible operation on the relay returns [`RelayError`]. Callers that
//! only care about the category of a failure (for example to map it onto an
//! errno-style code) use [`RelayError::kind`], which collapses the variants
//! into the small [`ErrorKind`] taxonomy:
//!
//! - **Configuration errors** (`InvalidArgument`, `Busy`): rejected
//!   synchronously, no state change.
//! - **Resource errors** (`SourceUnavailable`, `SinkUnavailable`): surfaced
//!   from `start()`, the device stays stopped and configured.
//! - **Shutdown errors** (`ShutdownTimedOut`): flush work or the final drain
//!   did not finish within the stop budget.
//! - **Session errors** (`SessionRevoked`): the session was force-released by
//!   an administrator.
//!
//! Loss conditions (channel full, log full, dispatch queue full) are not errors
//! at all; they are counted and logged.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Coarse classification of a [`RelayError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Out-of-range configuration value or missing configuration.
    InvalidArgument,
    /// Wrong state, or already open elsewhere.
    Busy,
    /// Event line could not be claimed.
    SourceUnavailable,
    /// Destination could not be opened.
    SinkUnavailable,
    /// Stop exceeded its budget.
    ShutdownTimedOut,
    /// Session was force-released.
    SessionRevoked,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::Busy => "busy",
            ErrorKind::SourceUnavailable => "source_unavailable",
            ErrorKind::SinkUnavailable => "sink_unavailable",
            ErrorKind::ShutdownTimedOut => "shutdown_timed_out",
            ErrorKind::SessionRevoked => "session_revoked",
        };
        write!(f, "{}", label)
    }
}

/// Errors that can occur while configuring or running a relay device.
#[derive(Error, Debug)]
pub enum RelayError {
    /// A configuration value was out of range.
    #[error("Invalid value for {field}: {reason}")]
    InvalidArgument {
        /// Name of the rejected field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// The operation is not legal in the current state, or the resource is
    /// already held by another session.
    #[error("Device busy: {0}")]
    Busy(String),

    /// The event source refused to hand out the requested line.
    #[error("Event line {line} unavailable: {reason}")]
    SourceUnavailable {
        /// Requested line.
        line: u32,
        /// Refusal reported by the source.
        reason: String,
    },

    /// The destination could not be opened for writing.
    #[error("Sink '{path}' unavailable: {source}")]
    SinkUnavailable {
        /// Destination path.
        path: String,
        /// Underlying open failure.
        #[source]
        source: std::io::Error,
    },

    /// Flush work, the final drain or the sink close did not finish within
    /// the shutdown budget.
    #[error("Shutdown timed out after {0:?} waiting on the sink")]
    ShutdownTimedOut(Duration),

    /// The session was revoked by `force_release`.
    #[error("Session on '{0}' was revoked by a forced release")]
    SessionRevoked(&'static str),
}

impl RelayError {
    /// Shorthand for an [`RelayError::InvalidArgument`].
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field,
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`RelayError::Busy`].
    pub fn busy(message: impl Into<String>) -> Self {
        Self::Busy(message.into())
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::Busy(_) => ErrorKind::Busy,
            Self::SourceUnavailable { .. } => ErrorKind::SourceUnavailable,
            Self::SinkUnavailable { .. } => ErrorKind::SinkUnavailable,
            Self::ShutdownTimedOut(_) => ErrorKind::ShutdownTimedOut,
            Self::SessionRevoked(_) => ErrorKind::SessionRevoked,
        }
    }

    /// Check if this error is a state/ownership conflict.
    pub fn is_busy(&self) -> bool {
        self.kind() == ErrorKind::Busy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RelayError::invalid("chunk_size", "must be greater than 0");
        assert!(err.to_string().contains("chunk_size"));
        assert!(err.to_string().contains("greater than 0"));

        let err = RelayError::SourceUnavailable {
            line: 7,
            reason: "already claimed".into(),
        };
        assert!(err.to_string().contains('7'));
    }

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(RelayError::busy("running").kind(), ErrorKind::Busy);
        assert_eq!(
            RelayError::ShutdownTimedOut(Duration::from_secs(1)).kind(),
            ErrorKind::ShutdownTimedOut
        );
        let sink = RelayError::SinkUnavailable {
            path: "/nope".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert_eq!(sink.kind(), ErrorKind::SinkUnavailable);
        assert!(!sink.is_busy());
    }

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::InvalidArgument.to_string(), "invalid_argument");
        assert_eq!(ErrorKind::SessionRevoked.to_string(), "session_revoked");
    }
}
