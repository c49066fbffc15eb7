//! Error types shared by the dispatch core.
//!
//! - [`RequestError`] is raised synchronously while building a descriptor.
//! - [`DispatchError`] is the single failure an operation resolves to.
//! - [`TransportError`] is whatever the transport collaborator reports,
//!   carried verbatim inside [`DispatchError::Transport`].

use crate::method::Method;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Descriptor construction violated a static invariant.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// A body was supplied for a method that cannot carry one.
    #[error("{method} requests cannot carry a body")]
    BodyNotSupported {
        /// The offending method.
        method: Method,
    },

    /// The target could not be parsed as an absolute URL.
    #[error("Invalid request target: {0}")]
    InvalidTarget(String),

    /// Only `http` and `https` targets can be dispatched.
    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),

    /// The target has no host component.
    #[error("Request target has no host")]
    MissingHost,

    /// A header name or value contains characters that cannot be sent.
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// Priority must be a finite number.
    #[error("Priority must be finite")]
    InvalidPriority,
}

/// Category of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    /// Establishing the connection failed or timed out.
    Connect,
    /// The peer reset the stream or connection.
    Reset,
    /// The peer violated the wire protocol.
    Protocol,
    /// Socket-level I/O failure.
    Io,
    /// The connection was closed locally.
    Closed,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "connect",
            Self::Reset => "reset",
            Self::Protocol => "protocol",
            Self::Io => "io",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Failure reported by the transport collaborator.
///
/// Whether the failure is safe to retry is decided by the transport, which
/// knows if any request bytes reached the peer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} error: {message}")]
pub struct TransportError {
    kind: TransportErrorKind,
    retriable: bool,
    message: Arc<str>,
}

impl TransportError {
    /// Failure that must not be retried.
    #[must_use]
    pub fn new(kind: TransportErrorKind, message: impl Into<Arc<str>>) -> Self {
        Self {
            kind,
            retriable: false,
            message: message.into(),
        }
    }

    /// Failure that may be retried for idempotent, replayable requests.
    #[must_use]
    pub fn retriable(kind: TransportErrorKind, message: impl Into<Arc<str>>) -> Self {
        Self {
            kind,
            retriable: true,
            message: message.into(),
        }
    }

    /// Failure category.
    #[must_use]
    pub const fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    /// Whether the transport marked this failure as retriable.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        self.retriable
    }

    /// Human-readable detail.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Terminal failure of an operation.
///
/// Exactly one outcome is delivered per operation, so this type is cheap to
/// clone for fan-out to several listeners.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The requested timeout elapsed before the operation finished.
    #[error("Request timed out after {after:?}")]
    Timeout {
        /// The armed timeout.
        after: Duration,
    },

    /// The caller cancelled the operation.
    #[error("Request was cancelled")]
    Cancelled,

    /// The transport reported a failure.
    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    /// The client is closing and refuses new submissions.
    #[error("Client is shutting down")]
    ShuttingDown,

    /// The client was killed while the operation was outstanding.
    #[error("Client was killed")]
    Killed,

    /// The redirect chain exceeded the descriptor's limit.
    #[error("Exceeded redirect limit of {limit}")]
    TooManyRedirects {
        /// The descriptor's `max_redirects`.
        limit: u32,
    },
}

impl DispatchError {
    /// Whether this is the timeout failure.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether this is the cancellation failure.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn request_error_display() {
        let err = RequestError::BodyNotSupported {
            method: Method::Head,
        };
        assert_eq!(err.to_string(), "HEAD requests cannot carry a body");
    }

    #[test]
    fn transport_error_carries_retry_flag() {
        let err = TransportError::retriable(TransportErrorKind::Reset, "stream reset");
        assert!(err.is_retriable());
        assert_eq!(err.kind(), TransportErrorKind::Reset);
        assert_eq!(err.to_string(), "reset error: stream reset");

        let fatal = TransportError::new(TransportErrorKind::Protocol, "bad frame");
        assert!(!fatal.is_retriable());
    }

    #[test]
    fn dispatch_error_wraps_transport_error() {
        let err: DispatchError = TransportError::new(TransportErrorKind::Io, "eof").into();
        assert_eq!(err.to_string(), "Transport failure: io error: eof");
        assert!(!err.is_timeout());
    }

    #[test]
    fn timeout_and_cancel_are_distinct() {
        let timeout = DispatchError::Timeout {
            after: Duration::from_millis(5),
        };
        assert!(timeout.is_timeout());
        assert!(!timeout.is_cancelled());
        assert!(DispatchError::Cancelled.is_cancelled());
        assert_ne!(timeout, DispatchError::Cancelled);
    }
}
