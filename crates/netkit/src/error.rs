//! Error taxonomy for the call scheduler and the layers built on it.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{call::CallId, transaction::TransactionFailure};

/// The main result type used throughout the crate.
pub type NetkitResult<T> = Result<T, NetkitError>;

/// Classification of a failed call attempt.
///
/// Every transport-level status or error is mapped onto one of these kinds
/// before any callback fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CallErrorKind {
    /// The remote host could not be reached.
    NoConnection,
    /// The attempt took longer than the call's timeout.
    TimedOut,
    /// The server rejected the request (4xx-style).
    BadRequest,
    /// The server failed or answered with something unexpected (5xx-style).
    BadServer,
    /// A logic error in the scheduler or the transport bridge itself.
    Internal,
}

impl CallErrorKind {
    /// All kinds, in declaration order.
    pub const ALL: [CallErrorKind; 5] = [
        CallErrorKind::NoConnection,
        CallErrorKind::TimedOut,
        CallErrorKind::BadRequest,
        CallErrorKind::BadServer,
        CallErrorKind::Internal,
    ];

    /// Whether an attempt that failed with this kind may be retried.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::NoConnection | Self::TimedOut)
    }

    /// Whether this kind signals a fault in this crate rather than the remote end.
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::Internal)
    }

    /// Classify a non-success HTTP status.
    ///
    /// Unknown and unexpected statuses are treated as a server-side problem.
    pub fn from_status(status: u16) -> Self {
        match status {
            408 => Self::TimedOut,
            400..=499 => Self::BadRequest,
            _ => Self::BadServer,
        }
    }
}

impl fmt::Display for CallErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoConnection => "no connection",
            Self::TimedOut => "timed out",
            Self::BadRequest => "bad request",
            Self::BadServer => "bad server",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Terminal failure of a call, as delivered to observers.
#[derive(Debug, Clone, Error)]
#[error("call failed ({kind}){}", status_suffix(.status))]
pub struct CallFailure {
    /// Classified failure kind.
    pub kind: CallErrorKind,
    /// HTTP status of the last attempt, if a response header arrived.
    pub status: Option<u16>,
    /// Bytes accumulated by the last attempt.
    pub body: Bytes,
    /// Diagnostic message from the transport, if any.
    pub message: Option<String>,
}

impl CallFailure {
    /// Create a failure of the given kind with no status or body.
    pub fn new(kind: CallErrorKind) -> Self {
        Self {
            kind,
            status: None,
            body: Bytes::new(),
            message: None,
        }
    }

    /// Attach the HTTP status.
    pub fn with_status(mut self, status: Option<u16>) -> Self {
        self.status = status;
        self
    }

    /// Attach the response body.
    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    /// Attach a diagnostic message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(", status {s}")).unwrap_or_default()
}

/// Crate-level error type.
#[derive(Error, Debug)]
pub enum NetkitError {
    /// Invalid configuration value.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// A URL could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A call reached a terminal failure.
    #[error(transparent)]
    Call(#[from] CallFailure),

    /// A transaction reached a terminal failure.
    #[error(transparent)]
    Transaction(#[from] TransactionFailure),

    /// The call was cancelled before it completed.
    #[error("Call {call} was cancelled")]
    Cancelled { call: CallId },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl NetkitError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}
