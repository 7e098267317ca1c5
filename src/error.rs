//! Error types for KCP conversations.
//!
//! Transport closure is not an error: async operations report it as
//! `Ok(false)` (or a closed [`ReceiveResult`](crate::ReceiveResult)).
//! Malformed inbound packets are dropped without any error at all.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, KcpError>;

/// Caller-supplied reason attached to a cancellation.
pub type CancelCause = Arc<dyn StdError + Send + Sync>;

// ── Error types ─────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum KcpError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Another operation is already pending")]
    ConcurrentOperation,

    #[error("Operation cancelled{}", .cause.as_ref().map(|c| format!(": {c}")).unwrap_or_default())]
    Cancelled { cause: Option<CancelCause> },

    #[error("Connection error: {kind}")]
    Connection { kind: ConnectionError },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionError {
    Closed,
    Lost,
    Timeout,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "connection closed"),
            Self::Lost => write!(f, "connection lost"),
            Self::Timeout => write!(f, "connection timed out"),
        }
    }
}

// ── Constructors ────────────────────────────────────────────────────────

impl KcpError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument { message: message.into() }
    }

    pub fn cancelled(cause: Option<CancelCause>) -> Self {
        Self::Cancelled { cause }
    }

    pub fn connection(kind: ConnectionError) -> Self {
        Self::Connection { kind }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }
}

// ── Predicates ──────────────────────────────────────────────────────────

impl KcpError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Errors caused by how the API was called rather than by the network.
    pub fn is_usage_error(&self) -> bool {
        matches!(self, Self::InvalidArgument { .. } | Self::ConcurrentOperation)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connection {
                kind: ConnectionError::Lost | ConnectionError::Closed | ConnectionError::Timeout
            }
        )
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Self::Connection { kind } => matches!(kind, ConnectionError::Closed),
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
