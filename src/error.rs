//! Client error types.
//!
//! [`ClientError`] is the central error type for the client. Each variant
//! is a distinct failure kind so callers can choose retry vs. fail-fast
//! behavior per kind.

use std::time::Duration;

use tokio_tungstenite::tungstenite;

/// Result alias for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Client-side error enum.
///
/// # Kinds
///
/// | Variant          | Scope                          | Retryable |
/// |------------------|--------------------------------|-----------|
/// | `Connection`     | transport open/read/write      | yes       |
/// | `Authentication` | handshake rejected             | no        |
/// | `Protocol`       | unexpected message shape/type  | no        |
/// | `Application`    | `result` with `success: false` | no        |
/// | `Timeout`        | single call                    | yes       |
/// | `Closed`         | connection torn down           | yes       |
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// Transport could not be opened, read from, or written to.
    #[error("connection error: {0}")]
    Connection(String),

    /// The server rejected the access token.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The server sent a message of an unexpected shape or type.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server answered with `success: false`.
    #[error("command failed ({code}): {message}")]
    Application {
        /// Server-supplied error code (e.g. `unknown_command`).
        code: String,
        /// Server-supplied human-readable message.
        message: String,
    },

    /// No response arrived within the caller's configured duration.
    #[error("{context} timed out after {timeout_ms} ms")]
    Timeout {
        /// What was being waited for.
        context: String,
        /// The duration that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// The connection is closed, or closed while the request was pending.
    #[error("connection closed")]
    Closed,
}

impl ClientError {
    /// Builds a [`ClientError::Timeout`] from a context label and duration.
    #[must_use]
    pub fn timeout(context: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            context: context.into(),
            timeout_ms: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Returns a stable snake_case identifier for this error kind.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection_error",
            Self::Authentication(_) => "authentication_error",
            Self::Protocol(_) => "protocol_error",
            Self::Application { .. } => "application_error",
            Self::Timeout { .. } => "timeout",
            Self::Closed => "closed",
        }
    }

    /// Returns `true` if retrying on a fresh attempt may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout { .. } | Self::Closed
        )
    }
}

impl From<tungstenite::Error> for ClientError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                Self::Closed
            }
            other => Self::Connection(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}
