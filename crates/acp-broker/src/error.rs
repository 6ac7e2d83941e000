//! Error taxonomy for the session broker.

use thiserror::Error;

/// Result type alias for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors a subscriber-facing operation can return.
///
/// Every public method on [`crate::broker::SessionBroker`] returns this type.
/// Asynchronous failures that occur mid-session (after the call that
/// triggered them has already returned) are instead delivered as
/// [`crate::event::Event::SessionError`] / [`crate::event::Event::PromptError`].
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Malformed request from a subscriber. Never affects session state.
    #[error("validation error: {0}")]
    Validation(String),

    /// The agent registry has no command for this provider.
    #[error("no_acp_support: provider {0} has no ACP command configured")]
    NoAcpSupport(String),

    /// The registry yielded a command but the process failed to start.
    #[error("acp_unavailable: {0}")]
    AcpUnavailable(String),

    /// Caller referenced a `sessionKey` that does not exist.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Caller attempted an operation the session's current state forbids.
    #[error("wrong state for session {session_key}: expected one of {expected:?}, was {actual}")]
    WrongState {
        session_key: String,
        expected: Vec<&'static str>,
        actual: &'static str,
    },

    /// The underlying child has exited or the peer connection closed.
    #[error("connection dead: {0}")]
    ConnectionDead(String),

    /// A prompt failed; recoverable, session returns to `ready`.
    #[error("prompt failed: {0}")]
    PromptFailure(String),

    /// A session failed fatally; session transitions to `error`.
    #[error("session failed: {0}")]
    SessionFailure(String),

    /// Path resolved outside the session's `cwd`. Raised to the agent as a
    /// protocol-level error, never surfaced to a subscriber directly.
    #[error("Path traversal blocked")]
    PathTraversal,

    /// Underlying ACP protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] agent_client_protocol::Error),

    /// IO error talking to a child process or the filesystem.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Escape hatch for unexpected failures that don't fit the taxonomy above.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BrokerError {
    /// Stable machine-readable tag for the `{success: false, error}`
    /// boundary contract every public operation returns.
    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::Validation(_) => "validation",
            BrokerError::NoAcpSupport(_) => "no_acp_support",
            BrokerError::AcpUnavailable(_) => "acp_unavailable",
            BrokerError::SessionNotFound(_) => "session_not_found",
            BrokerError::WrongState { .. } => "wrong_state",
            BrokerError::ConnectionDead(_) => "connection_dead",
            BrokerError::PromptFailure(_) => "prompt_failure",
            BrokerError::SessionFailure(_) => "session_failure",
            BrokerError::PathTraversal => "path_traversal",
            BrokerError::Protocol(_) => "protocol_error",
            BrokerError::Io(_) => "io_error",
            BrokerError::Serialization(_) => "serialization_error",
            BrokerError::Other(_) => "internal_error",
        }
    }
}
