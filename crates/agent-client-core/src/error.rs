//! Error types for Agent Client Core

use std::time::Duration;

use thiserror::Error;

use agent_client_acp::AcpError;

use crate::session::SessionStatus;

/// Result type alias using Agent Client Error
pub type Result<T> = std::result::Result<T, Error>;

/// Agent Client error types
#[derive(Error, Debug)]
pub enum Error {
    /// The agent process could not be launched or the handshake failed
    #[error("Failed to connect to agent '{agent_id}': {message}")]
    Connection { agent_id: String, message: String },

    #[error("Failed to create session with agent '{agent_id}': {source}")]
    SessionCreation {
        agent_id: String,
        #[source]
        source: Box<Error>,
    },

    /// Mid-turn transport failure
    #[error("Send failed: {0}")]
    Send(String),

    #[error("A permission request is awaiting a response")]
    PermissionPending,

    #[error("Option '{option_id}' is not offered by permission request {request_id}")]
    InvalidOption {
        request_id: String,
        option_id: String,
    },

    #[error("No pending permission request with id {0}")]
    UnknownPermission(String),

    #[error("Unsupported capability: {0}")]
    UnsupportedCapability(String),

    #[error("Failed to restore session {session_id}: {message}")]
    Restore { session_id: String, message: String },

    #[error("Failed to fork session {session_id}: {message}")]
    Fork { session_id: String, message: String },

    #[error("Failed to load session history: {0}")]
    HistoryLoad(String),

    #[error("No active session")]
    NoActiveSession,

    #[error("Cannot {operation} while session is {status}")]
    InvalidState {
        operation: &'static str,
        status: SessionStatus,
    },

    /// The adapter or agent broke a protocol rule
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A newer restore or fork replaced this one before it finished
    #[error("Superseded by a newer request")]
    Superseded,

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Session controller has shut down")]
    ControllerClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether retrying the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::HistoryLoad(_) | Error::Connection { .. } | Error::Timeout(_)
        )
    }
}

impl From<AcpError> for Error {
    fn from(e: AcpError) -> Self {
        match e {
            AcpError::Rpc { message, .. } => Error::Agent(message),
            AcpError::Protocol(message) => Error::ProtocolViolation(message),
            AcpError::Transport(message) => Error::Send(message),
            AcpError::Closed => Error::Send("agent connection closed".to_string()),
        }
    }
}
