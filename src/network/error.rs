//! Network error types

use thiserror::Error;

use crate::protocol::{CodecError, Message};

/// Errors that can occur in the network subsystem
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Disconnected")]
    Disconnected,

    #[error("Request timed out")]
    Timeout,

    /// The server answered a request with a non-`ok` status
    #[error("Server returned '{status}' for {message_type}")]
    Status {
        status: String,
        message_type: String,
        response: Option<Box<Message>>,
    },

    #[error("Unexpected response {actual} (expected {expected})")]
    UnexpectedResponse {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Signaling error: {0}")]
    SignalingError(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("No endpoint available")]
    NoEndpointAvailable,

    #[error("Invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    #[error("Endpoint discovery failed: {0}")]
    Discovery(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetworkError {
    /// Status string of a protocol error, if this is one
    pub fn status(&self) -> Option<&str> {
        match self {
            NetworkError::Status { status, .. } => Some(status),
            _ => None,
        }
    }

    /// True for failures of the connection itself rather than of one request
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            NetworkError::ConnectionTimeout
                | NetworkError::NotConnected
                | NetworkError::Disconnected
                | NetworkError::Timeout
                | NetworkError::SignalingError(_)
                | NetworkError::Io(_)
        )
    }
}
