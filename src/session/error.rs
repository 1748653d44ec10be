//! Session error types

use std::fmt;

use thiserror::Error;

use crate::network::NetworkError;
use crate::protocol::EndReason;

use super::stream::StreamState;

/// Why a session could not be brought online
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionFailure {
    /// No endpoint reachable, or the connection dropped
    NetworkUnavailable,
    /// The server is out of capacity
    Capacity,
    /// The authentication token was rejected
    Unauthorized,
    Failed,
}

impl SessionFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionFailure::NetworkUnavailable => "network-unavailable",
            SessionFailure::Capacity => "capacity",
            SessionFailure::Unauthorized => "unauthorized",
            SessionFailure::Failed => "failed",
        }
    }

    /// Map a server status to a failure reason
    pub fn from_status(status: &str) -> Self {
        match status {
            "capacity" => SessionFailure::Capacity,
            "unauthorized" => SessionFailure::Unauthorized,
            "network-unavailable" => SessionFailure::NetworkUnavailable,
            _ => SessionFailure::Failed,
        }
    }

    /// Classify an error from the connect/authenticate sequence
    pub fn from_network(error: &NetworkError) -> Self {
        match error {
            NetworkError::Status { status, .. } => Self::from_status(status),
            e if e.is_transport() => SessionFailure::NetworkUnavailable,
            NetworkError::NoEndpointAvailable | NetworkError::Discovery(_) => {
                SessionFailure::NetworkUnavailable
            }
            _ => SessionFailure::Failed,
        }
    }
}

impl fmt::Display for SessionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by session client operations
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Session is not online")]
    NotOnline,

    #[error("Session already started")]
    AlreadyStarted,

    #[error("Session start failed: {0}")]
    StartFailed(SessionFailure),

    #[error("Session stopped while starting")]
    Cancelled,

    #[error(transparent)]
    Network(#[from] NetworkError),
}

/// Errors returned when a stream does not reach `Active`
#[derive(Error, Debug)]
pub enum StreamError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Stream {state:?}: {reason}")]
    Terminated { state: StreamState, reason: EndReason },

    #[error("Stream driver stopped unexpectedly")]
    DriverGone,
}
