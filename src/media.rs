//! Media transport capability
//!
//! The signaling engine never touches media directly. Description
//! generation, ICE gathering, statistics and playback are provided by an
//! environment-specific implementation of [`MediaTransport`], chosen when a
//! stream is created.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

use crate::protocol::{IceCandidate, SessionDescription};

/// Errors reported by a media transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Operation not supported by this media transport")]
    Unsupported,

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Playback failed: {0}")]
    Playback(String),

    #[error("Media transport closed")]
    Closed,
}

/// Output of local ICE gathering
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IceGatheringEvent {
    Candidate(IceCandidate),
    /// Gathering finished; no more candidates follow
    Completed,
}

/// Logical state of the underlying peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogicalState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl LogicalState {
    /// States a monitored stream can never recover from
    pub fn is_dead(self) -> bool {
        matches!(self, LogicalState::Failed | LogicalState::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

/// Cumulative counters for one media kind
#[derive(Debug, Clone, PartialEq)]
pub struct KindStats {
    pub kind: MediaKind,
    /// Track is enabled (muted tracks are not judged)
    pub enabled: bool,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Frames per second, for kinds that have frames
    pub frame_rate: Option<f64>,
}

/// A statistics sample from the media transport
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TransportStats {
    pub state: LogicalState,
    pub kinds: Vec<KindStats>,
}

/// Capabilities the signaling engine needs from the media layer
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Create a local offer.
    ///
    /// Streams are set up with server-generated offers, so most transports
    /// can keep the default.
    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        Err(MediaError::Unsupported)
    }

    /// Apply the remote offer and produce the local answer
    async fn create_answer(&self, offer: &SessionDescription) -> Result<SessionDescription, MediaError>;

    /// Locally gathered ICE candidates, ending with [`IceGatheringEvent::Completed`]
    fn ice_candidates(&self) -> BoxStream<'static, IceGatheringEvent>;

    /// Current statistics sample
    async fn stats(&self) -> Result<TransportStats, MediaError>;

    /// Start passive pull-based playback of a manifest instead of a
    /// negotiated media session
    async fn attach_manifest(&self, uri: &str) -> Result<(), MediaError>;

    /// Release all media resources; safe to call more than once
    async fn release(&self);
}
