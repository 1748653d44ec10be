//! Message schemas for the PCast signaling protocol
//!
//! Every message type has a registered wire name (e.g. `pcast.SetupStream`)
//! and a payload struct. The table below is the single source of truth for
//! which names the codec accepts.

use std::fmt;

use bincode::Options;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Protocol API version sent with authentication and stream setup
pub const API_VERSION: u32 = 5;

/// Session identifier assigned by the server
pub type SessionId = String;

/// Stream identifier assigned by the server
pub type StreamId = String;

/// How a message travels over the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client -> server, carries a request id
    Request,
    /// Server -> client, answers a request id
    Response,
    /// Server -> client, unsolicited
    Event,
}

/// A payload struct registered in the schema table
pub trait Payload: Sized + Into<Message> {
    const MESSAGE_TYPE: MessageType;

    /// Unwrap this payload, handing back any other message unchanged
    fn from_message(message: Message) -> Result<Self, Message>;
}

macro_rules! schemas {
    ($( $variant:ident => $name:literal, $role:ident; )*) => {
        /// Registered message types
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum MessageType {
            $( $variant, )*
        }

        impl MessageType {
            /// Every registered schema, in table order
            pub const ALL: &'static [MessageType] = &[ $( MessageType::$variant, )* ];

            /// Wire name of this message type
            pub fn as_str(self) -> &'static str {
                match self {
                    $( MessageType::$variant => $name, )*
                }
            }

            /// Look up a message type by its wire name
            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $( $name => Some(MessageType::$variant), )*
                    _ => None,
                }
            }

            pub fn role(self) -> Role {
                match self {
                    $( MessageType::$variant => Role::$role, )*
                }
            }
        }

        /// A decoded protocol message
        #[derive(Debug, Clone, PartialEq)]
        pub enum Message {
            $( $variant($variant), )*
        }

        impl Message {
            pub fn message_type(&self) -> MessageType {
                match self {
                    $( Message::$variant(_) => MessageType::$variant, )*
                }
            }

            pub(crate) fn serialize_payload<O: Options>(&self, options: O) -> bincode::Result<Vec<u8>> {
                match self {
                    $( Message::$variant(payload) => options.serialize(payload), )*
                }
            }

            pub(crate) fn deserialize_payload<O: Options>(
                message_type: MessageType,
                bytes: &[u8],
                options: O,
            ) -> bincode::Result<Self> {
                match message_type {
                    $( MessageType::$variant => options.deserialize::<$variant>(bytes).map(Message::$variant), )*
                }
            }
        }

        $(
            impl From<$variant> for Message {
                fn from(payload: $variant) -> Self {
                    Message::$variant(payload)
                }
            }

            impl Payload for $variant {
                const MESSAGE_TYPE: MessageType = MessageType::$variant;

                fn from_message(message: Message) -> Result<Self, Message> {
                    match message {
                        Message::$variant(payload) => Ok(payload),
                        other => Err(other),
                    }
                }
            }
        )*
    };
}

schemas! {
    Authenticate => "pcast.Authenticate", Request;
    AuthenticateResponse => "pcast.AuthenticateResponse", Response;
    Bye => "pcast.Bye", Request;
    ByeResponse => "pcast.ByeResponse", Response;
    SetupStream => "pcast.SetupStream", Request;
    SetupStreamResponse => "pcast.SetupStreamResponse", Response;
    SetAnswer => "pcast.SetAnswer", Request;
    SetAnswerResponse => "pcast.SetAnswerResponse", Response;
    AddIceCandidates => "pcast.AddIceCandidates", Request;
    AddIceCandidatesResponse => "pcast.AddIceCandidatesResponse", Response;
    UpdateStreamState => "pcast.UpdateStreamState", Request;
    UpdateStreamStateResponse => "pcast.UpdateStreamStateResponse", Response;
    DestroyStream => "pcast.DestroyStream", Request;
    DestroyStreamResponse => "pcast.DestroyStreamResponse", Response;
    Ping => "pcast.Ping", Request;
    Pong => "pcast.Pong", Response;
    AuthenticationEvent => "pcast.AuthenticationEvent", Event;
    StreamEnded => "pcast.StreamEnded", Event;
    StreamDataQuality => "pcast.StreamDataQuality", Event;
    RoomEvent => "chat.RoomEvent", Event;
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stream direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamDirection {
    /// Publish local media
    Upload,
    /// Subscribe to remote media
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DescriptionKind {
    Offer,
    Answer,
}

/// Opaque session description produced or consumed by the media transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: DescriptionKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Answer,
            sdp: sdp.into(),
        }
    }

    /// Manifest URI if this offer asks for passive (pull-based) playback
    /// instead of a negotiated media session.
    pub fn manifest_uri(&self) -> Option<&str> {
        self.sdp.lines().find_map(|line| {
            let line = line.trim();
            line.strip_prefix("a=x-playlist:")
                .or_else(|| line.strip_prefix("a=x-manifest:"))
                .map(str::trim)
                .filter(|uri| !uri.is_empty())
        })
    }
}

/// Opaque ICE candidate produced by the media transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataQualityStatus {
    NoData,
    AudioOnly,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomEventType {
    MemberJoined,
    MemberLeft,
    MemberUpdated,
    RoomUpdated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMember {
    pub session_id: SessionId,
    pub screen_name: String,
}

// Client -> Server requests

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authenticate {
    pub api_version: u32,
    pub client_version: String,
    pub device_id: String,
    pub platform: String,
    pub platform_version: String,
    pub authentication_token: String,
    /// Previous session id when reconnecting
    pub session_id: Option<SessionId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bye {
    pub session_id: SessionId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupStream {
    pub api_version: u32,
    pub session_id: SessionId,
    pub stream_token: String,
    pub direction: StreamDirection,
    /// Ask the server to create the offer description
    pub create_offer: bool,
    pub tags: Vec<String>,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetAnswer {
    pub session_id: SessionId,
    pub stream_id: StreamId,
    pub answer: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddIceCandidates {
    pub session_id: SessionId,
    pub stream_id: StreamId,
    pub candidates: Vec<IceCandidate>,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStreamState {
    pub session_id: SessionId,
    pub stream_id: StreamId,
    pub signaling_state: String,
    pub ice_state: String,
    pub connection_state: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestroyStream {
    pub session_id: SessionId,
    pub stream_id: StreamId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub sent_at_ms: u64,
}

// Server -> Client responses

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticateResponse {
    pub session_id: Option<SessionId>,
    pub redirect: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByeResponse {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupStreamResponse {
    pub stream_id: StreamId,
    pub offer: Option<SessionDescription>,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetAnswerResponse {
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddIceCandidatesResponse {
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStreamStateResponse {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestroyStreamResponse {
    pub stream_id: StreamId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub sent_at_ms: u64,
}

// Server -> Client events

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationEvent {
    pub session_id: Option<SessionId>,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEnded {
    pub session_id: SessionId,
    pub stream_id: StreamId,
    pub reason: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDataQuality {
    pub stream_id: StreamId,
    pub status: DataQualityStatus,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomEvent {
    pub room_id: String,
    pub event_type: RoomEventType,
    pub members: Vec<RoomMember>,
}

/// Behavior flags carried in the `options` lists of stream messages.
///
/// Decoded once at the protocol boundary so the rest of the crate never
/// matches on raw option strings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamFlags {
    /// Server wants incremental ICE candidates
    pub ice_candidates: bool,
    /// Candidate gathering has finished
    pub completed: bool,
    /// Server no longer wants candidates for this stream
    pub cancel: bool,
}

impl StreamFlags {
    const ICE_CANDIDATES: &'static str = "ice-candidates";
    const COMPLETED: &'static str = "completed";
    const CANCEL: &'static str = "cancel";

    pub fn from_options(options: &[String]) -> Self {
        let mut flags = Self::default();
        for option in options {
            match option.as_str() {
                Self::ICE_CANDIDATES => flags.ice_candidates = true,
                Self::COMPLETED => flags.completed = true,
                Self::CANCEL => flags.cancel = true,
                other => debug!("Ignoring unknown stream option '{}'", other),
            }
        }
        flags
    }

    pub fn to_options(self) -> Vec<String> {
        let mut options = Vec::new();
        if self.ice_candidates {
            options.push(Self::ICE_CANDIDATES.to_string());
        }
        if self.completed {
            options.push(Self::COMPLETED.to_string());
        }
        if self.cancel {
            options.push(Self::CANCEL.to_string());
        }
        options
    }

    /// Combine flags reported by several responses for the same stream
    pub fn union(self, other: Self) -> Self {
        Self {
            ice_candidates: self.ice_candidates || other.ice_candidates,
            completed: self.completed || other.completed,
            cancel: self.cancel || other.cancel,
        }
    }
}

/// Symbolic reason a stream ended or failed
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EndReason {
    /// Torn down locally or with the connection
    Ended,
    /// Server ended the stream
    StreamEnded,
    /// The origin stream a subscriber was watching ended
    OriginStreamEnded,
    StreamingNotAvailable,
    /// Health monitor detected a dead media transport
    ClientSideFailure,
    Failed,
    Other(String),
}

impl EndReason {
    pub fn as_str(&self) -> &str {
        match self {
            EndReason::Ended => "ended",
            EndReason::StreamEnded => "stream-ended",
            EndReason::OriginStreamEnded => "origin-stream-ended",
            EndReason::StreamingNotAvailable => "streaming-not-available",
            EndReason::ClientSideFailure => "client-side-failure",
            EndReason::Failed => "failed",
            EndReason::Other(reason) => reason,
        }
    }

    pub fn from_wire(reason: &str) -> Self {
        match reason {
            "ended" => EndReason::Ended,
            "stream-ended" => EndReason::StreamEnded,
            "origin-stream-ended" => EndReason::OriginStreamEnded,
            "streaming-not-available" => EndReason::StreamingNotAvailable,
            "client-side-failure" => EndReason::ClientSideFailure,
            "failed" => EndReason::Failed,
            other => EndReason::Other(other.to_string()),
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
