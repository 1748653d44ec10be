//! Envelope framing and payload codec for the PCast protocol
//!
//! Every WebSocket binary frame carries one envelope:
//! - request_id: present on requests and responses, absent on events
//! - message_type: registered schema name (e.g. `pcast.SetupStream`)
//! - payload: bincode-encoded schema body
//! - status: present on responses only (`ok` on success)

use bincode::Options;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::messages::{Message, MessageType};

/// Largest frame the codec will produce or accept
pub const MAX_FRAME_SIZE: u64 = 1024 * 1024;

/// Response status for a successful request
pub const STATUS_OK: &str = "ok";

/// Errors produced while encoding or decoding frames
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Unknown message type '{0}'")]
    UnknownType(String),

    #[error("Malformed {message_type} payload: {reason}")]
    MalformedPayload {
        message_type: String,
        reason: String,
    },

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Encode failed: {0}")]
    Encode(String),
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE)
        .reject_trailing_bytes()
}

/// Encode a message payload (without envelope)
pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    message
        .serialize_payload(wire_options())
        .map_err(|e| CodecError::Encode(e.to_string()))
}

/// Decode a payload for the named message type
pub fn decode(message_type: &str, bytes: &[u8]) -> Result<Message, CodecError> {
    let schema = MessageType::from_name(message_type)
        .ok_or_else(|| CodecError::UnknownType(message_type.to_string()))?;

    Message::deserialize_payload(schema, bytes, wire_options()).map_err(|e| {
        CodecError::MalformedPayload {
            message_type: message_type.to_string(),
            reason: e.to_string(),
        }
    })
}

/// What an envelope represents on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request,
    Response,
    Event,
}

/// The outer frame shared by requests, responses and events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub request_id: Option<u64>,
    pub message_type: String,
    pub payload: Vec<u8>,
    pub status: Option<String>,
}

impl Envelope {
    /// Create a request envelope
    pub fn request(request_id: u64, message: &Message) -> Result<Self, CodecError> {
        Ok(Self {
            request_id: Some(request_id),
            message_type: message.message_type().as_str().to_string(),
            payload: encode(message)?,
            status: None,
        })
    }

    /// Create a response envelope
    pub fn response(request_id: u64, status: &str, message: &Message) -> Result<Self, CodecError> {
        Ok(Self {
            request_id: Some(request_id),
            message_type: message.message_type().as_str().to_string(),
            payload: encode(message)?,
            status: Some(status.to_string()),
        })
    }

    /// Create an error response that carries no payload
    pub fn failure(request_id: u64, message_type: MessageType, status: &str) -> Self {
        Self {
            request_id: Some(request_id),
            message_type: message_type.as_str().to_string(),
            payload: Vec::new(),
            status: Some(status.to_string()),
        }
    }

    /// Create an unsolicited event envelope
    pub fn event(message: &Message) -> Result<Self, CodecError> {
        Ok(Self {
            request_id: None,
            message_type: message.message_type().as_str().to_string(),
            payload: encode(message)?,
            status: None,
        })
    }

    pub fn kind(&self) -> FrameKind {
        match (self.request_id, &self.status) {
            (None, _) => FrameKind::Event,
            (Some(_), None) => FrameKind::Request,
            (Some(_), Some(_)) => FrameKind::Response,
        }
    }

    /// True if this is a response with status `ok`
    pub fn is_ok(&self) -> bool {
        self.status.as_deref() == Some(STATUS_OK)
    }

    /// Decode the payload according to the envelope's message type
    pub fn decode_message(&self) -> Result<Message, CodecError> {
        decode(&self.message_type, &self.payload)
    }

    /// Serialize the envelope to a frame
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        wire_options()
            .serialize(self)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Deserialize an envelope from a frame
    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        wire_options()
            .deserialize(data)
            .map_err(|e| CodecError::MalformedEnvelope(e.to_string()))
    }
}
