//! Signaling protocol definitions
//!
//! Defines the message schemas and the envelope codec used on the wire.

mod codec;
mod messages;

pub use codec::{
    decode, encode, CodecError, Envelope, FrameKind, MAX_FRAME_SIZE, STATUS_OK,
};
pub use messages::*;
