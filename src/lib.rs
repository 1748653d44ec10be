//! pcast - Signaling and session engine for the PCast real-time media platform
//!
//! This library discovers and selects a signaling endpoint, keeps an
//! authenticated session on one WebSocket connection and drives publish
//! and subscribe streams through negotiation to teardown. Media itself is
//! handled by an external [`media::MediaTransport`].

pub mod config;
pub mod media;
pub mod network;
pub mod protocol;
pub mod session;

pub use config::ClientConfig;
pub use media::MediaTransport;
pub use network::TransportConnection;
pub use session::{SessionClient, SessionEvent, StreamHandle};
