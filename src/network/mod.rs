//! Network module for PCast signaling
//!
//! Handles the WebSocket transport, endpoint discovery and latency-based
//! endpoint resolution.

mod discovery;
mod error;
mod resolver;
mod transport;

pub use discovery::{parse_endpoint_list, EndpointDiscovery};
pub use error::NetworkError;
pub use resolver::{
    endpoint_host_port, EndpointCandidate, EndpointProber, EndpointResolver, Resolution,
    ResolverConfig, TcpConnectProber,
};
pub use transport::{
    expect_payload, ConnectionState, EventHandler, EventKind, PendingResponse, ResponseHook, Subscription,
    TransportConfig, TransportConnection, TransportEvent,
};
