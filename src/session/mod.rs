//! Session layer
//!
//! The session client, the per-stream state machine and its driver, and
//! the media health monitor.

mod client;
mod driver;
mod error;
mod monitor;
mod stream;

pub use client::{SessionClient, SessionEvent, SessionStatus};
pub use driver::{StreamConfig, StreamEvent, StreamHandle, StreamOptions, StreamStatus};
pub use error::{SessionError, SessionFailure, StreamError};
pub use monitor::{
    Acknowledge, Condition, FailureReport, HealthMonitor, MonitorConfig, MonitorState, Verdict,
};
pub use stream::{
    Effect, IllegalTransition, StreamEventKind, StreamInput, StreamMachine, StreamState, Transition,
};
