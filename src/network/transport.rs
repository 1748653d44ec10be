//! WebSocket transport with request/response correlation
//!
//! One `TransportConnection` owns one duplex WebSocket. Requests are tagged
//! with a strictly increasing request id and completed when the matching
//! response arrives, so responses may come back in any order. Frames
//! without a request id are unsolicited events and are dispatched to the
//! registered listeners, in registration order, before the next frame is
//! read.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, trace, warn};

use crate::protocol::{Envelope, FrameKind, Message, MessageType, Payload, Ping};

use super::error::NetworkError;

/// Transport timing configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// WebSocket connect timeout
    pub connect_timeout_ms: u64,
    /// Time to wait for a response before failing the request
    pub request_timeout_ms: u64,
    /// Keepalive ping interval (0 disables keepalive)
    pub keepalive_interval_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            request_timeout_ms: 15_000,
            keepalive_interval_ms: 30_000,
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_ms > 0).then(|| Duration::from_millis(self.keepalive_interval_ms))
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected
    #[default]
    Disconnected,
    /// WebSocket handshake in progress
    Connecting,
    /// Ready to send requests
    Connected,
}

/// Something a listener can be told about
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    /// The connection was lost or could not be established
    Disconnected { code: Option<u16>, reason: String },
    /// Unsolicited server message
    Message(Message),
}

/// Key listeners register under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    Message(MessageType),
}

impl TransportEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TransportEvent::Connected => EventKind::Connected,
            TransportEvent::Disconnected { .. } => EventKind::Disconnected,
            TransportEvent::Message(message) => EventKind::Message(message.message_type()),
        }
    }
}

/// Event listener callback
pub type EventHandler = Arc<dyn Fn(&TransportEvent) + Send + Sync + 'static>;

struct Listener {
    id: u64,
    kind: EventKind,
    handler: EventHandler,
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<Listener>,
}

/// Handle returned by [`TransportConnection::on`]; the handler stays
/// registered until this is dropped or [`Subscription::unsubscribe`] is called.
#[must_use = "dropping a Subscription unregisters its handler"]
pub struct Subscription {
    id: u64,
    listeners: Weak<Mutex<Listeners>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.lock().entries.retain(|entry| entry.id != self.id);
        }
    }
}

type Completion = oneshot::Sender<Result<Message, NetworkError>>;

/// Runs on the reader task with a successful response, before the next
/// frame is read and before the awaiting caller is woken
pub type ResponseHook = Box<dyn FnOnce(&Message) + Send + 'static>;

struct PendingRequest {
    message_type: MessageType,
    created_at: Instant,
    completion: Completion,
    on_response: Option<ResponseHook>,
}

#[derive(Default)]
struct Correlation {
    state: ConnectionState,
    /// Bumped by every connect and close; a handshake only installs its
    /// socket if no other attempt or close happened meanwhile
    attempt: u64,
    outbound: Option<mpsc::UnboundedSender<WsMessage>>,
    pending: HashMap<u64, PendingRequest>,
}

struct Shared {
    correlation: Mutex<Correlation>,
    listeners: Arc<Mutex<Listeners>>,
    next_request_id: AtomicU64,
    reader: Mutex<Option<JoinHandle<()>>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            correlation: Mutex::new(Correlation::default()),
            listeners: Arc::new(Mutex::new(Listeners::default())),
            next_request_id: AtomicU64::new(0),
            reader: Mutex::new(None),
            keepalive: Mutex::new(None),
        }
    }

    fn state(&self) -> ConnectionState {
        self.correlation.lock().state
    }

    fn send_request(
        self: &Arc<Self>,
        message: Message,
        request_timeout: Duration,
        on_response: Option<ResponseHook>,
    ) -> Result<PendingResponse, NetworkError> {
        let message_type = message.message_type();
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1;
        let frame = Envelope::request(request_id, &message)?.to_bytes()?;
        let (completion, receiver) = oneshot::channel();

        {
            let mut guard = self.correlation.lock();
            let correlation = &mut *guard;
            if correlation.state != ConnectionState::Connected {
                return Err(NetworkError::NotConnected);
            }
            let outbound = correlation
                .outbound
                .as_ref()
                .ok_or(NetworkError::NotConnected)?;
            outbound
                .send(WsMessage::Binary(frame))
                .map_err(|_| NetworkError::NotConnected)?;
            correlation.pending.insert(
                request_id,
                PendingRequest {
                    message_type,
                    created_at: Instant::now(),
                    completion,
                    on_response,
                },
            );
        }

        trace!("Sent request {} ({})", request_id, message_type);

        Ok(PendingResponse {
            request_id,
            message_type,
            receiver,
            timeout: request_timeout,
            shared: Arc::downgrade(self),
        })
    }

    /// Mark the connection closed and fail every pending request.
    ///
    /// Returns false if it was already closed.
    fn close(&self) -> bool {
        self.close_if(|_| true)
    }

    /// Close only if `attempt` is still the current connect attempt
    fn close_attempt(&self, attempt: u64) -> bool {
        self.close_if(|current| current == attempt)
    }

    fn close_if(&self, current: impl FnOnce(u64) -> bool) -> bool {
        let pending = {
            let mut correlation = self.correlation.lock();
            if correlation.state == ConnectionState::Disconnected || !current(correlation.attempt) {
                return false;
            }
            correlation.state = ConnectionState::Disconnected;
            correlation.attempt += 1;
            correlation.outbound = None;
            std::mem::take(&mut correlation.pending)
        };

        for (request_id, request) in pending {
            debug!(
                "Failing request {} ({}) on disconnect",
                request_id, request.message_type
            );
            let _ = request.completion.send(Err(NetworkError::Disconnected));
        }
        true
    }

    fn stop_keepalive(&self) {
        if let Some(handle) = self.keepalive.lock().take() {
            handle.abort();
        }
    }

    fn dispatch(&self, event: &TransportEvent) {
        let kind = event.kind();
        let handlers: Vec<EventHandler> = self
            .listeners
            .lock()
            .entries
            .iter()
            .filter(|entry| entry.kind == kind)
            .map(|entry| entry.handler.clone())
            .collect();

        if handlers.is_empty() {
            trace!("No listeners for {:?}", kind);
        }
        for handler in handlers {
            handler(event);
        }
    }

    fn handle_frame(&self, data: &[u8]) {
        let envelope = match Envelope::from_bytes(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping undecodable frame ({} bytes): {}", data.len(), e);
                return;
            }
        };

        match envelope.kind() {
            FrameKind::Response => self.complete(envelope),
            FrameKind::Event => match envelope.decode_message() {
                Ok(message) => self.dispatch(&TransportEvent::Message(message)),
                Err(e) => warn!("Dropping event {}: {}", envelope.message_type, e),
            },
            FrameKind::Request => {
                warn!("Ignoring server request {}", envelope.message_type);
            }
        }
    }

    fn complete(&self, envelope: Envelope) {
        let Some(request_id) = envelope.request_id else {
            return;
        };
        let Some(pending) = self.correlation.lock().pending.remove(&request_id) else {
            debug!(
                "No pending request for response {} ({})",
                request_id, envelope.message_type
            );
            return;
        };

        trace!(
            "Response {} for {} after {:?}",
            request_id,
            pending.message_type,
            pending.created_at.elapsed()
        );

        let status = envelope.status.clone().unwrap_or_default();
        let result = match envelope.decode_message() {
            Ok(message) if envelope.is_ok() => Ok(message),
            Ok(message) => Err(NetworkError::Status {
                status,
                message_type: envelope.message_type,
                response: Some(Box::new(message)),
            }),
            Err(_) if !envelope.is_ok() => Err(NetworkError::Status {
                status,
                message_type: envelope.message_type,
                response: None,
            }),
            Err(e) => Err(NetworkError::Codec(e)),
        };

        if let (Ok(message), Some(on_response)) = (&result, pending.on_response) {
            on_response(message);
        }
        let _ = pending.completion.send(result);
    }
}

/// Unwrap a response, failing if the server answered with another schema
pub fn expect_payload<T: Payload>(message: Message) -> Result<T, NetworkError> {
    T::from_message(message).map_err(|other| NetworkError::UnexpectedResponse {
        expected: T::MESSAGE_TYPE.as_str(),
        actual: other.message_type().as_str(),
    })
}

/// A request that has been written to the connection and awaits its response
#[must_use = "a pending response does nothing unless awaited"]
pub struct PendingResponse {
    request_id: u64,
    message_type: MessageType,
    receiver: oneshot::Receiver<Result<Message, NetworkError>>,
    timeout: Duration,
    shared: Weak<Shared>,
}

impl PendingResponse {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Wait for the response.
    ///
    /// Resolves exactly once: with the response, the server's error status,
    /// `Disconnected` if the connection closed first, or `Timeout`.
    pub async fn response(self) -> Result<Message, NetworkError> {
        match timeout(self.timeout, self.receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(NetworkError::Disconnected),
            Err(_) => {
                if let Some(shared) = self.shared.upgrade() {
                    shared.correlation.lock().pending.remove(&self.request_id);
                }
                warn!(
                    "Request {} ({}) timed out after {:?}",
                    self.request_id, self.message_type, self.timeout
                );
                Err(NetworkError::Timeout)
            }
        }
    }

    /// Wait for the response and unwrap it as `T`
    pub async fn response_as<T: Payload>(self) -> Result<T, NetworkError> {
        expect_payload(self.response().await?)
    }
}

/// A persistent signaling connection
pub struct TransportConnection {
    shared: Arc<Shared>,
    config: TransportConfig,
}

impl TransportConnection {
    /// Create a new connection (not yet connected)
    pub fn new(config: TransportConfig) -> Self {
        Self {
            shared: Arc::new(Shared::new()),
            config,
        }
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Number of requests still waiting for a response
    pub fn pending_requests(&self) -> usize {
        self.shared.correlation.lock().pending.len()
    }

    /// Register a handler for one kind of event
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.shared.listeners.lock();
        listeners.next_id += 1;
        let id = listeners.next_id;
        listeners.entries.push(Listener {
            id,
            kind,
            handler: Arc::new(handler),
        });

        Subscription {
            id,
            listeners: Arc::downgrade(&self.shared.listeners),
        }
    }

    /// Connect to a signaling endpoint
    pub async fn connect(&self, uri: &str) -> Result<(), NetworkError> {
        let attempt = {
            let mut correlation = self.shared.correlation.lock();
            if correlation.state != ConnectionState::Disconnected {
                return Err(NetworkError::AlreadyConnected);
            }
            correlation.state = ConnectionState::Connecting;
            correlation.attempt += 1;
            correlation.attempt
        };

        info!("Connecting to {}", uri);

        let ws_stream = match timeout(self.config.connect_timeout(), connect_async(uri)).await {
            Ok(Ok((ws_stream, _))) => ws_stream,
            Ok(Err(e)) => {
                let reason = format!("Connect failed: {}", e);
                self.fail_connect(attempt, &reason);
                return Err(NetworkError::SignalingError(reason));
            }
            Err(_) => {
                self.fail_connect(attempt, "Connect timed out");
                return Err(NetworkError::ConnectionTimeout);
            }
        };

        let (mut write, mut read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WsMessage>();

        {
            let mut correlation = self.shared.correlation.lock();
            if correlation.state != ConnectionState::Connecting || correlation.attempt != attempt {
                // disconnect() ran while the handshake was in flight
                debug!("Discarding handshake of connect attempt {}", attempt);
                return Err(NetworkError::Disconnected);
            }
            correlation.state = ConnectionState::Connected;
            correlation.outbound = Some(outbound_tx);
        }

        // Writer ends when the outbound sender is dropped on close
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = write.send(frame).await {
                    warn!("WebSocket send failed: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        let shared = self.shared.clone();
        let reader = tokio::spawn(async move {
            let (code, reason) = loop {
                match read.next().await {
                    Some(Ok(WsMessage::Binary(data))) => {
                        if shared.state() != ConnectionState::Connected {
                            break (None, "Connection closed locally".to_string());
                        }
                        shared.handle_frame(&data);
                    }
                    Some(Ok(WsMessage::Text(text))) => {
                        warn!("Ignoring text frame ({} bytes)", text.len());
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        let code = frame.as_ref().map(|f| u16::from(f.code));
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .unwrap_or_else(|| "Connection closed".to_string());
                        break (code, reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break (None, e.to_string()),
                    None => break (None, "Connection closed".to_string()),
                }
            };

            if shared.close() {
                info!("Signaling connection lost: {}", reason);
                shared.stop_keepalive();
                shared.dispatch(&TransportEvent::Disconnected { code, reason });
            }
        });
        *self.shared.reader.lock() = Some(reader);

        self.start_keepalive();

        info!("Connected to {}", uri);
        self.shared.dispatch(&TransportEvent::Connected);
        Ok(())
    }

    fn fail_connect(&self, attempt: u64, reason: &str) {
        warn!("{}", reason);
        if self.shared.close_attempt(attempt) {
            self.shared.dispatch(&TransportEvent::Disconnected {
                code: None,
                reason: reason.to_string(),
            });
        }
    }

    /// Send a request without waiting for its response.
    ///
    /// Fails immediately with `NotConnected` if the connection is closed.
    pub fn send_request(&self, message: impl Into<Message>) -> Result<PendingResponse, NetworkError> {
        self.shared
            .send_request(message.into(), self.config.request_timeout(), None)
    }

    /// Send a request whose successful response is first handed to
    /// `on_response` on the reader task.
    ///
    /// Anything the hook does is visible before the next server frame is
    /// dispatched, so an event that follows the response on the wire can
    /// rely on it.
    pub fn send_request_with_hook(
        &self,
        message: impl Into<Message>,
        on_response: ResponseHook,
    ) -> Result<PendingResponse, NetworkError> {
        self.shared
            .send_request(message.into(), self.config.request_timeout(), Some(on_response))
    }

    /// Send a request and wait for its response
    pub async fn request(&self, message: impl Into<Message>) -> Result<Message, NetworkError> {
        self.send_request(message)?.response().await
    }

    /// Close the connection.
    ///
    /// Pending requests fail with `Disconnected`; no listener is invoked
    /// afterwards.
    pub fn disconnect(&self) {
        if !self.shared.close() {
            return;
        }
        if let Some(handle) = self.shared.reader.lock().take() {
            handle.abort();
        }
        self.shared.stop_keepalive();
        info!("Disconnected");
    }

    fn start_keepalive(&self) {
        let Some(interval) = self.config.keepalive_interval() else {
            return;
        };
        let shared = Arc::downgrade(&self.shared);
        let request_timeout = self.config.request_timeout();

        let handle = tokio::spawn(async move {
            loop {
                let jitter_ms = rand::thread_rng().gen_range(0..=interval.as_millis() as u64 / 10);
                tokio::time::sleep(interval + Duration::from_millis(jitter_ms)).await;

                let Some(shared) = shared.upgrade() else {
                    return;
                };
                let sent_at_ms = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis() as u64;
                let pending = match shared.send_request(Ping { sent_at_ms }.into(), request_timeout, None) {
                    Ok(pending) => pending,
                    Err(_) => return,
                };
                drop(shared);

                match pending.response().await {
                    Ok(_) => trace!("Keepalive pong received"),
                    Err(e) => warn!("Keepalive ping failed: {}", e),
                }
            }
        });

        *self.shared.keepalive.lock() = Some(handle);
    }

    #[cfg(test)]
    fn attach_for_test(&self) -> mpsc::UnboundedReceiver<WsMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut correlation = self.shared.correlation.lock();
        correlation.state = ConnectionState::Connected;
        correlation.outbound = Some(tx);
        rx
    }
}

impl Drop for TransportConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}
