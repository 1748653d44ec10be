//! Session client
//!
//! Owns the signaling connection, the authenticated session and the
//! registry of live streams. Server events are routed to the stream they
//! name; connection loss takes the session offline and fails every stream.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::media::MediaTransport;
use crate::network::{
    expect_payload, EndpointDiscovery, EndpointResolver, EventKind, NetworkError, PendingResponse,
    ResponseHook, Subscription, TransportConnection, TransportEvent,
};
use crate::protocol::{
    AddIceCandidates, AddIceCandidatesResponse, Authenticate, AuthenticateResponse,
    AuthenticationEvent, Bye, DescriptionKind, DestroyStream, DestroyStreamResponse, EndReason,
    IceCandidate, Message, MessageType, RoomEvent, SessionDescription, SessionId, SetAnswer, SetAnswerResponse,
    SetupStream, SetupStreamResponse, StreamDataQuality, StreamDirection, StreamEnded, StreamFlags,
    StreamId, UpdateStreamState, UpdateStreamStateResponse, API_VERSION, STATUS_OK,
};

use super::driver::{Command, StreamDriver, StreamEvent, StreamHandle, StreamOptions};
use super::error::{SessionError, SessionFailure, StreamError};
use super::stream::{StreamInput, StreamState};

/// Capacity of the session event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Redirects followed during one authentication
const MAX_REDIRECTS: usize = 1;

/// Reason sent with `pcast.Bye`
const BYE_REASON: &str = "stopped";

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionStatus {
    #[default]
    Offline,
    Connecting,
    Online,
}

/// Notifications published by a session client
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Online { session_id: SessionId },
    /// The session dropped or could not be started
    Offline { reason: SessionFailure },
    /// `stop()` finished
    Stopped,
    Stream(StreamEvent),
    Room(RoomEvent),
}

#[derive(Default)]
struct Session {
    session_id: Option<SessionId>,
    status: SessionStatus,
    /// Bumped by every start and stop so a stale start can detect it lost
    generation: u64,
    stopping: bool,
}

struct StreamEntry {
    stream_id: Option<StreamId>,
    commands: mpsc::UnboundedSender<Command>,
}

#[derive(Default)]
struct StreamRegistry {
    next_key: u64,
    entries: HashMap<u64, StreamEntry>,
}

pub(crate) struct ClientInner {
    config: ClientConfig,
    connection: TransportConnection,
    resolver: EndpointResolver,
    session: Mutex<Session>,
    streams: Mutex<StreamRegistry>,
    subscriptions: Mutex<Vec<Subscription>>,
    events: broadcast::Sender<SessionEvent>,
    status: watch::Sender<SessionStatus>,
}

fn invalid(condition: bool, message: &'static str) -> Result<(), SessionError> {
    if condition {
        Err(SessionError::InvalidArgument(message))
    } else {
        Ok(())
    }
}

impl ClientInner {
    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn set_status(&self, status: SessionStatus) {
        self.status.send_replace(status);
    }

    pub(crate) fn register_stream(&self, commands: mpsc::UnboundedSender<Command>) -> u64 {
        let mut registry = self.streams.lock();
        registry.next_key += 1;
        let key = registry.next_key;
        registry.entries.insert(
            key,
            StreamEntry {
                stream_id: None,
                commands,
            },
        );
        key
    }

    pub(crate) fn assign_stream_id(&self, key: u64, stream_id: &StreamId) {
        if let Some(entry) = self.streams.lock().entries.get_mut(&key) {
            entry.stream_id = Some(stream_id.clone());
        }
    }

    pub(crate) fn unregister_stream(&self, key: u64) {
        self.streams.lock().entries.remove(&key);
    }

    fn send_to_stream(&self, stream_id: &str, input: StreamInput) {
        let commands = self
            .streams
            .lock()
            .entries
            .values()
            .find(|entry| entry.stream_id.as_deref() == Some(stream_id))
            .map(|entry| entry.commands.clone());

        match commands {
            Some(commands) => {
                let _ = commands.send(Command::new(input));
            }
            None => debug!("{} for unknown stream {}", input.name(), stream_id),
        }
    }

    fn send_to_all_streams(&self, input: StreamInput) {
        for entry in self.streams.lock().entries.values() {
            let _ = entry.commands.send(Command::new(input.clone()));
        }
    }

    fn session_id(&self) -> Result<SessionId, SessionError> {
        let session = self.session.lock();
        match (session.status, &session.session_id) {
            (SessionStatus::Online, Some(session_id)) => Ok(session_id.clone()),
            _ => Err(SessionError::NotOnline),
        }
    }

    // Typed requests: arguments are validated before anything is sent

    pub(crate) fn begin_setup_stream(
        &self,
        stream_token: &str,
        direction: StreamDirection,
        options: &StreamOptions,
        on_response: Option<ResponseHook>,
    ) -> Result<PendingResponse, SessionError> {
        invalid(stream_token.trim().is_empty(), "stream token is empty")?;
        let session_id = self.session_id()?;

        let request = SetupStream {
            api_version: API_VERSION,
            session_id,
            stream_token: stream_token.to_string(),
            direction,
            create_offer: true,
            tags: options.tags.clone(),
            options: options.capabilities.clone(),
        };
        Ok(match on_response {
            Some(hook) => self.connection.send_request_with_hook(request, hook)?,
            None => self.connection.send_request(request)?,
        })
    }

    pub(crate) fn begin_set_answer(
        &self,
        stream_id: &str,
        answer: SessionDescription,
    ) -> Result<PendingResponse, SessionError> {
        invalid(stream_id.is_empty(), "stream id is empty")?;
        invalid(answer.kind != DescriptionKind::Answer, "description is not an answer")?;
        invalid(answer.sdp.trim().is_empty(), "answer is empty")?;
        let session_id = self.session_id()?;

        Ok(self.connection.send_request(SetAnswer {
            session_id,
            stream_id: stream_id.to_string(),
            answer,
        })?)
    }

    pub(crate) fn begin_add_ice_candidates(
        &self,
        stream_id: &str,
        candidates: Vec<IceCandidate>,
        options: Vec<String>,
    ) -> Result<PendingResponse, SessionError> {
        invalid(stream_id.is_empty(), "stream id is empty")?;
        invalid(
            candidates.is_empty() && !StreamFlags::from_options(&options).completed,
            "no candidates",
        )?;
        invalid(
            candidates.iter().any(|c| c.candidate.trim().is_empty()),
            "empty candidate",
        )?;
        let session_id = self.session_id()?;

        Ok(self.connection.send_request(AddIceCandidates {
            session_id,
            stream_id: stream_id.to_string(),
            candidates,
            options,
        })?)
    }

    fn begin_update_stream_state(
        &self,
        stream_id: &str,
        signaling_state: &str,
        ice_state: &str,
        connection_state: &str,
    ) -> Result<PendingResponse, SessionError> {
        invalid(stream_id.is_empty(), "stream id is empty")?;
        invalid(
            signaling_state.is_empty() || ice_state.is_empty() || connection_state.is_empty(),
            "stream state is empty",
        )?;
        let session_id = self.session_id()?;

        Ok(self.connection.send_request(UpdateStreamState {
            session_id,
            stream_id: stream_id.to_string(),
            signaling_state: signaling_state.to_string(),
            ice_state: ice_state.to_string(),
            connection_state: connection_state.to_string(),
        })?)
    }

    pub(crate) fn begin_destroy_stream(&self, stream_id: &str, reason: &str) -> Result<PendingResponse, SessionError> {
        invalid(stream_id.is_empty(), "stream id is empty")?;
        invalid(reason.is_empty(), "reason is empty")?;
        let session_id = self.session_id()?;

        Ok(self.connection.send_request(DestroyStream {
            session_id,
            stream_id: stream_id.to_string(),
            reason: reason.to_string(),
        })?)
    }

    async fn destroy_stream(
        &self,
        stream_id: &str,
        reason: &str,
    ) -> Result<DestroyStreamResponse, SessionError> {
        let pending = self.begin_destroy_stream(stream_id, reason)?;
        Ok(pending.response_as().await?)
    }

    // Connection events

    fn on_transport_lost(&self, reason: &str) {
        {
            let mut session = self.session.lock();
            if session.status != SessionStatus::Online || session.stopping {
                return;
            }
            session.status = SessionStatus::Offline;
        }

        warn!("Session offline: {}", reason);
        self.set_status(SessionStatus::Offline);
        self.emit(SessionEvent::Offline {
            reason: SessionFailure::NetworkUnavailable,
        });
        self.send_to_all_streams(StreamInput::TransportLost);
    }

    fn on_authentication_event(&self, event: &AuthenticationEvent) {
        if event.status == STATUS_OK {
            debug!("Authentication refreshed");
            return;
        }

        {
            let mut session = self.session.lock();
            if session.status != SessionStatus::Online || session.stopping {
                return;
            }
            session.status = SessionStatus::Offline;
        }

        warn!("Session revoked by server: {}", event.status);
        self.connection.disconnect();
        self.set_status(SessionStatus::Offline);
        self.emit(SessionEvent::Offline {
            reason: SessionFailure::Unauthorized,
        });
        self.send_to_all_streams(StreamInput::TransportLost);
    }

    fn on_stream_ended(&self, event: &StreamEnded) {
        debug!("Server ended stream {}: {}", event.stream_id, event.reason);
        self.send_to_stream(
            &event.stream_id,
            StreamInput::ServerEnded {
                reason: EndReason::from_wire(&event.reason),
            },
        );
    }

    fn on_data_quality(&self, event: &StreamDataQuality) {
        self.send_to_stream(
            &event.stream_id,
            StreamInput::DataQuality {
                status: event.status,
                reason: event.reason.clone(),
            },
        );
    }

    // Start sequence

    async fn endpoints(&self) -> Result<Vec<String>, NetworkError> {
        if !self.config.endpoints.is_empty() {
            return Ok(self.config.endpoints.clone());
        }
        let uri = self
            .config
            .discovery_uri
            .as_deref()
            .ok_or(NetworkError::NoEndpointAvailable)?;
        EndpointDiscovery::new(uri, self.config.transport.request_timeout())?
            .fetch()
            .await
    }

    async fn select_endpoint(&self) -> Result<String, NetworkError> {
        let endpoints = self.endpoints().await?;
        match endpoints.as_slice() {
            [only] => Ok(only.clone()),
            _ => Ok(self.resolver.resolve(&endpoints).await?.endpoint),
        }
    }

    async fn establish(
        &self,
        authentication_token: &str,
        previous_session_id: Option<SessionId>,
    ) -> Result<SessionId, SessionFailure> {
        let classify = |e: NetworkError| {
            warn!("Session start failed: {}", e);
            SessionFailure::from_network(&e)
        };

        let mut endpoint = self.select_endpoint().await.map_err(classify)?;

        for attempt in 0..=MAX_REDIRECTS {
            self.connection.connect(&endpoint).await.map_err(classify)?;

            let response: AuthenticateResponse = self
                .connection
                .request(Authenticate {
                    api_version: API_VERSION,
                    client_version: self.config.client_version.clone(),
                    device_id: self.config.device_id.clone(),
                    platform: self.config.platform.clone(),
                    platform_version: self.config.platform_version.clone(),
                    authentication_token: authentication_token.to_string(),
                    session_id: previous_session_id.clone(),
                })
                .await
                .and_then(expect_payload)
                .map_err(classify)?;

            match (response.redirect, response.session_id) {
                (Some(redirect), _) if attempt < MAX_REDIRECTS => {
                    info!("Redirected from {} to {}", endpoint, redirect);
                    self.connection.disconnect();
                    endpoint = redirect;
                }
                (_, Some(session_id)) => return Ok(session_id),
                _ => break,
            }
        }

        warn!("Authentication did not yield a session");
        Err(SessionFailure::Failed)
    }
}

/// Client for one PCast session
pub struct SessionClient {
    inner: Arc<ClientInner>,
}

impl SessionClient {
    pub fn new(config: ClientConfig) -> Self {
        let resolver = EndpointResolver::new(config.resolver.clone());
        Self::with_resolver(config, resolver)
    }

    /// Create a client that resolves endpoints with a custom resolver
    pub fn with_resolver(config: ClientConfig, resolver: EndpointResolver) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (status, _) = watch::channel(SessionStatus::Offline);

        let inner = Arc::new(ClientInner {
            connection: TransportConnection::new(config.transport.clone()),
            config,
            resolver,
            session: Mutex::new(Session::default()),
            streams: Mutex::new(StreamRegistry::default()),
            subscriptions: Mutex::new(Vec::new()),
            events,
            status,
        });

        let subscriptions = vec![
            listen(&inner, EventKind::Disconnected, |inner, event| {
                if let TransportEvent::Disconnected { reason, .. } = event {
                    inner.on_transport_lost(reason);
                }
            }),
            listen(&inner, EventKind::Message(MessageType::AuthenticationEvent), |inner, event| {
                if let TransportEvent::Message(Message::AuthenticationEvent(event)) = event {
                    inner.on_authentication_event(event);
                }
            }),
            listen(&inner, EventKind::Message(MessageType::StreamEnded), |inner, event| {
                if let TransportEvent::Message(Message::StreamEnded(event)) = event {
                    inner.on_stream_ended(event);
                }
            }),
            listen(&inner, EventKind::Message(MessageType::StreamDataQuality), |inner, event| {
                if let TransportEvent::Message(Message::StreamDataQuality(event)) = event {
                    inner.on_data_quality(event);
                }
            }),
            listen(&inner, EventKind::Message(MessageType::RoomEvent), |inner, event| {
                if let TransportEvent::Message(Message::RoomEvent(event)) = event {
                    inner.emit(SessionEvent::Room(event.clone()));
                }
            }),
        ];
        *inner.subscriptions.lock() = subscriptions;

        Self { inner }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn status(&self) -> SessionStatus {
        *self.inner.status.borrow()
    }

    /// Watch status changes
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status.subscribe()
    }

    /// Session id assigned by the server; kept while offline for reconnection
    pub fn session_id(&self) -> Option<SessionId> {
        self.inner.session.lock().session_id.clone()
    }

    /// Receive session and stream events
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Number of streams that have not ended yet
    pub fn active_streams(&self) -> usize {
        self.inner.streams.lock().entries.len()
    }

    /// Connect and authenticate.
    ///
    /// Failures leave the session `Offline` with a [`SessionFailure`]
    /// reason; nothing is retried automatically.
    pub async fn start(&self, authentication_token: &str) -> Result<SessionId, SessionError> {
        invalid(authentication_token.trim().is_empty(), "authentication token is empty")?;

        let (generation, previous_session_id) = {
            let mut session = self.inner.session.lock();
            if session.status != SessionStatus::Offline || session.stopping {
                return Err(SessionError::AlreadyStarted);
            }
            session.status = SessionStatus::Connecting;
            session.generation += 1;
            (session.generation, session.session_id.clone())
        };
        self.inner.set_status(SessionStatus::Connecting);
        info!("Starting session");

        let result = self
            .inner
            .establish(authentication_token, previous_session_id)
            .await;

        let mut session = self.inner.session.lock();
        if session.generation != generation {
            let abandoned = session.status == SessionStatus::Offline && !session.stopping;
            drop(session);
            if abandoned {
                self.inner.connection.disconnect();
            }
            debug!("Session stopped while starting");
            return Err(SessionError::Cancelled);
        }

        match result {
            Ok(session_id) => {
                session.status = SessionStatus::Online;
                session.session_id = Some(session_id.clone());
                drop(session);

                info!("Session {} online", session_id);
                self.inner.set_status(SessionStatus::Online);
                self.inner.emit(SessionEvent::Online {
                    session_id: session_id.clone(),
                });
                Ok(session_id)
            }
            Err(failure) => {
                session.status = SessionStatus::Offline;
                drop(session);

                self.inner.connection.disconnect();
                self.inner.set_status(SessionStatus::Offline);
                self.inner.emit(SessionEvent::Offline { reason: failure });
                Err(SessionError::StartFailed(failure))
            }
        }
    }

    /// Tear the session down.
    ///
    /// Every live stream is destroyed and `pcast.Bye` is sent, both best
    /// effort; the connection is always closed. Calling this again, or on
    /// an offline session, does nothing.
    pub async fn stop(&self) {
        let (was_online, session_id) = {
            let mut session = self.inner.session.lock();
            if session.status == SessionStatus::Offline || session.stopping {
                return;
            }
            session.stopping = true;
            session.generation += 1;
            (session.status == SessionStatus::Online, session.session_id.clone())
        };
        info!("Stopping session");

        let inner = &self.inner;
        let _teardown = scopeguard::guard((), |_| {
            inner.connection.disconnect();
            {
                let mut session = inner.session.lock();
                session.status = SessionStatus::Offline;
                session.stopping = false;
            }
            inner.set_status(SessionStatus::Offline);
            inner.emit(SessionEvent::Stopped);
            info!("Session stopped");
        });

        let acks: Vec<_> = inner
            .streams
            .lock()
            .entries
            .values()
            .filter_map(|entry| {
                let (command, ack) = Command::with_ack(StreamInput::Stop {
                    reason: EndReason::Ended,
                });
                entry.commands.send(command).ok().map(|_| ack)
            })
            .collect();
        debug!("Stopping {} stream(s)", acks.len());
        join_all(acks).await;

        if let (true, Some(session_id)) = (was_online, session_id) {
            let bye = Bye {
                session_id,
                reason: BYE_REASON.to_string(),
            };
            if let Err(e) = inner.connection.request(bye).await {
                debug!("Bye not acknowledged: {}", e);
            }
        }
    }

    /// Publish local media
    pub async fn publish(
        &self,
        stream_token: &str,
        options: StreamOptions,
        media: Arc<dyn MediaTransport>,
    ) -> Result<StreamHandle, StreamError> {
        self.open_stream(StreamDirection::Upload, stream_token, options, media)
            .await
    }

    /// Subscribe to a remote stream
    pub async fn subscribe(
        &self,
        stream_token: &str,
        options: StreamOptions,
        media: Arc<dyn MediaTransport>,
    ) -> Result<StreamHandle, StreamError> {
        self.open_stream(StreamDirection::Download, stream_token, options, media)
            .await
    }

    async fn open_stream(
        &self,
        direction: StreamDirection,
        stream_token: &str,
        options: StreamOptions,
        media: Arc<dyn MediaTransport>,
    ) -> Result<StreamHandle, StreamError> {
        let mut handle = StreamDriver::spawn(&self.inner, direction, stream_token, options, media)?;

        let status = handle.settled().await.ok_or(StreamError::DriverGone)?;
        match status.state {
            StreamState::Active => Ok(handle),
            state => Err(StreamError::Terminated {
                state,
                reason: status.reason.unwrap_or(EndReason::Failed),
            }),
        }
    }

    /// Send `pcast.SetupStream`
    pub async fn setup_stream(
        &self,
        stream_token: &str,
        direction: StreamDirection,
        options: &StreamOptions,
    ) -> Result<SetupStreamResponse, SessionError> {
        let pending = self
            .inner
            .begin_setup_stream(stream_token, direction, options, None)?;
        Ok(pending.response_as().await?)
    }

    /// Send `pcast.SetAnswer`
    pub async fn set_answer(
        &self,
        stream_id: &str,
        answer: SessionDescription,
    ) -> Result<SetAnswerResponse, SessionError> {
        let pending = self.inner.begin_set_answer(stream_id, answer)?;
        Ok(pending.response_as().await?)
    }

    /// Send `pcast.AddIceCandidates`
    pub async fn add_ice_candidates(
        &self,
        stream_id: &str,
        candidates: Vec<IceCandidate>,
        options: Vec<String>,
    ) -> Result<AddIceCandidatesResponse, SessionError> {
        let pending = self
            .inner
            .begin_add_ice_candidates(stream_id, candidates, options)?;
        Ok(pending.response_as().await?)
    }

    /// Send `pcast.UpdateStreamState`
    pub async fn update_stream_state(
        &self,
        stream_id: &str,
        signaling_state: &str,
        ice_state: &str,
        connection_state: &str,
    ) -> Result<UpdateStreamStateResponse, SessionError> {
        let pending = self.inner.begin_update_stream_state(
            stream_id,
            signaling_state,
            ice_state,
            connection_state,
        )?;
        Ok(pending.response_as().await?)
    }

    /// Send `pcast.DestroyStream`
    pub async fn destroy_stream(
        &self,
        stream_id: &str,
        reason: &str,
    ) -> Result<DestroyStreamResponse, SessionError> {
        self.inner.destroy_stream(stream_id, reason).await
    }
}

/// Register a connection listener that reaches the client without keeping it alive
fn listen<F>(inner: &Arc<ClientInner>, kind: EventKind, handler: F) -> Subscription
where
    F: Fn(&ClientInner, &TransportEvent) + Send + Sync + 'static,
{
    let weak = Arc::downgrade(inner);
    inner.connection.on(kind, move |event| {
        if let Some(inner) = weak.upgrade() {
            handler(&inner, event);
        }
    })
}
