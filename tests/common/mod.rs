//! Shared helpers for integration tests
//!
//! `ScriptedServer` speaks the PCast envelope protocol over a real
//! WebSocket and answers requests from a script; `MockMedia` stands in for
//! the media transport.

#![allow(dead_code)]

use std::net::TcpListener as StdTcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use pcast::config::ClientConfig;
use pcast::media::{IceGatheringEvent, LogicalState, MediaError, MediaTransport, TransportStats};
use pcast::network::TransportConfig;
use pcast::protocol::{
    AddIceCandidatesResponse, AuthenticateResponse, ByeResponse, DestroyStreamResponse, Envelope,
    IceCandidate, Message, MessageType, Pong, SessionDescription, SetAnswerResponse,
    SetupStreamResponse, UpdateStreamStateResponse, STATUS_OK,
};

/// Find an available port for testing
pub fn find_available_port() -> u16 {
    StdTcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to ephemeral port")
        .local_addr()
        .expect("Failed to get local address")
        .port()
}

/// Poll `condition` until it holds, panicking after five seconds
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("Timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Client config pointing at a single endpoint, with keepalive disabled
pub fn client_config(endpoint: &str) -> ClientConfig {
    ClientConfig {
        endpoints: vec![endpoint.to_string()],
        transport: TransportConfig {
            connect_timeout_ms: 2_000,
            request_timeout_ms: 2_000,
            keepalive_interval_ms: 0,
        },
        ..Default::default()
    }
}

/// How the server answers one request
pub enum Reply {
    Ok(Message),
    /// Response followed by events, written in one flush
    OkThen(Message, Vec<Message>),
    /// Error status with no payload
    Status(String),
    /// Never answer
    Silent,
}

/// Standard server behavior, with knobs for the failure cases
#[derive(Clone)]
pub struct Script {
    pub session_id: String,
    /// Reject `pcast.Authenticate` with this status
    pub authenticate_status: Option<String>,
    /// Offer returned by `pcast.SetupStream`
    pub offer: Option<SessionDescription>,
    pub setup_options: Vec<String>,
    /// Reject `pcast.SetupStream` with this status
    pub setup_status: Option<String>,
    pub ice_options: Vec<String>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            session_id: "session-1".to_string(),
            authenticate_status: None,
            offer: Some(SessionDescription::offer("v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\n")),
            setup_options: Vec::new(),
            setup_status: None,
            ice_options: Vec::new(),
        }
    }
}

impl Script {
    pub fn reply(&self, message: &Message, streams: &AtomicUsize) -> Reply {
        match message {
            Message::Authenticate(_) => match &self.authenticate_status {
                Some(status) => Reply::Status(status.clone()),
                None => Reply::Ok(
                    AuthenticateResponse {
                        session_id: Some(self.session_id.clone()),
                        redirect: None,
                    }
                    .into(),
                ),
            },
            Message::SetupStream(_) => match &self.setup_status {
                Some(status) => Reply::Status(status.clone()),
                None => {
                    let n = streams.fetch_add(1, Ordering::SeqCst) + 1;
                    Reply::Ok(
                        SetupStreamResponse {
                            stream_id: format!("stream-{}", n),
                            offer: self.offer.clone(),
                            options: self.setup_options.clone(),
                        }
                        .into(),
                    )
                }
            },
            Message::SetAnswer(_) => Reply::Ok(SetAnswerResponse::default().into()),
            Message::AddIceCandidates(_) => Reply::Ok(
                AddIceCandidatesResponse {
                    options: self.ice_options.clone(),
                }
                .into(),
            ),
            Message::UpdateStreamState(_) => Reply::Ok(UpdateStreamStateResponse::default().into()),
            Message::DestroyStream(request) => Reply::Ok(
                DestroyStreamResponse {
                    stream_id: request.stream_id.clone(),
                }
                .into(),
            ),
            Message::Bye(_) => Reply::Ok(ByeResponse::default().into()),
            Message::Ping(ping) => Reply::Ok(
                Pong {
                    sent_at_ms: ping.sent_at_ms,
                }
                .into(),
            ),
            _ => Reply::Silent,
        }
    }
}

/// Response schema paired with a request schema
fn response_type(request: MessageType) -> MessageType {
    match request {
        MessageType::Authenticate => MessageType::AuthenticateResponse,
        MessageType::Bye => MessageType::ByeResponse,
        MessageType::SetupStream => MessageType::SetupStreamResponse,
        MessageType::SetAnswer => MessageType::SetAnswerResponse,
        MessageType::AddIceCandidates => MessageType::AddIceCandidatesResponse,
        MessageType::UpdateStreamState => MessageType::UpdateStreamStateResponse,
        MessageType::DestroyStream => MessageType::DestroyStreamResponse,
        MessageType::Ping => MessageType::Pong,
        other => other,
    }
}

#[derive(Debug, Clone)]
enum Control {
    Push(Message),
    Close,
}

type Responder = Arc<dyn Fn(&Message) -> Reply + Send + Sync>;

struct State {
    responder: Responder,
    requests: Mutex<Vec<Message>>,
    connections: AtomicUsize,
    client_closes: AtomicUsize,
}

/// A PCast signaling server driven by a script
pub struct ScriptedServer {
    url: String,
    state: Arc<State>,
    control: broadcast::Sender<Control>,
    task: JoinHandle<()>,
}

impl ScriptedServer {
    pub async fn start(script: Script) -> Self {
        let streams = AtomicUsize::new(0);
        Self::start_with(move |message| script.reply(message, &streams)).await
    }

    pub async fn start_with<F>(responder: F) -> Self
    where
        F: Fn(&Message) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind scripted server");
        let port = listener.local_addr().expect("No local address").port();

        let state = Arc::new(State {
            responder: Arc::new(responder),
            requests: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            client_closes: AtomicUsize::new(0),
        });
        let (control, _) = broadcast::channel(64);

        let accept_state = state.clone();
        let accept_control = control.clone();
        let task = tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let state = accept_state.clone();
                let control = accept_control.subscribe();
                tokio::spawn(serve(tcp, state, control));
            }
        });

        Self {
            url: format!("ws://127.0.0.1:{}", port),
            state,
            control,
            task,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Every request received so far, in arrival order
    pub fn requests(&self) -> Vec<Message> {
        self.state.requests.lock().clone()
    }

    pub fn requests_of(&self, message_type: MessageType) -> Vec<Message> {
        self.requests()
            .into_iter()
            .filter(|m| m.message_type() == message_type)
            .collect()
    }

    pub fn count(&self, message_type: MessageType) -> usize {
        self.requests_of(message_type).len()
    }

    /// Completed WebSocket handshakes
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Connections the client closed
    pub fn client_closes(&self) -> usize {
        self.state.client_closes.load(Ordering::SeqCst)
    }

    /// Push an unsolicited event to every open connection
    pub fn push(&self, message: impl Into<Message>) {
        let _ = self.control.send(Control::Push(message.into()));
    }

    /// Close every open connection from the server side
    pub fn close_connections(&self) {
        let _ = self.control.send(Control::Close);
    }
}

impl Drop for ScriptedServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(tcp: TcpStream, state: Arc<State>, mut control: broadcast::Receiver<Control>) {
    // Latency probes open a bare TCP connection and hang up
    let Ok(ws) = tokio_tungstenite::accept_async(tcp).await else {
        return;
    };
    state.connections.fetch_add(1, Ordering::SeqCst);

    let (mut write, mut read) = ws.split();
    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(WsMessage::Binary(data))) => {
                    let frames = handle_request(&state, &data);
                    if frames.is_empty() {
                        continue;
                    }
                    let mut failed = false;
                    for frame in frames {
                        failed |= write.feed(WsMessage::Binary(frame)).await.is_err();
                    }
                    if failed || write.flush().await.is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => {
                    state.client_closes.fetch_add(1, Ordering::SeqCst);
                    break;
                }
                Some(Ok(_)) => {}
            },
            control = control.recv() => match control {
                Ok(Control::Push(message)) => {
                    let Ok(frame) = Envelope::event(&message).and_then(|e| e.to_bytes()) else {
                        continue;
                    };
                    if write.send(WsMessage::Binary(frame)).await.is_err() {
                        break;
                    }
                }
                Ok(Control::Close) => {
                    let _ = write
                        .send(WsMessage::Close(Some(CloseFrame {
                            code: CloseCode::Away,
                            reason: "server going away".into(),
                        })))
                        .await;
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

fn handle_request(state: &State, data: &[u8]) -> Vec<Vec<u8>> {
    let Ok(envelope) = Envelope::from_bytes(data) else {
        return Vec::new();
    };
    let (Some(request_id), Ok(message)) = (envelope.request_id, envelope.decode_message()) else {
        return Vec::new();
    };
    state.requests.lock().push(message.clone());

    let (response, events) = match (state.responder)(&message) {
        Reply::Ok(response) => (Envelope::response(request_id, STATUS_OK, &response), Vec::new()),
        Reply::OkThen(response, events) => (Envelope::response(request_id, STATUS_OK, &response), events),
        Reply::Status(status) => (
            Ok(Envelope::failure(request_id, response_type(message.message_type()), &status)),
            Vec::new(),
        ),
        Reply::Silent => return Vec::new(),
    };

    std::iter::once(response)
        .chain(events.iter().map(Envelope::event))
        .filter_map(|envelope| envelope.and_then(|e| e.to_bytes()).ok())
        .collect()
}

/// Media transport double with scripted answers and health
pub struct MockMedia {
    candidates: Vec<IceCandidate>,
    state: Mutex<LogicalState>,
    fail_answer: bool,
    /// Never finish negotiating
    stall: bool,
    answers: AtomicUsize,
    releases: AtomicUsize,
    manifests: Mutex<Vec<String>>,
}

impl MockMedia {
    pub fn new() -> Arc<Self> {
        Self::build(Vec::new(), false, false)
    }

    /// Gathers `count` host candidates
    pub fn with_candidates(count: usize) -> Arc<Self> {
        let candidates = (0..count)
            .map(|i| IceCandidate {
                candidate: format!("candidate:{} 1 udp 2122260223 192.0.2.1 {} typ host", i, 50000 + i),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            })
            .collect();
        Self::build(candidates, false, false)
    }

    /// Cannot produce an answer
    pub fn failing() -> Arc<Self> {
        Self::build(Vec::new(), true, false)
    }

    /// Never produces an answer or starts manifest playback
    pub fn stalled() -> Arc<Self> {
        Self::build(Vec::new(), false, true)
    }

    fn build(candidates: Vec<IceCandidate>, fail_answer: bool, stall: bool) -> Arc<Self> {
        Arc::new(Self {
            candidates,
            state: Mutex::new(LogicalState::Connected),
            fail_answer,
            stall,
            answers: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            manifests: Mutex::new(Vec::new()),
        })
    }

    pub fn set_state(&self, state: LogicalState) {
        *self.state.lock() = state;
    }

    pub fn answers(&self) -> usize {
        self.answers.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn manifests(&self) -> Vec<String> {
        self.manifests.lock().clone()
    }
}

#[async_trait]
impl MediaTransport for MockMedia {
    async fn create_answer(&self, _offer: &SessionDescription) -> Result<SessionDescription, MediaError> {
        if self.stall {
            std::future::pending::<()>().await;
        }
        if self.fail_answer {
            return Err(MediaError::Negotiation("no codecs in common".to_string()));
        }
        self.answers.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::answer("v=0\r\no=- 2 1 IN IP4 0.0.0.0\r\n"))
    }

    fn ice_candidates(&self) -> BoxStream<'static, IceGatheringEvent> {
        let events: Vec<_> = self
            .candidates
            .iter()
            .cloned()
            .map(IceGatheringEvent::Candidate)
            .chain(std::iter::once(IceGatheringEvent::Completed))
            .collect();
        stream::iter(events).boxed()
    }

    async fn stats(&self) -> Result<TransportStats, MediaError> {
        Ok(TransportStats {
            state: *self.state.lock(),
            kinds: Vec::new(),
        })
    }

    async fn attach_manifest(&self, uri: &str) -> Result<(), MediaError> {
        self.manifests.lock().push(uri.to_string());
        if self.stall {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}
