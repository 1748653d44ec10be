//! Per-stream driver task
//!
//! Each stream runs as one task that owns its [`StreamMachine`]. Inputs
//! arrive over a command channel: from the application, from server events
//! routed by the session client, and from the short-lived tasks the driver
//! spawns for media and signaling work. Because one task applies every
//! input in order, a stream can never end twice.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::media::{IceGatheringEvent, MediaTransport};
use crate::network::{NetworkError, ResponseHook};
use crate::protocol::{
    AddIceCandidatesResponse, DestroyStreamResponse, EndReason, IceCandidate, Message, SetAnswerResponse,
    SetupStreamResponse, StreamDirection, StreamFlags, StreamId,
};

use super::client::{ClientInner, SessionEvent};
use super::error::SessionError;
use super::monitor::{Acknowledge, HealthMonitor, MonitorConfig};
use super::stream::{Effect, StreamEventKind, StreamInput, StreamMachine, StreamState};

const ICE_BATCH_SIZE: usize = 16;

/// Options for publishing or subscribing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamOptions {
    /// Opaque labels echoed on every event for the stream
    pub tags: Vec<String>,
    /// Capability strings passed to the server with the setup request
    pub capabilities: Vec<String>,
}

/// Stream negotiation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Time the media transport gets to produce an answer or start
    /// manifest playback before the stream fails
    pub negotiation_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout_ms: 15_000,
        }
    }
}

impl StreamConfig {
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }
}

/// Snapshot of a stream's progress
#[derive(Debug, Clone, PartialEq)]
pub struct StreamStatus {
    pub state: StreamState,
    pub stream_id: Option<StreamId>,
    pub reason: Option<EndReason>,
}

/// Stream notification published on the session event channel
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub stream_id: Option<StreamId>,
    pub direction: StreamDirection,
    pub tags: Vec<String>,
    pub kind: StreamEventKind,
}

pub(crate) struct Command {
    input: StreamInput,
    ack: Option<oneshot::Sender<()>>,
}

impl Command {
    pub(crate) fn new(input: StreamInput) -> Self {
        Self { input, ack: None }
    }

    /// The ack fires once every effect of the input has been carried out
    pub(crate) fn with_ack(input: StreamInput) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                input,
                ack: Some(tx),
            },
            rx,
        )
    }
}

/// Application handle to a published or subscribed stream
pub struct StreamHandle {
    direction: StreamDirection,
    tags: Vec<String>,
    status: watch::Receiver<StreamStatus>,
    commands: mpsc::UnboundedSender<Command>,
}

impl StreamHandle {
    pub fn direction(&self) -> StreamDirection {
        self.direction
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn status(&self) -> StreamStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> StreamState {
        self.status.borrow().state
    }

    pub fn stream_id(&self) -> Option<StreamId> {
        self.status.borrow().stream_id.clone()
    }

    /// Watch status changes
    pub fn watch(&self) -> watch::Receiver<StreamStatus> {
        self.status.clone()
    }

    /// Stop the stream and wait for teardown to finish.
    ///
    /// Stopping an ended stream does nothing.
    pub async fn stop(&self) {
        let (command, ack) = Command::with_ack(StreamInput::Stop {
            reason: EndReason::Ended,
        });
        if self.commands.send(command).is_ok() {
            let _ = ack.await;
        }
    }

    /// Wait until the stream is active or has ended
    pub(crate) async fn settled(&mut self) -> Option<StreamStatus> {
        self.status
            .wait_for(|status| status.state == StreamState::Active || status.state.is_terminal())
            .await
            .ok()
            .map(|status| status.clone())
    }
}

/// Map a request failure to the reason a stream ends with
fn end_reason(error: &NetworkError) -> EndReason {
    match error {
        NetworkError::Status { status, .. } => EndReason::from_wire(status),
        _ => EndReason::Failed,
    }
}

pub(crate) struct StreamDriver {
    key: u64,
    client: Weak<ClientInner>,
    machine: StreamMachine,
    media: Arc<dyn MediaTransport>,
    tags: Vec<String>,
    monitor_config: MonitorConfig,
    negotiation_timeout: Duration,
    commands: mpsc::WeakUnboundedSender<Command>,
    status: watch::Sender<StreamStatus>,
    follow_ups: VecDeque<StreamInput>,
    ice_task: Option<JoinHandle<()>>,
    monitor_task: Option<JoinHandle<()>>,
}

impl StreamDriver {
    /// Send the setup request and start a driver for the stream it creates
    pub(crate) fn spawn(
        client: &Arc<ClientInner>,
        direction: StreamDirection,
        stream_token: &str,
        options: StreamOptions,
        media: Arc<dyn MediaTransport>,
    ) -> Result<StreamHandle, SessionError> {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(StreamStatus {
            state: StreamState::Created,
            stream_id: None,
            reason: None,
        });

        let key = client.register_stream(commands_tx.clone());

        // The stream id must be routable before the reader moves on, or a
        // StreamEnded right behind the setup response would find no stream
        let on_setup: ResponseHook = {
            let client = Arc::downgrade(client);
            let commands = commands_tx.downgrade();
            Box::new(move |message| {
                let Message::SetupStreamResponse(response) = message else {
                    return;
                };
                if let Some(client) = client.upgrade() {
                    client.assign_stream_id(key, &response.stream_id);
                }
                if let Some(tx) = commands.upgrade() {
                    let _ = tx.send(Command::new(StreamInput::SetupSucceeded {
                        stream_id: response.stream_id.clone(),
                        offer: response.offer.clone(),
                        flags: StreamFlags::from_options(&response.options),
                    }));
                }
            })
        };

        let setup = match client.begin_setup_stream(stream_token, direction, &options, Some(on_setup)) {
            Ok(setup) => setup,
            Err(e) => {
                client.unregister_stream(key);
                return Err(e);
            }
        };

        // A successful response has already been delivered by the hook
        let setup_tx = commands_tx.downgrade();
        tokio::spawn(async move {
            if let Err(e) = setup.response_as::<SetupStreamResponse>().await {
                warn!("Stream setup failed: {}", e);
                if let Some(tx) = setup_tx.upgrade() {
                    let _ = tx.send(Command::new(StreamInput::SetupFailed {
                        reason: end_reason(&e),
                    }));
                }
            }
        });

        let driver = StreamDriver {
            key,
            client: Arc::downgrade(client),
            machine: StreamMachine::new(direction),
            media,
            tags: options.tags.clone(),
            monitor_config: client.config().monitor.clone(),
            negotiation_timeout: client.config().stream.negotiation_timeout(),
            commands: commands_tx.downgrade(),
            status: status_tx,
            follow_ups: VecDeque::new(),
            ice_task: None,
            monitor_task: None,
        };
        tokio::spawn(driver.run(commands_rx));

        Ok(StreamHandle {
            direction,
            tags: options.tags,
            status: status_rx,
            commands: commands_tx,
        })
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(Command { input, ack }) = commands.recv().await {
            self.handle(input).await;
            if let Some(ack) = ack {
                let _ = ack.send(());
            }
        }

        self.abort_background();
        if !self.machine.state().is_terminal() {
            // Every sender is gone, nobody can stop this stream any more
            debug!("Stream driver abandoned while {:?}", self.machine.state());
            self.media.release().await;
        }
        trace!("Stream driver {} finished", self.key);
    }

    async fn handle(&mut self, input: StreamInput) {
        self.follow_ups.push_back(input);

        while let Some(input) = self.follow_ups.pop_front() {
            let transition = match self.machine.apply(input) {
                Ok(transition) => transition,
                Err(e) => {
                    debug!("{}", e);
                    continue;
                }
            };

            for effect in transition.effects {
                self.execute(effect).await;
            }

            self.status.send_replace(StreamStatus {
                state: self.machine.state(),
                stream_id: self.machine.stream_id().cloned(),
                reason: self.machine.reason().cloned(),
            });

            if transition.next.is_terminal() {
                if let Some(client) = self.client.upgrade() {
                    client.unregister_stream(self.key);
                }
            }
        }
    }

    async fn execute(&mut self, effect: Effect) {
        trace!("Stream {}: {:?}", self.key, effect);

        match effect {
            Effect::CreateAnswer(offer) => {
                let media = self.media.clone();
                let limit = self.negotiation_timeout;
                self.spawn_step(async move {
                    match timeout(limit, media.create_answer(&offer)).await {
                        Ok(Ok(answer)) => StreamInput::AnswerCreated { answer },
                        Ok(Err(e)) => {
                            warn!("Failed to create answer: {}", e);
                            StreamInput::NegotiationFailed {
                                reason: EndReason::Failed,
                            }
                        }
                        Err(_) => {
                            warn!("No answer from media transport after {:?}", limit);
                            StreamInput::NegotiationFailed {
                                reason: EndReason::Failed,
                            }
                        }
                    }
                });
            }

            Effect::SendAnswer(answer) => {
                let pending = match (self.client.upgrade(), self.machine.stream_id()) {
                    (Some(client), Some(stream_id)) => client.begin_set_answer(stream_id, answer),
                    _ => Err(NetworkError::NotConnected.into()),
                };
                match pending {
                    Ok(pending) => self.spawn_step(async move {
                        match pending.response_as::<SetAnswerResponse>().await {
                            Ok(response) => StreamInput::Committed {
                                flags: StreamFlags::from_options(&response.options),
                            },
                            Err(e) => {
                                warn!("Answer rejected: {}", e);
                                StreamInput::NegotiationFailed {
                                    reason: end_reason(&e),
                                }
                            }
                        }
                    }),
                    Err(e) => {
                        warn!("Failed to send answer: {}", e);
                        self.follow_ups.push_back(StreamInput::NegotiationFailed {
                            reason: EndReason::Failed,
                        });
                    }
                }
            }

            Effect::AttachManifest(uri) => {
                let media = self.media.clone();
                let limit = self.negotiation_timeout;
                self.spawn_step(async move {
                    match timeout(limit, media.attach_manifest(&uri)).await {
                        Ok(Ok(())) => StreamInput::Committed {
                            flags: StreamFlags::default(),
                        },
                        Ok(Err(e)) => {
                            warn!("Manifest playback of {} failed: {}", uri, e);
                            StreamInput::NegotiationFailed {
                                reason: EndReason::StreamingNotAvailable,
                            }
                        }
                        Err(_) => {
                            warn!("Manifest playback of {} did not start after {:?}", uri, limit);
                            StreamInput::NegotiationFailed {
                                reason: EndReason::Failed,
                            }
                        }
                    }
                });
            }

            Effect::StartIceForwarding => self.start_ice_forwarding(),

            Effect::StopIceForwarding => {
                if let Some(task) = self.ice_task.take() {
                    task.abort();
                }
            }

            Effect::SendIceCandidates {
                candidates,
                completed,
            } => self.send_ice_candidates(candidates, completed),

            Effect::StartMonitor => self.start_monitor(),

            Effect::StopMonitor => {
                if let Some(task) = self.monitor_task.take() {
                    task.abort();
                }
            }

            Effect::DestroyRemote { stream_id, reason } => self.destroy_remote(stream_id, reason),

            Effect::ReleaseMedia => self.media.release().await,

            Effect::Notify(kind) => {
                match &kind {
                    StreamEventKind::Started => info!(
                        "Stream {} active",
                        self.machine.stream_id().map(String::as_str).unwrap_or("-")
                    ),
                    StreamEventKind::Ended { state, reason } => info!(
                        "Stream {} {:?}: {}",
                        self.machine.stream_id().map(String::as_str).unwrap_or("-"),
                        state,
                        reason
                    ),
                    StreamEventKind::DataQuality { .. } => {}
                }

                if let Some(client) = self.client.upgrade() {
                    client.emit(SessionEvent::Stream(StreamEvent {
                        stream_id: self.machine.stream_id().cloned(),
                        direction: self.machine.direction(),
                        tags: self.tags.clone(),
                        kind,
                    }));
                }
            }
        }
    }

    /// Run one piece of async work and feed its outcome back as an input
    fn spawn_step<F>(&self, step: F)
    where
        F: Future<Output = StreamInput> + Send + 'static,
    {
        let Some(commands) = self.commands.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let input = step.await;
            let _ = commands.send(Command::new(input));
        });
    }

    fn start_ice_forwarding(&mut self) {
        let candidates = self.media.ice_candidates();
        let commands = self.commands.clone();

        self.ice_task = Some(tokio::spawn(async move {
            let post = |input: StreamInput| match commands.upgrade() {
                Some(tx) => tx.send(Command::new(input)).is_ok(),
                None => false,
            };

            let mut batches = candidates.ready_chunks(ICE_BATCH_SIZE);
            while let Some(batch) = batches.next().await {
                let mut list = Vec::with_capacity(batch.len());
                let mut completed = false;
                for event in batch {
                    match event {
                        IceGatheringEvent::Candidate(candidate) => list.push(candidate),
                        IceGatheringEvent::Completed => completed = true,
                    }
                }

                if !list.is_empty()
                    && !post(StreamInput::IceGathered {
                        candidates: list,
                        completed: false,
                    })
                {
                    return;
                }
                if completed {
                    break;
                }
            }

            post(StreamInput::IceGathered {
                candidates: Vec::new(),
                completed: true,
            });
        }));
    }

    fn send_ice_candidates(&mut self, candidates: Vec<IceCandidate>, completed: bool) {
        let (Some(client), Some(stream_id)) = (self.client.upgrade(), self.machine.stream_id()) else {
            return;
        };
        let options = StreamFlags {
            completed,
            ..Default::default()
        }
        .to_options();

        // Sent in order here; only the response is awaited in the background
        let pending = match client.begin_add_ice_candidates(stream_id, candidates, options) {
            Ok(pending) => pending,
            Err(e) => {
                warn!("Failed to send ICE candidates: {}", e);
                return;
            }
        };

        let commands = self.commands.clone();
        tokio::spawn(async move {
            match pending.response_as::<AddIceCandidatesResponse>().await {
                Ok(response) => {
                    if StreamFlags::from_options(&response.options).cancel {
                        if let Some(tx) = commands.upgrade() {
                            let _ = tx.send(Command::new(StreamInput::IceCancelled));
                        }
                    }
                }
                Err(e) => debug!("ICE candidates not accepted: {}", e),
            }
        });
    }

    fn destroy_remote(&self, stream_id: StreamId, reason: EndReason) {
        let Some(client) = self.client.upgrade() else {
            return;
        };

        // Sent here; the response must not hold up later inputs
        let pending = match client.begin_destroy_stream(&stream_id, reason.as_str()) {
            Ok(pending) => pending,
            Err(e) => {
                warn!("Failed to destroy stream {}: {}", stream_id, e);
                return;
            }
        };

        tokio::spawn(async move {
            match pending.response_as::<DestroyStreamResponse>().await {
                Ok(_) => debug!("Destroyed stream {} ({})", stream_id, reason),
                Err(e) => warn!("Failed to destroy stream {}: {}", stream_id, e),
            }
        });
    }

    fn start_monitor(&mut self) {
        let monitor = HealthMonitor::new(
            self.monitor_config.clone(),
            self.machine.direction(),
            self.media.clone(),
        );
        let status = self.status.subscribe();
        let commands = self.commands.clone();

        self.monitor_task = Some(tokio::spawn(async move {
            monitor
                .run(
                    move || status.borrow().state == StreamState::Active,
                    move |_report| {
                        if let Some(tx) = commands.upgrade() {
                            let _ = tx.send(Command::new(StreamInput::MonitorFailure));
                        }
                        Acknowledge::Stop
                    },
                )
                .await;
        }));
    }

    fn abort_background(&mut self) {
        for task in [self.ice_task.take(), self.monitor_task.take()].into_iter().flatten() {
            task.abort();
        }
    }
}
