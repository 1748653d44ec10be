//! Stream session state machine
//!
//! The machine is a plain transition function: it takes an input, updates
//! its own bookkeeping and returns the effects the driver must carry out.
//! It never performs I/O, so every path through publish, subscribe and
//! teardown can be exercised without a server.

use thiserror::Error;

use crate::protocol::{
    DataQualityStatus, EndReason, IceCandidate, SessionDescription, StreamDirection, StreamFlags,
    StreamId,
};

/// Lifecycle of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    /// Setup request sent, no stream id yet
    Created,
    /// Offer received, answer or manifest playback in progress
    Negotiating,
    /// Local description committed, media flowing
    Active,
    /// Stopped locally or ended by the server
    Ended,
    Failed,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamState::Ended | StreamState::Failed)
    }
}

/// Something that happened to a stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamInput {
    SetupSucceeded {
        stream_id: StreamId,
        offer: Option<SessionDescription>,
        flags: StreamFlags,
    },
    SetupFailed {
        reason: EndReason,
    },
    /// The media transport produced the local answer
    AnswerCreated {
        answer: SessionDescription,
    },
    /// The server accepted the answer, or manifest playback started
    Committed {
        flags: StreamFlags,
    },
    NegotiationFailed {
        reason: EndReason,
    },
    IceGathered {
        candidates: Vec<IceCandidate>,
        completed: bool,
    },
    /// The server no longer wants candidates
    IceCancelled,
    DataQuality {
        status: DataQualityStatus,
        reason: String,
    },
    Stop {
        reason: EndReason,
    },
    /// The server pushed `pcast.StreamEnded`
    ServerEnded {
        reason: EndReason,
    },
    /// The health monitor gave up on the media transport
    MonitorFailure,
    /// The signaling connection dropped
    TransportLost,
}

impl StreamInput {
    pub fn name(&self) -> &'static str {
        match self {
            StreamInput::SetupSucceeded { .. } => "SetupSucceeded",
            StreamInput::SetupFailed { .. } => "SetupFailed",
            StreamInput::AnswerCreated { .. } => "AnswerCreated",
            StreamInput::Committed { .. } => "Committed",
            StreamInput::NegotiationFailed { .. } => "NegotiationFailed",
            StreamInput::IceGathered { .. } => "IceGathered",
            StreamInput::IceCancelled => "IceCancelled",
            StreamInput::DataQuality { .. } => "DataQuality",
            StreamInput::Stop { .. } => "Stop",
            StreamInput::ServerEnded { .. } => "ServerEnded",
            StreamInput::MonitorFailure => "MonitorFailure",
            StreamInput::TransportLost => "TransportLost",
        }
    }
}

/// What a stream tells the application
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEventKind {
    Started,
    DataQuality {
        status: DataQualityStatus,
        reason: String,
    },
    Ended {
        state: StreamState,
        reason: EndReason,
    },
}

/// Work the driver performs after a transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    CreateAnswer(SessionDescription),
    SendAnswer(SessionDescription),
    AttachManifest(String),
    StartIceForwarding,
    StopIceForwarding,
    SendIceCandidates {
        candidates: Vec<IceCandidate>,
        completed: bool,
    },
    StartMonitor,
    StopMonitor,
    DestroyRemote {
        stream_id: StreamId,
        reason: EndReason,
    },
    ReleaseMedia,
    Notify(StreamEventKind),
}

/// An input that makes no sense in the current state
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Illegal stream transition: {input} while {state:?}")]
pub struct IllegalTransition {
    pub state: StreamState,
    pub input: &'static str,
}

/// Result of a legal transition
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: StreamState,
    pub effects: Vec<Effect>,
}

/// Per-stream negotiation state
#[derive(Debug, Clone)]
pub struct StreamMachine {
    direction: StreamDirection,
    state: StreamState,
    stream_id: Option<StreamId>,
    flags: StreamFlags,
    passive: bool,
    ice_forwarding: bool,
    /// Forwarding runs at most once per stream
    ice_started: bool,
    reason: Option<EndReason>,
}

impl StreamMachine {
    pub fn new(direction: StreamDirection) -> Self {
        Self {
            direction,
            state: StreamState::Created,
            stream_id: None,
            flags: StreamFlags::default(),
            passive: false,
            ice_forwarding: false,
            ice_started: false,
            reason: None,
        }
    }

    pub fn direction(&self) -> StreamDirection {
        self.direction
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn stream_id(&self) -> Option<&StreamId> {
        self.stream_id.as_ref()
    }

    /// Why the stream ended, once terminal
    pub fn reason(&self) -> Option<&EndReason> {
        self.reason.as_ref()
    }

    /// Playing a manifest rather than a negotiated session
    pub fn is_passive(&self) -> bool {
        self.passive
    }

    /// Apply one input.
    ///
    /// On error the machine is left untouched.
    pub fn apply(&mut self, input: StreamInput) -> Result<Transition, IllegalTransition> {
        use StreamState::*;

        let effects = match (self.state, input) {
            (Created, StreamInput::SetupSucceeded { stream_id, offer, flags }) => {
                self.stream_id = Some(stream_id);
                self.flags = flags;
                match offer {
                    Some(offer) => match offer.manifest_uri().map(str::to_string) {
                        Some(uri) => {
                            self.passive = true;
                            self.state = Negotiating;
                            vec![Effect::AttachManifest(uri)]
                        }
                        None => {
                            self.state = Negotiating;
                            vec![Effect::CreateAnswer(offer)]
                        }
                    },
                    None => self.terminate(Failed, EndReason::Failed, true),
                }
            }
            (Created, StreamInput::SetupFailed { reason }) => self.terminate(Failed, reason, false),

            (Negotiating, StreamInput::AnswerCreated { answer }) if !self.passive => {
                let mut effects = vec![Effect::SendAnswer(answer)];
                effects.extend(self.start_ice());
                effects
            }
            (Negotiating, StreamInput::Committed { flags }) => {
                self.flags = self.flags.union(flags);
                let mut effects = if self.flags.cancel {
                    self.stop_ice()
                } else {
                    self.start_ice()
                };
                self.state = Active;
                effects.push(Effect::StartMonitor);
                effects.push(Effect::Notify(StreamEventKind::Started));
                effects
            }
            (Negotiating, StreamInput::NegotiationFailed { reason }) => self.terminate(Failed, reason, true),

            (Negotiating | Active, StreamInput::IceGathered { candidates, completed }) => {
                if !self.ice_forwarding {
                    Vec::new()
                } else {
                    if completed {
                        self.ice_forwarding = false;
                    }
                    vec![Effect::SendIceCandidates { candidates, completed }]
                }
            }
            (Negotiating | Active, StreamInput::IceCancelled) => {
                self.flags.cancel = true;
                self.stop_ice()
            }
            (Negotiating | Active, StreamInput::DataQuality { status, reason }) => {
                vec![Effect::Notify(StreamEventKind::DataQuality { status, reason })]
            }

            (Created | Negotiating | Active, StreamInput::Stop { reason }) => self.terminate(Ended, reason, true),
            (Created | Negotiating | Active, StreamInput::ServerEnded { reason }) => {
                self.terminate(Ended, reason, false)
            }
            (Active, StreamInput::MonitorFailure) => {
                self.terminate(Failed, EndReason::ClientSideFailure, true)
            }
            (Created | Negotiating | Active, StreamInput::TransportLost) => {
                self.terminate(Failed, EndReason::Ended, false)
            }

            // Setup answered after a local stop: the server-side stream is orphaned
            (Ended | Failed, StreamInput::SetupSucceeded { stream_id, .. }) => {
                vec![Effect::DestroyRemote {
                    stream_id,
                    reason: self.reason.clone().unwrap_or(EndReason::Ended),
                }]
            }
            (
                Ended | Failed,
                StreamInput::Stop { .. }
                | StreamInput::ServerEnded { .. }
                | StreamInput::MonitorFailure
                | StreamInput::TransportLost,
            ) => Vec::new(),

            (state, input) => {
                return Err(IllegalTransition {
                    state,
                    input: input.name(),
                })
            }
        };

        Ok(Transition {
            next: self.state,
            effects,
        })
    }

    fn start_ice(&mut self) -> Vec<Effect> {
        if self.passive || self.ice_started || !self.flags.ice_candidates || self.flags.cancel {
            return Vec::new();
        }
        self.ice_started = true;
        self.ice_forwarding = true;
        vec![Effect::StartIceForwarding]
    }

    fn stop_ice(&mut self) -> Vec<Effect> {
        if !self.ice_forwarding {
            return Vec::new();
        }
        self.ice_forwarding = false;
        vec![Effect::StopIceForwarding]
    }

    fn terminate(&mut self, next: StreamState, reason: EndReason, notify_server: bool) -> Vec<Effect> {
        let mut effects = self.stop_ice();
        if self.state == StreamState::Active {
            effects.push(Effect::StopMonitor);
        }
        if notify_server {
            if let Some(stream_id) = &self.stream_id {
                effects.push(Effect::DestroyRemote {
                    stream_id: stream_id.clone(),
                    reason: reason.clone(),
                });
            }
        }
        effects.push(Effect::ReleaseMedia);
        effects.push(Effect::Notify(StreamEventKind::Ended {
            state: next,
            reason: reason.clone(),
        }));

        self.state = next;
        self.reason = Some(reason);
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer() -> SessionDescription {
        SessionDescription::offer("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n")
    }

    fn ice_flags() -> StreamFlags {
        StreamFlags {
            ice_candidates: true,
            ..Default::default()
        }
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{} 1 udp 2122260223 10.0.0.{} 5000 typ host", n, n),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    fn setup(machine: &mut StreamMachine, flags: StreamFlags) -> Transition {
        machine
            .apply(StreamInput::SetupSucceeded {
                stream_id: "stream-1".to_string(),
                offer: Some(offer()),
                flags,
            })
            .unwrap()
    }

    fn active_machine(flags: StreamFlags) -> StreamMachine {
        let mut machine = StreamMachine::new(StreamDirection::Upload);
        setup(&mut machine, flags);
        machine
            .apply(StreamInput::AnswerCreated {
                answer: SessionDescription::answer("v=0\r\n"),
            })
            .unwrap();
        machine
            .apply(StreamInput::Committed {
                flags: StreamFlags::default(),
            })
            .unwrap();
        machine
    }

    fn ended_notifications(effects: &[Effect]) -> usize {
        effects
            .iter()
            .filter(|e| matches!(e, Effect::Notify(StreamEventKind::Ended { .. })))
            .count()
    }

    #[test]
    fn test_upload_reaches_active() {
        let mut machine = StreamMachine::new(StreamDirection::Upload);

        let transition = setup(&mut machine, StreamFlags::default());
        assert_eq!(transition.next, StreamState::Negotiating);
        assert_eq!(transition.effects, vec![Effect::CreateAnswer(offer())]);

        let answer = SessionDescription::answer("v=0\r\n");
        let transition = machine
            .apply(StreamInput::AnswerCreated {
                answer: answer.clone(),
            })
            .unwrap();
        assert_eq!(transition.effects, vec![Effect::SendAnswer(answer)]);

        let transition = machine
            .apply(StreamInput::Committed {
                flags: StreamFlags::default(),
            })
            .unwrap();
        assert_eq!(transition.next, StreamState::Active);
        assert_eq!(
            transition.effects,
            vec![Effect::StartMonitor, Effect::Notify(StreamEventKind::Started)]
        );
        assert_eq!(machine.stream_id().map(String::as_str), Some("stream-1"));
    }

    #[test]
    fn test_ice_forwarding_follows_server_flags() {
        let mut machine = StreamMachine::new(StreamDirection::Download);
        setup(&mut machine, ice_flags());

        let transition = machine
            .apply(StreamInput::AnswerCreated {
                answer: SessionDescription::answer("v=0\r\n"),
            })
            .unwrap();
        assert!(transition.effects.contains(&Effect::StartIceForwarding));

        let transition = machine
            .apply(StreamInput::IceGathered {
                candidates: vec![candidate(1), candidate(2)],
                completed: false,
            })
            .unwrap();
        assert_eq!(
            transition.effects,
            vec![Effect::SendIceCandidates {
                candidates: vec![candidate(1), candidate(2)],
                completed: false
            }]
        );

        let transition = machine
            .apply(StreamInput::IceGathered {
                candidates: vec![],
                completed: true,
            })
            .unwrap();
        assert_eq!(
            transition.effects,
            vec![Effect::SendIceCandidates {
                candidates: vec![],
                completed: true
            }]
        );

        // Gathering finished; late candidates are not forwarded
        let transition = machine
            .apply(StreamInput::IceGathered {
                candidates: vec![candidate(3)],
                completed: false,
            })
            .unwrap();
        assert!(transition.effects.is_empty());

        // Committing after gathering finished does not gather again
        let transition = machine
            .apply(StreamInput::Committed { flags: ice_flags() })
            .unwrap();
        assert_eq!(transition.next, StreamState::Active);
        assert!(!transition.effects.contains(&Effect::StartIceForwarding));
    }

    #[test]
    fn test_ice_not_forwarded_without_flag() {
        let mut machine = active_machine(StreamFlags::default());
        let transition = machine
            .apply(StreamInput::IceGathered {
                candidates: vec![candidate(1)],
                completed: false,
            })
            .unwrap();
        assert!(transition.effects.is_empty());
    }

    #[test]
    fn test_cancel_stops_ice_forwarding() {
        let mut machine = StreamMachine::new(StreamDirection::Upload);
        setup(&mut machine, ice_flags());
        machine
            .apply(StreamInput::AnswerCreated {
                answer: SessionDescription::answer("v=0\r\n"),
            })
            .unwrap();

        let transition = machine.apply(StreamInput::IceCancelled).unwrap();
        assert_eq!(transition.effects, vec![Effect::StopIceForwarding]);

        let transition = machine
            .apply(StreamInput::Committed {
                flags: ice_flags(),
            })
            .unwrap();
        assert!(!transition.effects.contains(&Effect::StartIceForwarding));
    }

    #[test]
    fn test_manifest_offer_takes_passive_path() {
        let mut machine = StreamMachine::new(StreamDirection::Download);
        let transition = machine
            .apply(StreamInput::SetupSucceeded {
                stream_id: "stream-1".to_string(),
                offer: Some(SessionDescription::offer(
                    "v=0\r\na=x-playlist:https://cdn.example.com/live.m3u8\r\n",
                )),
                flags: ice_flags(),
            })
            .unwrap();
        assert_eq!(
            transition.effects,
            vec![Effect::AttachManifest("https://cdn.example.com/live.m3u8".to_string())]
        );
        assert!(machine.is_passive());

        let transition = machine
            .apply(StreamInput::Committed {
                flags: StreamFlags::default(),
            })
            .unwrap();
        assert_eq!(transition.next, StreamState::Active);
        assert!(!transition.effects.contains(&Effect::StartIceForwarding));
    }

    #[test]
    fn test_setup_failure_does_not_notify_server() {
        let mut machine = StreamMachine::new(StreamDirection::Upload);
        let transition = machine
            .apply(StreamInput::SetupFailed {
                reason: EndReason::from_wire("capacity"),
            })
            .unwrap();

        assert_eq!(transition.next, StreamState::Failed);
        assert!(!transition
            .effects
            .iter()
            .any(|e| matches!(e, Effect::DestroyRemote { .. })));
        assert!(transition.effects.contains(&Effect::ReleaseMedia));
    }

    #[test]
    fn test_missing_offer_fails_and_destroys() {
        let mut machine = StreamMachine::new(StreamDirection::Upload);
        let transition = machine
            .apply(StreamInput::SetupSucceeded {
                stream_id: "stream-1".to_string(),
                offer: None,
                flags: StreamFlags::default(),
            })
            .unwrap();

        assert_eq!(transition.next, StreamState::Failed);
        assert!(transition.effects.contains(&Effect::DestroyRemote {
            stream_id: "stream-1".to_string(),
            reason: EndReason::Failed,
        }));
    }

    #[test]
    fn test_server_ended_twice_ends_once() {
        let mut machine = active_machine(StreamFlags::default());

        let first = machine
            .apply(StreamInput::ServerEnded {
                reason: EndReason::StreamEnded,
            })
            .unwrap();
        assert_eq!(first.next, StreamState::Ended);
        assert_eq!(ended_notifications(&first.effects), 1);
        assert!(first.effects.contains(&Effect::StopMonitor));
        assert!(!first
            .effects
            .iter()
            .any(|e| matches!(e, Effect::DestroyRemote { .. })));

        let second = machine
            .apply(StreamInput::ServerEnded {
                reason: EndReason::StreamEnded,
            })
            .unwrap();
        assert_eq!(second.next, StreamState::Ended);
        assert!(second.effects.is_empty());
    }

    #[test]
    fn test_stop_twice_destroys_once() {
        let mut machine = active_machine(StreamFlags::default());

        let first = machine
            .apply(StreamInput::Stop {
                reason: EndReason::Ended,
            })
            .unwrap();
        assert!(first.effects.contains(&Effect::DestroyRemote {
            stream_id: "stream-1".to_string(),
            reason: EndReason::Ended,
        }));

        let second = machine
            .apply(StreamInput::Stop {
                reason: EndReason::Ended,
            })
            .unwrap();
        assert!(second.effects.is_empty());
    }

    #[test]
    fn test_monitor_failure_is_client_side() {
        let mut machine = active_machine(StreamFlags::default());
        let transition = machine.apply(StreamInput::MonitorFailure).unwrap();

        assert_eq!(transition.next, StreamState::Failed);
        assert!(transition.effects.contains(&Effect::DestroyRemote {
            stream_id: "stream-1".to_string(),
            reason: EndReason::ClientSideFailure,
        }));
        assert_eq!(machine.reason(), Some(&EndReason::ClientSideFailure));
    }

    #[test]
    fn test_transport_lost_fails_without_destroy() {
        let mut machine = active_machine(StreamFlags::default());
        let transition = machine.apply(StreamInput::TransportLost).unwrap();

        assert_eq!(transition.next, StreamState::Failed);
        assert!(transition.effects.contains(&Effect::Notify(StreamEventKind::Ended {
            state: StreamState::Failed,
            reason: EndReason::Ended,
        })));
        assert!(!transition
            .effects
            .iter()
            .any(|e| matches!(e, Effect::DestroyRemote { .. })));
    }

    #[test]
    fn test_ice_after_end_is_illegal() {
        let mut machine = active_machine(ice_flags());
        machine
            .apply(StreamInput::Stop {
                reason: EndReason::Ended,
            })
            .unwrap();

        let err = machine
            .apply(StreamInput::IceGathered {
                candidates: vec![candidate(1)],
                completed: false,
            })
            .unwrap_err();
        assert_eq!(
            err,
            IllegalTransition {
                state: StreamState::Ended,
                input: "IceGathered"
            }
        );
        assert_eq!(machine.state(), StreamState::Ended);
    }

    #[test]
    fn test_answer_before_offer_is_illegal() {
        let mut machine = StreamMachine::new(StreamDirection::Upload);
        assert!(machine
            .apply(StreamInput::AnswerCreated {
                answer: SessionDescription::answer("v=0\r\n"),
            })
            .is_err());
        assert_eq!(machine.state(), StreamState::Created);
    }

    #[test]
    fn test_late_setup_after_stop_destroys_orphan() {
        let mut machine = StreamMachine::new(StreamDirection::Upload);
        let stopped = machine
            .apply(StreamInput::Stop {
                reason: EndReason::Ended,
            })
            .unwrap();
        assert_eq!(stopped.next, StreamState::Ended);

        let transition = setup(&mut machine, StreamFlags::default());
        assert_eq!(transition.next, StreamState::Ended);
        assert_eq!(
            transition.effects,
            vec![Effect::DestroyRemote {
                stream_id: "stream-1".to_string(),
                reason: EndReason::Ended,
            }]
        );
    }
}
