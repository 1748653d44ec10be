//! Connection health monitor
//!
//! Samples media transport statistics on an adaptive period and raises a
//! failure after a run of consecutive unhealthy samples. A single bad sample
//! only shortens the period; one healthy sample resets the count.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::{debug, trace, warn};

use crate::media::{LogicalState, MediaKind, MediaTransport, TransportStats};
use crate::protocol::StreamDirection;

/// Health monitor tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Sampling period while healthy
    pub period_ms: u64,
    /// Sampling period while at least one unhealthy sample is outstanding
    pub alert_period_ms: u64,
    /// Consecutive unhealthy samples before failure is raised
    pub threshold: u32,
    pub min_audio_bitrate_bps: f64,
    pub min_video_bitrate_bps: f64,
    pub min_video_frame_rate: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            period_ms: 4000,
            alert_period_ms: 1500,
            threshold: 3,
            min_audio_bitrate_bps: 0.0,
            min_video_bitrate_bps: 0.0,
            min_video_frame_rate: 0.0,
        }
    }
}

impl MonitorConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn alert_period(&self) -> Duration {
        Duration::from_millis(self.alert_period_ms)
    }

    fn min_bitrate(&self, kind: MediaKind) -> f64 {
        match kind {
            MediaKind::Audio => self.min_audio_bitrate_bps,
            MediaKind::Video => self.min_video_bitrate_bps,
        }
    }
}

/// Why a sample was judged unhealthy
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    State(LogicalState),
    Bitrate { kind: MediaKind, bps: f64 },
    FrameRate { kind: MediaKind, fps: f64 },
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::State(state) => write!(f, "transport {:?}", state),
            Condition::Bitrate { kind, bps } => write!(f, "{:?} bitrate {:.0} bps", kind, bps),
            Condition::FrameRate { kind, fps } => write!(f, "{:?} frame rate {:.1} fps", kind, fps),
        }
    }
}

/// Metrics reported with a raised failure
#[derive(Debug, Clone, PartialEq)]
pub struct FailureReport {
    pub condition_count: u32,
    pub conditions: Vec<Condition>,
    pub stats: TransportStats,
}

/// Result of judging one sample
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Healthy,
    Unhealthy { count: u32, conditions: Vec<Condition> },
    Failed(FailureReport),
}

/// What the failure callback wants the monitor to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledge {
    /// Stop sampling
    Stop,
    /// Reset and resume at the normal period
    Mute,
}

/// Hysteresis state for one monitored stream
#[derive(Debug, Clone)]
pub struct MonitorState {
    config: MonitorConfig,
    direction: StreamDirection,
    condition_count: u32,
    raised: bool,
    last_sample: Option<(Instant, HashMap<MediaKind, u64>)>,
}

impl MonitorState {
    pub fn new(config: MonitorConfig, direction: StreamDirection) -> Self {
        Self {
            config,
            direction,
            condition_count: 0,
            raised: false,
            last_sample: None,
        }
    }

    pub fn condition_count(&self) -> u32 {
        self.condition_count
    }

    /// Delay before the next sample
    pub fn next_period(&self) -> Duration {
        if self.condition_count > 0 {
            self.config.alert_period()
        } else {
            self.config.period()
        }
    }

    /// Forget the current run of unhealthy samples
    pub fn mute(&mut self) {
        self.condition_count = 0;
        self.raised = false;
    }

    /// Judge one statistics sample taken at `now`
    pub fn observe(&mut self, stats: &TransportStats, now: Instant) -> Verdict {
        let conditions = self.evaluate(stats, now);

        if conditions.is_empty() {
            if self.condition_count > 0 {
                debug!("Media healthy again after {} bad sample(s)", self.condition_count);
            }
            self.mute();
            return Verdict::Healthy;
        }

        self.condition_count += 1;
        if self.condition_count >= self.config.threshold && !self.raised {
            self.raised = true;
            return Verdict::Failed(FailureReport {
                condition_count: self.condition_count,
                conditions,
                stats: stats.clone(),
            });
        }

        Verdict::Unhealthy {
            count: self.condition_count,
            conditions,
        }
    }

    fn evaluate(&mut self, stats: &TransportStats, now: Instant) -> Vec<Condition> {
        let mut conditions = Vec::new();
        if stats.state.is_dead() {
            conditions.push(Condition::State(stats.state));
        }

        let bytes: HashMap<MediaKind, u64> = stats
            .kinds
            .iter()
            .map(|k| {
                let count = match self.direction {
                    StreamDirection::Upload => k.bytes_sent,
                    StreamDirection::Download => k.bytes_received,
                };
                (k.kind, count)
            })
            .collect();

        for kind in stats.kinds.iter().filter(|k| k.enabled) {
            if let Some((previous_at, previous)) = &self.last_sample {
                let elapsed = now.saturating_duration_since(*previous_at).as_secs_f64();
                if let (Some(before), Some(after)) = (previous.get(&kind.kind), bytes.get(&kind.kind)) {
                    if elapsed > 0.0 {
                        let bps = after.saturating_sub(*before) as f64 * 8.0 / elapsed;
                        if bps <= self.config.min_bitrate(kind.kind) {
                            conditions.push(Condition::Bitrate { kind: kind.kind, bps });
                        }
                    }
                }
            }

            if kind.kind == MediaKind::Video {
                if let Some(fps) = kind.frame_rate {
                    if fps <= self.config.min_video_frame_rate {
                        conditions.push(Condition::FrameRate { kind: kind.kind, fps });
                    }
                }
            }
        }

        self.last_sample = Some((now, bytes));
        conditions
    }
}

/// Periodic sampler for one stream's media transport
pub struct HealthMonitor {
    state: MonitorState,
    media: Arc<dyn MediaTransport>,
}

impl HealthMonitor {
    pub fn new(config: MonitorConfig, direction: StreamDirection, media: Arc<dyn MediaTransport>) -> Self {
        Self {
            state: MonitorState::new(config, direction),
            media,
        }
    }

    /// Sample until `is_active` reports false or the failure callback
    /// answers [`Acknowledge::Stop`].
    pub async fn run<A, F>(mut self, is_active: A, mut on_failure: F)
    where
        A: Fn() -> bool,
        F: FnMut(FailureReport) -> Acknowledge,
    {
        loop {
            sleep(self.state.next_period()).await;

            if !is_active() {
                debug!("Stream inactive, stopping health monitor");
                return;
            }

            let stats = match self.media.stats().await {
                Ok(stats) => stats,
                Err(e) => {
                    debug!("Skipping health sample: {}", e);
                    continue;
                }
            };

            match self.state.observe(&stats, Instant::now()) {
                Verdict::Healthy => trace!("Media healthy"),
                Verdict::Unhealthy { count, conditions } => {
                    debug!("Unhealthy media sample {} ({:?})", count, conditions);
                }
                Verdict::Failed(report) => {
                    warn!(
                        "Media failure after {} samples: {}",
                        report.condition_count,
                        report
                            .conditions
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join(", ")
                    );
                    match on_failure(report) {
                        Acknowledge::Stop => return,
                        Acknowledge::Mute => self.state.mute(),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{KindStats, MediaError};
    use async_trait::async_trait;
    use futures_util::stream::{self, BoxStream};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use crate::media::IceGatheringEvent;
    use crate::protocol::SessionDescription;

    fn sample(state: LogicalState, audio_bytes: u64) -> TransportStats {
        TransportStats {
            state,
            kinds: vec![KindStats {
                kind: MediaKind::Audio,
                enabled: true,
                bytes_sent: audio_bytes,
                bytes_received: 0,
                frame_rate: None,
            }],
        }
    }

    fn dead() -> TransportStats {
        sample(LogicalState::Failed, 0)
    }

    fn alive() -> TransportStats {
        sample(LogicalState::Connected, 0)
    }

    #[test]
    fn test_two_bad_one_good_does_not_fail() {
        let mut state = MonitorState::new(MonitorConfig::default(), StreamDirection::Upload);
        let now = Instant::now();

        assert!(matches!(state.observe(&dead(), now), Verdict::Unhealthy { count: 1, .. }));
        assert!(matches!(state.observe(&dead(), now), Verdict::Unhealthy { count: 2, .. }));
        assert_eq!(state.observe(&alive(), now), Verdict::Healthy);
        assert_eq!(state.condition_count(), 0);
        assert!(matches!(state.observe(&dead(), now), Verdict::Unhealthy { count: 1, .. }));
    }

    #[test]
    fn test_three_bad_fail_exactly_once() {
        let mut state = MonitorState::new(MonitorConfig::default(), StreamDirection::Upload);
        let now = Instant::now();

        let failures = (0..6)
            .map(|_| state.observe(&dead(), now))
            .filter(|v| matches!(v, Verdict::Failed(_)))
            .count();
        assert_eq!(failures, 1);
        assert_eq!(state.condition_count(), 6);
    }

    #[test]
    fn test_alert_period_while_unhealthy() {
        let mut state = MonitorState::new(MonitorConfig::default(), StreamDirection::Upload);
        let now = Instant::now();
        assert_eq!(state.next_period(), Duration::from_millis(4000));

        state.observe(&dead(), now);
        assert_eq!(state.next_period(), Duration::from_millis(1500));

        state.mute();
        assert_eq!(state.next_period(), Duration::from_millis(4000));
    }

    #[test]
    fn test_stalled_bytes_are_unhealthy() {
        let mut state = MonitorState::new(MonitorConfig::default(), StreamDirection::Upload);
        let start = Instant::now();

        // First sample has no baseline
        assert_eq!(state.observe(&sample(LogicalState::Connected, 1000), start), Verdict::Healthy);
        assert_eq!(
            state.observe(&sample(LogicalState::Connected, 5000), start + Duration::from_secs(1)),
            Verdict::Healthy
        );

        match state.observe(&sample(LogicalState::Connected, 5000), start + Duration::from_secs(2)) {
            Verdict::Unhealthy { count: 1, conditions } => {
                assert_eq!(
                    conditions,
                    vec![Condition::Bitrate {
                        kind: MediaKind::Audio,
                        bps: 0.0
                    }]
                );
            }
            other => panic!("Unexpected verdict {:?}", other),
        }
    }

    #[test]
    fn test_disabled_kind_is_not_judged() {
        let mut state = MonitorState::new(MonitorConfig::default(), StreamDirection::Download);
        let start = Instant::now();
        let muted = TransportStats {
            state: LogicalState::Connected,
            kinds: vec![KindStats {
                kind: MediaKind::Video,
                enabled: false,
                bytes_sent: 0,
                bytes_received: 0,
                frame_rate: Some(0.0),
            }],
        };

        assert_eq!(state.observe(&muted, start), Verdict::Healthy);
        assert_eq!(state.observe(&muted, start + Duration::from_secs(1)), Verdict::Healthy);
    }

    struct DeadMedia {
        samples: AtomicUsize,
    }

    #[async_trait]
    impl MediaTransport for DeadMedia {
        async fn create_answer(&self, _offer: &SessionDescription) -> Result<SessionDescription, MediaError> {
            Err(MediaError::Unsupported)
        }

        fn ice_candidates(&self) -> BoxStream<'static, IceGatheringEvent> {
            Box::pin(stream::empty())
        }

        async fn stats(&self) -> Result<TransportStats, MediaError> {
            self.samples.fetch_add(1, Ordering::SeqCst);
            Ok(dead())
        }

        async fn attach_manifest(&self, _uri: &str) -> Result<(), MediaError> {
            Ok(())
        }

        async fn release(&self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_stops_on_acknowledge() {
        let media = Arc::new(DeadMedia {
            samples: AtomicUsize::new(0),
        });
        let monitor = HealthMonitor::new(MonitorConfig::default(), StreamDirection::Upload, media.clone());
        let reports = Arc::new(Mutex::new(Vec::new()));

        let started = Instant::now();
        let collected = reports.clone();
        monitor
            .run(
                || true,
                move |report| {
                    collected.lock().push(report);
                    Acknowledge::Stop
                },
            )
            .await;

        assert_eq!(reports.lock().len(), 1);
        assert_eq!(reports.lock()[0].condition_count, 3);
        assert_eq!(media.samples.load(Ordering::SeqCst), 3);
        // One normal period, then two alert periods
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(4000 + 1500 + 1500));
        assert!(elapsed < Duration::from_millis(8000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_stops_when_inactive() {
        let media = Arc::new(DeadMedia {
            samples: AtomicUsize::new(0),
        });
        let monitor = HealthMonitor::new(MonitorConfig::default(), StreamDirection::Upload, media.clone());
        let active = AtomicBool::new(false);

        monitor
            .run(|| active.load(Ordering::SeqCst), |_| Acknowledge::Stop)
            .await;

        assert_eq!(media.samples.load(Ordering::SeqCst), 0);
    }
}
