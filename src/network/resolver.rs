//! Endpoint resolution by measured latency
//!
//! Every candidate endpoint is probed concurrently, a few times each, and
//! the one with the lowest observed latency wins. Resolution completes as
//! soon as the answer can no longer improve in a useful way.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, trace};
use url::Url;

use super::error::NetworkError;

/// Resolver tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Sequential probes per candidate
    pub probes_per_endpoint: u32,
    /// Retries for a failed probe
    pub probe_retries: u32,
    pub probe_timeout_ms: u64,
    /// Overall time limit
    pub resolve_timeout_ms: u64,
    /// Stop as soon as any candidate answers this fast
    pub acceptable_latency_ms: Option<u64>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            probes_per_endpoint: 4,
            probe_retries: 1,
            probe_timeout_ms: 2_000,
            resolve_timeout_ms: 10_000,
            acceptable_latency_ms: None,
        }
    }
}

impl ResolverConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    pub fn acceptable_latency(&self) -> Option<Duration> {
        self.acceptable_latency_ms.map(Duration::from_millis)
    }
}

/// Measures the latency of one endpoint
#[async_trait]
pub trait EndpointProber: Send + Sync {
    async fn probe(&self, endpoint: &str) -> Result<Duration, NetworkError>;
}

/// Probes by timing a TCP connect to the endpoint's host and port
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnectProber;

#[async_trait]
impl EndpointProber for TcpConnectProber {
    async fn probe(&self, endpoint: &str) -> Result<Duration, NetworkError> {
        let (host, port) = endpoint_host_port(endpoint)?;
        let started = Instant::now();
        let stream = TcpStream::connect((host.as_str(), port)).await?;
        let latency = started.elapsed();
        drop(stream);
        Ok(latency)
    }
}

/// Host and port a WebSocket URI connects to
pub fn endpoint_host_port(endpoint: &str) -> Result<(String, u16), NetworkError> {
    let url = Url::parse(endpoint)
        .map_err(|e| NetworkError::InvalidEndpoint(format!("{}: {}", endpoint, e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| NetworkError::InvalidEndpoint(endpoint.to_string()))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| NetworkError::InvalidEndpoint(endpoint.to_string()))?;
    Ok((host, port))
}

/// Probe results for one candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointCandidate {
    pub address: String,
    pub min_latency: Option<Duration>,
}

/// Outcome of a resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub endpoint: String,
    pub latency: Duration,
    pub candidates: Vec<EndpointCandidate>,
}

enum ProbeOutcome {
    Sample { index: usize, latency: Option<Duration> },
    Exhausted,
}

/// Picks the lowest-latency endpoint from a candidate list
pub struct EndpointResolver {
    config: ResolverConfig,
    prober: Arc<dyn EndpointProber>,
}

impl EndpointResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self::with_prober(config, Arc::new(TcpConnectProber))
    }

    pub fn with_prober(config: ResolverConfig, prober: Arc<dyn EndpointProber>) -> Self {
        Self { config, prober }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Probe every endpoint and return the fastest.
    ///
    /// Ties go to the endpoint listed first.
    pub async fn resolve(&self, endpoints: &[String]) -> Result<Resolution, NetworkError> {
        if endpoints.is_empty() {
            return Err(NetworkError::NoEndpointAvailable);
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut probes = JoinSet::new();
        for (index, endpoint) in endpoints.iter().enumerate() {
            let tx = tx.clone();
            let prober = self.prober.clone();
            let endpoint = endpoint.clone();
            let config = self.config.clone();
            probes.spawn(async move {
                for _ in 0..config.probes_per_endpoint {
                    let latency = probe_with_retries(prober.as_ref(), &endpoint, &config).await;
                    if tx.send(ProbeOutcome::Sample { index, latency }).is_err() {
                        return;
                    }
                }
                let _ = tx.send(ProbeOutcome::Exhausted);
            });
        }
        drop(tx);

        let mut candidates: Vec<EndpointCandidate> = endpoints
            .iter()
            .map(|address| EndpointCandidate {
                address: address.clone(),
                min_latency: None,
            })
            .collect();
        let acceptable = self.config.acceptable_latency();
        let mut exhausted = 0;

        let deadline = sleep(self.config.resolve_timeout());
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                outcome = rx.recv() => match outcome {
                    Some(ProbeOutcome::Sample { index, latency: Some(latency) }) => {
                        let candidate = &mut candidates[index];
                        trace!("Probe {} took {:?}", candidate.address, latency);
                        candidate.min_latency = Some(
                            candidate.min_latency.map_or(latency, |min| min.min(latency)),
                        );

                        if acceptable.is_some_and(|limit| latency <= limit) {
                            debug!("{} is within acceptable latency", candidate.address);
                            break;
                        }
                        if candidates.iter().all(|c| c.min_latency.is_some()) {
                            break;
                        }
                    }
                    Some(ProbeOutcome::Sample { .. }) => {}
                    Some(ProbeOutcome::Exhausted) => {
                        exhausted += 1;
                        if exhausted == candidates.len() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = &mut deadline => {
                    debug!("Resolve timed out after {:?}", self.config.resolve_timeout());
                    break;
                }
            }
        }
        probes.abort_all();

        let (endpoint, latency) = candidates
            .iter()
            .filter_map(|c| c.min_latency.map(|latency| (c.address.clone(), latency)))
            .min_by_key(|(_, latency)| *latency)
            .ok_or(NetworkError::NoEndpointAvailable)?;

        info!("Resolved endpoint {} ({:?})", endpoint, latency);

        Ok(Resolution {
            endpoint,
            latency,
            candidates,
        })
    }
}

async fn probe_with_retries(
    prober: &dyn EndpointProber,
    endpoint: &str,
    config: &ResolverConfig,
) -> Option<Duration> {
    for attempt in 0..=config.probe_retries {
        match timeout(config.probe_timeout(), prober.probe(endpoint)).await {
            Ok(Ok(latency)) => return Some(latency),
            Ok(Err(e)) => debug!("Probe {} attempt {} failed: {}", endpoint, attempt + 1, e),
            Err(_) => debug!("Probe {} attempt {} timed out", endpoint, attempt + 1),
        }
    }
    None
}
