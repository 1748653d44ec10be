//! Endpoint discovery over HTTP
//!
//! The discovery service answers `GET {base}/endpoints` with a plain-text,
//! comma-separated list of signaling WebSocket URIs.

use std::time::Duration;

use tracing::{debug, info};
use url::Url;

use super::error::NetworkError;

const ENDPOINTS_PATH: &str = "endpoints";

/// Fetches candidate signaling endpoints from the discovery service
pub struct EndpointDiscovery {
    base: Url,
    client: reqwest::Client,
}

impl EndpointDiscovery {
    pub fn new(base_uri: &str, request_timeout: Duration) -> Result<Self, NetworkError> {
        let mut base =
            Url::parse(base_uri).map_err(|e| NetworkError::InvalidEndpoint(format!("{}: {}", base_uri, e)))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(NetworkError::InvalidEndpoint(base_uri.to_string()));
        }
        // Url::join drops the last path segment unless it ends with '/'
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| NetworkError::Discovery(e.to_string()))?;

        Ok(Self { base, client })
    }

    /// URL the endpoint list is fetched from
    pub fn endpoints_url(&self) -> Result<Url, NetworkError> {
        self.base
            .join(ENDPOINTS_PATH)
            .map_err(|e| NetworkError::InvalidEndpoint(e.to_string()))
    }

    /// Fetch the current endpoint list
    pub async fn fetch(&self) -> Result<Vec<String>, NetworkError> {
        let url = self.endpoints_url()?;
        debug!("Fetching endpoints from {}", url);

        let body = self
            .client
            .get(url.clone())
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| NetworkError::Discovery(e.to_string()))?
            .text()
            .await
            .map_err(|e| NetworkError::Discovery(e.to_string()))?;

        let endpoints = parse_endpoint_list(&body);
        info!("Discovered {} endpoint(s) from {}", endpoints.len(), url);
        Ok(endpoints)
    }
}

/// Split a comma-separated endpoint list, dropping blanks
pub fn parse_endpoint_list(body: &str) -> Vec<String> {
    body.split(',')
        .map(str::trim)
        .filter(|endpoint| !endpoint.is_empty())
        .map(str::to_string)
        .collect()
}
