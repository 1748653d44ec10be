//! Client configuration
//!
//! Loaded from a TOML file; every field has a default so a file only needs
//! the values it changes:
//!
//! ```toml
//! discovery_uri = "https://pcast.example.com"
//!
//! [transport]
//! request_timeout_ms = 15000
//!
//! [stream]
//! negotiation_timeout_ms = 10000
//!
//! [monitor]
//! threshold = 3
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::network::{ResolverConfig, TransportConfig};
use crate::session::{MonitorConfig, StreamConfig};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Session client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URI of the endpoint discovery service
    pub discovery_uri: Option<String>,

    /// Static signaling endpoints; skips discovery when non-empty
    pub endpoints: Vec<String>,

    /// Token used by `pcast connect` when none is given on the command line
    pub authentication_token: Option<String>,

    /// Stable identifier of this device
    pub device_id: String,

    pub client_version: String,

    pub platform: String,

    pub platform_version: String,

    pub transport: TransportConfig,

    pub resolver: ResolverConfig,

    pub stream: StreamConfig,

    pub monitor: MonitorConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            discovery_uri: None,
            endpoints: Vec::new(),
            authentication_token: None,
            device_id: uuid::Uuid::new_v4().to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
            platform_version: std::env::consts::ARCH.to_string(),
            transport: TransportConfig::default(),
            resolver: ResolverConfig::default(),
            stream: StreamConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML config text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration can be used to start a session
    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.discovery_uri {
            Some(uri) => {
                let url = Url::parse(uri).map_err(|e| invalid("discovery_uri", e.to_string()))?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(invalid("discovery_uri", format!("{} must use http or https", uri)));
                }
            }
            None if self.endpoints.is_empty() => {
                return Err(invalid("endpoints", "set discovery_uri or at least one endpoint"));
            }
            None => {}
        }

        for endpoint in &self.endpoints {
            let url = Url::parse(endpoint).map_err(|e| invalid("endpoints", format!("{}: {}", endpoint, e)))?;
            if !matches!(url.scheme(), "ws" | "wss") {
                return Err(invalid("endpoints", format!("{} must use ws or wss", endpoint)));
            }
        }

        if self.device_id.trim().is_empty() {
            return Err(invalid("device_id", "must not be empty"));
        }

        if self.transport.request_timeout_ms == 0 {
            return Err(invalid("transport.request_timeout_ms", "must be non-zero"));
        }
        if self.transport.connect_timeout_ms == 0 {
            return Err(invalid("transport.connect_timeout_ms", "must be non-zero"));
        }

        if self.resolver.probes_per_endpoint == 0 {
            return Err(invalid("resolver.probes_per_endpoint", "must be at least 1"));
        }
        if self.resolver.probe_timeout_ms == 0 || self.resolver.resolve_timeout_ms == 0 {
            return Err(invalid("resolver", "timeouts must be non-zero"));
        }

        if self.stream.negotiation_timeout_ms == 0 {
            return Err(invalid("stream.negotiation_timeout_ms", "must be non-zero"));
        }

        if self.monitor.period_ms == 0 || self.monitor.alert_period_ms == 0 {
            return Err(invalid("monitor", "periods must be non-zero"));
        }
        if self.monitor.threshold == 0 {
            return Err(invalid("monitor.threshold", "must be at least 1"));
        }

        Ok(())
    }
}
