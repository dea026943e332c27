use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("At least one protocol version must be accepted")]
    NoAcceptedVersions,

    #[error("Empty protocol version")]
    EmptyVersion,

    #[error("Request timeout cannot be 0")]
    InvalidTimeout,

    #[error("Store path cannot be empty")]
    EmptyStorePath,
}

/// Relay configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Listener for caller queries and instance channels
    pub listener: Listener,
    /// Admin listener for health and readiness probes
    pub admin_listener: Listener,
    /// Where identity records are kept
    #[serde(default)]
    pub store: repo_store::config::Config,
    pub protocol: ProtocolConfig,
    /// How long a forwarded request waits for the instance's reply
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Config {
    /// Validates the relay configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;
        self.protocol.validate()?;

        if self.request_timeout_ms == 0 {
            return Err(ValidationError::InvalidTimeout);
        }

        if self.store.path.as_os_str().is_empty() {
            return Err(ValidationError::EmptyStorePath);
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Listener {
    /// Validates the listener configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

/// Protocol versions instances may declare when registering
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ProtocolConfig {
    /// Ordered oldest to newest. The last entry is suggested to instances that are
    /// turned away.
    pub accepted_versions: Vec<String>,
}

impl ProtocolConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.accepted_versions.is_empty() {
            return Err(ValidationError::NoAcceptedVersions);
        }
        if self.accepted_versions.iter().any(|v| v.trim().is_empty()) {
            return Err(ValidationError::EmptyVersion);
        }
        Ok(())
    }

    pub fn accepts(&self, version: &str) -> bool {
        self.accepted_versions.iter().any(|v| v == version)
    }

    pub fn latest(&self) -> &str {
        self.accepted_versions
            .last()
            .map(String::as_str)
            .unwrap_or_default()
    }
}
