//! Error taxonomy shared across the bridge.

use crate::bus::TransportError;
use crate::config::ConfigError;
use crate::discovery::DiscoveryError;

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// A message could not be translated between the two header schemas.
///
/// Translation is deterministic, so these are never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversionError {
    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Missing required header '{0}'")]
    MissingHeader(String),
}

/// Top-level error for the bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Conversion failed: {0}")]
    Conversion(#[from] ConversionError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Queue discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Provisioning of queue '{0}' failed")]
    Provisioning(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to encode control message: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl BridgeError {
    /// Conversion failures go straight to the poison queue.
    pub fn is_conversion_failure(&self) -> bool {
        matches!(self, BridgeError::Conversion(_))
    }
}
