//! Crate-level error type for the adaptive publisher
//!
//! Connection and probe failures are recovered inside the orchestrator and
//! monitor; only subscription management and configuration loading surface
//! errors to callers.

use crate::config::ConfigError;
use crate::transport::TransportError;
use thiserror::Error;

/// Main error type for publisher operations
#[derive(Debug, Error)]
pub enum PublisherError {
    #[error("Not connected to any broker")]
    NotConnected,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid QoS level: {0}")]
    InvalidQos(u8),
}

impl PublisherError {
    /// True when the operation could succeed once a broker connection exists
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PublisherError::NotConnected | PublisherError::Transport(TransportError::NotConnected)
        )
    }
}

/// Result type for publisher operations
pub type PublisherResult<T> = Result<T, PublisherError>;
