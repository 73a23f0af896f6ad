//! Error types for the DON environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Outbound request failed (connection reset, bad response, etc.)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Target host is unreachable (simulated outage)
    #[error("Host unreachable: {0}")]
    HostUnreachable(String),
}

impl EnvError {
    /// Creates a network error.
    pub fn network(msg: impl Into<String>) -> Self {
        Self::NetworkError(msg.into())
    }

    /// Creates an unreachable error.
    pub fn unreachable(host: impl std::fmt::Display) -> Self {
        Self::HostUnreachable(host.to_string())
    }
}
