//! Bus error types.

use thiserror::Error;

/// Boxed error produced by the underlying bus client.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Bus access layer error type.
#[derive(Debug, Error)]
pub enum BusError {
    /// No endpoint is available (none configured, or none could be reached).
    #[error("No bus endpoints available")]
    NoEndpoints,

    /// Connecting to an endpoint failed.
    #[error("Failed to connect to {address}: {source}")]
    Connect { address: String, source: BoxError },

    /// Publishing on an endpoint failed.
    #[error("Failed to publish on {address}: {source}")]
    Publish { address: String, source: BoxError },

    /// Subscribing on an endpoint failed.
    #[error("Failed to subscribe on {address}: {source}")]
    Subscribe { address: String, source: BoxError },

    /// The endpoint was asked to run twice.
    #[error("Endpoint {0} is already running")]
    AlreadyRunning(String),
}

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;
