//! Gateway error types.

use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Bus access layer error.
    #[error("Bus error: {0}")]
    Bus(#[from] bus::BusError),

    /// Frame is not valid hex.
    #[error("Hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),

    /// Payload is not a valid protobuf message.
    #[error("Protobuf decode error: {0}")]
    Protobuf(#[from] prost::DecodeError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame could not be decoded for another reason.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Destination route uses a scheme the gateway does not forward to.
    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),

    /// Message carries no destination route.
    #[error("Message has no destination route")]
    NoDestination,

    /// The client connection is gone.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The client's outbound buffer is full.
    #[error("Channel send error")]
    ChannelSend,

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// TLS setup error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rustls::Error> for GatewayError {
    fn from(e: rustls::Error) -> Self {
        GatewayError::Tls(e.to_string())
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
