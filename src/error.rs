//! Error types for endec-relay

use thiserror::Error;

/// Errors that can occur while relaying frames or watching heartbeats
#[derive(Debug, Error)]
pub enum RelayError {
    /// Serial device could not be opened or a read failed (disconnect, EOF)
    #[error("Serial error on '{port}': {reason}")]
    SerialIo { port: String, reason: String },

    /// Broker connection failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Publish failure
    #[error("Failed to publish to subject '{subject}': {reason}")]
    Publish { subject: String, reason: String },

    /// Subscribe failure
    #[error("Failed to subscribe to subject '{subject}': {reason}")]
    Subscribe { subject: String, reason: String },

    /// JetStream stream creation or management error
    #[error("Stream error: {0}")]
    Stream(String),

    /// JetStream consumer creation or management error
    #[error("Consumer error: {0}")]
    Consumer(String),

    /// Acknowledgement failure
    #[error("Failed to acknowledge message: {0}")]
    Ack(String),

    /// A sink rejected or failed a single delivery attempt
    #[error("Delivery to '{target}' failed: {reason}")]
    Delivery { target: String, reason: String },

    /// HTTP transport failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filesystem or other local I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Work was abandoned because shutdown was requested
    #[error("Operation cancelled")]
    Cancelled,
}

impl RelayError {
    /// Build a serial error for a port
    pub fn serial(port: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::SerialIo {
            port: port.into(),
            reason: reason.to_string(),
        }
    }

    /// Build a delivery error for a target
    pub fn delivery(target: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Delivery {
            target: target.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
