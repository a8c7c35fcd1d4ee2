//! Error types for message bus

use thiserror::Error;

/// Message bus error
#[derive(Debug, Error)]
pub enum Error {
    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Webhook endpoint answered with a non-success status
    #[error("Webhook returned {status}: {body}")]
    WebhookStatus {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// NATS error
    #[error("NATS error: {0}")]
    Nats(String),

    /// Broker has been shut down
    #[error("Broker closed")]
    Closed,
}

impl Error {
    /// Whether a delivery may succeed if tried again
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Connection(_) | Error::Http(_) | Error::Nats(_) => true,
            Error::WebhookStatus { status, .. } => *status >= 500 || *status == 429,
            Error::Serialization(_) | Error::Closed => false,
        }
    }
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;
