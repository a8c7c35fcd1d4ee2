//! Error types for node clients

use thiserror::Error;

/// Result type for node operations
pub type Result<T> = std::result::Result<T, Error>;

/// Node client errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Transport or RPC-level failure (node unreachable, bad response)
    #[error("Node RPC error: {0}")]
    Rpc(String),

    /// The node definitively failed the payment
    #[error("Payment failed: {0}")]
    PaymentFailed(String),

    /// The node has no record of the payment
    #[error("Payment not found: {0}")]
    PaymentNotFound(String),

    /// Payment request could not be decoded
    #[error("Invalid payment request: {0}")]
    InvalidPaymentRequest(String),

    /// Invoice subscription stream ended
    #[error("Invoice stream closed: {0}")]
    StreamClosed(String),

    /// Call did not complete in time
    #[error("Timeout after {seconds}s: {operation}")]
    Timeout {
        /// Timeout duration
        seconds: u64,
        /// Operation
        operation: String,
    },

    /// No node configured or reachable
    #[error("Node unavailable: {0}")]
    Unavailable(String),
}

impl Error {
    /// Whether the outcome of the call is unknown: the node may or may not
    /// have acted on it. Everything else is a definite answer.
    pub fn is_indeterminate(&self) -> bool {
        matches!(
            self,
            Error::Rpc(_) | Error::Timeout { .. } | Error::Unavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indeterminate_classification() {
        assert!(!Error::PaymentFailed("no route".into()).is_indeterminate());
        assert!(!Error::InvalidPaymentRequest("bad".into()).is_indeterminate());
        assert!(Error::Rpc("eof".into()).is_indeterminate());
        assert!(Error::Timeout {
            seconds: 5,
            operation: "pay".into()
        }
        .is_indeterminate());
    }
}
