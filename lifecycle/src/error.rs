//! Error types for the life-cycle managers

use ledger_core::{InvoiceId, InvoiceState, UserId};
use thiserror::Error;

/// Result type for life-cycle operations
pub type Result<T> = std::result::Result<T, Error>;

/// Life-cycle errors
#[derive(Error, Debug)]
pub enum Error {
    /// Ledger error (storage, lock contention, commit-time balance check)
    #[error("Ledger error: {0}")]
    Ledger(#[from] ledger_core::Error),

    /// Node error outside a payment attempt
    #[error("Node error: {0}")]
    Node(#[from] node_adapters::Error),

    /// Event bus error
    #[error("Message bus error: {0}")]
    Bus(#[from] message_bus::Error),

    /// Bad request (amount, payment request, target)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Pre-check: not enough spendable balance
    #[error("Insufficient balance: {available} available, {required} required")]
    InsufficientBalance {
        /// Current balance
        available: i64,
        /// Amount plus fee reserve
        required: i64,
    },

    /// User is deactivated
    #[error("User {0} is not active")]
    UserInactive(UserId),

    /// Invoice is not an outgoing invoice awaiting payment
    #[error("Invoice {invoice_id} cannot be paid in state {state}")]
    NotPayable {
        /// Invoice
        invoice_id: InvoiceId,
        /// Current state
        state: InvoiceState,
    },

    /// Node definitively failed the payment; reservation reversed
    #[error("Payment for invoice {invoice_id} failed: {reason}")]
    PaymentFailed {
        /// Invoice
        invoice_id: InvoiceId,
        /// Reason recorded on the invoice
        reason: String,
    },

    /// Settlement stream ended with a non-cancellation error
    #[error("Invoice subscription failed: {0}")]
    SubscriptionFailed(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the caller may retry (lock contention only)
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Ledger(e) if e.is_retryable())
    }
}
