//! Error types for the ledger

use crate::locks::LockKey;
use crate::types::{AccountId, InvoiceId, InvoiceState, UserId};
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// User not found
    #[error("User not found: {0}")]
    UserNotFound(UserId),

    /// Account not found
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    /// Invoice not found
    #[error("Invoice not found: {0}")]
    InvoiceNotFound(InvoiceId),

    /// Login already taken
    #[error("Login already exists: {0}")]
    DuplicateLogin(String),

    /// Malformed entry (same debit/credit account, negative amount, ...)
    #[error("Invalid entry: {0}")]
    InvalidEntry(String),

    /// Invoice state may only move forward
    #[error("Invalid invoice transition for {invoice_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        /// Invoice
        invoice_id: InvoiceId,
        /// Stored state
        from: InvoiceState,
        /// Requested state
        to: InvoiceState,
    },

    /// Commit would leave a constrained account negative
    #[error("Insufficient balance on account {account_id}: would be {balance}")]
    InsufficientBalance {
        /// Offending account
        account_id: AccountId,
        /// Balance the commit would have produced
        balance: i64,
    },

    /// Row lock held by another transaction (fail-fast, never waits)
    #[error("Lock contention on {0}")]
    LockContention(LockKey),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the operation may succeed if retried by a higher layer.
    ///
    /// The ledger itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::LockContention(_))
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
