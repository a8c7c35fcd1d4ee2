//! Satshub Ledger Core
//!
//! Double-entry accounting store for a custodial Lightning hub.
//!
//! # Architecture
//!
//! - **Double entry**: every movement is one immutable row moving an amount
//!   from a debit account to a credit account
//! - **Derived balances**: never stored, rebuilt from entries at open and
//!   kept as an in-memory cache afterwards
//! - **Fail-fast locks**: rows are locked without waiting; contention is an
//!   error surfaced to the caller
//! - **Atomic commit**: all rows of a transaction land in one RocksDB batch
//!
//! # Invariants
//!
//! - Σ(credits) == Σ(debits) over all accounts at all times
//! - `current` and `outgoing` balances are never negative after a commit
//! - Entries are never modified or deleted; mistakes are reversed
//! - Invoice states only move forward

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod error;
pub mod ledger;
pub mod locks;
pub mod metrics;
pub mod storage;
pub mod types;

// Re-exports
pub use config::Config;
pub use error::{Error, Result};
pub use ledger::{Ledger, LedgerTx};
pub use locks::LockKey;
pub use types::{
    Account, AccountId, AccountType, EntryId, EntryType, Invoice, InvoiceId, InvoiceState,
    InvoiceType, NewEntry, TransactionEntry, User, UserId, MAX_AMOUNT_SAT,
};
