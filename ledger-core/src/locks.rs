//! Fail-fast row locks
//!
//! Every balance-affecting transaction locks the accounts it touches and the
//! invoice it mutates. Acquisition never waits: a key held by another
//! transaction yields [`Error::LockContention`] immediately, so two
//! transactions touching the same pair of accounts in opposite order cannot
//! deadlock.

use crate::types::{AccountId, InvoiceId};
use crate::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;

/// Lockable row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKey {
    /// Ledger account
    Account(AccountId),
    /// Invoice row
    Invoice(InvoiceId),
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKey::Account(id) => write!(f, "account {}", id),
            LockKey::Invoice(id) => write!(f, "invoice {}", id),
        }
    }
}

/// Process-wide lock table, keyed by row, valued by owning transaction
#[derive(Debug, Default)]
pub struct LockTable {
    held: DashMap<LockKey, u64>,
}

impl LockTable {
    /// Create empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take `key` for transaction `owner`.
    ///
    /// Returns `Ok(true)` when newly acquired, `Ok(false)` when `owner`
    /// already holds it.
    pub fn try_acquire(&self, key: LockKey, owner: u64) -> Result<bool> {
        match self.held.entry(key) {
            Entry::Occupied(held) => {
                if *held.get() == owner {
                    Ok(false)
                } else {
                    tracing::debug!(%key, owner, holder = *held.get(), "lock contention");
                    Err(Error::LockContention(key))
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(owner);
                Ok(true)
            }
        }
    }

    /// Release `key` if held by `owner`
    pub fn release(&self, key: LockKey, owner: u64) {
        self.held.remove_if(&key, |_, holder| *holder == owner);
    }

    /// Whether any transaction holds `key`
    pub fn is_held(&self, key: LockKey) -> bool {
        self.held.contains_key(&key)
    }
}
