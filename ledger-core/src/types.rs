//! Core types for the ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Integer satoshi arithmetic (no floats for money)
//! - Append-only entries, forward-only invoice states

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// User identifier
pub type UserId = u64;
/// Account identifier
pub type AccountId = u64;
/// Invoice identifier
pub type InvoiceId = u64;
/// Transaction entry identifier
pub type EntryId = u64;

/// Largest amount a single entry or invoice may carry: the 21M BTC supply cap
pub const MAX_AMOUNT_SAT: i64 = 21_000_000 * 100_000_000;

/// The four accounts every user owns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum AccountType {
    /// Liability towards the node; may go negative
    Incoming = 1,
    /// Spendable balance
    Current = 2,
    /// Sum of outgoing payments
    Outgoing = 3,
    /// Routing fees collected; unconstrained
    Fees = 4,
}

impl AccountType {
    /// All account types, in creation order
    pub const ALL: [AccountType; 4] = [
        AccountType::Incoming,
        AccountType::Current,
        AccountType::Outgoing,
        AccountType::Fees,
    ];

    /// Whether commit-time validation requires a non-negative balance
    pub fn is_balance_constrained(&self) -> bool {
        !matches!(self, AccountType::Incoming | AccountType::Fees)
    }

    /// Lower-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Incoming => "incoming",
            AccountType::Current => "current",
            AccountType::Outgoing => "outgoing",
            AccountType::Fees => "fees",
        }
    }
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hub user. Never deleted, only deactivated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// User ID
    pub id: UserId,
    /// Login name (unique)
    pub login: String,
    /// Opaque credential hash, issued by the auth layer
    pub password_hash: String,
    /// Deactivated users cannot create invoices
    pub active: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Ledger account. Balance is derived from entries, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account ID
    pub id: AccountId,
    /// Owner
    pub user_id: UserId,
    /// Account type
    pub account_type: AccountType,
}

/// Kind of ledger movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    /// Incoming invoice settled: incoming -> current
    Incoming,
    /// Outgoing payment reservation: current -> outgoing
    Outgoing,
    /// Routing fee actually paid: current -> fees
    Fee,
    /// Fee reserve held while a payment is in flight: current -> fees
    FeeReserve,
    /// Reversal of a fee reserve
    FeeReserveReversal,
    /// Reversal of an outgoing reservation
    OutgoingReversal,
}

impl EntryType {
    /// Entry type used when reversing an entry of this type
    pub fn reversal(&self) -> EntryType {
        match self {
            EntryType::FeeReserve => EntryType::FeeReserveReversal,
            _ => EntryType::OutgoingReversal,
        }
    }

    /// Whether this entry undoes another one
    pub fn is_reversal(&self) -> bool {
        matches!(
            self,
            EntryType::FeeReserveReversal | EntryType::OutgoingReversal
        )
    }
}

/// Entry to be inserted within a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    /// Owner
    pub user_id: UserId,
    /// Invoice this movement belongs to
    pub invoice_id: InvoiceId,
    /// Entry this one reverses
    pub parent_id: Option<EntryId>,
    /// Account the amount leaves
    pub debit_account_id: AccountId,
    /// Account the amount arrives at
    pub credit_account_id: AccountId,
    /// Amount in satoshis
    pub amount: i64,
    /// Kind of movement
    pub entry_type: EntryType,
}

/// Immutable double-entry row: `amount` moves from debit to credit account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionEntry {
    /// Entry ID
    pub id: EntryId,
    /// Owner
    pub user_id: UserId,
    /// Invoice this movement belongs to
    pub invoice_id: InvoiceId,
    /// Entry this one reverses
    pub parent_id: Option<EntryId>,
    /// Account the amount leaves
    pub debit_account_id: AccountId,
    /// Account the amount arrives at
    pub credit_account_id: AccountId,
    /// Amount in satoshis
    pub amount: i64,
    /// Kind of movement
    pub entry_type: EntryType,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl TransactionEntry {
    /// Compensating entry: same amount, accounts swapped, linked to `self`
    pub fn reversal(&self) -> NewEntry {
        NewEntry {
            user_id: self.user_id,
            invoice_id: self.invoice_id,
            parent_id: Some(self.id),
            debit_account_id: self.credit_account_id,
            credit_account_id: self.debit_account_id,
            amount: self.amount,
            entry_type: self.entry_type.reversal(),
        }
    }
}

/// Invoice direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum InvoiceType {
    /// Funds arriving to a user
    Incoming = 1,
    /// Funds leaving a user
    Outgoing = 2,
}

impl InvoiceType {
    /// Lower-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceType::Incoming => "incoming",
            InvoiceType::Outgoing => "outgoing",
        }
    }
}

impl fmt::Display for InvoiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Invoice life-cycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceState {
    /// Row written, external call not yet confirmed
    Initialized,
    /// Incoming invoice registered with the node
    Open,
    /// Terminal: funds moved
    Settled,
    /// Terminal: attempt failed, reservation reversed
    Error,
}

impl InvoiceState {
    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, InvoiceState::Settled | InvoiceState::Error)
    }

    fn rank(&self) -> u8 {
        match self {
            InvoiceState::Initialized => 0,
            InvoiceState::Open => 1,
            InvoiceState::Settled | InvoiceState::Error => 2,
        }
    }

    /// Forward-only transition check (staying in a non-terminal state is allowed)
    pub fn can_transition_to(&self, next: InvoiceState) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }

    /// Lower-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceState::Initialized => "initialized",
            InvoiceState::Open => "open",
            InvoiceState::Settled => "settled",
            InvoiceState::Error => "error",
        }
    }
}

impl fmt::Display for InvoiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Incoming or outgoing invoice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    /// Invoice ID (assigned on insert)
    pub id: InvoiceId,
    /// Direction
    pub invoice_type: InvoiceType,
    /// Owner
    pub user_id: UserId,
    /// Amount in satoshis
    pub amount: i64,
    /// Routing fee actually paid (outgoing only)
    pub fee: i64,
    /// Free-form memo
    pub memo: String,
    /// Hex description hash, if any
    pub description_hash: Option<String>,
    /// BOLT11 payment request
    pub payment_request: Option<String>,
    /// Hex payment hash
    pub r_hash: Option<String>,
    /// Hex preimage
    pub preimage: Option<String>,
    /// Node subscription cursor (incoming only)
    pub add_index: Option<u64>,
    /// Payee node (outgoing only)
    pub destination_pubkey: Option<String>,
    /// TLV custom records
    pub custom_records: BTreeMap<u64, Vec<u8>>,
    /// Life-cycle state
    pub state: InvoiceState,
    /// Failure reason for `error`
    pub error_message: Option<String>,
    /// Sent via keysend
    pub keysend: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Expiry time
    pub expires_at: Option<DateTime<Utc>>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
    /// Settlement time
    pub settled_at: Option<DateTime<Utc>>,
}

impl Invoice {
    /// Fresh `initialized` invoice; the id is assigned by the ledger on insert
    pub fn draft(invoice_type: InvoiceType, user_id: UserId, amount: i64) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            invoice_type,
            user_id,
            amount,
            fee: 0,
            memo: String::new(),
            description_hash: None,
            payment_request: None,
            r_hash: None,
            preimage: None,
            add_index: None,
            destination_pubkey: None,
            custom_records: BTreeMap::new(),
            state: InvoiceState::Initialized,
            error_message: None,
            keysend: false,
            created_at: now,
            expires_at: None,
            updated_at: now,
            settled_at: None,
        }
    }

    /// Whether this is an outgoing invoice still awaiting an outcome
    pub fn is_pending_outgoing(&self) -> bool {
        self.invoice_type == InvoiceType::Outgoing && self.state == InvoiceState::Initialized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constrained_accounts() {
        assert!(AccountType::Current.is_balance_constrained());
        assert!(AccountType::Outgoing.is_balance_constrained());
        assert!(!AccountType::Incoming.is_balance_constrained());
        assert!(!AccountType::Fees.is_balance_constrained());
    }

    #[test]
    fn test_state_transitions_forward_only() {
        use InvoiceState::*;
        assert!(Initialized.can_transition_to(Open));
        assert!(Initialized.can_transition_to(Settled));
        assert!(Initialized.can_transition_to(Error));
        assert!(Initialized.can_transition_to(Initialized));
        assert!(Open.can_transition_to(Settled));
        assert!(!Open.can_transition_to(Initialized));
        assert!(!Settled.can_transition_to(Error));
        assert!(!Settled.can_transition_to(Settled));
        assert!(!Error.can_transition_to(Settled));
    }

    #[test]
    fn test_reversal_swaps_accounts() {
        let entry = TransactionEntry {
            id: 7,
            user_id: 1,
            invoice_id: 3,
            parent_id: None,
            debit_account_id: 10,
            credit_account_id: 11,
            amount: 500,
            entry_type: EntryType::Outgoing,
            created_at: Utc::now(),
        };

        let reversal = entry.reversal();
        assert_eq!(reversal.parent_id, Some(7));
        assert_eq!(reversal.debit_account_id, 11);
        assert_eq!(reversal.credit_account_id, 10);
        assert_eq!(reversal.amount, 500);
        assert_eq!(reversal.entry_type, EntryType::OutgoingReversal);
    }

    #[test]
    fn test_fee_reserve_reversal_type() {
        assert_eq!(EntryType::FeeReserve.reversal(), EntryType::FeeReserveReversal);
        assert!(EntryType::FeeReserveReversal.is_reversal());
        assert!(!EntryType::Fee.is_reversal());
    }
}
