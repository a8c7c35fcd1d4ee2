//! Main ledger orchestration layer
//!
//! Ties together storage, the lock table and the derived balance cache into
//! the transactional API used by the life-cycle managers.
//!
//! # Example
//!
//! ```no_run
//! use ledger_core::{AccountType, Config, EntryType, Ledger, NewEntry};
//!
//! fn main() -> ledger_core::Result<()> {
//!     let ledger = Ledger::open(Config::default())?;
//!     let (user, _) = ledger.create_user("alice", "hash")?;
//!     let incoming = ledger.account_for(user.id, AccountType::Incoming)?;
//!     let current = ledger.account_for(user.id, AccountType::Current)?;
//!
//!     let mut tx = ledger.begin();
//!     tx.insert_entry(NewEntry {
//!         user_id: user.id,
//!         invoice_id: 1,
//!         parent_id: None,
//!         debit_account_id: incoming.id,
//!         credit_account_id: current.id,
//!         amount: 1000,
//!         entry_type: EntryType::Incoming,
//!     })?;
//!     tx.commit()?;
//!
//!     assert_eq!(ledger.balance(current.id)?, 1000);
//!     Ok(())
//! }
//! ```

use crate::{
    locks::{LockKey, LockTable},
    metrics::Metrics,
    storage::{Storage, Write},
    types::*,
    Config, Error, Result,
};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Main ledger interface
pub struct Ledger {
    /// Persistent rows
    storage: Storage,

    /// Fail-fast row locks
    locks: LockTable,

    /// Derived balances, rebuilt from entries at open
    balances: DashMap<AccountId, i64>,

    /// Account directory (accounts are immutable)
    accounts: DashMap<AccountId, Account>,

    /// (user, type) -> account
    account_index: DashMap<(UserId, AccountType), AccountId>,

    /// Serializes user creation (login uniqueness)
    signup: Mutex<()>,

    next_user_id: AtomicU64,
    next_account_id: AtomicU64,
    next_invoice_id: AtomicU64,
    next_entry_id: AtomicU64,
    next_tx_id: AtomicU64,

    /// Highest node add_index seen on an incoming invoice
    max_add_index: AtomicU64,

    /// Metrics
    metrics: Metrics,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("storage", &self.storage)
            .field("accounts", &self.accounts.len())
            .finish()
    }
}

impl Ledger {
    /// Open ledger with configuration
    pub fn open(config: Config) -> Result<Self> {
        let storage = Storage::open(&config)?;
        let (last_user, last_account, last_invoice, last_entry) = storage.last_ids()?;

        let accounts = DashMap::new();
        let account_index = DashMap::new();
        let balances = DashMap::new();
        for account in storage.all_accounts()? {
            account_index.insert((account.user_id, account.account_type), account.id);
            balances.insert(account.id, 0i64);
            accounts.insert(account.id, account);
        }

        // Replay entries: balance is never stored, only derived
        let mut entry_count = 0usize;
        for entry in storage.all_entries()? {
            *balances.entry(entry.debit_account_id).or_insert(0) -= entry.amount;
            *balances.entry(entry.credit_account_id).or_insert(0) += entry.amount;
            entry_count += 1;
        }

        let max_add_index = storage
            .all_invoices()?
            .iter()
            .filter_map(|invoice| invoice.add_index)
            .max()
            .unwrap_or(0);

        tracing::info!(
            accounts = accounts.len(),
            entries = entry_count,
            max_add_index,
            "Ledger opened"
        );

        Ok(Self {
            storage,
            locks: LockTable::new(),
            balances,
            accounts,
            account_index,
            signup: Mutex::new(()),
            next_user_id: AtomicU64::new(last_user + 1),
            next_account_id: AtomicU64::new(last_account + 1),
            next_invoice_id: AtomicU64::new(last_invoice + 1),
            next_entry_id: AtomicU64::new(last_entry + 1),
            next_tx_id: AtomicU64::new(1),
            max_add_index: AtomicU64::new(max_add_index),
            metrics: Metrics::new()?,
        })
    }

    /// Ledger metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    // Users and accounts

    /// Create a user together with its four accounts, atomically
    pub fn create_user(
        &self,
        login: impl Into<String>,
        password_hash: impl Into<String>,
    ) -> Result<(User, [Account; 4])> {
        let login = login.into();
        if login.is_empty() {
            return Err(Error::InvalidEntry("login must not be empty".to_string()));
        }

        let _guard = self.signup.lock();
        if self.storage.get_user_id_by_login(&login)?.is_some() {
            return Err(Error::DuplicateLogin(login));
        }

        let user = User {
            id: self.next_user_id.fetch_add(1, Ordering::SeqCst),
            login,
            password_hash: password_hash.into(),
            active: true,
            created_at: Utc::now(),
        };

        let accounts = AccountType::ALL.map(|account_type| Account {
            id: self.next_account_id.fetch_add(1, Ordering::SeqCst),
            user_id: user.id,
            account_type,
        });

        let mut writes = vec![
            Write::User(user.clone()),
            Write::PutIndex(Storage::index_key_login(&user.login), user.id.to_be_bytes().to_vec()),
        ];
        for account in &accounts {
            writes.push(Write::Account(*account));
            writes.push(Write::PutIndex(
                Storage::index_key_account(user.id, account.account_type),
                account.id.to_be_bytes().to_vec(),
            ));
        }
        self.storage.commit(&writes)?;

        for account in &accounts {
            self.account_index
                .insert((user.id, account.account_type), account.id);
            self.balances.insert(account.id, 0);
            self.accounts.insert(account.id, *account);
        }

        tracing::info!(user_id = user.id, login = %user.login, "User created");
        Ok((user, accounts))
    }

    /// Get user by ID
    pub fn user(&self, user_id: UserId) -> Result<User> {
        self.storage
            .get_user(user_id)?
            .ok_or(Error::UserNotFound(user_id))
    }

    /// Get user by login
    pub fn user_by_login(&self, login: &str) -> Result<Option<User>> {
        match self.storage.get_user_id_by_login(login)? {
            Some(user_id) => Ok(Some(self.user(user_id)?)),
            None => Ok(None),
        }
    }

    /// Soft-deactivate a user; accounts and history are kept
    pub fn deactivate_user(&self, user_id: UserId) -> Result<User> {
        let mut user = self.user(user_id)?;
        user.active = false;
        self.storage.commit(&[Write::User(user.clone())])?;
        tracing::info!(user_id, "User deactivated");
        Ok(user)
    }

    /// Account of the given type for a user
    pub fn account_for(&self, user_id: UserId, account_type: AccountType) -> Result<Account> {
        let account_id = self
            .account_index
            .get(&(user_id, account_type))
            .map(|id| *id)
            .ok_or_else(|| Error::AccountNotFound(format!("{} of user {}", account_type, user_id)))?;
        self.account(account_id)
    }

    /// Account by ID
    pub fn account(&self, account_id: AccountId) -> Result<Account> {
        self.accounts
            .get(&account_id)
            .map(|account| *account)
            .ok_or_else(|| Error::AccountNotFound(account_id.to_string()))
    }

    // Balances

    /// Σ credits − Σ debits of committed entries
    pub fn balance(&self, account_id: AccountId) -> Result<i64> {
        self.balances
            .get(&account_id)
            .map(|balance| *balance)
            .ok_or_else(|| Error::AccountNotFound(account_id.to_string()))
    }

    /// Balance of a user's account of the given type
    pub fn balance_of(&self, user_id: UserId, account_type: AccountType) -> Result<i64> {
        let account = self.account_for(user_id, account_type)?;
        self.balance(account.id)
    }

    /// Balance recomputed by scanning the owner's entries (audit path)
    pub fn recompute_balance(&self, account_id: AccountId) -> Result<i64> {
        let account = self.account(account_id)?;
        let mut balance = 0i64;
        for entry in self.entries_for_user(account.user_id)? {
            if entry.credit_account_id == account_id {
                balance += entry.amount;
            }
            if entry.debit_account_id == account_id {
                balance -= entry.amount;
            }
        }
        Ok(balance)
    }

    // Invoices and entries

    /// Invoice by ID
    pub fn invoice(&self, invoice_id: InvoiceId) -> Result<Invoice> {
        self.storage
            .get_invoice(invoice_id)?
            .ok_or(Error::InvoiceNotFound(invoice_id))
    }

    /// Invoice by ID, only if owned by `user_id`
    pub fn invoice_for_user(&self, user_id: UserId, invoice_id: InvoiceId) -> Result<Invoice> {
        let invoice = self.invoice(invoice_id)?;
        if invoice.user_id != user_id {
            return Err(Error::InvoiceNotFound(invoice_id));
        }
        Ok(invoice)
    }

    /// First invoice of `invoice_type` with `r_hash` whose state is not `exclude_state`
    pub fn find_invoice_by_r_hash(
        &self,
        invoice_type: InvoiceType,
        r_hash: &str,
        exclude_state: Option<InvoiceState>,
    ) -> Result<Option<Invoice>> {
        for invoice_id in self.storage.invoice_ids_by_r_hash(invoice_type, r_hash)? {
            let invoice = self.invoice(invoice_id)?;
            if Some(invoice.state) != exclude_state {
                return Ok(Some(invoice));
            }
        }
        Ok(None)
    }

    /// A user's invoices, optionally filtered by direction, in id order
    pub fn invoices_for_user(
        &self,
        user_id: UserId,
        invoice_type: Option<InvoiceType>,
    ) -> Result<Vec<Invoice>> {
        let mut invoices = Vec::new();
        for invoice_id in self.storage.invoice_ids_for_user(user_id)? {
            let invoice = self.invoice(invoice_id)?;
            if invoice_type.map_or(true, |t| t == invoice.invoice_type) {
                invoices.push(invoice);
            }
        }
        Ok(invoices)
    }

    /// Outgoing invoices still `initialized`
    pub fn pending_outgoing_invoices(&self) -> Result<Vec<Invoice>> {
        self.storage
            .pending_outgoing_ids()?
            .into_iter()
            .map(|invoice_id| self.invoice(invoice_id))
            .collect()
    }

    /// Highest add_index recorded on any incoming invoice
    pub fn max_add_index(&self) -> u64 {
        self.max_add_index.load(Ordering::SeqCst)
    }

    /// Entries recorded against an invoice, in id order
    pub fn entries_for_invoice(&self, invoice_id: InvoiceId) -> Result<Vec<TransactionEntry>> {
        self.load_entries(self.storage.entry_ids_for_invoice(invoice_id)?)
    }

    /// Entries owned by a user, in id order
    pub fn entries_for_user(&self, user_id: UserId) -> Result<Vec<TransactionEntry>> {
        self.load_entries(self.storage.entry_ids_for_user(user_id)?)
    }

    fn load_entries(&self, ids: Vec<EntryId>) -> Result<Vec<TransactionEntry>> {
        ids.into_iter()
            .map(|entry_id| {
                self.storage
                    .get_entry(entry_id)?
                    .ok_or_else(|| Error::Storage(format!("dangling entry index {}", entry_id)))
            })
            .collect()
    }

    // Transactions

    /// Start a transaction. Nothing is visible to others until `commit`.
    pub fn begin(&self) -> LedgerTx<'_> {
        LedgerTx {
            ledger: self,
            id: self.next_tx_id.fetch_add(1, Ordering::SeqCst),
            held: Vec::new(),
            writes: Vec::new(),
            deltas: HashMap::new(),
            invoices: HashMap::new(),
            entries: Vec::new(),
        }
    }

    fn acquire(&self, key: LockKey, owner: u64) -> Result<bool> {
        self.locks.try_acquire(key, owner).map_err(|e| {
            self.metrics.record_lock_contention();
            e
        })
    }
}

/// Atomic unit of ledger work.
///
/// Locks are taken fail-fast as rows are touched and released on commit or
/// drop. Dropping an uncommitted transaction discards every staged write.
pub struct LedgerTx<'a> {
    ledger: &'a Ledger,
    id: u64,
    held: Vec<LockKey>,
    writes: Vec<Write>,
    deltas: HashMap<AccountId, i64>,
    invoices: HashMap<InvoiceId, Invoice>,
    entries: Vec<TransactionEntry>,
}

impl std::fmt::Debug for LedgerTx<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerTx")
            .field("id", &self.id)
            .field("held", &self.held)
            .field("writes", &self.writes.len())
            .finish()
    }
}

impl<'a> LedgerTx<'a> {
    fn lock(&mut self, key: LockKey) -> Result<()> {
        if self.ledger.acquire(key, self.id)? {
            self.held.push(key);
        }
        Ok(())
    }

    /// Take the row lock on an invoice (fail-fast)
    pub fn lock_invoice(&mut self, invoice_id: InvoiceId) -> Result<()> {
        self.lock(LockKey::Invoice(invoice_id))
    }

    /// Invoice as seen by this transaction (staged version first)
    pub fn invoice(&self, invoice_id: InvoiceId) -> Result<Invoice> {
        match self.invoices.get(&invoice_id) {
            Some(invoice) => Ok(invoice.clone()),
            None => self.ledger.invoice(invoice_id),
        }
    }

    /// Stage a new invoice; assigns and returns its id
    pub fn insert_invoice(&mut self, mut invoice: Invoice) -> Result<Invoice> {
        invoice.id = self.ledger.next_invoice_id.fetch_add(1, Ordering::SeqCst);
        self.lock_invoice(invoice.id)?;

        self.writes.push(Write::PutIndex(
            Storage::index_key_user_invoice(invoice.user_id, invoice.id),
            vec![],
        ));
        self.stage_invoice(None, invoice.clone());
        Ok(invoice)
    }

    /// Stage an update to an existing invoice (takes its lock).
    ///
    /// The state may only move forward; terminal invoices are immutable.
    pub fn update_invoice(&mut self, mut invoice: Invoice) -> Result<Invoice> {
        self.lock_invoice(invoice.id)?;
        let previous = self.invoice(invoice.id)?;

        if !previous.state.can_transition_to(invoice.state) {
            return Err(Error::InvalidTransition {
                invoice_id: invoice.id,
                from: previous.state,
                to: invoice.state,
            });
        }

        invoice.updated_at = Utc::now();
        self.stage_invoice(Some(&previous), invoice.clone());
        Ok(invoice)
    }

    fn stage_invoice(&mut self, previous: Option<&Invoice>, invoice: Invoice) {
        if let Some(r_hash) = invoice.r_hash.as_deref() {
            if previous.and_then(|p| p.r_hash.as_deref()) != Some(r_hash) {
                self.writes.push(Write::PutIndex(
                    Storage::index_key_r_hash(invoice.invoice_type, r_hash, Some(invoice.id)),
                    vec![],
                ));
            }
        }

        let pending_key = Storage::index_key_pending_outgoing(invoice.id);
        if invoice.is_pending_outgoing() {
            self.writes.push(Write::PutIndex(pending_key, vec![]));
        } else if previous.map_or(false, Invoice::is_pending_outgoing) {
            self.writes.push(Write::DeleteIndex(pending_key));
        }

        self.writes.push(Write::Invoice(invoice.clone()));
        self.invoices.insert(invoice.id, invoice);
    }

    /// Stage an entry; locks both accounts (fail-fast)
    pub fn insert_entry(&mut self, entry: NewEntry) -> Result<TransactionEntry> {
        if entry.debit_account_id == entry.credit_account_id {
            return Err(Error::InvalidEntry(format!(
                "debit and credit account are both {}",
                entry.debit_account_id
            )));
        }
        if entry.amount < 0 {
            return Err(Error::InvalidEntry(format!("negative amount {}", entry.amount)));
        }
        if entry.amount > MAX_AMOUNT_SAT {
            return Err(Error::InvalidEntry(format!(
                "amount {} above {}",
                entry.amount, MAX_AMOUNT_SAT
            )));
        }

        let debit = self.ledger.account(entry.debit_account_id)?;
        let credit = self.ledger.account(entry.credit_account_id)?;
        if debit.user_id != entry.user_id || credit.user_id != entry.user_id {
            return Err(Error::InvalidEntry(format!(
                "accounts {} / {} do not belong to user {}",
                debit.id, credit.id, entry.user_id
            )));
        }

        self.lock(LockKey::Account(debit.id))?;
        self.lock(LockKey::Account(credit.id))?;

        let row = TransactionEntry {
            id: self.ledger.next_entry_id.fetch_add(1, Ordering::SeqCst),
            user_id: entry.user_id,
            invoice_id: entry.invoice_id,
            parent_id: entry.parent_id,
            debit_account_id: debit.id,
            credit_account_id: credit.id,
            amount: entry.amount,
            entry_type: entry.entry_type,
            created_at: Utc::now(),
        };

        let debit_delta = self.deltas.get(&debit.id).copied().unwrap_or(0);
        let credit_delta = self.deltas.get(&credit.id).copied().unwrap_or(0);
        let (Some(debit_delta), Some(credit_delta)) = (
            debit_delta.checked_sub(row.amount),
            credit_delta.checked_add(row.amount),
        ) else {
            return Err(Error::InvalidEntry(format!(
                "amount {} overflows the transaction total",
                row.amount
            )));
        };
        self.deltas.insert(debit.id, debit_delta);
        self.deltas.insert(credit.id, credit_delta);

        self.writes.push(Write::Entry(row.clone()));
        self.writes.push(Write::PutIndex(
            Storage::index_key_invoice_entry(row.invoice_id, row.id),
            vec![],
        ));
        self.writes.push(Write::PutIndex(
            Storage::index_key_user_entry(row.user_id, row.id),
            vec![],
        ));
        self.entries.push(row.clone());

        Ok(row)
    }

    /// Committed entries of an invoice plus those staged here
    pub fn entries_for_invoice(&self, invoice_id: InvoiceId) -> Result<Vec<TransactionEntry>> {
        let mut entries = self.ledger.entries_for_invoice(invoice_id)?;
        entries.extend(
            self.entries
                .iter()
                .filter(|entry| entry.invoice_id == invoice_id)
                .cloned(),
        );
        Ok(entries)
    }

    /// Balance this transaction would leave on `account_id`
    pub fn balance(&self, account_id: AccountId) -> Result<i64> {
        let committed = self.ledger.balance(account_id)?;
        let delta = self.deltas.get(&account_id).copied().unwrap_or(0);
        committed
            .checked_add(delta)
            .ok_or_else(|| Error::InvalidEntry(format!("balance overflow on account {}", account_id)))
    }

    /// Validate the net effect and write everything atomically.
    ///
    /// Constrained accounts (all but `incoming` and `fees`) must end
    /// non-negative; intermediate negatives inside the transaction are fine.
    pub fn commit(self) -> Result<Vec<TransactionEntry>> {
        let start = Instant::now();

        for &account_id in self.deltas.keys() {
            let account = self.ledger.account(account_id)?;
            let balance = self.balance(account_id)?;
            if !account.account_type.is_balance_constrained() {
                continue;
            }
            if balance < 0 {
                self.ledger.metrics.record_rejected();
                tracing::warn!(
                    account_id,
                    account_type = %account.account_type,
                    balance,
                    "Commit rejected: balance would go negative"
                );
                return Err(Error::InsufficientBalance { account_id, balance });
            }
        }

        self.ledger.storage.commit(&self.writes)?;

        for (&account_id, &delta) in &self.deltas {
            *self.ledger.balances.entry(account_id).or_insert(0) += delta;
        }
        for invoice in self.invoices.values() {
            if let Some(add_index) = invoice.add_index {
                self.ledger
                    .max_add_index
                    .fetch_max(add_index, Ordering::SeqCst);
            }
        }

        self.ledger
            .metrics
            .record_commit(self.entries.len(), start.elapsed().as_secs_f64());

        tracing::debug!(tx = self.id, entries = self.entries.len(), "Transaction committed");

        Ok(self.entries.clone())
    }
}

impl Drop for LedgerTx<'_> {
    fn drop(&mut self) {
        for key in self.held.drain(..) {
            self.ledger.locks.release(key, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_ledger() -> (Ledger, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let ledger = Ledger::open(Config::with_data_dir(temp_dir.path())).unwrap();
        (ledger, temp_dir)
    }

    fn entry(
        ledger: &Ledger,
        user_id: UserId,
        from: AccountType,
        to: AccountType,
        amount: i64,
    ) -> NewEntry {
        NewEntry {
            user_id,
            invoice_id: 1,
            parent_id: None,
            debit_account_id: ledger.account_for(user_id, from).unwrap().id,
            credit_account_id: ledger.account_for(user_id, to).unwrap().id,
            amount,
            entry_type: EntryType::Incoming,
        }
    }

    fn fund(ledger: &Ledger, user_id: UserId, amount: i64) {
        let mut tx = ledger.begin();
        tx.insert_entry(entry(ledger, user_id, AccountType::Incoming, AccountType::Current, amount))
            .unwrap();
        tx.commit().unwrap();
    }

    #[test]
    fn test_create_user_creates_four_accounts() {
        let (ledger, _temp) = test_ledger();
        let (user, accounts) = ledger.create_user("alice", "hash").unwrap();

        for (account, account_type) in accounts.iter().zip(AccountType::ALL) {
            assert_eq!(account.user_id, user.id);
            assert_eq!(ledger.account_for(user.id, account_type).unwrap(), *account);
            assert_eq!(ledger.balance(account.id).unwrap(), 0);
        }
    }

    #[test]
    fn test_duplicate_login_rejected() {
        let (ledger, _temp) = test_ledger();
        ledger.create_user("alice", "hash").unwrap();
        assert!(matches!(
            ledger.create_user("alice", "other"),
            Err(Error::DuplicateLogin(_))
        ));
    }

    #[test]
    fn test_incoming_may_go_negative() {
        let (ledger, _temp) = test_ledger();
        let (user, _) = ledger.create_user("alice", "hash").unwrap();

        fund(&ledger, user.id, 1000);

        assert_eq!(ledger.balance_of(user.id, AccountType::Current).unwrap(), 1000);
        assert_eq!(ledger.balance_of(user.id, AccountType::Incoming).unwrap(), -1000);
    }

    #[test]
    fn test_overdraft_rejected_atomically() {
        let (ledger, _temp) = test_ledger();
        let (user, _) = ledger.create_user("alice", "hash").unwrap();
        fund(&ledger, user.id, 100);

        let mut tx = ledger.begin();
        tx.insert_entry(entry(&ledger, user.id, AccountType::Current, AccountType::Outgoing, 60))
            .unwrap();
        tx.insert_entry(entry(&ledger, user.id, AccountType::Current, AccountType::Fees, 60))
            .unwrap();
        let err = tx.commit().unwrap_err();
        assert!(matches!(err, Error::InsufficientBalance { balance: -20, .. }));

        assert_eq!(ledger.balance_of(user.id, AccountType::Current).unwrap(), 100);
        assert_eq!(ledger.entries_for_user(user.id).unwrap().len(), 1);
    }

    #[test]
    fn test_temporary_negative_within_transaction() {
        let (ledger, _temp) = test_ledger();
        let (user, _) = ledger.create_user("alice", "hash").unwrap();

        // Debit first, credit afterwards: only the net result is checked
        let mut tx = ledger.begin();
        tx.insert_entry(entry(&ledger, user.id, AccountType::Current, AccountType::Outgoing, 50))
            .unwrap();
        tx.insert_entry(entry(&ledger, user.id, AccountType::Incoming, AccountType::Current, 50))
            .unwrap();
        tx.commit().unwrap();

        assert_eq!(ledger.balance_of(user.id, AccountType::Current).unwrap(), 0);
        assert_eq!(ledger.balance_of(user.id, AccountType::Outgoing).unwrap(), 50);
    }

    #[test]
    fn test_same_account_entry_rejected() {
        let (ledger, _temp) = test_ledger();
        let (user, _) = ledger.create_user("alice", "hash").unwrap();

        let mut tx = ledger.begin();
        let err = tx
            .insert_entry(entry(&ledger, user.id, AccountType::Current, AccountType::Current, 1))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidEntry(_)));
    }

    #[test]
    fn test_amount_above_supply_rejected() {
        let (ledger, _temp) = test_ledger();
        let (user, _) = ledger.create_user("alice", "hash").unwrap();

        let mut tx = ledger.begin();
        tx.insert_entry(entry(
            &ledger,
            user.id,
            AccountType::Incoming,
            AccountType::Current,
            MAX_AMOUNT_SAT,
        ))
        .unwrap();
        let err = tx
            .insert_entry(entry(
                &ledger,
                user.id,
                AccountType::Incoming,
                AccountType::Current,
                MAX_AMOUNT_SAT + 1,
            ))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidEntry(_)));
    }

    #[test]
    fn test_transaction_total_overflow_rejected() {
        let (ledger, _temp) = test_ledger();
        let (user, _) = ledger.create_user("alice", "hash").unwrap();

        let mut tx = ledger.begin();
        let limit = i64::MAX / MAX_AMOUNT_SAT + 1;
        let mut overflowed = false;
        for _ in 0..limit {
            let result = tx.insert_entry(entry(
                &ledger,
                user.id,
                AccountType::Incoming,
                AccountType::Current,
                MAX_AMOUNT_SAT,
            ));
            if let Err(err) = result {
                assert!(matches!(err, Error::InvalidEntry(_)));
                overflowed = true;
                break;
            }
        }
        assert!(overflowed);
        drop(tx);
        assert_eq!(ledger.balance_of(user.id, AccountType::Current).unwrap(), 0);
    }

    #[test]
    fn test_committed_balance_overflow_rejected() {
        let (ledger, _temp) = test_ledger();
        let (user, _) = ledger.create_user("alice", "hash").unwrap();

        // Fill `current` close to the top, one transaction at a time
        let per_tx = i64::MAX / MAX_AMOUNT_SAT / 2;
        let mut tx = ledger.begin();
        for _ in 0..per_tx {
            tx.insert_entry(entry(
                &ledger,
                user.id,
                AccountType::Incoming,
                AccountType::Current,
                MAX_AMOUNT_SAT,
            ))
            .unwrap();
        }
        tx.commit().unwrap();

        let mut tx = ledger.begin();
        for _ in 0..per_tx + 2 {
            tx.insert_entry(entry(
                &ledger,
                user.id,
                AccountType::Incoming,
                AccountType::Current,
                MAX_AMOUNT_SAT,
            ))
            .unwrap();
        }
        assert!(matches!(tx.commit(), Err(Error::InvalidEntry(_))));
        assert_eq!(
            ledger.balance_of(user.id, AccountType::Current).unwrap(),
            per_tx * MAX_AMOUNT_SAT
        );
    }

    #[test]
    fn test_concurrent_debit_fails_fast() {
        let (ledger, _temp) = test_ledger();
        let (user, _) = ledger.create_user("alice", "hash").unwrap();
        fund(&ledger, user.id, 1000);

        let mut first = ledger.begin();
        first
            .insert_entry(entry(&ledger, user.id, AccountType::Current, AccountType::Outgoing, 500))
            .unwrap();

        let mut second = ledger.begin();
        let err = second
            .insert_entry(entry(&ledger, user.id, AccountType::Current, AccountType::Outgoing, 500))
            .unwrap_err();
        assert!(matches!(err, Error::LockContention(LockKey::Account(_))));
        assert_eq!(ledger.metrics().lock_contention_total.get(), 1);
        drop(second);

        first.commit().unwrap();
        assert_eq!(ledger.balance_of(user.id, AccountType::Current).unwrap(), 500);

        // Locks released on commit
        let mut third = ledger.begin();
        third
            .insert_entry(entry(&ledger, user.id, AccountType::Current, AccountType::Outgoing, 500))
            .unwrap();
        third.commit().unwrap();
    }

    #[test]
    fn test_dropped_tx_rolls_back() {
        let (ledger, _temp) = test_ledger();
        let (user, _) = ledger.create_user("alice", "hash").unwrap();

        {
            let mut tx = ledger.begin();
            tx.insert_invoice(Invoice::draft(InvoiceType::Incoming, user.id, 10))
                .unwrap();
            tx.insert_entry(entry(&ledger, user.id, AccountType::Incoming, AccountType::Current, 10))
                .unwrap();
        }

        assert_eq!(ledger.balance_of(user.id, AccountType::Current).unwrap(), 0);
        assert!(ledger.invoices_for_user(user.id, None).unwrap().is_empty());
    }

    #[test]
    fn test_invoice_state_forward_only() {
        let (ledger, _temp) = test_ledger();
        let (user, _) = ledger.create_user("alice", "hash").unwrap();

        let mut tx = ledger.begin();
        let mut invoice = tx
            .insert_invoice(Invoice::draft(InvoiceType::Outgoing, user.id, 10))
            .unwrap();
        tx.commit().unwrap();
        assert_eq!(ledger.pending_outgoing_invoices().unwrap().len(), 1);

        invoice.state = InvoiceState::Error;
        let mut tx = ledger.begin();
        tx.update_invoice(invoice.clone()).unwrap();
        tx.commit().unwrap();
        assert!(ledger.pending_outgoing_invoices().unwrap().is_empty());

        invoice.state = InvoiceState::Settled;
        let mut tx = ledger.begin();
        assert!(matches!(
            tx.update_invoice(invoice),
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_find_by_r_hash_excludes_state() {
        let (ledger, _temp) = test_ledger();
        let (user, _) = ledger.create_user("alice", "hash").unwrap();
        let r_hash = "cd".repeat(32);

        let mut draft = Invoice::draft(InvoiceType::Incoming, user.id, 10);
        draft.r_hash = Some(r_hash.clone());
        draft.state = InvoiceState::Settled;
        let mut tx = ledger.begin();
        tx.insert_invoice(draft).unwrap();
        tx.commit().unwrap();

        assert!(ledger
            .find_invoice_by_r_hash(InvoiceType::Incoming, &r_hash, Some(InvoiceState::Settled))
            .unwrap()
            .is_none());
        assert!(ledger
            .find_invoice_by_r_hash(InvoiceType::Incoming, &r_hash, None)
            .unwrap()
            .is_some());
        assert!(ledger
            .find_invoice_by_r_hash(InvoiceType::Outgoing, &r_hash, None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_reopen_rebuilds_balances_and_sequences() {
        let temp_dir = TempDir::new().unwrap();
        let user_id;
        {
            let ledger = Ledger::open(Config::with_data_dir(temp_dir.path())).unwrap();
            let (user, _) = ledger.create_user("alice", "hash").unwrap();
            user_id = user.id;

            let mut tx = ledger.begin();
            let mut invoice = tx
                .insert_invoice(Invoice::draft(InvoiceType::Incoming, user.id, 700))
                .unwrap();
            invoice.add_index = Some(42);
            invoice.state = InvoiceState::Open;
            tx.update_invoice(invoice).unwrap();
            tx.insert_entry(entry(&ledger, user.id, AccountType::Incoming, AccountType::Current, 700))
                .unwrap();
            tx.commit().unwrap();
        }

        let ledger = Ledger::open(Config::with_data_dir(temp_dir.path())).unwrap();
        assert_eq!(ledger.balance_of(user_id, AccountType::Current).unwrap(), 700);
        assert_eq!(ledger.max_add_index(), 42);

        let (bob, _) = ledger.create_user("bob", "hash").unwrap();
        assert_eq!(bob.id, user_id + 1);
        assert_eq!(ledger.user_by_login("alice").unwrap().unwrap().id, user_id);
    }

    #[test]
    fn test_recompute_matches_cache() {
        let (ledger, _temp) = test_ledger();
        let (user, accounts) = ledger.create_user("alice", "hash").unwrap();
        fund(&ledger, user.id, 300);

        let mut tx = ledger.begin();
        tx.insert_entry(entry(&ledger, user.id, AccountType::Current, AccountType::Outgoing, 120))
            .unwrap();
        tx.commit().unwrap();

        for account in accounts {
            assert_eq!(
                ledger.recompute_balance(account.id).unwrap(),
                ledger.balance(account.id).unwrap()
            );
        }
    }

    #[test]
    fn test_deactivate_user() {
        let (ledger, _temp) = test_ledger();
        let (user, _) = ledger.create_user("alice", "hash").unwrap();
        assert!(!ledger.deactivate_user(user.id).unwrap().active);
        assert!(!ledger.user(user.id).unwrap().active);
    }
}
