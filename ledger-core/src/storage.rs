//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `users` - Users (key: user_id)
//! - `accounts` - Accounts (key: account_id)
//! - `invoices` - Invoices (key: invoice_id)
//! - `entries` - Append-only transaction entries (key: entry_id)
//! - `indices` - Secondary indices for fast lookups
//!
//! All ids are encoded big-endian so iteration order is id order.

use crate::{
    error::{Error, Result},
    types::{Account, AccountType, Invoice, InvoiceId, InvoiceType, TransactionEntry, User, UserId},
    Config,
};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch,
    WriteOptions, DB,
};
use serde::{de::DeserializeOwned, Serialize};

/// Column family names
const CF_USERS: &str = "users";
const CF_ACCOUNTS: &str = "accounts";
const CF_INVOICES: &str = "invoices";
const CF_ENTRIES: &str = "entries";
const CF_INDICES: &str = "indices";

/// Index key prefixes
const IDX_LOGIN: u8 = b'L';
const IDX_ACCOUNT: u8 = b'A';
const IDX_R_HASH: u8 = b'R';
const IDX_USER_INVOICE: u8 = b'U';
const IDX_INVOICE_ENTRY: u8 = b'E';
const IDX_USER_ENTRY: u8 = b'N';
const IDX_PENDING_OUTGOING: u8 = b'P';

/// Single staged write, applied atomically with the rest of its transaction
#[derive(Debug, Clone)]
pub(crate) enum Write {
    User(User),
    Account(Account),
    Invoice(Invoice),
    Entry(TransactionEntry),
    PutIndex(Vec<u8>, Vec<u8>),
    DeleteIndex(Vec<u8>),
}

/// Storage wrapper for RocksDB
pub struct Storage {
    db: DB,
    sync_writes: bool,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.db.path())
            .finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        // Database options
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        // Tuning from config
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_USERS, Self::cf_options_rows()),
            ColumnFamilyDescriptor::new(CF_ACCOUNTS, Self::cf_options_rows()),
            ColumnFamilyDescriptor::new(CF_INVOICES, Self::cf_options_rows()),
            ColumnFamilyDescriptor::new(CF_ENTRIES, Self::cf_options_entries()),
            ColumnFamilyDescriptor::new(CF_INDICES, Self::cf_options_indices()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened ledger store");

        Ok(Self {
            db,
            sync_writes: config.rocksdb.sync_writes,
        })
    }

    // Column family options

    fn cf_options_rows() -> Options {
        let mut opts = Options::default();
        // Rows are frequently read, use LZ4 for speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_entries() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts.set_bottommost_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_indices() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn get<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf_handle(cf)?;
        match self.db.get_cf(cf, key)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    fn scan_all<T: DeserializeOwned>(&self, cf: &str) -> Result<Vec<T>> {
        let cf = self.cf_handle(cf)?;
        let mut rows = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            rows.push(bincode::deserialize(&value)?);
        }
        Ok(rows)
    }

    fn last_id(&self, cf: &str) -> Result<u64> {
        let cf = self.cf_handle(cf)?;
        match self.db.iterator_cf(cf, IteratorMode::End).next() {
            Some(item) => {
                let (key, _) = item?;
                Ok(decode_id(&key))
            }
            None => Ok(0),
        }
    }

    /// Keys of the index under `prefix`
    fn scan_index(&self, prefix: &[u8]) -> Result<Vec<Box<[u8]>>> {
        let cf = self.cf_handle(CF_INDICES)?;
        let mut keys = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key);
        }
        Ok(keys)
    }

    // Row reads

    /// Get user by ID
    pub fn get_user(&self, user_id: UserId) -> Result<Option<User>> {
        self.get(CF_USERS, &user_id.to_be_bytes())
    }

    /// Get user ID by login
    pub fn get_user_id_by_login(&self, login: &str) -> Result<Option<UserId>> {
        let cf = self.cf_handle(CF_INDICES)?;
        Ok(self
            .db
            .get_cf(cf, Self::index_key_login(login))?
            .map(|value| decode_id(&value)))
    }

    /// Get invoice by ID
    pub fn get_invoice(&self, invoice_id: InvoiceId) -> Result<Option<Invoice>> {
        self.get(CF_INVOICES, &invoice_id.to_be_bytes())
    }

    /// Get entry by ID
    pub fn get_entry(&self, entry_id: u64) -> Result<Option<TransactionEntry>> {
        self.get(CF_ENTRIES, &entry_id.to_be_bytes())
    }

    /// All accounts (loaded once at open)
    pub fn all_accounts(&self) -> Result<Vec<Account>> {
        self.scan_all(CF_ACCOUNTS)
    }

    /// All entries, in id order (balance replay at open)
    pub fn all_entries(&self) -> Result<Vec<TransactionEntry>> {
        self.scan_all(CF_ENTRIES)
    }

    /// All invoices, in id order
    pub fn all_invoices(&self) -> Result<Vec<Invoice>> {
        self.scan_all(CF_INVOICES)
    }

    /// Highest ids in use: (users, accounts, invoices, entries)
    pub fn last_ids(&self) -> Result<(u64, u64, u64, u64)> {
        Ok((
            self.last_id(CF_USERS)?,
            self.last_id(CF_ACCOUNTS)?,
            self.last_id(CF_INVOICES)?,
            self.last_id(CF_ENTRIES)?,
        ))
    }

    // Index reads

    /// Invoice IDs carrying `r_hash` for the given direction
    pub fn invoice_ids_by_r_hash(
        &self,
        invoice_type: InvoiceType,
        r_hash: &str,
    ) -> Result<Vec<InvoiceId>> {
        let prefix = Self::index_key_r_hash(invoice_type, r_hash, None);
        Ok(self
            .scan_index(&prefix)?
            .iter()
            .map(|key| decode_id(&key[prefix.len()..]))
            .collect())
    }

    /// Invoice IDs owned by a user
    pub fn invoice_ids_for_user(&self, user_id: UserId) -> Result<Vec<InvoiceId>> {
        let prefix = Self::index_key_pair(IDX_USER_INVOICE, user_id, None);
        Ok(self
            .scan_index(&prefix)?
            .iter()
            .map(|key| decode_id(&key[prefix.len()..]))
            .collect())
    }

    /// Entry IDs recorded against an invoice
    pub fn entry_ids_for_invoice(&self, invoice_id: InvoiceId) -> Result<Vec<u64>> {
        let prefix = Self::index_key_pair(IDX_INVOICE_ENTRY, invoice_id, None);
        Ok(self
            .scan_index(&prefix)?
            .iter()
            .map(|key| decode_id(&key[prefix.len()..]))
            .collect())
    }

    /// Entry IDs owned by a user
    pub fn entry_ids_for_user(&self, user_id: UserId) -> Result<Vec<u64>> {
        let prefix = Self::index_key_pair(IDX_USER_ENTRY, user_id, None);
        Ok(self
            .scan_index(&prefix)?
            .iter()
            .map(|key| decode_id(&key[prefix.len()..]))
            .collect())
    }

    /// Outgoing invoices still `initialized`
    pub fn pending_outgoing_ids(&self) -> Result<Vec<InvoiceId>> {
        let prefix = [IDX_PENDING_OUTGOING];
        Ok(self
            .scan_index(&prefix)?
            .iter()
            .map(|key| decode_id(&key[1..]))
            .collect())
    }

    // Atomic commit

    /// Apply staged writes in a single write batch
    pub(crate) fn commit(&self, writes: &[Write]) -> Result<()> {
        let mut batch = WriteBatch::default();

        for write in writes {
            match write {
                Write::User(user) => {
                    batch.put_cf(
                        self.cf_handle(CF_USERS)?,
                        user.id.to_be_bytes(),
                        bincode::serialize(user)?,
                    );
                }
                Write::Account(account) => {
                    batch.put_cf(
                        self.cf_handle(CF_ACCOUNTS)?,
                        account.id.to_be_bytes(),
                        bincode::serialize(account)?,
                    );
                }
                Write::Invoice(invoice) => {
                    batch.put_cf(
                        self.cf_handle(CF_INVOICES)?,
                        invoice.id.to_be_bytes(),
                        bincode::serialize(invoice)?,
                    );
                }
                Write::Entry(entry) => {
                    batch.put_cf(
                        self.cf_handle(CF_ENTRIES)?,
                        entry.id.to_be_bytes(),
                        bincode::serialize(entry)?,
                    );
                }
                Write::PutIndex(key, value) => {
                    batch.put_cf(self.cf_handle(CF_INDICES)?, key, value);
                }
                Write::DeleteIndex(key) => {
                    batch.delete_cf(self.cf_handle(CF_INDICES)?, key);
                }
            }
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(())
    }

    // Index key helpers

    pub(crate) fn index_key_login(login: &str) -> Vec<u8> {
        let mut key = vec![IDX_LOGIN];
        key.extend_from_slice(login.as_bytes());
        key
    }

    pub(crate) fn index_key_account(user_id: UserId, account_type: AccountType) -> Vec<u8> {
        let mut key = vec![IDX_ACCOUNT];
        key.extend_from_slice(&user_id.to_be_bytes());
        key.push(account_type as u8);
        key
    }

    pub(crate) fn index_key_r_hash(
        invoice_type: InvoiceType,
        r_hash: &str,
        invoice_id: Option<InvoiceId>,
    ) -> Vec<u8> {
        let mut key = vec![IDX_R_HASH, invoice_type as u8];
        key.extend_from_slice(r_hash.as_bytes());
        key.push(b'|'); // Separator
        if let Some(id) = invoice_id {
            key.extend_from_slice(&id.to_be_bytes());
        }
        key
    }

    fn index_key_pair(tag: u8, owner: u64, child: Option<u64>) -> Vec<u8> {
        let mut key = vec![tag];
        key.extend_from_slice(&owner.to_be_bytes());
        if let Some(child) = child {
            key.extend_from_slice(&child.to_be_bytes());
        }
        key
    }

    pub(crate) fn index_key_user_invoice(user_id: UserId, invoice_id: InvoiceId) -> Vec<u8> {
        Self::index_key_pair(IDX_USER_INVOICE, user_id, Some(invoice_id))
    }

    pub(crate) fn index_key_invoice_entry(invoice_id: InvoiceId, entry_id: u64) -> Vec<u8> {
        Self::index_key_pair(IDX_INVOICE_ENTRY, invoice_id, Some(entry_id))
    }

    pub(crate) fn index_key_user_entry(user_id: UserId, entry_id: u64) -> Vec<u8> {
        Self::index_key_pair(IDX_USER_ENTRY, user_id, Some(entry_id))
    }

    pub(crate) fn index_key_pending_outgoing(invoice_id: InvoiceId) -> Vec<u8> {
        let mut key = vec![IDX_PENDING_OUTGOING];
        key.extend_from_slice(&invoice_id.to_be_bytes());
        key
    }
}

/// Decode a big-endian id from the first 8 bytes
fn decode_id(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let len = bytes.len().min(8);
    buf[..len].copy_from_slice(&bytes[..len]);
    u64::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntryType, InvoiceState};
    use chrono::Utc;
    use tempfile::TempDir;

    fn test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::with_data_dir(temp_dir.path());
        (Storage::open(&config).unwrap(), temp_dir)
    }

    fn test_entry(id: u64, invoice_id: InvoiceId) -> TransactionEntry {
        TransactionEntry {
            id,
            user_id: 1,
            invoice_id,
            parent_id: None,
            debit_account_id: 1,
            credit_account_id: 2,
            amount: 1000,
            entry_type: EntryType::Incoming,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_storage_open() {
        let (storage, _temp) = test_storage();
        assert!(storage.db.cf_handle(CF_ENTRIES).is_some());
        assert!(storage.db.cf_handle(CF_INDICES).is_some());
        assert_eq!(storage.last_ids().unwrap(), (0, 0, 0, 0));
    }

    #[test]
    fn test_commit_is_readable() {
        let (storage, _temp) = test_storage();

        let mut invoice = Invoice::draft(InvoiceType::Incoming, 1, 1000);
        invoice.id = 3;
        let entry = test_entry(9, 3);

        storage
            .commit(&[
                Write::Invoice(invoice.clone()),
                Write::Entry(entry.clone()),
                Write::PutIndex(Storage::index_key_invoice_entry(3, 9), vec![]),
            ])
            .unwrap();

        assert_eq!(storage.get_invoice(3).unwrap(), Some(invoice));
        assert_eq!(storage.get_entry(9).unwrap(), Some(entry));
        assert_eq!(storage.entry_ids_for_invoice(3).unwrap(), vec![9]);
        assert_eq!(storage.last_ids().unwrap(), (0, 0, 3, 9));
    }

    #[test]
    fn test_r_hash_index_is_per_direction() {
        let (storage, _temp) = test_storage();
        let r_hash = "ab".repeat(32);

        storage
            .commit(&[
                Write::PutIndex(Storage::index_key_r_hash(InvoiceType::Incoming, &r_hash, Some(4)), vec![]),
                Write::PutIndex(Storage::index_key_r_hash(InvoiceType::Outgoing, &r_hash, Some(5)), vec![]),
            ])
            .unwrap();

        assert_eq!(storage.invoice_ids_by_r_hash(InvoiceType::Incoming, &r_hash).unwrap(), vec![4]);
        assert_eq!(storage.invoice_ids_by_r_hash(InvoiceType::Outgoing, &r_hash).unwrap(), vec![5]);
    }

    #[test]
    fn test_pending_index_delete() {
        let (storage, _temp) = test_storage();

        storage
            .commit(&[
                Write::PutIndex(Storage::index_key_pending_outgoing(1), vec![]),
                Write::PutIndex(Storage::index_key_pending_outgoing(2), vec![]),
            ])
            .unwrap();
        assert_eq!(storage.pending_outgoing_ids().unwrap(), vec![1, 2]);

        storage
            .commit(&[Write::DeleteIndex(Storage::index_key_pending_outgoing(1))])
            .unwrap();
        assert_eq!(storage.pending_outgoing_ids().unwrap(), vec![2]);
    }

    #[test]
    fn test_scan_stops_at_prefix_boundary() {
        let (storage, _temp) = test_storage();

        let mut settled = Invoice::draft(InvoiceType::Incoming, 2, 5);
        settled.id = 1;
        settled.state = InvoiceState::Settled;

        storage
            .commit(&[
                Write::Invoice(settled),
                Write::PutIndex(Storage::index_key_user_invoice(1, 10), vec![]),
                Write::PutIndex(Storage::index_key_user_invoice(2, 11), vec![]),
            ])
            .unwrap();

        assert_eq!(storage.invoice_ids_for_user(1).unwrap(), vec![10]);
        assert_eq!(storage.invoice_ids_for_user(2).unwrap(), vec![11]);
    }
}
