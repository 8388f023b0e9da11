//! Embedded backend using RocksDB
//!
//! # Column Families
//!
//! - `accounts` - Account records (key: account id)
//! - `transactions` - Append-only history (key: timestamp || sequence)
//! - `snapshots` - Daily balances (key: day || account id)
//! - `names` - Name index, both directions (`n:` lowercase name -> id,
//!   `i:` id -> name)

use super::{
    rank_entries, ExtendedQueries, LoadedAccount, StorageBackend, TransactionFilter,
    NEW_ACCOUNT_REASON,
};
use crate::config::RocksDBConfig;
use crate::error::{Error, Result};
use crate::types::{AccountId, AccountRecord, TopBalanceEntry, TransactionEntry};
use crate::Config;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
use rust_decimal::Decimal;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Column family names
const CF_ACCOUNTS: &str = "accounts";
const CF_TRANSACTIONS: &str = "transactions";
const CF_SNAPSHOTS: &str = "snapshots";
const CF_NAMES: &str = "names";

const NAME_PREFIX: &[u8] = b"n:";
const ID_PREFIX: &[u8] = b"i:";

/// RocksDB-backed account store
pub struct RocksBackend {
    db: DB,
    /// Disambiguates history entries sharing a timestamp
    sequence: AtomicU64,
}

impl RocksBackend {
    /// Open or create the database under `config.data_dir`
    pub fn open(config: &Config) -> Result<Self> {
        Self::open_path(&config.data_dir, &config.storage.rocksdb)
    }

    /// Open or create the database at `path`
    pub fn open_path(path: &Path, tuning: &RocksDBConfig) -> Result<Self> {
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(tuning.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(tuning.max_write_buffer_number);
        db_opts.set_max_background_jobs(tuning.max_background_jobs);

        if tuning.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_ACCOUNTS, Self::cf_options_accounts()),
            ColumnFamilyDescriptor::new(CF_TRANSACTIONS, Self::cf_options_history()),
            ColumnFamilyDescriptor::new(CF_SNAPSHOTS, Self::cf_options_history()),
            ColumnFamilyDescriptor::new(CF_NAMES, Self::cf_options_names()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;
        tracing::info!(path = ?path, "Opened RocksDB account store");

        Ok(Self {
            db,
            sequence: AtomicU64::new(0),
        })
    }

    // Column family options

    fn cf_options_accounts() -> Options {
        let mut opts = Options::default();
        // Point lookups on every cache miss
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_options_history() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_names() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    // Key helpers

    fn account_key(id: AccountId) -> [u8; 16] {
        *id.as_uuid().as_bytes()
    }

    fn transaction_key(&self, timestamp: DateTime<Utc>) -> Vec<u8> {
        // Flip the sign bit so negative timestamps still sort first
        let micros = (timestamp.timestamp_micros() as u64) ^ (1 << 63);
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let mut key = micros.to_be_bytes().to_vec();
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    fn snapshot_key(day: NaiveDate, id: AccountId) -> Vec<u8> {
        let mut key = day.num_days_from_ce().to_be_bytes().to_vec();
        key.extend_from_slice(id.as_uuid().as_bytes());
        key
    }

    fn name_key(name: &str) -> Vec<u8> {
        let mut key = NAME_PREFIX.to_vec();
        key.extend_from_slice(name.to_lowercase().as_bytes());
        key
    }

    fn id_key(id: AccountId) -> Vec<u8> {
        let mut key = ID_PREFIX.to_vec();
        key.extend_from_slice(id.as_uuid().as_bytes());
        key
    }

    fn id_from_bytes(bytes: &[u8]) -> Result<AccountId> {
        Uuid::from_slice(bytes)
            .map(AccountId::new)
            .map_err(|e| Error::Storage(format!("Corrupt account key: {}", e)))
    }

    // Record helpers

    fn get_record(&self, id: AccountId) -> Result<Option<AccountRecord>> {
        let cf = self.cf_handle(CF_ACCOUNTS)?;
        let Some(value) = self.db.get_cf(cf, Self::account_key(id))? else {
            return Ok(None);
        };

        match bincode::deserialize::<AccountRecord>(&value) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                tracing::warn!(account = %id, error = %e, "Malformed account record, treating as missing");
                Ok(None)
            }
        }
    }

    fn put_record(&self, record: &AccountRecord) -> Result<()> {
        let cf = self.cf_handle(CF_ACCOUNTS)?;
        let value = bincode::serialize(record)?;
        self.db.put_cf(cf, Self::account_key(record.id), value)?;
        Ok(())
    }

    fn write_records(&self, records: &[AccountRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let cf = self.cf_handle(CF_ACCOUNTS)?;
        let mut batch = WriteBatch::default();
        for record in records {
            batch.put_cf(cf, Self::account_key(record.id), bincode::serialize(record)?);
        }

        // Atomic commit
        self.db.write(batch)?;

        tracing::debug!(count = records.len(), "Account batch written");
        Ok(())
    }

    fn scan_records(&self) -> Result<Vec<AccountRecord>> {
        let cf = self.cf_handle(CF_ACCOUNTS)?;
        let mut records = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            match bincode::deserialize::<AccountRecord>(&value) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(
                    key = ?Self::id_from_bytes(&key).ok(),
                    error = %e,
                    "Skipping malformed account record"
                ),
            }
        }
        Ok(records)
    }

    fn scan_prefix(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>> {
        let cf = self.cf_handle(cf_name)?;
        let mut rows = Vec::new();
        for item in self.db.prefix_iterator_cf(cf, prefix) {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            rows.push((key, value));
        }
        Ok(rows)
    }

    fn snapshot_balance(&self, day: NaiveDate, id: AccountId) -> Result<Option<Decimal>> {
        let cf = self.cf_handle(CF_SNAPSHOTS)?;
        match self.db.get_cf(cf, Self::snapshot_key(day, id))? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl StorageBackend for RocksBackend {
    fn name(&self) -> &'static str {
        "rocksdb"
    }

    async fn initialize(&self) -> Result<()> {
        for name in [CF_ACCOUNTS, CF_TRANSACTIONS, CF_SNAPSHOTS, CF_NAMES] {
            self.cf_handle(name)?;
        }
        Ok(())
    }

    async fn load_account(&self, id: AccountId, starting_balance: Decimal) -> Result<LoadedAccount> {
        if let Some(record) = self.get_record(id)? {
            return Ok(LoadedAccount {
                record,
                created: false,
            });
        }

        let record = AccountRecord::with_starting_balance(id, starting_balance, NEW_ACCOUNT_REASON);
        self.put_record(&record)?;
        tracing::debug!(account = %id, "Created account");

        Ok(LoadedAccount {
            record,
            created: true,
        })
    }

    async fn save_account(&self, record: &AccountRecord) -> Result<()> {
        self.put_record(record)
    }

    async fn save_all(&self, records: &[AccountRecord]) -> Result<()> {
        self.write_records(records)
    }

    fn supports_sync_save(&self) -> bool {
        true
    }

    fn save_all_sync(&self, records: &[AccountRecord]) -> Result<()> {
        self.write_records(records)?;
        self.db.flush()?;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<AccountRecord>> {
        self.scan_records()
    }

    async fn account_exists(&self, id: AccountId) -> Result<bool> {
        let cf = self.cf_handle(CF_ACCOUNTS)?;
        Ok(self.db.get_pinned_cf(cf, Self::account_key(id))?.is_some())
    }

    async fn delete_account(&self, id: AccountId) -> Result<bool> {
        let existed = self.account_exists(id).await?;

        let cf_accounts = self.cf_handle(CF_ACCOUNTS)?;
        let cf_names = self.cf_handle(CF_NAMES)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_accounts, Self::account_key(id));

        if let Some(name) = self.db.get_cf(cf_names, Self::id_key(id))? {
            batch.delete_cf(cf_names, Self::name_key(&String::from_utf8_lossy(&name)));
            batch.delete_cf(cf_names, Self::id_key(id));
        }

        self.db.write(batch)?;
        Ok(existed)
    }

    async fn account_count(&self) -> Result<usize> {
        let cf = self.cf_handle(CF_ACCOUNTS)?;
        Ok(self.db.iterator_cf(cf, IteratorMode::Start).count())
    }

    async fn find_account_by_name(&self, name: &str) -> Result<Option<AccountId>> {
        let cf = self.cf_handle(CF_NAMES)?;
        match self.db.get_cf(cf, Self::name_key(name))? {
            Some(bytes) => Ok(Some(Self::id_from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn display_name(&self, id: AccountId) -> Result<Option<String>> {
        let cf = self.cf_handle(CF_NAMES)?;
        Ok(self
            .db
            .get_cf(cf, Self::id_key(id))?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    async fn update_display_name(&self, id: AccountId, name: &str) -> Result<()> {
        let cf = self.cf_handle(CF_NAMES)?;
        let mut batch = WriteBatch::default();

        if let Some(previous) = self.db.get_cf(cf, Self::id_key(id))? {
            batch.delete_cf(cf, Self::name_key(&String::from_utf8_lossy(&previous)));
        }
        batch.put_cf(cf, Self::name_key(name), id.as_uuid().as_bytes());
        batch.put_cf(cf, Self::id_key(id), name.as_bytes());

        self.db.write(batch)?;
        Ok(())
    }

    async fn append_transactions(&self, entries: &[TransactionEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let cf = self.cf_handle(CF_TRANSACTIONS)?;
        let mut batch = WriteBatch::default();
        for entry in entries {
            batch.put_cf(cf, self.transaction_key(entry.timestamp), bincode::serialize(entry)?);
        }
        self.db.write(batch)?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.db.flush()?;
        tracing::info!("RocksDB flushed for shutdown");
        Ok(())
    }

    fn extended(&self) -> Option<&dyn ExtendedQueries> {
        Some(self)
    }
}

#[async_trait]
impl ExtendedQueries for RocksBackend {
    async fn query_transactions(
        &self,
        filter: &TransactionFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TransactionEntry>> {
        let cf = self.cf_handle(CF_TRANSACTIONS)?;
        let mut matched = Vec::new();
        let mut skipped = 0;

        for item in self.db.iterator_cf(cf, IteratorMode::End) {
            if matched.len() >= limit {
                break;
            }
            let (_, value) = item?;
            let entry: TransactionEntry = bincode::deserialize(&value)?;
            if !filter.matches(&entry) {
                continue;
            }
            if skipped < offset {
                skipped += 1;
                continue;
            }
            matched.push(entry);
        }

        Ok(matched)
    }

    async fn count_transactions(&self, filter: &TransactionFilter) -> Result<u64> {
        let cf = self.cf_handle(CF_TRANSACTIONS)?;
        let mut count = 0u64;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let entry: TransactionEntry = bincode::deserialize(&value)?;
            if filter.matches(&entry) {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn top_balances(&self, limit: usize, offset: usize) -> Result<Vec<TopBalanceEntry>> {
        let rows = self
            .scan_records()?
            .into_iter()
            .map(|record| TopBalanceEntry {
                id: record.id,
                name: record.display_name,
                balance: record.balance,
                trend: Decimal::ZERO,
            })
            .collect();
        Ok(rank_entries(rows, false, limit, offset))
    }

    async fn top_balances_period(
        &self,
        limit: usize,
        offset: usize,
        days_ago: u32,
    ) -> Result<Vec<TopBalanceEntry>> {
        let day = Utc::now().date_naive() - chrono::Duration::days(i64::from(days_ago));

        let mut rows = Vec::new();
        for record in self.scan_records()? {
            let baseline = self.snapshot_balance(day, record.id)?.unwrap_or(Decimal::ZERO);
            rows.push(TopBalanceEntry {
                id: record.id,
                name: record.display_name,
                balance: record.balance,
                trend: record.balance - baseline,
            });
        }
        Ok(rank_entries(rows, true, limit, offset))
    }

    async fn snapshot_balances(&self, day: NaiveDate) -> Result<usize> {
        let records = self.scan_records()?;
        let cf = self.cf_handle(CF_SNAPSHOTS)?;

        let mut batch = WriteBatch::default();
        for record in &records {
            batch.put_cf(cf, Self::snapshot_key(day, record.id), bincode::serialize(&record.balance)?);
        }
        self.db.write(batch)?;

        tracing::info!(%day, count = records.len(), "Balance snapshot recorded");
        Ok(records.len())
    }

    async fn count_accounts_with_balance_greater(&self, amount: Decimal) -> Result<u64> {
        Ok(self
            .scan_records()?
            .iter()
            .filter(|record| record.balance > amount)
            .count() as u64)
    }

    async fn all_display_names(&self) -> Result<Vec<(AccountId, String)>> {
        self.scan_prefix(CF_NAMES, ID_PREFIX)?
            .into_iter()
            .map(|(key, value)| {
                let id = Self::id_from_bytes(&key[ID_PREFIX.len()..])?;
                Ok((id, String::from_utf8_lossy(&value).into_owned()))
            })
            .collect()
    }
}
