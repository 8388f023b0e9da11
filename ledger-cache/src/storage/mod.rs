//! Durable storage backends
//!
//! The ledger talks to persistence exclusively through [`StorageBackend`].
//! Backends that can answer aggregate queries (rankings, transaction
//! history, daily snapshots) additionally expose [`ExtendedQueries`]
//! through [`StorageBackend::extended`].
//!
//! # Implementations
//!
//! | Backend | Module | Sync save | Extended queries |
//! |---------|--------|-----------|------------------|
//! | RocksDB | [`rocks`] | yes | yes |
//! | JSON files | [`file`] | yes | no |
//! | PostgreSQL | [`postgres`] | no | yes |
//! | Memory | [`memory`] | yes | yes |

pub mod file;
pub mod memory;
pub mod postgres;
pub mod rocks;

pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use postgres::PostgresBackend;
pub use rocks::RocksBackend;

use crate::config::{Config, StorageProvider};
use crate::types::{AccountId, AccountRecord, TopBalanceEntry, TransactionEntry};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::sync::Arc;

/// Reason recorded on accounts created by a backend
pub const NEW_ACCOUNT_REASON: &str = "Starting balance";

/// Result of [`StorageBackend::load_account`]
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedAccount {
    pub record: AccountRecord,
    /// True when the backend had no record and persisted a fresh default
    pub created: bool,
}

/// Filter for transaction history queries
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionFilter {
    /// Case-insensitive substring of the entry's display name
    pub name: Option<String>,
    /// Entries where this account is source or target
    pub account: Option<AccountId>,
}

impl TransactionFilter {
    /// Filter on display name
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            account: None,
        }
    }

    /// Filter on participating account
    pub fn by_account(account: AccountId) -> Self {
        Self {
            name: None,
            account: Some(account),
        }
    }

    /// Evaluate against one entry (embedded backends)
    pub fn matches(&self, entry: &TransactionEntry) -> bool {
        if let Some(account) = self.account {
            if !entry.involves(account) {
                return false;
            }
        }
        match &self.name {
            Some(name) if !name.is_empty() => entry
                .display_name
                .to_lowercase()
                .contains(&name.to_lowercase()),
            _ => true,
        }
    }
}

/// Durable home of account records
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Prepare the backend (schemas, directories, migrations).
    /// Failure here is fatal to the ledger.
    async fn initialize(&self) -> Result<()>;

    /// Load an account, creating and persisting a default record holding
    /// `starting_balance` when none exists.
    async fn load_account(&self, id: AccountId, starting_balance: Decimal)
        -> Result<LoadedAccount>;

    /// Persist one record
    async fn save_account(&self, record: &AccountRecord) -> Result<()>;

    /// Persist a batch of records
    async fn save_all(&self, records: &[AccountRecord]) -> Result<()>;

    /// Whether [`StorageBackend::save_all_sync`] is implemented
    fn supports_sync_save(&self) -> bool {
        false
    }

    /// Blocking batch save used at shutdown
    fn save_all_sync(&self, _records: &[AccountRecord]) -> Result<()> {
        Err(Error::Storage(format!(
            "{} has no synchronous save path",
            self.name()
        )))
    }

    /// Every stored record
    async fn load_all(&self) -> Result<Vec<AccountRecord>>;

    async fn account_exists(&self, id: AccountId) -> Result<bool>;

    /// Remove an account; returns whether it existed
    async fn delete_account(&self, id: AccountId) -> Result<bool>;

    async fn account_count(&self) -> Result<usize>;

    /// Case-insensitive lookup in the name index
    async fn find_account_by_name(&self, name: &str) -> Result<Option<AccountId>>;

    async fn display_name(&self, id: AccountId) -> Result<Option<String>>;

    async fn update_display_name(&self, id: AccountId, name: &str) -> Result<()>;

    /// Append entries to the durable transaction history
    async fn append_transactions(&self, _entries: &[TransactionEntry]) -> Result<()> {
        Ok(())
    }

    /// Release resources
    async fn shutdown(&self) -> Result<()>;

    /// Optional aggregate-query capability
    fn extended(&self) -> Option<&dyn ExtendedQueries> {
        None
    }
}

/// Aggregate queries offered by database-like backends
#[async_trait]
pub trait ExtendedQueries: Send + Sync {
    /// Transaction history, newest first
    async fn query_transactions(
        &self,
        filter: &TransactionFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TransactionEntry>>;

    async fn count_transactions(&self, filter: &TransactionFilter) -> Result<u64>;

    /// All-time ranking by durable balance
    async fn top_balances(&self, limit: usize, offset: usize) -> Result<Vec<TopBalanceEntry>>;

    /// Ranking by change since the snapshot taken `days_ago` days ago.
    /// Accounts without a snapshot that day count from zero.
    async fn top_balances_period(
        &self,
        limit: usize,
        offset: usize,
        days_ago: u32,
    ) -> Result<Vec<TopBalanceEntry>>;

    /// Record every durable balance under `day`, replacing an earlier
    /// snapshot of the same day. Returns the number of rows written.
    async fn snapshot_balances(&self, day: NaiveDate) -> Result<usize>;

    async fn count_accounts_with_balance_greater(&self, amount: Decimal) -> Result<u64>;

    async fn all_display_names(&self) -> Result<Vec<(AccountId, String)>>;
}

/// Rank rows by `trend` or `balance` descending, ties by id, then page.
pub(crate) fn rank_entries(
    mut entries: Vec<TopBalanceEntry>,
    by_trend: bool,
    limit: usize,
    offset: usize,
) -> Vec<TopBalanceEntry> {
    entries.sort_by(|a, b| {
        let primary = if by_trend {
            b.trend.cmp(&a.trend)
        } else {
            b.balance.cmp(&a.balance)
        };
        primary.then_with(|| a.id.cmp(&b.id))
    });
    entries.into_iter().skip(offset).take(limit).collect()
}

/// Build the backend selected in `config` and initialize it
pub async fn open_backend(config: &Config) -> Result<Arc<dyn StorageBackend>> {
    let unavailable = |e: Error| Error::BackendUnavailable(e.to_string());

    let backend: Arc<dyn StorageBackend> = match config.storage.provider {
        StorageProvider::RocksDb => Arc::new(RocksBackend::open(config).map_err(unavailable)?),
        StorageProvider::File => Arc::new(FileBackend::new(config.data_dir.clone())),
        StorageProvider::Postgres => Arc::new(
            PostgresBackend::connect(&config.storage.postgres)
                .await
                .map_err(unavailable)?,
        ),
        StorageProvider::Memory => Arc::new(MemoryBackend::new()),
    };

    backend.initialize().await.map_err(|e| match e {
        Error::BackendUnavailable(_) => e,
        other => Error::BackendUnavailable(format!("{}: {}", backend.name(), other)),
    })?;

    tracing::info!(backend = backend.name(), "Storage backend initialized");
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionKind;

    #[test]
    fn test_filter_matches_name_case_insensitive() {
        let entry = TransactionEntry::single(
            TransactionKind::Earn,
            AccountId::random(),
            "Alice",
            Decimal::ONE,
        );
        assert!(TransactionFilter::by_name("ali").matches(&entry));
        assert!(!TransactionFilter::by_name("bob").matches(&entry));
        assert!(TransactionFilter::default().matches(&entry));
    }

    #[test]
    fn test_filter_matches_account() {
        let a = AccountId::random();
        let b = AccountId::random();
        let entry = TransactionEntry::transfer(a, "a", b, "b", Decimal::ONE);
        assert!(TransactionFilter::by_account(b).matches(&entry));
        assert!(!TransactionFilter::by_account(AccountId::random()).matches(&entry));
    }

    #[test]
    fn test_rank_entries_paging() {
        let rows: Vec<TopBalanceEntry> = (1..=5)
            .map(|i| TopBalanceEntry {
                id: AccountId::random(),
                name: None,
                balance: Decimal::new(i * 10, 0),
                trend: Decimal::new(-i, 0),
            })
            .collect();

        let by_balance = rank_entries(rows.clone(), false, 2, 1);
        assert_eq!(by_balance.len(), 2);
        assert_eq!(by_balance[0].balance, Decimal::new(40, 0));

        let by_trend = rank_entries(rows, true, 1, 0);
        assert_eq!(by_trend[0].trend, Decimal::new(-1, 0));
    }

    #[tokio::test]
    async fn test_open_memory_backend() {
        let mut config = Config::default();
        config.storage.provider = StorageProvider::Memory;
        let backend = open_backend(&config).await.unwrap();
        assert_eq!(backend.name(), "memory");
    }

    #[tokio::test]
    async fn test_open_rocks_backend_unwritable_dir_is_fatal() {
        let temp = tempfile::tempdir().unwrap();
        let blocker = temp.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        let mut config = Config::default();
        config.data_dir = blocker.join("db");
        assert!(matches!(
            open_backend(&config).await,
            Err(Error::BackendUnavailable(_))
        ));
    }
}
