//! Volatile in-process backend
//!
//! Nothing survives the process. Useful for tests and for deployments that
//! only need the cache semantics.

use super::{
    rank_entries, ExtendedQueries, LoadedAccount, StorageBackend, TransactionFilter,
    NEW_ACCOUNT_REASON,
};
use crate::types::{AccountId, AccountRecord, TopBalanceEntry, TransactionEntry};
use crate::Result;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;

/// In-memory account store
#[derive(Default)]
pub struct MemoryBackend {
    accounts: DashMap<AccountId, AccountRecord>,
    names: DashMap<AccountId, String>,
    snapshots: DashMap<(NaiveDate, AccountId), Decimal>,
    transactions: RwLock<Vec<TransactionEntry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored copy of a record, bypassing the trait (tests)
    pub fn stored(&self, id: AccountId) -> Option<AccountRecord> {
        self.accounts.get(&id).map(|r| r.value().clone())
    }

    fn all_records(&self) -> Vec<AccountRecord> {
        self.accounts.iter().map(|r| r.value().clone()).collect()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn load_account(&self, id: AccountId, starting_balance: Decimal) -> Result<LoadedAccount> {
        Ok(match self.accounts.entry(id) {
            Entry::Occupied(entry) => LoadedAccount {
                record: entry.get().clone(),
                created: false,
            },
            Entry::Vacant(entry) => {
                let record =
                    AccountRecord::with_starting_balance(id, starting_balance, NEW_ACCOUNT_REASON);
                entry.insert(record.clone());
                LoadedAccount {
                    record,
                    created: true,
                }
            }
        })
    }

    async fn save_account(&self, record: &AccountRecord) -> Result<()> {
        self.accounts.insert(record.id, record.clone());
        Ok(())
    }

    async fn save_all(&self, records: &[AccountRecord]) -> Result<()> {
        self.save_all_sync(records)
    }

    fn supports_sync_save(&self) -> bool {
        true
    }

    fn save_all_sync(&self, records: &[AccountRecord]) -> Result<()> {
        for record in records {
            self.accounts.insert(record.id, record.clone());
        }
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<AccountRecord>> {
        Ok(self.all_records())
    }

    async fn account_exists(&self, id: AccountId) -> Result<bool> {
        Ok(self.accounts.contains_key(&id))
    }

    async fn delete_account(&self, id: AccountId) -> Result<bool> {
        self.names.remove(&id);
        Ok(self.accounts.remove(&id).is_some())
    }

    async fn account_count(&self) -> Result<usize> {
        Ok(self.accounts.len())
    }

    async fn find_account_by_name(&self, name: &str) -> Result<Option<AccountId>> {
        let wanted = name.to_lowercase();
        Ok(self
            .names
            .iter()
            .find(|entry| entry.value().to_lowercase() == wanted)
            .map(|entry| *entry.key()))
    }

    async fn display_name(&self, id: AccountId) -> Result<Option<String>> {
        Ok(self.names.get(&id).map(|name| name.value().clone()))
    }

    async fn update_display_name(&self, id: AccountId, name: &str) -> Result<()> {
        self.names.insert(id, name.to_string());
        Ok(())
    }

    async fn append_transactions(&self, entries: &[TransactionEntry]) -> Result<()> {
        self.transactions.write().extend_from_slice(entries);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    fn extended(&self) -> Option<&dyn ExtendedQueries> {
        Some(self)
    }
}

#[async_trait]
impl ExtendedQueries for MemoryBackend {
    async fn query_transactions(
        &self,
        filter: &TransactionFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TransactionEntry>> {
        let transactions = self.transactions.read();
        let mut matched: Vec<TransactionEntry> = transactions
            .iter()
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(matched.into_iter().skip(offset).take(limit).collect())
    }

    async fn count_transactions(&self, filter: &TransactionFilter) -> Result<u64> {
        let transactions = self.transactions.read();
        Ok(transactions.iter().filter(|entry| filter.matches(entry)).count() as u64)
    }

    async fn top_balances(&self, limit: usize, offset: usize) -> Result<Vec<TopBalanceEntry>> {
        let rows = self
            .all_records()
            .into_iter()
            .map(|record| TopBalanceEntry {
                name: self.names.get(&record.id).map(|n| n.value().clone()),
                id: record.id,
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
        let rows = self
            .all_records()
            .into_iter()
            .map(|record| {
                let baseline = self
                    .snapshots
                    .get(&(day, record.id))
                    .map(|b| *b.value())
                    .unwrap_or(Decimal::ZERO);
                TopBalanceEntry {
                    name: self.names.get(&record.id).map(|n| n.value().clone()),
                    id: record.id,
                    balance: record.balance,
                    trend: record.balance - baseline,
                }
            })
            .collect();
        Ok(rank_entries(rows, true, limit, offset))
    }

    async fn snapshot_balances(&self, day: NaiveDate) -> Result<usize> {
        let records = self.all_records();
        for record in &records {
            self.snapshots.insert((day, record.id), record.balance);
        }
        Ok(records.len())
    }

    async fn count_accounts_with_balance_greater(&self, amount: Decimal) -> Result<u64> {
        Ok(self
            .accounts
            .iter()
            .filter(|record| record.balance > amount)
            .count() as u64)
    }

    async fn all_display_names(&self) -> Result<Vec<(AccountId, String)>> {
        Ok(self
            .names
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect())
    }
}
