//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use ledger_cache::storage::{LoadedAccount, MemoryBackend};
use ledger_cache::{
    AccountId, AccountRecord, Config, Error, ExtendedQueries, Ledger, Result, StorageBackend,
    StorageProvider, TransactionEntry,
};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn dec(v: i64) -> Decimal {
    Decimal::new(v, 0)
}

/// Memory-backed configuration with the durable journal off
pub fn memory_config() -> Config {
    let mut config = Config::default();
    config.storage.provider = StorageProvider::Memory;
    config.journal.persist = false;
    config
}

pub async fn memory_ledger(config: Config) -> (Arc<Ledger>, Arc<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::new());
    let ledger = Ledger::with_storage(config, backend.clone()).await.unwrap();
    (Arc::new(ledger), backend)
}

/// Memory backend whose saves can be made to fail or stall, and which
/// only offers the async save path
#[derive(Default)]
pub struct FlakyBackend {
    pub inner: MemoryBackend,
    pub fail_saves: AtomicBool,
    pub stall_saves: AtomicBool,
    pub save_calls: AtomicUsize,
}

impl FlakyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    async fn gate(&self) -> Result<()> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        if self.stall_saves.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
        }
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(Error::Storage("injected save failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FlakyBackend {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn initialize(&self) -> Result<()> {
        self.inner.initialize().await
    }

    async fn load_account(&self, id: AccountId, starting_balance: Decimal) -> Result<LoadedAccount> {
        self.inner.load_account(id, starting_balance).await
    }

    async fn save_account(&self, record: &AccountRecord) -> Result<()> {
        self.gate().await?;
        self.inner.save_account(record).await
    }

    async fn save_all(&self, records: &[AccountRecord]) -> Result<()> {
        self.gate().await?;
        self.inner.save_all(records).await
    }

    async fn load_all(&self) -> Result<Vec<AccountRecord>> {
        self.inner.load_all().await
    }

    async fn account_exists(&self, id: AccountId) -> Result<bool> {
        self.inner.account_exists(id).await
    }

    async fn delete_account(&self, id: AccountId) -> Result<bool> {
        self.inner.delete_account(id).await
    }

    async fn account_count(&self) -> Result<usize> {
        self.inner.account_count().await
    }

    async fn find_account_by_name(&self, name: &str) -> Result<Option<AccountId>> {
        self.inner.find_account_by_name(name).await
    }

    async fn display_name(&self, id: AccountId) -> Result<Option<String>> {
        self.inner.display_name(id).await
    }

    async fn update_display_name(&self, id: AccountId, name: &str) -> Result<()> {
        self.inner.update_display_name(id, name).await
    }

    async fn append_transactions(&self, entries: &[TransactionEntry]) -> Result<()> {
        self.inner.append_transactions(entries).await
    }

    async fn shutdown(&self) -> Result<()> {
        self.inner.shutdown().await
    }

    fn extended(&self) -> Option<&dyn ExtendedQueries> {
        self.inner.extended()
    }
}
