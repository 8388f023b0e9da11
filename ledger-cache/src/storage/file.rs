//! Flat-file backend: one JSON document per account
//!
//! # Layout
//!
//! ```text
//! <data_dir>/
//!   balances.json             legacy single-file ledger, migrated on start
//!   balances.json.migrated    legacy file after migration
//!   accounts/
//!     <id>.json               current record
//!     <id>.json.bak           previous record
//!     <id>.json.tmp           in-flight write
//! ```
//!
//! Saves write the temp file, move the current file over the backup and
//! then move the temp file into place, so a crash leaves either the old or
//! the new record readable.

use super::{LoadedAccount, StorageBackend, NEW_ACCOUNT_REASON};
use crate::error::{Error, Result};
use crate::types::{AccountId, AccountRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const ACCOUNTS_DIR: &str = "accounts";
const LEGACY_FILE: &str = "balances.json";
const LEGACY_MIGRATED: &str = "balances.json.migrated";
const RECOVERY_REASON: &str = "Recovery - starting balance";

/// Legacy `balances.json` document
#[derive(Debug, Deserialize)]
struct LegacyLedger {
    #[serde(rename = "Balances", default)]
    balances: Vec<LegacyBalance>,
}

#[derive(Debug, Deserialize)]
struct LegacyBalance {
    #[serde(rename = "Uuid")]
    uuid: uuid::Uuid,
    #[serde(rename = "Balance", default)]
    balance: f64,
    #[serde(rename = "TotalEarned", default)]
    total_earned: f64,
    #[serde(rename = "TotalSpent", default)]
    total_spent: f64,
    #[serde(rename = "LastTransaction", default)]
    last_transaction: String,
    #[serde(rename = "LastTransactionTime", default)]
    last_transaction_time: i64,
}

impl LegacyBalance {
    fn into_record(self) -> AccountRecord {
        let amount = |v: f64| Decimal::try_from(v).unwrap_or_default().normalize();
        AccountRecord {
            id: AccountId::new(self.uuid),
            display_name: None,
            balance: amount(self.balance).max(Decimal::ZERO),
            total_earned: amount(self.total_earned),
            total_spent: amount(self.total_spent),
            last_transaction: self.last_transaction,
            last_transaction_at: (self.last_transaction_time > 0)
                .then(|| DateTime::<Utc>::from_timestamp_millis(self.last_transaction_time))
                .flatten(),
        }
    }
}

/// Per-account JSON file store
pub struct FileBackend {
    root: PathBuf,
    accounts_dir: PathBuf,
    /// Name index rebuilt from the record files on start
    names: DashMap<AccountId, String>,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let accounts_dir = root.join(ACCOUNTS_DIR);
        Self {
            root,
            accounts_dir,
            names: DashMap::new(),
        }
    }

    fn record_path(&self, id: AccountId) -> PathBuf {
        self.accounts_dir.join(format!("{}.json", id))
    }

    fn backup_path(&self, id: AccountId) -> PathBuf {
        self.accounts_dir.join(format!("{}.json.bak", id))
    }

    fn temp_path(&self, id: AccountId) -> PathBuf {
        self.accounts_dir.join(format!("{}.json.tmp", id))
    }

    /// Parse the account id out of `<id>.json`; `None` for backups, temp
    /// files and strangers
    fn id_from_path(path: &Path) -> Option<AccountId> {
        let name = path.file_name()?.to_str()?;
        name.strip_suffix(".json")?.parse().ok()
    }

    fn id_from_backup_path(path: &Path) -> Option<AccountId> {
        let name = path.file_name()?.to_str()?;
        name.strip_suffix(".json.bak")?.parse().ok()
    }

    async fn read_record(path: &Path) -> Result<AccountRecord> {
        let bytes = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn replace(record: &AccountRecord, current: &Path, backup: &Path, temp: &Path) -> Result<()> {
        tokio::fs::write(temp, serde_json::to_vec_pretty(record)?).await?;
        if tokio::fs::metadata(current).await.is_ok() {
            tokio::fs::rename(current, backup).await?;
        }
        tokio::fs::rename(temp, current).await?;
        Ok(())
    }

    fn replace_blocking(record: &AccountRecord, current: &Path, backup: &Path, temp: &Path) -> Result<()> {
        std::fs::write(temp, serde_json::to_vec_pretty(record)?)?;
        if current.exists() {
            std::fs::rename(current, backup)?;
        }
        std::fs::rename(temp, current)?;
        Ok(())
    }

    async fn write_record(&self, record: &AccountRecord) -> Result<()> {
        let current = self.record_path(record.id);
        let backup = self.backup_path(record.id);
        let temp = self.temp_path(record.id);

        let result = Self::replace(record, &current, &backup, &temp).await;

        if let Err(e) = &result {
            tracing::error!(account = %record.id, error = %e, "Failed to save account file");
            let _ = tokio::fs::remove_file(&temp).await;
            if tokio::fs::metadata(&current).await.is_err()
                && tokio::fs::metadata(&backup).await.is_ok()
                && tokio::fs::copy(&backup, &current).await.is_ok()
            {
                tracing::info!(account = %record.id, "Restored account file from backup after save failure");
            }
        }
        result
    }

    fn write_record_blocking(&self, record: &AccountRecord) -> Result<()> {
        let current = self.record_path(record.id);
        let backup = self.backup_path(record.id);
        let temp = self.temp_path(record.id);

        let result = Self::replace_blocking(record, &current, &backup, &temp);

        if let Err(e) = &result {
            tracing::error!(account = %record.id, error = %e, "Failed to save account file");
            let _ = std::fs::remove_file(&temp);
            if !current.exists() && backup.exists() && std::fs::copy(&backup, &current).is_ok() {
                tracing::info!(account = %record.id, "Restored account file from backup after save failure");
            }
        }
        result
    }

    fn migrate_legacy(&self) -> Result<usize> {
        let legacy_path = self.root.join(LEGACY_FILE);
        let bytes = std::fs::read(&legacy_path)?;
        let legacy: LegacyLedger = serde_json::from_slice(&bytes)?;

        let mut migrated = 0;
        for balance in legacy.balances {
            self.write_record_blocking(&balance.into_record())?;
            migrated += 1;
        }

        std::fs::rename(&legacy_path, self.root.join(LEGACY_MIGRATED))?;
        Ok(migrated)
    }

    /// Readable file per account: `<id>.json`, or the backup when a save
    /// died between its two renames and left no current file
    async fn list_record_paths(&self) -> Result<Vec<(AccountId, PathBuf)>> {
        let mut entries = tokio::fs::read_dir(&self.accounts_dir).await?;
        let mut current = HashMap::new();
        let mut backups = HashMap::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if let Some(id) = Self::id_from_path(&path) {
                current.insert(id, path);
            } else if let Some(id) = Self::id_from_backup_path(&path) {
                backups.insert(id, path);
            }
        }

        backups.retain(|id, _| !current.contains_key(id));
        current.extend(backups);
        Ok(current.into_iter().collect())
    }

    /// Read the backup of an account with no current file and copy it back
    /// into place. The next save must not rename a fresh record over it.
    async fn restore_backup(&self, id: AccountId) -> Result<AccountRecord> {
        let backup = self.backup_path(id);
        let record = Self::read_record(&backup).await?;
        if let Err(e) = tokio::fs::copy(&backup, self.record_path(id)).await {
            tracing::warn!(account = %id, error = %e, "Could not copy backup into place");
        }
        tracing::info!(account = %id, "Recovered account from backup after interrupted save");
        Ok(record)
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn initialize(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.accounts_dir).await?;

        if self.root.join(LEGACY_FILE).exists() {
            tracing::info!("Migrating legacy balances.json");
            match self.migrate_legacy() {
                Ok(count) => tracing::info!(count, "Legacy migration complete"),
                Err(e) => {
                    tracing::error!(error = %e, "Legacy migration failed, file left in place");
                }
            }
        }

        for (id, path) in self.list_record_paths().await? {
            if let Ok(AccountRecord {
                display_name: Some(name),
                ..
            }) = Self::read_record(&path).await
            {
                self.names.insert(id, name);
            }
        }

        let accounts = self.account_count().await?;
        tracing::info!(
            accounts,
            dir = ?self.accounts_dir,
            "File storage initialized"
        );
        Ok(())
    }

    async fn load_account(&self, id: AccountId, starting_balance: Decimal) -> Result<LoadedAccount> {
        let path = self.record_path(id);

        if tokio::fs::metadata(&path).await.is_err() {
            if tokio::fs::metadata(self.backup_path(id)).await.is_ok() {
                match self.restore_backup(id).await {
                    Ok(record) => {
                        return Ok(LoadedAccount {
                            record,
                            created: false,
                        })
                    }
                    Err(e) => {
                        tracing::warn!(account = %id, error = %e, "Orphaned backup unusable, creating account");
                    }
                }
            }

            let record = AccountRecord::with_starting_balance(id, starting_balance, NEW_ACCOUNT_REASON);
            self.write_record(&record).await?;
            return Ok(LoadedAccount {
                record,
                created: true,
            });
        }

        match Self::read_record(&path).await {
            Ok(record) => {
                return Ok(LoadedAccount {
                    record,
                    created: false,
                })
            }
            Err(e) => {
                tracing::warn!(account = %id, error = %e, "Failed to load account file, trying backup");
            }
        }

        match Self::read_record(&self.backup_path(id)).await {
            Ok(record) => {
                tracing::info!(account = %id, "Restored account from backup");
                Ok(LoadedAccount {
                    record,
                    created: false,
                })
            }
            Err(e) => {
                tracing::warn!(account = %id, error = %e, "Backup unusable, recreating account");
                // Reported as created so the fresh record gets written back
                Ok(LoadedAccount {
                    record: AccountRecord::with_starting_balance(id, starting_balance, RECOVERY_REASON),
                    created: true,
                })
            }
        }
    }

    async fn save_account(&self, record: &AccountRecord) -> Result<()> {
        self.write_record(record).await
    }

    async fn save_all(&self, records: &[AccountRecord]) -> Result<()> {
        let mut failed = 0;
        for record in records {
            if self.write_record(record).await.is_err() {
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(Error::Storage(format!(
                "{} of {} account files failed to save",
                failed,
                records.len()
            )));
        }
        tracing::debug!(count = records.len(), "Saved account files");
        Ok(())
    }

    fn supports_sync_save(&self) -> bool {
        true
    }

    fn save_all_sync(&self, records: &[AccountRecord]) -> Result<()> {
        std::fs::create_dir_all(&self.accounts_dir)?;
        let failed = records
            .iter()
            .filter(|record| self.write_record_blocking(record).is_err())
            .count();
        if failed > 0 {
            return Err(Error::Storage(format!(
                "{} of {} account files failed to save",
                failed,
                records.len()
            )));
        }
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<AccountRecord>> {
        let mut records = Vec::new();
        for (id, path) in self.list_record_paths().await? {
            let read = if path == self.backup_path(id) {
                self.restore_backup(id).await
            } else {
                Self::read_record(&path).await
            };
            match read {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(account = %id, error = %e, "Skipping invalid account file"),
            }
        }
        Ok(records)
    }

    async fn account_exists(&self, id: AccountId) -> Result<bool> {
        Ok(tokio::fs::metadata(self.record_path(id)).await.is_ok())
    }

    async fn delete_account(&self, id: AccountId) -> Result<bool> {
        let existed = self.account_exists(id).await?;
        for path in [self.record_path(id), self.backup_path(id), self.temp_path(id)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.names.remove(&id);
        tracing::info!(account = %id, "Deleted account files");
        Ok(existed)
    }

    async fn account_count(&self) -> Result<usize> {
        Ok(self.list_record_paths().await?.len())
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

        let path = self.record_path(id);
        if let Ok(mut record) = Self::read_record(&path).await {
            if record.display_name.as_deref() != Some(name) {
                record.display_name = Some(name.to_string());
                self.write_record(&record).await?;
            }
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        tracing::info!("File storage shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn backend() -> (FileBackend, TempDir) {
        let temp = TempDir::new().unwrap();
        let backend = FileBackend::new(temp.path());
        backend.initialize().await.unwrap();
        (backend, temp)
    }

    #[tokio::test]
    async fn test_save_keeps_backup() {
        let (backend, _temp) = backend().await;
        let id = AccountId::random();

        let mut record = backend.load_account(id, Decimal::new(100, 0)).await.unwrap().record;
        record.credit(Decimal::new(5, 0), "first");
        backend.save_account(&record).await.unwrap();

        assert!(backend.record_path(id).exists());
        assert!(backend.backup_path(id).exists());
        assert!(!backend.temp_path(id).exists());

        let backup: AccountRecord =
            serde_json::from_slice(&std::fs::read(backend.backup_path(id)).unwrap()).unwrap();
        assert_eq!(backup.balance, Decimal::new(100, 0));
    }

    #[tokio::test]
    async fn test_corrupt_record_falls_back_to_backup() {
        let (backend, _temp) = backend().await;
        let id = AccountId::random();

        let mut record = backend.load_account(id, Decimal::new(100, 0)).await.unwrap().record;
        record.credit(Decimal::new(20, 0), "a");
        backend.save_account(&record).await.unwrap();

        std::fs::write(backend.record_path(id), b"{ not json").unwrap();

        let loaded = backend.load_account(id, Decimal::ZERO).await.unwrap();
        assert!(!loaded.created);
        assert_eq!(loaded.record.balance, Decimal::new(100, 0));
    }

    #[tokio::test]
    async fn test_corrupt_without_backup_recreates() {
        let (backend, _temp) = backend().await;
        let id = AccountId::random();
        std::fs::write(backend.record_path(id), b"garbage").unwrap();

        let loaded = backend.load_account(id, Decimal::new(7, 0)).await.unwrap();
        assert!(loaded.created);
        assert_eq!(loaded.record.balance, Decimal::new(7, 0));
        assert!(loaded.record.last_transaction.contains("Recovery"));
    }

    #[tokio::test]
    async fn test_interrupted_save_recovers_from_backup() {
        let (backend, _temp) = backend().await;
        let id = AccountId::random();

        let mut record = backend.load_account(id, Decimal::new(100, 0)).await.unwrap().record;
        record.credit(Decimal::new(900, 0), "Earn");
        backend.save_account(&record).await.unwrap();

        // Crash after moving the current file aside, before the temp file landed
        std::fs::rename(backend.record_path(id), backend.backup_path(id)).unwrap();

        let loaded = backend.load_account(id, Decimal::new(100, 0)).await.unwrap();
        assert!(!loaded.created);
        assert_eq!(loaded.record.balance, Decimal::new(1000, 0));
        assert!(backend.record_path(id).exists());

        // Saving the next record keeps the recovered one as its backup
        backend.save_account(&loaded.record).await.unwrap();
        let backup: AccountRecord =
            serde_json::from_slice(&std::fs::read(backend.backup_path(id)).unwrap()).unwrap();
        assert_eq!(backup.balance, Decimal::new(1000, 0));
    }

    #[tokio::test]
    async fn test_load_all_picks_up_orphaned_backup() {
        let (backend, _temp) = backend().await;
        let id = AccountId::random();

        let mut record = backend.load_account(id, Decimal::new(100, 0)).await.unwrap().record;
        record.credit(Decimal::new(900, 0), "Earn");
        backend.save_account(&record).await.unwrap();
        std::fs::rename(backend.record_path(id), backend.backup_path(id)).unwrap();

        assert_eq!(backend.account_count().await.unwrap(), 1);
        let records = backend.load_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].balance, Decimal::new(1000, 0));
        assert!(backend.record_path(id).exists());
    }

    #[tokio::test]
    async fn test_count_ignores_backup_and_temp() {
        let (backend, _temp) = backend().await;
        let id = AccountId::random();
        let record = backend.load_account(id, Decimal::ONE).await.unwrap().record;
        backend.save_account(&record).await.unwrap();
        std::fs::write(backend.temp_path(id), b"partial").unwrap();

        assert_eq!(backend.account_count().await.unwrap(), 1);
        assert_eq!(backend.load_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_legacy_migration() {
        let temp = TempDir::new().unwrap();
        let id = uuid::Uuid::new_v4();
        std::fs::write(
            temp.path().join(LEGACY_FILE),
            format!(
                r#"{{"Balances":[{{"Uuid":"{}","Balance":250.5,"TotalEarned":300.0,"TotalSpent":49.5,"LastTransaction":"+50 (Quest)","LastTransactionTime":1700000000000}}]}}"#,
                id
            ),
        )
        .unwrap();

        let backend = FileBackend::new(temp.path());
        backend.initialize().await.unwrap();

        assert!(!temp.path().join(LEGACY_FILE).exists());
        assert!(temp.path().join(LEGACY_MIGRATED).exists());

        let loaded = backend.load_account(AccountId::new(id), Decimal::ZERO).await.unwrap();
        assert!(!loaded.created);
        assert_eq!(loaded.record.balance, Decimal::new(2505, 1));
        assert_eq!(loaded.record.total_spent, Decimal::new(495, 1));
        assert!(loaded.record.last_transaction_at.is_some());
    }

    #[tokio::test]
    async fn test_names_survive_restart() {
        let temp = TempDir::new().unwrap();
        let id = AccountId::random();
        {
            let backend = FileBackend::new(temp.path());
            backend.initialize().await.unwrap();
            backend.load_account(id, Decimal::ONE).await.unwrap();
            backend.update_display_name(id, "Notch").await.unwrap();
        }

        let backend = FileBackend::new(temp.path());
        backend.initialize().await.unwrap();
        assert_eq!(backend.find_account_by_name("notch").await.unwrap(), Some(id));
    }

    #[test]
    fn test_sync_save() {
        let temp = TempDir::new().unwrap();
        let backend = FileBackend::new(temp.path());
        let record = AccountRecord::with_starting_balance(AccountId::random(), Decimal::TEN, "t");

        backend.save_all_sync(&[record.clone()]).unwrap();
        assert!(backend.record_path(record.id).exists());
    }
}
