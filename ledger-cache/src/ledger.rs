//! Main ledger orchestration layer
//!
//! This module ties together the account cache, striped locks, journal and
//! storage backend into the high-level balance API.
//!
//! # Example
//!
//! ```no_run
//! use ledger_cache::{AccountId, Config, Ledger};
//! use rust_decimal::Decimal;
//!
//! #[tokio::main]
//! async fn main() -> ledger_cache::Result<()> {
//!     let ledger = Ledger::open(Config::default()).await?;
//!
//!     let alice = AccountId::random();
//!     let bob = AccountId::random();
//!     ledger.ensure_account(alice).await?;
//!
//!     ledger.deposit(alice, Decimal::new(50, 0), "Quest reward").await;
//!     ledger.transfer(alice, bob, Decimal::new(20, 0), "Trade").await;
//!
//!     ledger.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Locking
//!
//! - Every mutation holds the stripe lock of its account(s); transfers lock
//!   both stripes in ascending index order
//! - Transfers apply both legs under the write side of a commit guard;
//!   balance reads take the read side, so a transfer is seen whole or not
//!   at all
//! - Flush, eviction, delete and shutdown serialize on a flush gate
//! - No DashMap reference or commit guard is held across an `.await`

use crate::{
    actor::spawn_journal_writer,
    config::{EconomyConfig, MaintenanceConfig},
    hooks::{self, BalanceChange, BalanceHook, ChangeCause, NoSessions, SessionDirectory},
    journal::TransactionLogger,
    leaderboard::{LeaderboardCache, LeaderboardSnapshot},
    locks::LockTable,
    metrics::Metrics,
    storage::{self, ExtendedQueries, StorageBackend},
    types::{
        AccountId, AccountRecord, BalanceNotification, DepositResult, TransactionEntry,
        TransactionKind, TransferResult, WithdrawResult,
    },
    Config, Error, Result,
};
use arc_swap::ArcSwap;
use chrono::NaiveDate;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Duration;

const NOTIFICATION_CAPACITY: usize = 1024;

/// Cache slot: the record plus its last access tick
struct CachedAccount {
    record: AccountRecord,
    last_access: AtomicU64,
}

/// Write-back account ledger
pub struct Ledger {
    storage: Arc<dyn StorageBackend>,

    /// Economy rules, swappable at runtime
    economy: ArcSwap<EconomyConfig>,

    /// Eviction threshold and shutdown bounds, swappable at runtime
    maintenance: ArcSwap<MaintenanceConfig>,

    accounts: DashMap<AccountId, CachedAccount>,
    locks: LockTable,

    /// Makes the two legs of a transfer one observable step
    commit_guard: RwLock<()>,

    /// Ids whose cached record is newer than the backend's
    dirty: Mutex<HashSet<AccountId>>,

    /// Serializes flush, eviction, delete and shutdown
    flush_gate: tokio::sync::Mutex<()>,

    leaderboard: LeaderboardCache,
    journal: TransactionLogger,
    hooks: ArcSwap<Vec<Arc<dyn BalanceHook>>>,
    sessions: RwLock<Arc<dyn SessionDirectory>>,
    notifications: broadcast::Sender<BalanceNotification>,
    metrics: Metrics,

    /// Logical clock for least-recently-used eviction
    access_clock: AtomicU64,
    closed: AtomicBool,
}

impl Ledger {
    /// Open the backend selected in `config` and build the ledger on it
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let storage = storage::open_backend(&config).await?;
        Self::build(config, storage).await
    }

    /// Build the ledger on a caller-supplied backend, initializing it first
    pub async fn with_storage(config: Config, storage: Arc<dyn StorageBackend>) -> Result<Self> {
        config.validate()?;
        storage
            .initialize()
            .await
            .map_err(|e| Error::BackendUnavailable(format!("{}: {}", storage.name(), e)))?;
        Self::build(config, storage).await
    }

    async fn build(config: Config, storage: Arc<dyn StorageBackend>) -> Result<Self> {
        let metrics = Metrics::new().map_err(|e| Error::Other(format!("Metrics setup failed: {}", e)))?;

        let journal = if config.journal.persist {
            let writer = spawn_journal_writer(storage.clone(), &config.journal);
            TransactionLogger::with_writer(config.journal.ring_capacity, writer)
        } else {
            TransactionLogger::new(config.journal.ring_capacity)
        };

        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        let ledger = Self {
            storage,
            economy: ArcSwap::from_pointee(config.economy),
            locks: LockTable::new(config.maintenance.lock_stripes),
            maintenance: ArcSwap::from_pointee(config.maintenance),
            accounts: DashMap::new(),
            commit_guard: RwLock::new(()),
            dirty: Mutex::new(HashSet::new()),
            flush_gate: tokio::sync::Mutex::new(()),
            leaderboard: LeaderboardCache::new(),
            journal,
            hooks: ArcSwap::from_pointee(Vec::new()),
            sessions: RwLock::new(Arc::new(NoSessions)),
            notifications,
            metrics,
            access_clock: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        };

        let preloaded = ledger.preload().await;
        tracing::info!(
            backend = ledger.storage.name(),
            preloaded,
            "Ledger opened"
        );

        Ok(ledger)
    }

    // Collaborators

    /// Register a pre-commit hook; hooks run in registration order
    pub fn register_hook(&self, hook: Arc<dyn BalanceHook>) {
        self.hooks.rcu(|hooks| {
            let mut hooks = Vec::clone(hooks);
            hooks.push(hook.clone());
            hooks
        });
    }

    /// Replace the session directory
    pub fn set_session_directory(&self, sessions: Arc<dyn SessionDirectory>) {
        *self.sessions.write() = sessions;
    }

    /// Receive a notification after every committed mutation
    pub fn subscribe(&self) -> broadcast::Receiver<BalanceNotification> {
        self.notifications.subscribe()
    }

    /// Current economy rules
    pub fn economy(&self) -> Arc<EconomyConfig> {
        self.economy.load_full()
    }

    /// Swap the economy rules; later operations see the new values.
    /// Rules that fail validation are rejected and the old ones kept.
    pub fn update_economy(&self, economy: EconomyConfig) -> Result<()> {
        economy.validate()?;
        self.economy.store(Arc::new(economy));
        self.leaderboard.invalidate();
        tracing::info!("Economy configuration updated");
        Ok(())
    }

    pub fn journal(&self) -> &TransactionLogger {
        &self.journal
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// Aggregate queries, when the backend offers them
    pub fn extended(&self) -> Option<&dyn ExtendedQueries> {
        self.storage.extended()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn maintenance_config(&self) -> Arc<MaintenanceConfig> {
        self.maintenance.load_full()
    }

    /// Swap the maintenance settings; the next eviction pass and shutdown
    /// see the new values. The stripe count is fixed at open.
    pub fn update_maintenance(&self, config: MaintenanceConfig) -> Result<()> {
        config.validate()?;
        if config.lock_stripes != self.locks.len() {
            tracing::warn!(
                requested = config.lock_stripes,
                active = self.locks.len(),
                "lock_stripes only applies when the ledger is opened"
            );
        }
        self.maintenance.store(Arc::new(config));
        tracing::info!("Maintenance configuration updated");
        Ok(())
    }

    /// Whether `shutdown` has begun; every mutation fails from then on
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // Reads

    /// Cached balance; zero when the account is not resident. Never loads.
    pub fn get_balance(&self, id: AccountId) -> Decimal {
        let _commit = self.commit_guard.read();
        self.accounts
            .get(&id)
            .map(|cached| {
                self.touch(&cached);
                cached.record.balance
            })
            .unwrap_or(Decimal::ZERO)
    }

    /// Several balances read as one consistent view
    pub fn get_balances(&self, ids: &[AccountId]) -> Vec<Decimal> {
        let _commit = self.commit_guard.read();
        ids.iter()
            .map(|id| {
                self.accounts
                    .get(id)
                    .map(|cached| cached.record.balance)
                    .unwrap_or(Decimal::ZERO)
            })
            .collect()
    }

    /// Copy of the cached record
    pub fn get_account(&self, id: AccountId) -> Option<AccountRecord> {
        let _commit = self.commit_guard.read();
        self.accounts.get(&id).map(|cached| {
            self.touch(&cached);
            cached.record.clone()
        })
    }

    pub fn has_balance(&self, id: AccountId, amount: Decimal) -> bool {
        self.get_balance(id) >= amount
    }

    /// Copy of every cached record
    pub fn all_balances(&self) -> HashMap<AccountId, AccountRecord> {
        let _commit = self.commit_guard.read();
        self.accounts
            .iter()
            .map(|entry| (*entry.key(), entry.record.clone()))
            .collect()
    }

    pub fn is_cached(&self, id: AccountId) -> bool {
        self.accounts.contains_key(&id)
    }

    pub fn cached_count(&self) -> usize {
        self.accounts.len()
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.lock().len()
    }

    /// Top `limit` cached accounts by balance.
    ///
    /// Served from a snapshot rebuilt at most once per refresh interval,
    /// so results may lag recent mutations by up to that interval. At most
    /// `leaderboard_size` entries are ever returned.
    pub fn leaderboard(&self, limit: usize) -> Vec<(AccountId, AccountRecord)> {
        let economy = self.economy.load();
        let snapshot = self.leaderboard.get_or_rebuild(economy.leaderboard_refresh(), || {
            let _commit = self.commit_guard.read();
            LeaderboardSnapshot::build(
                self.accounts.iter().map(|entry| entry.record.clone()),
                economy.leaderboard_size,
            )
        });
        snapshot.top(limit)
    }

    /// Look up an account by display name, cache first
    pub async fn find_account_by_name(&self, name: &str) -> Result<Option<AccountId>> {
        let cached = self
            .accounts
            .iter()
            .find(|entry| {
                entry
                    .record
                    .display_name
                    .as_deref()
                    .is_some_and(|n| n.eq_ignore_ascii_case(name))
            })
            .map(|entry| *entry.key());

        match cached {
            Some(id) => Ok(Some(id)),
            None => self.storage.find_account_by_name(name).await,
        }
    }

    // Mutations

    /// Make sure the account is resident, creating it with the starting
    /// balance when the backend has none. Returns whether it was created.
    pub async fn ensure_account(&self, id: AccountId) -> Result<bool> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let _guard = self.locks.lock(&id).await;
        self.load_locked(id).await
    }

    /// Credit an account, loading it on demand
    pub async fn deposit(&self, id: AccountId, amount: Decimal, reason: &str) -> DepositResult {
        if amount <= Decimal::ZERO {
            return DepositResult::InvalidAmount;
        }
        if self.is_closed() {
            return DepositResult::AccountNotFound;
        }

        let _guard = self.locks.lock(&id).await;
        let Some(current) = self.resident_balance(id).await else {
            return DepositResult::AccountNotFound;
        };
        let Some(proposed) = current.checked_add(amount) else {
            return DepositResult::ExceedsMaxBalance;
        };

        let Some(target) = self.run_hooks(id, current, proposed, ChangeCause::Deposit, reason) else {
            return DepositResult::EventCancelled;
        };
        if target <= current {
            return DepositResult::EventCancelled;
        }
        if target > self.economy.load().max_balance {
            return DepositResult::ExceedsMaxBalance;
        }

        let credited = target - current;
        let new_balance = self.apply(id, |record| record.credit(credited, reason));
        self.mark_dirty(id);

        if let Some(kind) = TransactionKind::for_deposit(reason) {
            self.log_single(kind, id, credited);
        }
        self.notify(id, new_balance, credited);

        DepositResult::Success
    }

    /// Debit a cached account. Never loads: an account that is not
    /// resident is reported as not found.
    pub async fn withdraw(&self, id: AccountId, amount: Decimal, reason: &str) -> WithdrawResult {
        if amount <= Decimal::ZERO {
            return WithdrawResult::InvalidAmount;
        }
        if self.is_closed() {
            return WithdrawResult::AccountNotFound;
        }

        let _guard = self.locks.lock(&id).await;
        let Some(current) = self.cached_balance(id) else {
            return WithdrawResult::AccountNotFound;
        };

        let Some(target) = self.run_hooks(id, current, current - amount, ChangeCause::Withdraw, reason) else {
            return WithdrawResult::EventCancelled;
        };
        if target < Decimal::ZERO {
            return WithdrawResult::InsufficientFunds;
        }
        if target >= current {
            return WithdrawResult::EventCancelled;
        }

        let debited = current - target;
        let new_balance = self.apply(id, |record| record.debit(debited, reason));
        self.mark_dirty(id);

        if let Some(kind) = TransactionKind::for_withdraw(reason) {
            self.log_single(kind, id, debited);
        }
        self.notify(id, new_balance, -debited);

        WithdrawResult::Success
    }

    /// Administrative overwrite, clamped at zero. Returns false when the
    /// account cannot be loaded, a hook vetoes the change or the ledger
    /// is closed.
    pub async fn set_balance(&self, id: AccountId, amount: Decimal, reason: &str) -> bool {
        if self.is_closed() {
            return false;
        }
        let _guard = self.locks.lock(&id).await;
        let Some(current) = self.resident_balance(id).await else {
            return false;
        };

        let Some(target) = self.run_hooks(id, current, amount, ChangeCause::Set, reason) else {
            return false;
        };

        let new_balance = self.apply(id, |record| record.overwrite(target, reason));
        self.mark_dirty(id);
        self.log_single(TransactionKind::for_set(reason), id, new_balance);
        self.notify(id, new_balance, new_balance - current);

        true
    }

    /// Move `amount` from one account to another.
    ///
    /// The sender pays `amount` plus the configured fee; the recipient
    /// receives exactly `amount`. The fee leaves the economy.
    pub async fn transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Decimal,
        reason: &str,
    ) -> TransferResult {
        let result = self.transfer_locked(from, to, amount, reason).await;
        self.metrics.record_transfer(result);
        result
    }

    async fn transfer_locked(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Decimal,
        reason: &str,
    ) -> TransferResult {
        if from == to {
            return TransferResult::SelfTransfer;
        }
        if amount <= Decimal::ZERO {
            return TransferResult::InvalidAmount;
        }
        if self.is_closed() {
            return TransferResult::AccountUnavailable;
        }

        // No balance can cover a debit past the numeric range
        let economy = self.economy.load_full();
        let Some(fee) = economy.fee_for(amount) else {
            return TransferResult::InsufficientFunds;
        };
        let Some(total) = amount.checked_add(fee) else {
            return TransferResult::InsufficientFunds;
        };

        let _guard = self.locks.lock_pair(&from, &to).await;
        let Some(from_balance) = self.resident_balance(from).await else {
            return TransferResult::AccountUnavailable;
        };
        let Some(to_balance) = self.resident_balance(to).await else {
            return TransferResult::AccountUnavailable;
        };

        if from_balance < total {
            return TransferResult::InsufficientFunds;
        }
        match to_balance.checked_add(amount) {
            Some(credited) if credited <= economy.max_balance => {}
            _ => return TransferResult::RecipientMaxBalance,
        }

        let from_name = self.resolve_name(from);
        let to_name = self.resolve_name(to);
        let debit_reason = format!("Transfer to {}: {}", to, reason);
        let credit_reason = format!("Transfer from {}: {}", from, reason);

        let (from_after, to_after) = {
            let _commit = self.commit_guard.write();
            let from_after = self.apply(from, |record| record.debit(total, &debit_reason));
            let to_after = self.apply(to, |record| record.credit(amount, &credit_reason));

            let mut dirty = self.dirty.lock();
            dirty.insert(from);
            dirty.insert(to);
            (from_after, to_after)
        };

        self.journal
            .log(TransactionEntry::transfer(from, &from_name, to, &to_name, amount));
        self.metrics.record_mutation(TransactionKind::Pay);

        self.notify(from, from_after, -total);
        self.notify(to, to_after, amount);

        tracing::debug!(%from, %to, %amount, %fee, "Transfer committed");
        TransferResult::Success
    }

    /// Record a new display name in the cache and the backend's name index
    pub async fn update_display_name(&self, id: AccountId, name: &str) -> Result<()> {
        if let Some(mut cached) = self.accounts.get_mut(&id) {
            cached.record.display_name = Some(name.to_string());
        }
        self.storage.update_display_name(id, name).await
    }

    /// Remove an account from the cache and the backend
    pub async fn delete_account(&self, id: AccountId) -> Result<bool> {
        let _gate = self.flush_gate.lock().await;
        let _guard = self.locks.lock(&id).await;

        let was_cached = self.accounts.remove(&id).is_some();
        self.dirty.lock().remove(&id);
        self.leaderboard.invalidate();

        let existed = self.storage.delete_account(id).await?;
        tracing::info!(account = %id, "Account deleted");
        Ok(existed || was_cached)
    }

    /// Flag a resident account for the next flush
    pub fn mark_dirty(&self, id: AccountId) {
        self.dirty.lock().insert(id);
    }

    // Persistence

    /// Load every stored record into the cache, keeping resident records.
    /// Failure is logged and leaves the ledger loading on demand.
    pub async fn preload(&self) -> usize {
        match self.storage.load_all().await {
            Ok(records) => {
                let count = records.len();
                for record in records {
                    let tick = self.tick();
                    self.accounts.entry(record.id).or_insert_with(|| CachedAccount {
                        record,
                        last_access: AtomicU64::new(tick),
                    });
                }
                self.refresh_gauges();
                tracing::info!(count, "Bulk preloaded accounts");
                count
            }
            Err(e) => {
                tracing::warn!(error = %e, "Bulk preload failed, loading on demand");
                0
            }
        }
    }

    /// Write every dirty record to the backend.
    ///
    /// On failure the ids are re-marked dirty and retried on the next
    /// flush. Returns the number of records written.
    pub async fn force_flush(&self) -> Result<usize> {
        let _gate = self.flush_gate.lock().await;
        self.flush_dirty().await
    }

    async fn flush_dirty(&self) -> Result<usize> {
        let (ids, records) = {
            let _commit = self.commit_guard.read();
            let ids = std::mem::take(&mut *self.dirty.lock());
            let records: Vec<AccountRecord> = ids
                .iter()
                .filter_map(|id| self.accounts.get(id).map(|cached| cached.record.clone()))
                .collect();
            (ids, records)
        };

        if records.is_empty() {
            return Ok(0);
        }

        match self.storage.save_all(&records).await {
            Ok(()) => {
                self.metrics.record_flush(records.len());
                self.refresh_gauges();
                tracing::debug!(count = records.len(), "Flushed dirty accounts");
                Ok(records.len())
            }
            Err(e) => {
                self.dirty.lock().extend(ids);
                self.metrics.record_flush_failure();
                self.refresh_gauges();
                tracing::error!(error = %e, count = records.len(), "Flush failed, accounts re-marked dirty");
                Err(e)
            }
        }
    }

    /// Trim the cache back to `max_cached_accounts`.
    ///
    /// Active, dirty and locked accounts are never evicted; the least
    /// recently accessed go first. Returns the number evicted.
    pub async fn evict_idle(&self) -> usize {
        let _gate = self.flush_gate.lock().await;

        let max = self.maintenance.load().max_cached_accounts;
        let cached = self.accounts.len();
        if cached <= max {
            return 0;
        }

        let active: HashSet<AccountId> = self.sessions.read().active_accounts().into_iter().collect();
        let dirty = self.dirty.lock().clone();

        let mut candidates: Vec<(u64, AccountId)> = self
            .accounts
            .iter()
            .filter(|entry| !active.contains(entry.key()) && !dirty.contains(entry.key()))
            .map(|entry| (entry.last_access.load(Ordering::Relaxed), *entry.key()))
            .collect();
        candidates.sort_unstable();

        let excess = cached - max;
        let mut evicted = 0;
        for (_, id) in candidates {
            if evicted >= excess {
                break;
            }
            let Some(_guard) = self.locks.try_lock(&id) else {
                continue;
            };
            // Re-check under the lock; a mutation may have landed since
            if self.dirty.lock().contains(&id) {
                continue;
            }
            if self.accounts.remove(&id).is_some() {
                evicted += 1;
            }
        }

        if evicted > 0 {
            self.metrics.record_evictions(evicted);
            self.refresh_gauges();
            tracing::debug!(evicted, remaining = self.accounts.len(), "Evicted idle accounts");
        }
        evicted
    }

    /// Flush, then record today's balances for trend rankings. `None`
    /// when the backend has no aggregate queries.
    pub async fn record_daily_snapshot(&self, day: NaiveDate) -> Result<Option<usize>> {
        if self.storage.extended().is_none() {
            return Ok(None);
        }
        self.force_flush().await?;

        match self.storage.extended() {
            Some(queries) => Ok(Some(queries.snapshot_balances(day).await?)),
            None => Ok(None),
        }
    }

    /// Persist the whole cache and release the backend.
    ///
    /// Prefers the backend's synchronous save path; otherwise the save is
    /// bounded by `save_timeout_secs`. Backend shutdown is bounded by
    /// `storage_shutdown_timeout_secs`. Timeouts and save failures are
    /// logged, never returned. Mutations fail once shutdown has begun.
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let maintenance = self.maintenance.load_full();
        tracing::info!(
            dirty = self.dirty_count(),
            cached = self.cached_count(),
            "Ledger shutdown starting"
        );

        if let Some(writer) = self.journal.writer() {
            if let Err(e) = writer.shutdown().await {
                tracing::warn!(error = %e, "Journal writer did not shut down cleanly");
            }
        }

        let _gate = self.flush_gate.lock().await;

        let (ids, records) = {
            let _commit = self.commit_guard.read();
            let ids = std::mem::take(&mut *self.dirty.lock());
            let records: Vec<AccountRecord> =
                self.accounts.iter().map(|entry| entry.record.clone()).collect();
            (ids, records)
        };

        if !records.is_empty() {
            tracing::info!(count = records.len(), "Saving cached accounts");
            if let Err(e) = self.save_for_shutdown(records, maintenance.save_timeout_secs).await {
                self.dirty.lock().extend(ids);
                match e {
                    Error::Timeout(_) => tracing::warn!(error = %e, "Shutdown save timed out, data may be lost"),
                    _ => tracing::error!(error = %e, "Shutdown save failed"),
                }
            }
        }

        let shutdown_timeout = Duration::from_secs(maintenance.storage_shutdown_timeout_secs);
        match tokio::time::timeout(shutdown_timeout, self.storage.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "Error during storage shutdown"),
            Err(_) => tracing::warn!(
                timeout_secs = maintenance.storage_shutdown_timeout_secs,
                "Storage shutdown timed out"
            ),
        }

        tracing::info!("Ledger shutdown complete");
        Ok(())
    }

    async fn save_for_shutdown(&self, records: Vec<AccountRecord>, timeout_secs: u64) -> Result<()> {
        if self.storage.supports_sync_save() {
            let storage = self.storage.clone();
            tokio::task::spawn_blocking(move || storage.save_all_sync(&records)).await??;
            tracing::info!("Cached accounts saved (sync)");
            return Ok(());
        }

        let save_timeout = Duration::from_secs(timeout_secs);
        match tokio::time::timeout(save_timeout, self.storage.save_all(&records)).await {
            Ok(result) => {
                result?;
                tracing::info!("Cached accounts saved");
                Ok(())
            }
            Err(_) => Err(Error::Timeout(format!("save_all exceeded {}s", timeout_secs))),
        }
    }

    // Internals

    fn tick(&self) -> u64 {
        self.access_clock.fetch_add(1, Ordering::Relaxed)
    }

    fn touch(&self, cached: &CachedAccount) {
        cached.last_access.store(self.tick(), Ordering::Relaxed);
    }

    /// Load `id` into the cache if absent. Caller holds the stripe lock.
    async fn load_locked(&self, id: AccountId) -> Result<bool> {
        if let Some(cached) = self.accounts.get(&id) {
            self.touch(&cached);
            return Ok(false);
        }

        let starting_balance = self.economy.load().starting_balance;
        let loaded = self.storage.load_account(id, starting_balance).await?;

        let mut record = loaded.record;
        if record.display_name.is_none() {
            record.display_name = self.sessions.read().display_name(id);
        }

        self.accounts.insert(
            id,
            CachedAccount {
                record,
                last_access: AtomicU64::new(self.tick()),
            },
        );
        if loaded.created {
            self.mark_dirty(id);
            tracing::debug!(account = %id, "Created account");
        }
        self.metrics.cached_accounts.set(self.accounts.len() as i64);

        Ok(loaded.created)
    }

    /// Balance of `id` after loading it on demand. Caller holds the stripe
    /// lock. `None` when the backend could not produce the account.
    async fn resident_balance(&self, id: AccountId) -> Option<Decimal> {
        if let Err(e) = self.load_locked(id).await {
            tracing::warn!(account = %id, error = %e, "Failed to load account");
            return None;
        }
        self.accounts.get(&id).map(|cached| cached.record.balance)
    }

    /// Balance of a resident account without loading
    fn cached_balance(&self, id: AccountId) -> Option<Decimal> {
        self.accounts.get(&id).map(|cached| {
            self.touch(&cached);
            cached.record.balance
        })
    }

    /// Mutate a resident record; returns the new balance
    fn apply<F>(&self, id: AccountId, mutate: F) -> Decimal
    where
        F: FnOnce(&mut AccountRecord),
    {
        match self.accounts.get_mut(&id) {
            Some(mut cached) => {
                mutate(&mut cached.record);
                cached.last_access.store(self.tick(), Ordering::Relaxed);
                cached.record.balance
            }
            None => {
                tracing::error!(account = %id, "Locked account missing from cache");
                Decimal::ZERO
            }
        }
    }

    fn run_hooks(
        &self,
        id: AccountId,
        current: Decimal,
        proposed: Decimal,
        cause: ChangeCause,
        reason: &str,
    ) -> Option<Decimal> {
        let registered = self.hooks.load();
        hooks::evaluate(
            registered.as_slice(),
            BalanceChange {
                account: id,
                current,
                proposed,
                cause,
                reason,
            },
        )
    }

    /// Session name, then cached name, then a shortened id
    fn resolve_name(&self, id: AccountId) -> String {
        let sessions = self.sessions.read().clone();
        sessions
            .display_name(id)
            .or_else(|| {
                self.accounts
                    .get(&id)
                    .and_then(|cached| cached.record.display_name.clone())
            })
            .unwrap_or_else(|| id.short_name())
    }

    fn log_single(&self, kind: TransactionKind, id: AccountId, amount: Decimal) {
        let name = self.resolve_name(id);
        self.journal.log(TransactionEntry::single(kind, id, name, amount));
        self.metrics.record_mutation(kind);
    }

    fn notify(&self, account: AccountId, new_balance: Decimal, delta: Decimal) {
        // No subscribers is fine
        let _ = self.notifications.send(BalanceNotification {
            account,
            new_balance,
            delta,
        });
    }

    fn refresh_gauges(&self) {
        self.metrics
            .update_cache_size(self.accounts.len(), self.dirty.lock().len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageProvider;
    use crate::hooks::{hook_fn, HookDecision};
    use crate::storage::MemoryBackend;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.storage.provider = StorageProvider::Memory;
        config.journal.persist = false;
        config
    }

    async fn test_ledger() -> (Ledger, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let ledger = Ledger::with_storage(test_config(), backend.clone()).await.unwrap();
        (ledger, backend)
    }

    fn dec(v: i64) -> Decimal {
        Decimal::new(v, 0)
    }

    #[tokio::test]
    async fn test_ensure_account_is_idempotent() {
        let (ledger, _) = test_ledger().await;
        let id = AccountId::random();

        assert!(ledger.ensure_account(id).await.unwrap());
        assert_eq!(ledger.dirty_count(), 1);
        ledger.force_flush().await.unwrap();

        assert!(!ledger.ensure_account(id).await.unwrap());
        assert_eq!(ledger.get_balance(id), dec(100));
        assert_eq!(ledger.dirty_count(), 0);
    }

    #[tokio::test]
    async fn test_get_balance_does_not_load() {
        let (ledger, backend) = test_ledger().await;
        let id = AccountId::random();
        backend
            .save_account(&AccountRecord::with_starting_balance(id, dec(70), "seed"))
            .await
            .unwrap();

        assert!(!ledger.is_cached(id));
        assert_eq!(ledger.get_balance(id), Decimal::ZERO);

        ledger.ensure_account(id).await.unwrap();
        assert_eq!(ledger.get_balance(id), dec(70));
    }

    #[tokio::test]
    async fn test_deposit_and_withdraw() {
        let (ledger, _) = test_ledger().await;
        let id = AccountId::random();

        assert_eq!(ledger.deposit(id, dec(50), "Earn").await, DepositResult::Success);
        assert_eq!(ledger.get_balance(id), dec(150));
        assert_eq!(ledger.withdraw(id, dec(200), "Spend").await, WithdrawResult::InsufficientFunds);
        assert_eq!(ledger.get_balance(id), dec(150));
        assert_eq!(ledger.withdraw(id, dec(30), "Spend").await, WithdrawResult::Success);

        let record = ledger.get_account(id).unwrap();
        assert_eq!(record.balance, dec(120));
        assert_eq!(record.total_earned, dec(150));
        assert_eq!(record.total_spent, dec(30));
    }

    #[tokio::test]
    async fn test_withdraw_never_creates_accounts() {
        let (ledger, backend) = test_ledger().await;
        let id = AccountId::random();

        assert_eq!(ledger.withdraw(id, dec(30), "Spend").await, WithdrawResult::AccountNotFound);
        assert!(!ledger.is_cached(id));
        assert_eq!(ledger.dirty_count(), 0);
        assert!(backend.stored(id).is_none());

        // A stored but evicted account is not resident either
        backend
            .save_account(&AccountRecord::with_starting_balance(id, dec(70), "seed"))
            .await
            .unwrap();
        assert_eq!(ledger.withdraw(id, dec(30), "Spend").await, WithdrawResult::AccountNotFound);
        assert_eq!(backend.stored(id).unwrap().balance, dec(70));
    }

    #[tokio::test]
    async fn test_extreme_amounts_are_rejected() {
        let (ledger, _) = test_ledger().await;
        let a = AccountId::random();
        let b = AccountId::random();
        ledger.ensure_account(a).await.unwrap();
        ledger.ensure_account(b).await.unwrap();

        assert_eq!(ledger.deposit(a, Decimal::MAX, "Earn").await, DepositResult::ExceedsMaxBalance);
        assert_eq!(ledger.transfer(a, b, Decimal::MAX, "Pay").await, TransferResult::InsufficientFunds);

        // Fee-free with no ceiling: the recipient credit itself overflows
        ledger
            .update_economy(EconomyConfig {
                max_balance: Decimal::MAX,
                transfer_fee: Decimal::ZERO,
                ..EconomyConfig::default()
            })
            .unwrap();
        assert!(ledger.set_balance(a, Decimal::MAX, "Admin set").await);
        assert_eq!(
            ledger.transfer(a, b, Decimal::MAX, "Pay").await,
            TransferResult::RecipientMaxBalance
        );

        assert_eq!(ledger.get_balances(&[a, b]), vec![Decimal::MAX, dec(100)]);
    }

    #[tokio::test]
    async fn test_invalid_economy_is_rejected() {
        let (ledger, _) = test_ledger().await;

        let negative_fee = EconomyConfig {
            transfer_fee: Decimal::new(-5, 1),
            ..EconomyConfig::default()
        };
        assert!(matches!(ledger.update_economy(negative_fee), Err(Error::Config(_))));

        let ceiling_below_start = EconomyConfig {
            max_balance: dec(50),
            ..EconomyConfig::default()
        };
        assert!(ledger.update_economy(ceiling_below_start).is_err());
        assert_eq!(*ledger.economy(), EconomyConfig::default());

        // The old 5% fee still applies
        let a = AccountId::random();
        let b = AccountId::random();
        assert_eq!(ledger.transfer(a, b, dec(20), "Pay").await, TransferResult::Success);
        assert_eq!(ledger.get_balances(&[a, b]), vec![dec(79), dec(120)]);
    }

    #[tokio::test]
    async fn test_mutations_fail_after_shutdown() {
        let (ledger, backend) = test_ledger().await;
        let a = AccountId::random();
        let b = AccountId::random();
        ledger.ensure_account(a).await.unwrap();
        ledger.ensure_account(b).await.unwrap();
        ledger.shutdown().await.unwrap();
        assert!(ledger.is_closed());

        assert_eq!(ledger.deposit(a, dec(5), "Earn").await, DepositResult::AccountNotFound);
        assert_eq!(ledger.withdraw(a, dec(5), "Spend").await, WithdrawResult::AccountNotFound);
        assert!(!ledger.set_balance(a, dec(5), "Admin set").await);
        assert_eq!(ledger.transfer(a, b, dec(5), "Pay").await, TransferResult::AccountUnavailable);
        assert!(matches!(ledger.ensure_account(AccountId::random()).await, Err(Error::Closed)));

        assert_eq!(ledger.get_balances(&[a, b]), vec![dec(100), dec(100)]);
        assert_eq!(ledger.dirty_count(), 0);
        assert_eq!(backend.stored(a).unwrap().balance, dec(100));
        assert_eq!(ledger.journal().total_logged(), 0);
    }

    #[tokio::test]
    async fn test_maintenance_update_reaches_eviction() {
        let (ledger, _) = test_ledger().await;
        for _ in 0..3 {
            ledger.ensure_account(AccountId::random()).await.unwrap();
        }
        ledger.force_flush().await.unwrap();
        assert_eq!(ledger.evict_idle().await, 0);

        ledger
            .update_maintenance(MaintenanceConfig {
                max_cached_accounts: 1,
                ..MaintenanceConfig::default()
            })
            .unwrap();
        assert_eq!(ledger.maintenance_config().max_cached_accounts, 1);
        assert_eq!(ledger.evict_idle().await, 2);
        assert_eq!(ledger.cached_count(), 1);

        let bad_time = MaintenanceConfig {
            snapshot_time: "noon".to_string(),
            ..MaintenanceConfig::default()
        };
        assert!(ledger.update_maintenance(bad_time).is_err());
        assert_eq!(ledger.maintenance_config().max_cached_accounts, 1);
    }

    #[tokio::test]
    async fn test_invalid_amounts() {
        let (ledger, _) = test_ledger().await;
        let id = AccountId::random();

        assert_eq!(ledger.deposit(id, Decimal::ZERO, "x").await, DepositResult::InvalidAmount);
        assert_eq!(ledger.withdraw(id, dec(-1), "x").await, WithdrawResult::InvalidAmount);
        assert_eq!(
            ledger.transfer(id, AccountId::random(), Decimal::ZERO, "x").await,
            TransferResult::InvalidAmount
        );
        assert!(!ledger.is_cached(id));
    }

    #[tokio::test]
    async fn test_deposit_respects_ceiling() {
        let (ledger, _) = test_ledger().await;
        ledger.update_economy(EconomyConfig {
            max_balance: dec(200),
            ..EconomyConfig::default()
        })
        .unwrap();
        let id = AccountId::random();

        assert_eq!(ledger.deposit(id, dec(101), "Earn").await, DepositResult::ExceedsMaxBalance);
        assert_eq!(ledger.deposit(id, dec(100), "Earn").await, DepositResult::Success);
        assert_eq!(ledger.get_balance(id), dec(200));
    }

    #[tokio::test]
    async fn test_set_balance_clamps_and_classifies() {
        let (ledger, _) = test_ledger().await;
        let id = AccountId::random();

        assert!(ledger.set_balance(id, dec(-40), "Admin set").await);
        assert_eq!(ledger.get_balance(id), Decimal::ZERO);
        assert_eq!(ledger.journal().get_recent(1)[0].kind, TransactionKind::Set);

        assert!(ledger.set_balance(id, dec(10), "Season Reset").await);
        assert_eq!(ledger.journal().get_recent(1)[0].kind, TransactionKind::Reset);
        assert_eq!(ledger.journal().get_recent(1)[0].amount, dec(10));
    }

    #[tokio::test]
    async fn test_reason_prefix_classification() {
        let (ledger, _) = test_ledger().await;
        let id = AccountId::random();

        ledger.deposit(id, dec(5), "Admin grant").await;
        ledger.withdraw(id, dec(1), "Admin fine").await;
        ledger.deposit(id, dec(5), "Transfer from nowhere").await;
        ledger.withdraw(id, dec(1), "Shop").await;

        let kinds: Vec<TransactionKind> = ledger.journal().all().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![TransactionKind::Spend, TransactionKind::Take, TransactionKind::Give]
        );
    }

    #[tokio::test]
    async fn test_hook_veto_leaves_no_trace() {
        let (ledger, _) = test_ledger().await;
        let id = AccountId::random();
        ledger.ensure_account(id).await.unwrap();
        ledger.force_flush().await.unwrap();

        ledger.register_hook(hook_fn(|change| {
            if change.reason == "blocked" {
                HookDecision::Deny
            } else {
                HookDecision::Allow
            }
        }));

        assert_eq!(ledger.deposit(id, dec(5), "blocked").await, DepositResult::EventCancelled);
        assert_eq!(ledger.withdraw(id, dec(5), "blocked").await, WithdrawResult::EventCancelled);
        assert!(!ledger.set_balance(id, dec(5), "blocked").await);

        assert_eq!(ledger.get_balance(id), dec(100));
        assert_eq!(ledger.dirty_count(), 0);
        assert_eq!(ledger.journal().total_logged(), 0);
    }

    #[tokio::test]
    async fn test_hook_adjustment_is_validated() {
        let (ledger, _) = test_ledger().await;
        ledger.update_economy(EconomyConfig {
            max_balance: dec(500),
            ..EconomyConfig::default()
        })
        .unwrap();
        let id = AccountId::random();

        ledger.register_hook(hook_fn(|change| match change.cause {
            ChangeCause::Deposit => HookDecision::Adjust(change.proposed * dec(10)),
            _ => HookDecision::Allow,
        }));

        // 110 becomes 1100, over the ceiling
        assert_eq!(ledger.deposit(id, dec(10), "Earn").await, DepositResult::ExceedsMaxBalance);
        assert_eq!(ledger.get_balance(id), dec(100));

        // 50 becomes 500, right at it
        assert!(ledger.set_balance(id, dec(40), "Admin set").await);
        assert_eq!(ledger.deposit(id, dec(10), "Earn").await, DepositResult::Success);
        assert_eq!(ledger.get_balance(id), dec(500));
        assert_eq!(ledger.get_account(id).unwrap().total_earned, dec(460));
    }

    #[tokio::test]
    async fn test_transfer_scenario() {
        let (ledger, _) = test_ledger().await;
        let a = AccountId::random();
        let b = AccountId::random();

        ledger.ensure_account(a).await.unwrap();
        assert_eq!(ledger.deposit(a, dec(50), "Earn").await, DepositResult::Success);
        assert_eq!(ledger.get_balance(a), dec(150));
        assert_eq!(ledger.get_account(a).unwrap().total_earned, dec(50));

        assert_eq!(ledger.withdraw(a, dec(200), "Spend").await, WithdrawResult::InsufficientFunds);
        assert_eq!(ledger.get_balance(a), dec(150));

        ledger.ensure_account(b).await.unwrap();
        assert!(ledger.set_balance(b, Decimal::ZERO, "Admin set").await);

        assert_eq!(ledger.transfer(a, b, dec(100), "Pay").await, TransferResult::Success);
        assert_eq!(ledger.get_balances(&[a, b]), vec![dec(45), dec(100)]);

        let entry = &ledger.journal().get_recent(1)[0];
        assert_eq!(entry.kind, TransactionKind::Pay);
        assert_eq!(entry.target, Some(b));
        assert_eq!(entry.amount, dec(100));
    }

    #[tokio::test]
    async fn test_transfer_rejections() {
        let (ledger, _) = test_ledger().await;
        let a = AccountId::random();
        let b = AccountId::random();

        assert_eq!(ledger.transfer(a, a, dec(1), "x").await, TransferResult::SelfTransfer);
        assert!(!ledger.is_cached(a));

        // 100 + 5% fee = 105 > 100
        assert_eq!(ledger.transfer(a, b, dec(100), "x").await, TransferResult::InsufficientFunds);

        ledger.update_economy(EconomyConfig {
            max_balance: dec(150),
            ..EconomyConfig::default()
        })
        .unwrap();
        assert_eq!(ledger.transfer(a, b, dec(51), "x").await, TransferResult::RecipientMaxBalance);
        assert_eq!(ledger.get_balances(&[a, b]), vec![dec(100), dec(100)]);
    }

    #[tokio::test]
    async fn test_notifications() {
        let (ledger, _) = test_ledger().await;
        let mut rx = ledger.subscribe();
        let a = AccountId::random();
        let b = AccountId::random();

        ledger.transfer(a, b, dec(10), "Pay").await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.account, a);
        assert_eq!(first.delta, Decimal::new(-105, 1));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.account, b);
        assert_eq!(second.new_balance, dec(110));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leaderboard_refresh_window() {
        let (ledger, _) = test_ledger().await;
        let a = AccountId::random();
        let b = AccountId::random();
        ledger.ensure_account(a).await.unwrap();
        ledger.ensure_account(b).await.unwrap();
        ledger.deposit(a, dec(10), "Earn").await;

        assert_eq!(ledger.leaderboard(1)[0].0, a);

        ledger.deposit(b, dec(100), "Earn").await;
        assert_eq!(ledger.leaderboard(1)[0].0, a, "snapshot is still fresh");

        tokio::time::advance(Duration::from_millis(2_001)).await;
        assert_eq!(ledger.leaderboard(1)[0].0, b);
        assert_eq!(ledger.leaderboard(10).len(), 2);
    }

    #[tokio::test]
    async fn test_flush_writes_dirty_records() {
        let (ledger, backend) = test_ledger().await;
        let id = AccountId::random();
        ledger.deposit(id, dec(25), "Earn").await;

        assert_eq!(ledger.force_flush().await.unwrap(), 1);
        assert_eq!(backend.stored(id).unwrap().balance, dec(125));
        assert_eq!(ledger.force_flush().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_account() {
        let (ledger, backend) = test_ledger().await;
        let id = AccountId::random();
        ledger.ensure_account(id).await.unwrap();
        ledger.force_flush().await.unwrap();

        assert!(ledger.delete_account(id).await.unwrap());
        assert!(!ledger.is_cached(id));
        assert!(backend.stored(id).is_none());
        assert_eq!(ledger.dirty_count(), 0);
    }

    #[tokio::test]
    async fn test_display_names() {
        let (ledger, _) = test_ledger().await;
        let id = AccountId::random();
        ledger.ensure_account(id).await.unwrap();
        ledger.update_display_name(id, "Alex").await.unwrap();

        assert_eq!(ledger.find_account_by_name("alex").await.unwrap(), Some(id));
        ledger.deposit(id, dec(1), "Earn").await;
        assert_eq!(ledger.journal().get_recent(1)[0].display_name, "Alex");

        let stranger = AccountId::random();
        ledger.deposit(stranger, dec(1), "Earn").await;
        assert_eq!(ledger.journal().get_recent(1)[0].display_name, stranger.short_name());
    }
}
