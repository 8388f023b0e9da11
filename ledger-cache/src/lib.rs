//! Ledger Cache
//!
//! In-memory, write-back account ledger with pluggable persistence.
//!
//! # Architecture
//!
//! - **Write-back cache**: Balances live in memory; dirty records are flushed
//!   to the backend on a fixed cadence and at shutdown
//! - **Striped locks**: Per-account mutual exclusion without a global lock;
//!   transfers lock both stripes in a fixed order
//! - **Pluggable storage**: RocksDB, JSON files, PostgreSQL or memory behind
//!   one async trait
//! - **Recent-activity journal**: Lock-free ring buffer, optionally mirrored
//!   to durable history by a single writer task
//!
//! # Invariants
//!
//! - Balances never go negative and never exceed the configured ceiling
//!   through deposits or transfer credits
//! - A transfer debits `amount + fee` and credits `amount`, observed as one step
//! - Every committed mutation leaves its account dirty until a flush succeeds

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, clippy::all)]

pub mod actor;
pub mod config;
pub mod error;
pub mod hooks;
pub mod journal;
pub mod leaderboard;
pub mod ledger;
pub mod locks;
pub mod maintenance;
pub mod metrics;
pub mod storage;
pub mod types;

// Re-exports
pub use config::{Config, EconomyConfig, MaintenanceConfig, StorageProvider};
pub use error::{Error, Result};
pub use hooks::{hook_fn, BalanceChange, BalanceHook, ChangeCause, HookDecision, SessionDirectory};
pub use journal::TransactionLogger;
pub use ledger::Ledger;
pub use maintenance::{MaintenanceReport, MaintenanceScheduler};
pub use storage::{ExtendedQueries, StorageBackend, TransactionFilter};
pub use types::{
    AccountId, AccountRecord, BalanceNotification, DepositResult, TopBalanceEntry,
    TransactionEntry, TransactionKind, TransferResult, WithdrawResult,
};
