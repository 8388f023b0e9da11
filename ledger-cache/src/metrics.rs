//! Metrics collection for observability
//!
//! Prometheus collectors registered on a per-ledger registry, so several
//! ledgers (tests, multi-tenant hosts) can coexist in one process.
//!
//! # Metrics
//!
//! - `ledger_mutations_total{kind}` - Committed mutations by transaction kind
//! - `ledger_transfers_total{result}` - Transfer outcomes
//! - `ledger_flushes_total` - Completed flush passes
//! - `ledger_flush_failures_total` - Flush passes that failed and re-marked
//! - `ledger_flushed_records` - Histogram of records per flush
//! - `ledger_cached_accounts` - Accounts resident in the cache
//! - `ledger_dirty_accounts` - Accounts awaiting persistence
//! - `ledger_evictions_total` - Accounts evicted from the cache

use crate::types::{TransactionKind, TransferResult};
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    pub mutations_total: IntCounterVec,
    pub transfers_total: IntCounterVec,
    pub flushes_total: IntCounter,
    pub flush_failures_total: IntCounter,
    pub flushed_records: Histogram,
    pub cached_accounts: IntGauge,
    pub dirty_accounts: IntGauge,
    pub evictions_total: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let mutations_total = IntCounterVec::new(
            Opts::new("ledger_mutations_total", "Committed mutations by transaction kind"),
            &["kind"],
        )?;
        registry.register(Box::new(mutations_total.clone()))?;

        let transfers_total = IntCounterVec::new(
            Opts::new("ledger_transfers_total", "Transfer outcomes"),
            &["result"],
        )?;
        registry.register(Box::new(transfers_total.clone()))?;

        let flushes_total = IntCounter::new("ledger_flushes_total", "Completed flush passes")?;
        registry.register(Box::new(flushes_total.clone()))?;

        let flush_failures_total = IntCounter::new(
            "ledger_flush_failures_total",
            "Flush passes that failed and re-marked their records",
        )?;
        registry.register(Box::new(flush_failures_total.clone()))?;

        let flushed_records = Histogram::with_opts(
            HistogramOpts::new("ledger_flushed_records", "Histogram of records per flush")
                .buckets(vec![1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0]),
        )?;
        registry.register(Box::new(flushed_records.clone()))?;

        let cached_accounts = IntGauge::new("ledger_cached_accounts", "Accounts resident in the cache")?;
        registry.register(Box::new(cached_accounts.clone()))?;

        let dirty_accounts = IntGauge::new("ledger_dirty_accounts", "Accounts awaiting persistence")?;
        registry.register(Box::new(dirty_accounts.clone()))?;

        let evictions_total = IntCounter::new("ledger_evictions_total", "Accounts evicted from the cache")?;
        registry.register(Box::new(evictions_total.clone()))?;

        Ok(Self {
            mutations_total,
            transfers_total,
            flushes_total,
            flush_failures_total,
            flushed_records,
            cached_accounts,
            dirty_accounts,
            evictions_total,
            registry,
        })
    }

    pub fn record_mutation(&self, kind: TransactionKind) {
        self.mutations_total.with_label_values(&[kind.code()]).inc();
    }

    pub fn record_transfer(&self, result: TransferResult) {
        self.transfers_total.with_label_values(&[result.as_str()]).inc();
    }

    /// Record a successful flush of `records` records
    pub fn record_flush(&self, records: usize) {
        self.flushes_total.inc();
        self.flushed_records.observe(records as f64);
    }

    pub fn record_flush_failure(&self) {
        self.flush_failures_total.inc();
    }

    pub fn record_evictions(&self, count: usize) {
        self.evictions_total.inc_by(count as u64);
    }

    /// Refresh the cache gauges
    pub fn update_cache_size(&self, cached: usize, dirty: usize) {
        self.cached_accounts.set(cached as i64);
        self.dirty_accounts.set(dirty as i64);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
