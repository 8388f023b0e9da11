//! Background maintenance loop
//!
//! Every `auto_flush_interval_secs` the scheduler:
//! - Flushes dirty accounts to the backend
//! - Evicts idle accounts once the cache is over `max_cached_accounts`
//! - Records the daily balance snapshot after `snapshot_time` (UTC), once
//!   per day, when the backend supports aggregate queries
//!
//! Settings are read from the ledger on every cycle, so one update reaches
//! the loop, eviction and shutdown alike.

use crate::config::MaintenanceConfig;
use crate::ledger::Ledger;
use crate::Result;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outcome of one maintenance pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub flushed: usize,
    pub evicted: usize,
    /// Accounts recorded in today's snapshot, when one was taken
    pub snapshot: Option<usize>,
}

/// Periodic flush, eviction and snapshot driver
pub struct MaintenanceScheduler {
    ledger: Arc<Ledger>,
    last_snapshot: RwLock<Option<NaiveDate>>,
    stop_tx: watch::Sender<bool>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl MaintenanceScheduler {
    pub fn new(ledger: Arc<Ledger>) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            ledger,
            last_snapshot: RwLock::new(None),
            stop_tx,
            task: parking_lot::Mutex::new(None),
        })
    }

    /// Spawn the loop; a second call while running is a no-op
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let scheduler = self.clone();
        let mut stop_rx = self.stop_tx.subscribe();
        *task = Some(tokio::spawn(async move {
            info!("Starting maintenance scheduler");
            loop {
                let interval = scheduler.ledger.maintenance_config().flush_interval();
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stop_rx.changed() => break,
                }

                match scheduler.run_once(Utc::now()).await {
                    Ok(report) => debug!(?report, "Maintenance pass complete"),
                    Err(e) => warn!("Maintenance pass failed: {}", e),
                }
            }
            info!("Maintenance scheduler stopped");
        }));
    }

    /// Stop the loop and wait for it to exit
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Maintenance task ended abnormally: {}", e);
            }
        }
    }

    /// Replace the ledger's maintenance settings; the loop picks up a new
    /// interval after its current sleep
    pub fn update_config(&self, config: MaintenanceConfig) -> Result<()> {
        self.ledger.update_maintenance(config)
    }

    /// One flush, evict and snapshot pass as of `now`
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<MaintenanceReport> {
        let mut report = MaintenanceReport::default();

        // A failed flush re-marks its records; eviction still skips them
        match self.ledger.force_flush().await {
            Ok(flushed) => report.flushed = flushed,
            Err(e) => warn!("Auto-flush failed: {}", e),
        }
        report.evicted = self.ledger.evict_idle().await;

        if self.ledger.extended().is_some() {
            let snapshot_time = self.ledger.maintenance_config().snapshot_time_of_day()?;
            let today = now.date_naive();
            let last = *self.last_snapshot.read().await;

            if snapshot_due(now, snapshot_time, last) {
                if let Some(count) = self.ledger.record_daily_snapshot(today).await? {
                    *self.last_snapshot.write().await = Some(today);
                    info!(day = %today, count, "Recorded daily balance snapshot");
                    report.snapshot = Some(count);
                }
            }
        }

        Ok(report)
    }
}

/// Whether today's snapshot should be taken at `now`
fn snapshot_due(now: DateTime<Utc>, at: NaiveTime, last: Option<NaiveDate>) -> bool {
    now.time() >= at && last != Some(now.date_naive())
}
