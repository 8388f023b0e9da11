//! Rate-limited leaderboard snapshot
//!
//! Sorting every cached account on each request is wasteful, so the top
//! entries are kept in a snapshot rebuilt at most once per refresh
//! interval. Smaller requests are served by truncating the snapshot.

use crate::types::{AccountId, AccountRecord};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

/// One ranking, sorted by descending balance
#[derive(Debug, Clone)]
pub struct LeaderboardSnapshot {
    pub built_at: Instant,
    pub entries: Vec<(AccountId, AccountRecord)>,
}

impl LeaderboardSnapshot {
    /// Rank `records` and keep the first `size`
    pub fn build(records: impl IntoIterator<Item = AccountRecord>, size: usize) -> Self {
        let mut entries: Vec<(AccountId, AccountRecord)> =
            records.into_iter().map(|record| (record.id, record)).collect();
        entries.sort_by(|(a_id, a), (b_id, b)| b.balance.cmp(&a.balance).then_with(|| a_id.cmp(b_id)));
        entries.truncate(size);

        Self {
            built_at: Instant::now(),
            entries,
        }
    }

    /// First `limit` entries
    pub fn top(&self, limit: usize) -> Vec<(AccountId, AccountRecord)> {
        self.entries.iter().take(limit).cloned().collect()
    }

    fn is_fresh(&self, refresh: Duration) -> bool {
        self.built_at.elapsed() < refresh
    }
}

/// Holder of the current snapshot
#[derive(Default)]
pub struct LeaderboardCache {
    current: Mutex<Option<Arc<LeaderboardSnapshot>>>,
}

impl LeaderboardCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot, rebuilt with `build` when older than `refresh`.
    ///
    /// The rebuild runs under the holder's mutex so concurrent callers
    /// share one rebuild.
    pub fn get_or_rebuild<F>(&self, refresh: Duration, build: F) -> Arc<LeaderboardSnapshot>
    where
        F: FnOnce() -> LeaderboardSnapshot,
    {
        let mut current = self.current.lock();
        if let Some(snapshot) = current.as_ref() {
            if snapshot.is_fresh(refresh) {
                return snapshot.clone();
            }
        }

        let snapshot = Arc::new(build());
        tracing::trace!(entries = snapshot.entries.len(), "Leaderboard rebuilt");
        *current = Some(snapshot.clone());
        snapshot
    }

    /// Force the next request to rebuild
    pub fn invalidate(&self) {
        *self.current.lock() = None;
    }
}
