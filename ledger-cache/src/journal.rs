//! Recent-activity journal
//!
//! Fixed-capacity ring buffer of [`TransactionEntry`]. Writers claim a
//! sequence number with an atomic counter and publish the entry, tagged
//! with that number, by an atomic pointer swap, so readers never take a
//! lock. When a [`JournalHandle`] is attached, every entry is also queued
//! for the durable history writer.

use crate::actor::JournalHandle;
use crate::types::{AccountId, TransactionEntry};
use arc_swap::ArcSwapOption;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Published entry and the sequence number it was claimed under
struct Slot {
    seq: u64,
    entry: Arc<TransactionEntry>,
}

/// Ring buffer of recent transactions
pub struct TransactionLogger {
    slots: Vec<ArcSwapOption<Slot>>,
    /// Total entries ever logged; the next write goes to `written % capacity`
    written: AtomicU64,
    durable: Option<JournalHandle>,
}

impl TransactionLogger {
    /// Memory-only journal holding `capacity` entries (at least one)
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity.max(1)).map(|_| ArcSwapOption::empty()).collect();
        Self {
            slots,
            written: AtomicU64::new(0),
            durable: None,
        }
    }

    /// Journal that also forwards entries to a durable writer
    pub fn with_writer(capacity: usize, writer: JournalHandle) -> Self {
        Self {
            durable: Some(writer),
            ..Self::new(capacity)
        }
    }

    /// Durable writer, if attached
    pub fn writer(&self) -> Option<&JournalHandle> {
        self.durable.as_ref()
    }

    /// Ring capacity
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Entries ever logged, including overwritten ones
    pub fn total_logged(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }

    /// Entries currently readable
    pub fn available(&self) -> usize {
        self.total_logged().min(self.capacity() as u64) as usize
    }

    /// Append an entry, overwriting the oldest once full
    pub fn log(&self, entry: TransactionEntry) {
        let entry = Arc::new(entry);
        let seq = self.written.fetch_add(1, Ordering::AcqRel);
        self.publish(seq, entry.clone());

        if let Some(writer) = &self.durable {
            writer.try_append(entry);
        }
    }

    /// Store `entry` in its slot unless a later lap already got there
    fn publish(&self, seq: u64, entry: Arc<TransactionEntry>) {
        let index = (seq % self.slots.len() as u64) as usize;
        let published = Arc::new(Slot { seq, entry });
        self.slots[index].rcu(|current| match current {
            Some(existing) if existing.seq > seq => Some(existing.clone()),
            _ => Some(published.clone()),
        });
    }

    /// Up to `count` entries, newest first
    pub fn get_recent(&self, count: usize) -> Vec<Arc<TransactionEntry>> {
        self.newest_first().take(count).collect()
    }

    /// Up to `limit` entries involving `account`, newest first
    pub fn get_recent_for_account(&self, account: AccountId, limit: usize) -> Vec<Arc<TransactionEntry>> {
        self.newest_first()
            .filter(|entry| entry.involves(account))
            .take(limit)
            .collect()
    }

    /// Every readable entry, newest first
    pub fn all(&self) -> Vec<Arc<TransactionEntry>> {
        self.newest_first().collect()
    }

    /// Drop every entry and reset the counter
    pub fn clear(&self) {
        for slot in &self.slots {
            slot.store(None);
        }
        self.written.store(0, Ordering::Release);
    }

    fn newest_first(&self) -> impl Iterator<Item = Arc<TransactionEntry>> + '_ {
        let total = self.total_logged();
        let capacity = self.slots.len() as u64;
        let available = total.min(capacity);

        // A slot whose writer has not published yet still holds an earlier
        // lap, or nothing; either way its sequence does not match
        (1..=available).filter_map(move |back| {
            let expected = total - back;
            let slot = self.slots[(expected % capacity) as usize].load_full()?;
            (slot.seq == expected).then(|| slot.entry.clone())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionKind;
    use rust_decimal::Decimal;

    fn entry(account: AccountId, amount: i64) -> TransactionEntry {
        TransactionEntry::single(TransactionKind::Earn, account, "test", Decimal::new(amount, 0))
    }

    #[test]
    fn test_recent_is_newest_first() {
        let logger = TransactionLogger::new(10);
        let id = AccountId::random();
        for i in 0..3 {
            logger.log(entry(id, i));
        }

        let recent = logger.get_recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].amount, Decimal::new(2, 0));
        assert_eq!(recent[1].amount, Decimal::new(1, 0));
    }

    #[test]
    fn test_wraps_and_keeps_last_capacity_entries() {
        let logger = TransactionLogger::new(5);
        let id = AccountId::random();
        for i in 0..12 {
            logger.log(entry(id, i));
        }

        assert_eq!(logger.total_logged(), 12);
        assert_eq!(logger.available(), 5);

        let amounts: Vec<Decimal> = logger.get_recent(100).iter().map(|e| e.amount).collect();
        let expected: Vec<Decimal> = (7..12).rev().map(|i| Decimal::new(i, 0)).collect();
        assert_eq!(amounts, expected);
    }

    #[test]
    fn test_recent_for_account() {
        let logger = TransactionLogger::new(20);
        let alice = AccountId::random();
        let bob = AccountId::random();

        logger.log(entry(alice, 1));
        logger.log(entry(bob, 2));
        logger.log(TransactionEntry::transfer(bob, "bob", alice, "alice", Decimal::new(3, 0)));
        logger.log(entry(bob, 4));

        let for_alice = logger.get_recent_for_account(alice, 10);
        assert_eq!(for_alice.len(), 2);
        assert_eq!(for_alice[0].kind, TransactionKind::Pay);

        assert_eq!(logger.get_recent_for_account(bob, 1)[0].amount, Decimal::new(4, 0));
    }

    #[test]
    fn test_clear() {
        let logger = TransactionLogger::new(3);
        logger.log(entry(AccountId::random(), 1));
        logger.clear();

        assert_eq!(logger.total_logged(), 0);
        assert!(logger.all().is_empty());
    }

    #[test]
    fn test_unpublished_slot_hides_previous_lap() {
        let logger = TransactionLogger::new(2);
        let id = AccountId::random();
        logger.log(entry(id, 0));
        logger.log(entry(id, 1));

        // A writer has claimed sequence 2 (slot 0) but not stored its entry
        logger.written.fetch_add(1, Ordering::AcqRel);

        let amounts: Vec<Decimal> = logger.all().iter().map(|e| e.amount).collect();
        assert_eq!(amounts, vec![Decimal::new(1, 0)]);

        logger.publish(2, Arc::new(entry(id, 2)));
        let amounts: Vec<Decimal> = logger.all().iter().map(|e| e.amount).collect();
        assert_eq!(amounts, vec![Decimal::new(2, 0), Decimal::new(1, 0)]);
    }

    #[test]
    fn test_late_writer_does_not_clobber_newer_lap() {
        let logger = TransactionLogger::new(2);
        let id = AccountId::random();
        for i in 0..3 {
            logger.log(entry(id, i));
        }

        // Sequence 0 published after sequence 2 took its slot
        logger.publish(0, Arc::new(entry(id, 99)));

        let amounts: Vec<Decimal> = logger.all().iter().map(|e| e.amount).collect();
        assert_eq!(amounts, vec![Decimal::new(2, 0), Decimal::new(1, 0)]);
    }

    #[test]
    fn test_concurrent_writers_fill_ring() {
        let logger = Arc::new(TransactionLogger::new(64));
        let id = AccountId::random();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let logger = logger.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        logger.log(entry(id, i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(logger.total_logged(), 800);
        assert_eq!(logger.all().len(), 64);
    }
}
