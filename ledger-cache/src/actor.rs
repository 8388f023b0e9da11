//! Durable journal writer
//!
//! Single-writer actor that mirrors journal entries into the storage
//! backend's transaction history:
//! - One task owns the batch, so backend appends never interleave
//! - Batching amortizes backend round-trips
//! - Producers enqueue with `try_send` and never wait on storage
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │   Ledger operations (deposit / withdraw / transfer)  │
//! │            TransactionLogger::log(entry)             │
//! └─────────────────────┬────────────────────────────────┘
//!                       │
//!                       │ mpsc::channel (bounded, try_send)
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │                JournalWriter (Single Task)           │
//! │  ┌────────────────────────────────────────────────┐  │
//! │  │ Batch: Vec<TransactionEntry>                   │  │
//! │  │ Timer: 50ms or 100 entries → flush_batch()     │  │
//! │  └────────────────────────────────────────────────┘  │
//! │                       │                              │
//! │                       ▼                              │
//! │         StorageBackend::append_transactions()        │
//! └──────────────────────────────────────────────────────┘
//! ```

use crate::config::JournalConfig;
use crate::storage::StorageBackend;
use crate::types::TransactionEntry;
use crate::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Duration};

/// Message sent to the journal writer
pub enum JournalMessage {
    /// Queue an entry for the next batch
    Append(Arc<TransactionEntry>),

    /// Write the current batch now
    Flush {
        response: oneshot::Sender<Result<()>>,
    },

    /// Write the current batch and stop
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

/// Actor that batches entries into the backend
pub struct JournalWriter {
    storage: Arc<dyn StorageBackend>,
    mailbox: mpsc::Receiver<JournalMessage>,
    batch: Vec<Arc<TransactionEntry>>,
    max_batch_size: usize,
    batch_timeout: Duration,
}

impl JournalWriter {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        mailbox: mpsc::Receiver<JournalMessage>,
        max_batch_size: usize,
        batch_timeout: Duration,
    ) -> Self {
        let max_batch_size = max_batch_size.max(1);
        Self {
            storage,
            mailbox,
            batch: Vec::with_capacity(max_batch_size),
            max_batch_size,
            batch_timeout,
        }
    }

    /// Run the writer event loop
    pub async fn run(mut self) {
        let mut batch_timer = interval(self.batch_timeout);
        batch_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(msg) = self.mailbox.recv() => {
                    match msg {
                        JournalMessage::Append(entry) => {
                            self.batch.push(entry);
                            if self.batch.len() >= self.max_batch_size {
                                if let Err(e) = self.flush_batch().await {
                                    tracing::error!("Error flushing journal batch: {}", e);
                                }
                            }
                        }
                        JournalMessage::Flush { response } => {
                            let _ = response.send(self.flush_batch().await);
                        }
                        JournalMessage::Shutdown { response } => {
                            if let Err(e) = self.flush_batch().await {
                                tracing::error!("Error flushing journal on shutdown: {}", e);
                            }
                            let _ = response.send(());
                            break;
                        }
                    }
                }

                _ = batch_timer.tick(), if !self.batch.is_empty() => {
                    if let Err(e) = self.flush_batch().await {
                        tracing::error!("Error flushing journal batch on timeout: {}", e);
                    }
                }

                // Every handle dropped
                else => {
                    let _ = self.flush_batch().await;
                    break;
                }
            }
        }

        tracing::debug!("Journal writer stopped");
    }

    /// Write the current batch. A failed batch is dropped; the in-memory
    /// ring still holds the entries.
    async fn flush_batch(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }

        let entries: Vec<TransactionEntry> =
            self.batch.drain(..).map(|entry| (*entry).clone()).collect();

        tracing::debug!("Flushing journal batch of {} entries", entries.len());
        self.storage.append_transactions(&entries).await
    }
}

/// Handle for sending entries to the writer
#[derive(Clone)]
pub struct JournalHandle {
    sender: mpsc::Sender<JournalMessage>,
    dropped: Arc<AtomicU64>,
}

impl JournalHandle {
    pub fn new(sender: mpsc::Sender<JournalMessage>) -> Self {
        Self {
            sender,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queue an entry without waiting. Returns false when the backlog is
    /// full or the writer is gone; the entry is then not persisted.
    pub fn try_append(&self, entry: Arc<TransactionEntry>) -> bool {
        match self.sender.try_send(JournalMessage::Append(entry)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(dropped, "Journal backlog full, entry not persisted");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Entries that never reached the writer
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Write everything queued so far
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(JournalMessage::Flush { response: tx })
            .await
            .map_err(|_| Error::Concurrency("Journal mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Flush and stop the writer
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(JournalMessage::Shutdown { response: tx })
            .await
            .map_err(|_| Error::Concurrency("Journal mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))
    }
}

/// Spawn the journal writer
pub fn spawn_journal_writer(storage: Arc<dyn StorageBackend>, config: &JournalConfig) -> JournalHandle {
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let writer = JournalWriter::new(
        storage,
        rx,
        config.max_batch_size,
        Duration::from_millis(config.batch_timeout_ms.max(1)),
    );

    tokio::spawn(async move {
        writer.run().await;
    });

    JournalHandle::new(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ExtendedQueries, MemoryBackend, TransactionFilter};
    use crate::types::{AccountId, TransactionKind};
    use rust_decimal::Decimal;

    fn entry(amount: i64) -> Arc<TransactionEntry> {
        Arc::new(TransactionEntry::single(
            TransactionKind::Earn,
            AccountId::random(),
            "writer",
            Decimal::new(amount, 0),
        ))
    }

    #[tokio::test]
    async fn test_writer_spawn_and_shutdown() {
        let storage = Arc::new(MemoryBackend::new());
        let handle = spawn_journal_writer(storage, &JournalConfig::default());
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_flush_persists_batch() {
        let storage = Arc::new(MemoryBackend::new());
        let config = JournalConfig {
            max_batch_size: 100,
            batch_timeout_ms: 10_000,
            ..JournalConfig::default()
        };
        let handle = spawn_journal_writer(storage.clone(), &config);

        for i in 0..5 {
            assert!(handle.try_append(entry(i)));
        }
        handle.flush().await.unwrap();

        let stored = storage
            .count_transactions(&TransactionFilter::default())
            .await
            .unwrap();
        assert_eq!(stored, 5);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_full_batch_writes_without_flush() {
        let storage = Arc::new(MemoryBackend::new());
        let config = JournalConfig {
            max_batch_size: 3,
            batch_timeout_ms: 10_000,
            ..JournalConfig::default()
        };
        let handle = spawn_journal_writer(storage.clone(), &config);

        for i in 0..3 {
            handle.try_append(entry(i));
        }
        // Shutdown is queued behind the appends, so it observes the batch
        handle.shutdown().await.unwrap();

        let stored = storage
            .query_transactions(&TransactionFilter::default(), 10, 0)
            .await
            .unwrap();
        assert_eq!(stored.len(), 3);
    }

    #[tokio::test]
    async fn test_append_after_shutdown_is_dropped() {
        let storage = Arc::new(MemoryBackend::new());
        let handle = spawn_journal_writer(storage, &JournalConfig::default());
        handle.shutdown().await.unwrap();

        // Give the task a moment to drop its receiver
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.try_append(entry(1)));
        assert_eq!(handle.dropped(), 1);
        assert!(handle.flush().await.is_err());
    }
}
