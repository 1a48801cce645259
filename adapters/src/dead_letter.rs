//! Dead-letter sink for terminally failed batches
//!
//! A batch lands here after its retry budget is exhausted with the error
//! budget tripped, instead of being silently dropped. Entries are kept per
//! adapter instance for operator inspection and replay tooling; a bounded
//! channel additionally streams new entries to any subscribed consumer.

use crate::error::{Error, ErrorClass, Result};
use crate::types::Batch;
use async_channel::{bounded, Receiver, Sender};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// A terminally failed batch plus its failure context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Adapter instance the batch belonged to
    pub adapter_id: String,
    /// The failed batch
    pub batch: Batch,
    /// Last error message
    pub last_error: String,
    /// Last error class
    pub error_class: ErrorClass,
    /// Failed at
    pub failed_at: DateTime<Utc>,
}

/// Bounded per-instance dead-letter storage
pub struct DeadLetterSink {
    storage: RwLock<HashMap<String, Vec<DeadLetterEntry>>>,
    sender: Sender<DeadLetterEntry>,
    receiver: Receiver<DeadLetterEntry>,
    max_size: usize,
}

impl DeadLetterSink {
    /// Create a sink holding at most `max_size` entries per adapter instance
    pub fn new(max_size: usize) -> Self {
        let (sender, receiver) = bounded(max_size.max(1));
        Self {
            storage: RwLock::new(HashMap::new()),
            sender,
            receiver,
            max_size,
        }
    }

    /// Record a terminally failed batch.
    ///
    /// Returns [`Error::DeadLetterFull`] when the instance's storage is at
    /// capacity; the caller surfaces that to the operator rather than
    /// dropping data silently.
    pub async fn push(&self, adapter_id: &str, batch: Batch, error: &Error) -> Result<()> {
        let mut storage = self.storage.write().await;
        let entries = storage.entry(adapter_id.to_string()).or_default();
        if entries.len() >= self.max_size {
            return Err(Error::DeadLetterFull {
                current: entries.len(),
                max: self.max_size,
            });
        }

        let entry = DeadLetterEntry {
            adapter_id: adapter_id.to_string(),
            batch,
            last_error: error.to_string(),
            error_class: error.class(),
            failed_at: Utc::now(),
        };

        warn!(
            "Batch {} ({} records) dead-lettered for adapter {}: {}",
            entry.batch.batch_id,
            entry.batch.len(),
            adapter_id,
            entry.last_error
        );

        // Best-effort stream to subscribers; storage is the source of truth
        let _ = self.sender.try_send(entry.clone());
        entries.push(entry);
        Ok(())
    }

    /// Subscribe to a live stream of new entries
    pub fn subscribe(&self) -> Receiver<DeadLetterEntry> {
        self.receiver.clone()
    }

    /// Entries pending for an adapter instance
    pub async fn depth(&self, adapter_id: &str) -> usize {
        let storage = self.storage.read().await;
        storage.get(adapter_id).map(|e| e.len()).unwrap_or(0)
    }

    /// Snapshot of an instance's entries
    pub async fn entries(&self, adapter_id: &str) -> Vec<DeadLetterEntry> {
        let storage = self.storage.read().await;
        storage.get(adapter_id).cloned().unwrap_or_default()
    }

    /// Remove and return an instance's entries (operator replay)
    pub async fn drain(&self, adapter_id: &str) -> Vec<DeadLetterEntry> {
        let mut storage = self.storage.write().await;
        let drained = storage.remove(adapter_id).unwrap_or_default();
        if !drained.is_empty() {
            info!(
                "Drained {} dead-letter entries for adapter {}",
                drained.len(),
                adapter_id
            );
        }
        drained
    }

    /// Discard an instance's entries
    pub async fn clear(&self, adapter_id: &str) {
        let mut storage = self.storage.write().await;
        storage.remove(adapter_id);
        info!("Cleared dead letters for adapter {}", adapter_id);
    }
}
