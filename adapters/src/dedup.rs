//! Duplicate suppression
//!
//! Tracks recently seen record identities per adapter instance. Membership
//! is checked before ingestion/delivery and inserted only after success, so
//! a replayed batch (at-least-once semantics) is invisible downstream.

use crate::config::DedupStrategy;
use crate::error::Result;
use crate::types::Record;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::RwLock;

/// A record's dedup identity plus the strategy that derived it
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct DedupKey {
    /// Strategy tag
    pub strategy: DedupStrategy,
    /// Derived identity value
    pub value: String,
}

impl DedupKey {
    /// Derive a key from a record per the configured strategy
    pub fn from_record(record: &Record, strategy: DedupStrategy) -> Self {
        let value = match strategy {
            DedupStrategy::Name => record.name.clone(),
            DedupStrategy::Checksum => {
                let mut hasher = Sha256::new();
                hasher.update(record.payload.to_string().as_bytes());
                hex::encode(hasher.finalize())
            }
            DedupStrategy::Content => {
                let mut hasher = Sha256::new();
                hasher.update(record.name.as_bytes());
                hasher.update(b"\0");
                hasher.update(record.payload.to_string().as_bytes());
                hex::encode(hasher.finalize())
            }
        };
        Self { strategy, value }
    }
}

/// Membership index of recently seen record identities
#[async_trait]
pub trait DedupIndex: Send + Sync {
    /// Whether the key has been seen for this adapter instance
    async fn contains(&self, adapter_id: &str, key: &DedupKey) -> Result<bool>;

    /// Record keys as seen (called after a successful hand-off/commit)
    async fn insert(&self, adapter_id: &str, keys: &[DedupKey]) -> Result<()>;
}

#[derive(Debug, Default)]
struct InstanceIndex {
    members: HashSet<DedupKey>,
    order: VecDeque<DedupKey>,
}

/// Bounded in-memory index with FIFO eviction per adapter instance
#[derive(Debug)]
pub struct MemoryDedupIndex {
    indexes: RwLock<HashMap<String, InstanceIndex>>,
    max_entries: usize,
}

impl MemoryDedupIndex {
    /// Create an index retaining at most `max_entries` keys per instance
    pub fn new(max_entries: usize) -> Self {
        Self {
            indexes: RwLock::new(HashMap::new()),
            max_entries,
        }
    }

    /// Number of keys currently tracked for an instance
    pub async fn len(&self, adapter_id: &str) -> usize {
        let indexes = self.indexes.read().await;
        indexes.get(adapter_id).map(|i| i.members.len()).unwrap_or(0)
    }

    /// Whether nothing is tracked for an instance
    pub async fn is_empty(&self, adapter_id: &str) -> bool {
        self.len(adapter_id).await == 0
    }
}

#[async_trait]
impl DedupIndex for MemoryDedupIndex {
    async fn contains(&self, adapter_id: &str, key: &DedupKey) -> Result<bool> {
        let indexes = self.indexes.read().await;
        Ok(indexes
            .get(adapter_id)
            .map(|i| i.members.contains(key))
            .unwrap_or(false))
    }

    async fn insert(&self, adapter_id: &str, keys: &[DedupKey]) -> Result<()> {
        let mut indexes = self.indexes.write().await;
        let index = indexes.entry(adapter_id.to_string()).or_default();
        for key in keys {
            if index.members.insert(key.clone()) {
                index.order.push_back(key.clone());
            }
            while index.members.len() > self.max_entries {
                if let Some(oldest) = index.order.pop_front() {
                    index.members.remove(&oldest);
                } else {
                    break;
                }
            }
        }
        Ok(())
    }
}
