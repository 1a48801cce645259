//! Cursor persistence for incremental polling
//!
//! The store owns the progress marker per adapter instance. An advance is
//! accepted only after a fetched batch has been fully handed off, and never
//! moves backward except through an explicit operator [`reset`](CursorStore::reset).

use crate::error::{Error, Result};
use crate::types::Cursor;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Durable cursor storage, keyed by adapter instance ID
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Load the current cursor, if one has been recorded
    async fn load(&self, adapter_id: &str) -> Result<Option<Cursor>>;

    /// Advance the cursor. Rejects regressions with
    /// [`Error::CursorRegression`]; opaque delta tokens always advance.
    async fn advance(&self, adapter_id: &str, cursor: Cursor) -> Result<()>;

    /// Operator-triggered reset: the only sanctioned way backward.
    /// `None` clears the cursor entirely (full re-read on next poll).
    async fn reset(&self, adapter_id: &str, cursor: Option<Cursor>) -> Result<()>;
}

/// In-memory reference store
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    cursors: RwLock<HashMap<String, Cursor>>,
}

impl MemoryCursorStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self, adapter_id: &str) -> Result<Option<Cursor>> {
        let cursors = self.cursors.read().await;
        Ok(cursors.get(adapter_id).cloned())
    }

    async fn advance(&self, adapter_id: &str, cursor: Cursor) -> Result<()> {
        let mut cursors = self.cursors.write().await;
        if let Some(current) = cursors.get(adapter_id) {
            if !current.allows_advance_to(&cursor) {
                return Err(Error::CursorRegression {
                    adapter_id: adapter_id.to_string(),
                    current: current.to_string(),
                    proposed: cursor.to_string(),
                });
            }
        }
        cursors.insert(adapter_id.to_string(), cursor);
        Ok(())
    }

    async fn reset(&self, adapter_id: &str, cursor: Option<Cursor>) -> Result<()> {
        let mut cursors = self.cursors.write().await;
        match cursor {
            Some(c) => {
                warn!("Cursor for adapter {} reset to {}", adapter_id, c);
                cursors.insert(adapter_id.to_string(), c);
            }
            None => {
                info!("Cursor for adapter {} cleared", adapter_id);
                cursors.remove(adapter_id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_advance_is_monotonic() {
        let store = MemoryCursorStore::new();

        assert!(store.load("a1").await.unwrap().is_none());

        store.advance("a1", Cursor::Sequence(10)).await.unwrap();
        store.advance("a1", Cursor::Sequence(20)).await.unwrap();

        let err = store.advance("a1", Cursor::Sequence(5)).await.unwrap_err();
        assert!(matches!(err, Error::CursorRegression { .. }));

        // Rejected advance leaves the cursor untouched
        assert_eq!(store.load("a1").await.unwrap(), Some(Cursor::Sequence(20)));
    }

    #[tokio::test]
    async fn test_reset_moves_backward() {
        let store = MemoryCursorStore::new();
        store.advance("a1", Cursor::Sequence(100)).await.unwrap();

        store.reset("a1", Some(Cursor::Sequence(1))).await.unwrap();
        assert_eq!(store.load("a1").await.unwrap(), Some(Cursor::Sequence(1)));

        store.reset("a1", None).await.unwrap();
        assert!(store.load("a1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delta_tokens_always_advance() {
        let store = MemoryCursorStore::new();
        store
            .advance("a1", Cursor::DeltaToken("t-1".into()))
            .await
            .unwrap();
        store
            .advance("a1", Cursor::DeltaToken("a-0".into()))
            .await
            .unwrap();
        assert_eq!(
            store.load("a1").await.unwrap(),
            Some(Cursor::DeltaToken("a-0".into()))
        );
    }

    #[tokio::test]
    async fn test_instances_are_isolated() {
        let store = MemoryCursorStore::new();
        store
            .advance("a1", Cursor::Timestamp(Utc::now()))
            .await
            .unwrap();
        assert!(store.load("a2").await.unwrap().is_none());
    }
}
