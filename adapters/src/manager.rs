//! Adapter registry and operator controls
//!
//! The manager tracks every activated adapter instance, exposes health
//! snapshots, and carries the operator's two levers: disable (stop an
//! instance outright) and re-arm (clear a tripped error budget and resume).

use crate::error::{Error, ErrorClass, Result};
use crate::metrics::ADAPTER_STATUS;
use crate::types::{AdapterHealth, AdapterStatus, ConnectorKind};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info};

#[derive(Debug)]
struct StatusInner {
    status: AdapterStatus,
    last_error_class: Option<ErrorClass>,
    disabled_reason: Option<String>,
}

/// Shared per-instance status and operation counters.
///
/// Owned jointly by the driving component (poller or executor) and the
/// manager; all updates are atomic or behind the one lock.
#[derive(Debug)]
pub struct StatusCell {
    adapter_id: String,
    inner: RwLock<StatusInner>,
    successes: AtomicU64,
    failures: AtomicU64,
    deduped: AtomicU64,
}

impl StatusCell {
    /// Fresh cell in `Running` state
    pub fn new(adapter_id: impl Into<String>) -> Self {
        Self {
            adapter_id: adapter_id.into(),
            inner: RwLock::new(StatusInner {
                status: AdapterStatus::Running,
                last_error_class: None,
                disabled_reason: None,
            }),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            deduped: AtomicU64::new(0),
        }
    }

    /// Current status
    pub async fn status(&self) -> AdapterStatus {
        self.inner.read().await.status
    }

    /// Whether the instance is disabled
    pub async fn is_disabled(&self) -> bool {
        self.inner.read().await.status == AdapterStatus::Disabled
    }

    /// Reason recorded at disable time, if disabled
    pub async fn disabled_reason(&self) -> Option<String> {
        self.inner.read().await.disabled_reason.clone()
    }

    /// Last error class seen, if any
    pub async fn last_error_class(&self) -> Option<ErrorClass> {
        self.inner.read().await.last_error_class
    }

    /// Back to normal operation
    pub async fn set_running(&self) {
        let mut inner = self.inner.write().await;
        inner.status = AdapterStatus::Running;
        inner.disabled_reason = None;
        ADAPTER_STATUS.with_label_values(&[&self.adapter_id]).set(0);
    }

    /// Retry budget exhausted; waiting out a backoff period
    pub async fn set_backoff(&self, class: ErrorClass) {
        let mut inner = self.inner.write().await;
        inner.status = AdapterStatus::Backoff;
        inner.last_error_class = Some(class);
        ADAPTER_STATUS.with_label_values(&[&self.adapter_id]).set(1);
    }

    /// Disable until re-armed
    pub async fn set_disabled(&self, reason: String, class: Option<ErrorClass>) {
        error!("Adapter {} disabled: {}", self.adapter_id, reason);
        let mut inner = self.inner.write().await;
        inner.status = AdapterStatus::Disabled;
        inner.disabled_reason = Some(reason);
        if let Some(class) = class {
            inner.last_error_class = Some(class);
        }
        ADAPTER_STATUS.with_label_values(&[&self.adapter_id]).set(2);
    }

    /// Count a successful operation
    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed operation
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count records suppressed by dedup
    pub fn record_deduped(&self, count: u64) {
        self.deduped.fetch_add(count, Ordering::Relaxed);
    }

    /// Successful operations so far
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Failed operations so far
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Deduped records so far
    pub fn deduped(&self) -> u64 {
        self.deduped.load(Ordering::Relaxed)
    }
}

/// Object-safe facade every driveable adapter instance exposes to the manager
#[async_trait]
pub trait ManagedAdapter: Send + Sync {
    /// Adapter instance ID
    fn adapter_id(&self) -> &str;

    /// Connector kind
    fn kind(&self) -> ConnectorKind;

    /// Health snapshot
    async fn health(&self) -> AdapterHealth;

    /// Stop polling/delivering until re-armed
    async fn disable(&self, reason: String);

    /// Clear the error budget and resume
    async fn re_arm(&self);
}

/// Registry of adapter instances with operator controls
#[derive(Default)]
pub struct AdapterManager {
    adapters: RwLock<HashMap<String, Arc<dyn ManagedAdapter>>>,
}

impl AdapterManager {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an activated instance
    pub async fn register(&self, adapter: Arc<dyn ManagedAdapter>) {
        let mut adapters = self.adapters.write().await;
        info!("Registered adapter {} ({})", adapter.adapter_id(), adapter.kind());
        adapters.insert(adapter.adapter_id().to_string(), adapter);
    }

    /// Remove an instance from the registry
    pub async fn deregister(&self, adapter_id: &str) {
        let mut adapters = self.adapters.write().await;
        adapters.remove(adapter_id);
    }

    /// Operator disable
    pub async fn disable(&self, adapter_id: &str, reason: String, by: &str) -> Result<()> {
        let adapter = self.get(adapter_id).await?;
        error!(
            "Adapter {} disabled by {}: {}",
            adapter_id, by, reason
        );
        adapter.disable(reason).await;
        Ok(())
    }

    /// Operator re-arm after a budget trip or manual disable
    pub async fn re_arm(&self, adapter_id: &str, by: &str) -> Result<()> {
        let adapter = self.get(adapter_id).await?;
        info!("Adapter {} re-armed by {}", adapter_id, by);
        adapter.re_arm().await;
        Ok(())
    }

    /// Health snapshot for one instance
    pub async fn health(&self, adapter_id: &str) -> Result<AdapterHealth> {
        Ok(self.get(adapter_id).await?.health().await)
    }

    /// Health snapshots for every registered instance
    pub async fn all_health(&self) -> Vec<AdapterHealth> {
        let adapters = self.adapters.read().await;
        let mut snapshots = Vec::with_capacity(adapters.len());
        for adapter in adapters.values() {
            snapshots.push(adapter.health().await);
        }
        snapshots
    }

    async fn get(&self, adapter_id: &str) -> Result<Arc<dyn ManagedAdapter>> {
        let adapters = self.adapters.read().await;
        adapters
            .get(adapter_id)
            .cloned()
            .ok_or_else(|| Error::Generic(format!("unknown adapter: {}", adapter_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    struct StubAdapter {
        status: Arc<StatusCell>,
    }

    #[async_trait]
    impl ManagedAdapter for StubAdapter {
        fn adapter_id(&self) -> &str {
            "stub-1"
        }

        fn kind(&self) -> ConnectorKind {
            ConnectorKind::File
        }

        async fn health(&self) -> AdapterHealth {
            AdapterHealth {
                adapter_id: "stub-1".into(),
                kind: ConnectorKind::File,
                status: self.status.status().await,
                last_error_class: self.status.last_error_class().await,
                disabled_reason: self.status.disabled_reason().await,
                successful_operations: self.status.successes(),
                failed_operations: self.status.failures(),
                records_deduped: self.status.deduped(),
                cursor: None,
                dead_letter_depth: 0,
                last_check: Utc::now(),
            }
        }

        async fn disable(&self, reason: String) {
            self.status.set_disabled(reason, None).await;
        }

        async fn re_arm(&self) {
            self.status.set_running().await;
        }
    }

    #[tokio::test]
    async fn test_disable_and_re_arm() {
        let manager = AdapterManager::new();
        let status = Arc::new(StatusCell::new("stub-1"));
        manager
            .register(Arc::new(StubAdapter {
                status: status.clone(),
            }))
            .await;

        manager
            .disable("stub-1", "maintenance window".into(), "ops")
            .await
            .unwrap();
        assert!(status.is_disabled().await);

        let health = manager.health("stub-1").await.unwrap();
        assert_eq!(health.status, AdapterStatus::Disabled);
        assert_eq!(health.disabled_reason.as_deref(), Some("maintenance window"));

        manager.re_arm("stub-1", "ops").await.unwrap();
        assert_eq!(status.status().await, AdapterStatus::Running);
    }

    #[tokio::test]
    async fn test_unknown_adapter_is_an_error() {
        let manager = AdapterManager::new();
        assert!(manager.health("missing").await.is_err());
        assert!(manager.re_arm("missing", "ops").await.is_err());
    }

    #[tokio::test]
    async fn test_status_cell_counters() {
        let cell = StatusCell::new("c1");
        cell.record_success();
        cell.record_success();
        cell.record_failure();
        cell.record_deduped(5);
        assert_eq!(cell.successes(), 2);
        assert_eq!(cell.failures(), 1);
        assert_eq!(cell.deduped(), 5);

        cell.set_backoff(ErrorClass::Timeout).await;
        assert_eq!(cell.status().await, AdapterStatus::Backoff);
        assert_eq!(cell.last_error_class().await, Some(ErrorClass::Timeout));
    }
}
