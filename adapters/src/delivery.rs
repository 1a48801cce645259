//! Outbound delivery executor
//!
//! Records submitted for an outbound adapter instance accumulate in an
//! open batch and are flushed per the configured strategy. A flush is
//! idempotent toward the target: duplicate submissions are suppressed
//! against the dedup index, and a failed flush retains the undelivered
//! remainder so the next flush resumes instead of redelivering. Targets
//! that commit batches atomically get the whole batch in one call; all
//! others are driven record by record behind a high-water mark.

use crate::config::{BatchStrategy, EffectiveConfig};
use crate::dead_letter::DeadLetterSink;
use crate::dedup::{DedupIndex, DedupKey};
use crate::error::{Error, Result};
use crate::manager::{ManagedAdapter, StatusCell};
use crate::metrics::{
    ADAPTER_DEAD_LETTER_DEPTH, ADAPTER_DELIVERIES_TOTAL, ADAPTER_OPERATION_DURATION,
    ADAPTER_RECORDS_DEDUPED_TOTAL,
};
use crate::pool::{ConnectionLeaseManager, PoolConfig};
use crate::rate_limit::RateLimiter;
use crate::retry::{ErrorBudget, RetryPolicy, RetryState};
use crate::transport::Transport;
use crate::types::{AdapterHealth, AdapterStatus, Batch, ConnectorKind, Record};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What happened to a submitted record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Queued in the open batch
    Queued,
    /// Suppressed as a duplicate
    Suppressed,
    /// Queued, and the submission triggered a size-based flush
    Flushed {
        /// Records delivered by the triggered flush
        delivered: usize,
    },
}

struct QueuedRecord {
    record: Record,
    key: Option<DedupKey>,
}

struct PendingBatch {
    batch_id: Uuid,
    records: Vec<QueuedRecord>,
    /// Records before this index are committed at the target
    next: usize,
}

#[derive(Default)]
struct BatchState {
    open: Vec<QueuedRecord>,
    opened_at: Option<Instant>,
    pending: Option<PendingBatch>,
}

/// Batches and delivers records for one outbound adapter instance
pub struct DeliveryExecutor<T: Transport> {
    adapter_id: String,
    transport: Arc<T>,
    pool: ConnectionLeaseManager<T>,
    dedup: Arc<dyn DedupIndex>,
    dead_letter: Arc<DeadLetterSink>,
    config: EffectiveConfig,
    retry: RetryPolicy,
    retry_state: Mutex<RetryState>,
    budget: ErrorBudget,
    rate_limiter: Option<RateLimiter>,
    status: Arc<StatusCell>,
    state: Mutex<BatchState>,
}

impl<T: Transport> DeliveryExecutor<T> {
    /// Assemble an executor for one adapter instance
    pub fn new(
        adapter_id: impl Into<String>,
        transport: Arc<T>,
        dedup: Arc<dyn DedupIndex>,
        dead_letter: Arc<DeadLetterSink>,
        config: EffectiveConfig,
    ) -> Self {
        let adapter_id = adapter_id.into();
        let pool = ConnectionLeaseManager::new(transport.clone(), PoolConfig::from_config(&config));
        let retry = RetryPolicy::from_config(&config);
        let budget = ErrorBudget::from_config(adapter_id.clone(), &config);
        let rate_limiter = RateLimiter::from_config(&config);
        let status = Arc::new(StatusCell::new(adapter_id.clone()));
        Self {
            adapter_id,
            transport,
            pool,
            dedup,
            dead_letter,
            config,
            retry,
            retry_state: Mutex::new(RetryState::new()),
            budget,
            rate_limiter,
            status,
            state: Mutex::new(BatchState::default()),
        }
    }

    /// Shared status cell
    pub fn status_cell(&self) -> Arc<StatusCell> {
        self.status.clone()
    }

    /// The instance's connection pool
    pub fn pool(&self) -> &ConnectionLeaseManager<T> {
        &self.pool
    }

    /// Submit one record for delivery.
    ///
    /// Duplicates (against the index or records already queued) are
    /// suppressed. Under a size-cutting strategy, reaching the flush size
    /// flushes inline and reports the result.
    pub async fn submit(&self, record: Record) -> Result<SubmitOutcome> {
        if self.status.is_disabled().await {
            return Err(Error::AdapterDisabled {
                adapter_id: self.adapter_id.clone(),
                reason: self
                    .status
                    .disabled_reason()
                    .await
                    .unwrap_or_else(|| "disabled".into()),
            });
        }

        let key = self
            .config
            .dedup_enabled
            .then(|| DedupKey::from_record(&record, self.config.dedup_strategy));

        let should_flush = {
            let mut state = self.state.lock().await;
            if let Some(key) = &key {
                if Self::queued(&state, key) || self.dedup.contains(&self.adapter_id, key).await? {
                    ADAPTER_RECORDS_DEDUPED_TOTAL
                        .with_label_values(&[&self.adapter_id])
                        .inc();
                    self.status.record_deduped(1);
                    debug!(
                        "Adapter {}: duplicate submission {} suppressed",
                        self.adapter_id, record.name
                    );
                    return Ok(SubmitOutcome::Suppressed);
                }
            }

            state.open.push(QueuedRecord { record, key });
            if state.opened_at.is_none() {
                state.opened_at = Some(Instant::now());
            }
            match self.config.batch_strategy {
                BatchStrategy::SizeBased | BatchStrategy::Mixed => {
                    state.open.len() >= self.config.batch_flush_size
                }
                BatchStrategy::TimeBased => false,
            }
        };

        if should_flush {
            let delivered = self.flush().await?;
            return Ok(SubmitOutcome::Flushed { delivered });
        }
        Ok(SubmitOutcome::Queued)
    }

    /// Deliver everything queued: first the retained remainder of a failed
    /// flush, then the open batch. Returns the records committed by this
    /// call.
    pub async fn flush(&self) -> Result<usize> {
        if self.status.is_disabled().await {
            return Err(Error::AdapterDisabled {
                adapter_id: self.adapter_id.clone(),
                reason: self
                    .status
                    .disabled_reason()
                    .await
                    .unwrap_or_else(|| "disabled".into()),
            });
        }

        let mut state = self.state.lock().await;
        let mut delivered_total = 0;

        loop {
            let pending = match state.pending.as_mut() {
                Some(pending) => pending,
                None => {
                    if state.open.is_empty() {
                        break;
                    }
                    let records = std::mem::take(&mut state.open);
                    state.opened_at = None;
                    state.pending.insert(PendingBatch {
                        batch_id: Uuid::new_v4(),
                        records,
                        next: 0,
                    })
                }
            };

            match self.deliver_pending(pending).await {
                Ok(count) => {
                    delivered_total += count;
                    state.pending = None;
                    ADAPTER_DELIVERIES_TOTAL
                        .with_label_values(&[&self.adapter_id, "ok"])
                        .inc();
                    self.status.record_success();
                    if self.status.status().await == AdapterStatus::Backoff {
                        self.status.set_running().await;
                    }
                }
                Err(e) => return Err(self.fail(&mut state, e).await),
            }
        }

        Ok(delivered_total)
    }

    /// Run the time-based flush loop until `shutdown` flips
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(
            "Adapter {} ({}) flushing every {:?}",
            self.adapter_id,
            self.transport.kind(),
            self.config.batch_flush_interval
        );
        let mut interval = tokio::time::interval(self.config.batch_flush_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let due = {
                        let state = self.state.lock().await;
                        let time_cut = !matches!(self.config.batch_strategy, BatchStrategy::SizeBased);
                        state.pending.is_some() || (time_cut && !state.open.is_empty())
                    };
                    if due {
                        if let Err(e) = self.flush().await {
                            warn!("Adapter {} flush failed: {}", self.adapter_id, e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("Adapter {} delivery stopped", self.adapter_id);
                    break;
                }
            }
        }
    }

    async fn deliver_pending(&self, pending: &mut PendingBatch) -> Result<usize> {
        let timer = ADAPTER_OPERATION_DURATION
            .with_label_values(&[&self.adapter_id, "deliver"])
            .start_timer();
        let result = if self.transport.supports_atomic_batches() {
            self.deliver_atomic(pending).await
        } else {
            self.deliver_sequential(pending).await
        };
        timer.observe_duration();
        result
    }

    /// Whole batch in one transport call; the target commits all or nothing
    async fn deliver_atomic(&self, pending: &mut PendingBatch) -> Result<usize> {
        let batch = Batch {
            batch_id: pending.batch_id,
            records: pending.records.iter().map(|q| q.record.clone()).collect(),
            end_cursor: None,
            created_at: Utc::now(),
        };

        self.rate_gate().await?;
        self.deliver_with_retry(&batch).await?;

        let keys: Vec<DedupKey> = pending
            .records
            .iter()
            .filter_map(|q| q.key.clone())
            .collect();
        if !keys.is_empty() {
            self.dedup.insert(&self.adapter_id, &keys).await?;
        }
        pending.next = pending.records.len();
        Ok(pending.records.len())
    }

    /// Record at a time behind a high-water mark; a failure leaves committed
    /// records marked so the resume never redelivers them
    async fn deliver_sequential(&self, pending: &mut PendingBatch) -> Result<usize> {
        let start = pending.next;
        while pending.next < pending.records.len() {
            self.rate_gate().await?;

            let queued = &pending.records[pending.next];
            let single = Batch {
                batch_id: Uuid::new_v4(),
                records: vec![queued.record.clone()],
                end_cursor: None,
                created_at: Utc::now(),
            };
            self.deliver_with_retry(&single).await?;

            if let Some(key) = &queued.key {
                self.dedup
                    .insert(&self.adapter_id, std::slice::from_ref(key))
                    .await?;
            }
            pending.next += 1;
        }
        Ok(pending.records.len() - start)
    }

    async fn deliver_with_retry(&self, batch: &Batch) -> Result<()> {
        let mut retry_state = self.retry_state.lock().await;
        let call_timeout = self.config.fetch_timeout;

        self.retry
            .execute(&mut retry_state, || {
                let batch = &*batch;
                async move {
                    let mut lease = self.pool.acquire().await?;
                    match tokio::time::timeout(
                        call_timeout,
                        self.transport.deliver(lease.session_mut(), batch),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(Error::Timeout {
                            seconds: call_timeout.as_secs(),
                            operation: "deliver".into(),
                        }),
                    }
                }
            })
            .await?;
        Ok(())
    }

    async fn rate_gate(&self) -> Result<()> {
        match &self.rate_limiter {
            Some(limiter) => limiter.acquire(self.config.fetch_timeout).await,
            None => Ok(()),
        }
    }

    /// Classify a failed flush: budget it, then either disable (dead-lettering
    /// the undelivered remainder) or back off with the remainder retained
    async fn fail(&self, state: &mut BatchState, error: Error) -> Error {
        ADAPTER_DELIVERIES_TOTAL
            .with_label_values(&[&self.adapter_id, "error"])
            .inc();
        self.status.record_failure();

        if let Err(budget_error) = self.budget.record_failures(1).await {
            if self.config.disable_on_exceed {
                self.status
                    .set_disabled(budget_error.to_string(), Some(error.class()))
                    .await;
                if let Some(pending) = state.pending.take() {
                    let remainder = Batch {
                        batch_id: pending.batch_id,
                        records: pending.records[pending.next..]
                            .iter()
                            .map(|q| q.record.clone())
                            .collect(),
                        end_cursor: None,
                        created_at: Utc::now(),
                    };
                    if !remainder.is_empty() {
                        if let Err(e) = self
                            .dead_letter
                            .push(&self.adapter_id, remainder, &error)
                            .await
                        {
                            warn!(
                                "Adapter {}: dead-letter push failed: {}",
                                self.adapter_id, e
                            );
                        }
                    }
                }
                return budget_error;
            }
        }

        self.status.set_backoff(error.class()).await;
        warn!(
            "Adapter {} delivery failed, remainder retained: {}",
            self.adapter_id, error
        );
        error
    }

    fn queued(state: &BatchState, key: &DedupKey) -> bool {
        let in_open = state.open.iter().any(|q| q.key.as_ref() == Some(key));
        let in_pending = state
            .pending
            .as_ref()
            .map(|p| p.records.iter().any(|q| q.key.as_ref() == Some(key)))
            .unwrap_or(false);
        in_open || in_pending
    }
}

#[async_trait]
impl<T: Transport> ManagedAdapter for DeliveryExecutor<T> {
    fn adapter_id(&self) -> &str {
        &self.adapter_id
    }

    fn kind(&self) -> ConnectorKind {
        self.transport.kind()
    }

    async fn health(&self) -> AdapterHealth {
        let depth = self.dead_letter.depth(&self.adapter_id).await;
        ADAPTER_DEAD_LETTER_DEPTH
            .with_label_values(&[&self.adapter_id])
            .set(depth as i64);
        AdapterHealth {
            adapter_id: self.adapter_id.clone(),
            kind: self.transport.kind(),
            status: self.status.status().await,
            last_error_class: self.status.last_error_class().await,
            disabled_reason: self.status.disabled_reason().await,
            successful_operations: self.status.successes(),
            failed_operations: self.status.failures(),
            records_deduped: self.status.deduped(),
            cursor: None,
            dead_letter_depth: depth,
            last_check: Utc::now(),
        }
    }

    async fn disable(&self, reason: String) {
        self.status.set_disabled(reason, None).await;
    }

    async fn re_arm(&self) {
        self.budget.re_arm().await;
        self.retry_state.lock().await.consecutive_failures = 0;
        self.status.set_running().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AdapterConfig, ConfigScope};
    use crate::dedup::MemoryDedupIndex;
    use crate::types::{CommitResult, Cursor};
    use serde_json::json;
    use std::collections::HashSet;

    struct CollectingTransport {
        delivered: parking_lot::Mutex<Vec<String>>,
        fail_names: parking_lot::Mutex<HashSet<String>>,
        atomic: bool,
    }

    impl CollectingTransport {
        fn new(atomic: bool) -> Arc<Self> {
            Arc::new(Self {
                delivered: parking_lot::Mutex::new(Vec::new()),
                fail_names: parking_lot::Mutex::new(HashSet::new()),
                atomic,
            })
        }

        fn fail_on(&self, name: &str) {
            self.fail_names.lock().insert(name.to_string());
        }

        fn heal(&self, name: &str) {
            self.fail_names.lock().remove(name);
        }

        fn names(&self) -> Vec<String> {
            self.delivered.lock().clone()
        }
    }

    #[async_trait]
    impl Transport for CollectingTransport {
        type Session = ();

        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn fetch(
            &self,
            _session: &mut (),
            _cursor: Option<&Cursor>,
            _max_items: usize,
        ) -> Result<Batch> {
            Ok(Batch::empty())
        }

        async fn deliver(&self, _session: &mut (), batch: &Batch) -> Result<CommitResult> {
            {
                let failing = self.fail_names.lock();
                if batch.records.iter().any(|r| failing.contains(&r.name)) {
                    return Err(Error::TransportRetryable("target rejected write".into()));
                }
            }
            let mut delivered = self.delivered.lock();
            delivered.extend(batch.records.iter().map(|r| r.name.clone()));
            Ok(CommitResult {
                delivered: batch.len(),
                external_reference: None,
            })
        }

        async fn test_connection(&self, _session: &mut ()) -> Result<()> {
            Ok(())
        }

        fn supports_atomic_batches(&self) -> bool {
            self.atomic
        }

        fn kind(&self) -> ConnectorKind {
            ConnectorKind::Http
        }

        fn name(&self) -> &str {
            "collecting"
        }
    }

    fn test_config(overrides: &[(&str, serde_json::Value)]) -> EffectiveConfig {
        let mut instance = AdapterConfig::new("test", ConfigScope::Instance)
            .with("retry.max.attempts", json!(1))
            .with("retry.delay.ms", json!(1))
            .with("pool.acquire.timeout.ms", json!(50))
            .with("fetch.timeout.ms", json!(200))
            .with("batch.flush.size", json!(3));
        for (key, value) in overrides {
            instance = instance.with(*key, value.clone());
        }
        crate::config::resolve(
            &instance,
            &AdapterConfig::new("tg", ConfigScope::TypeGlobal),
            &AdapterConfig::new("sd", ConfigScope::SystemDefault),
        )
        .unwrap()
    }

    fn executor(
        transport: Arc<CollectingTransport>,
        config: EffectiveConfig,
    ) -> DeliveryExecutor<CollectingTransport> {
        DeliveryExecutor::new(
            "out-1",
            transport,
            Arc::new(MemoryDedupIndex::new(100)),
            Arc::new(DeadLetterSink::new(10)),
            config,
        )
    }

    fn record(name: &str) -> Record {
        Record::new(name, json!({"n": name}))
    }

    #[tokio::test]
    async fn test_size_based_flush() {
        let transport = CollectingTransport::new(false);
        let exec = executor(transport.clone(), test_config(&[]));

        assert_eq!(
            exec.submit(record("r1")).await.unwrap(),
            SubmitOutcome::Queued
        );
        assert_eq!(
            exec.submit(record("r2")).await.unwrap(),
            SubmitOutcome::Queued
        );
        assert!(transport.names().is_empty());

        assert_eq!(
            exec.submit(record("r3")).await.unwrap(),
            SubmitOutcome::Flushed { delivered: 3 }
        );
        assert_eq!(transport.names(), vec!["r1", "r2", "r3"]);
    }

    #[tokio::test]
    async fn test_time_based_strategy_ignores_size() {
        let transport = CollectingTransport::new(false);
        let exec = executor(
            transport.clone(),
            test_config(&[("batch.strategy", json!("time_based"))]),
        );

        for i in 0..5 {
            assert_eq!(
                exec.submit(record(&format!("r{}", i))).await.unwrap(),
                SubmitOutcome::Queued
            );
        }
        assert!(transport.names().is_empty());

        assert_eq!(exec.flush().await.unwrap(), 5);
        assert_eq!(transport.names().len(), 5);
    }

    #[tokio::test]
    async fn test_duplicate_submission_suppressed() {
        let transport = CollectingTransport::new(false);
        let exec = executor(
            transport.clone(),
            test_config(&[("dedup.enabled", json!(true))]),
        );

        exec.submit(record("r1")).await.unwrap();
        // Still queued: suppressed against the open batch
        assert_eq!(
            exec.submit(record("r1")).await.unwrap(),
            SubmitOutcome::Suppressed
        );

        exec.flush().await.unwrap();
        // Delivered: suppressed against the index
        assert_eq!(
            exec.submit(record("r1")).await.unwrap(),
            SubmitOutcome::Suppressed
        );
        assert_eq!(transport.names(), vec!["r1"]);
        assert_eq!(exec.status_cell().deduped(), 2);
    }

    #[tokio::test]
    async fn test_atomic_batch_commits_all_or_nothing() {
        let transport = CollectingTransport::new(true);
        transport.fail_on("r2");
        let exec = executor(transport.clone(), test_config(&[]));

        exec.submit(record("r1")).await.unwrap();
        exec.submit(record("r2")).await.unwrap();
        assert!(exec.flush().await.is_err());
        // Nothing visible at the target
        assert!(transport.names().is_empty());

        transport.heal("r2");
        assert_eq!(exec.flush().await.unwrap(), 2);
        assert_eq!(transport.names(), vec!["r1", "r2"]);
    }

    #[tokio::test]
    async fn test_sequential_resume_from_high_water_mark() {
        let transport = CollectingTransport::new(false);
        transport.fail_on("r2");
        let exec = executor(transport.clone(), test_config(&[]));

        exec.submit(record("r1")).await.unwrap();
        exec.submit(record("r2")).await.unwrap();
        assert!(exec.flush().await.is_err());
        assert_eq!(transport.names(), vec!["r1"]);

        transport.heal("r2");
        // Resume delivers only the remainder
        assert_eq!(exec.flush().await.unwrap(), 1);
        assert_eq!(transport.names(), vec!["r1", "r2"]);
    }

    #[tokio::test]
    async fn test_budget_trip_dead_letters_the_remainder() {
        let transport = CollectingTransport::new(false);
        transport.fail_on("r1");
        let exec = executor(
            transport.clone(),
            test_config(&[("error.threshold.max", json!(0))]),
        );

        exec.submit(record("r1")).await.unwrap();
        exec.submit(record("r2")).await.unwrap();
        let err = exec.flush().await.unwrap_err();
        assert!(matches!(err, Error::ErrorBudgetExceeded { .. }));

        let health = exec.health().await;
        assert_eq!(health.status, AdapterStatus::Disabled);
        assert_eq!(health.dead_letter_depth, 1);

        let rejected = exec.submit(record("r3")).await.unwrap_err();
        assert!(matches!(rejected, Error::AdapterDisabled { .. }));

        exec.re_arm().await;
        assert!(exec.submit(record("r3")).await.is_ok());
    }

    #[tokio::test]
    async fn test_rate_limit_deadline_fails_the_flush() {
        let transport = CollectingTransport::new(false);
        let exec = executor(
            transport.clone(),
            test_config(&[
                ("rate.limit.enabled", json!(true)),
                ("rate.limit.capacity", json!(1)),
                ("rate.limit.refill", json!(1)),
                ("rate.limit.tier", json!("per_hour")),
                ("fetch.timeout.ms", json!(30)),
            ]),
        );

        exec.submit(record("r1")).await.unwrap();
        exec.submit(record("r2")).await.unwrap();
        let err = exec.flush().await.unwrap_err();
        assert!(matches!(err, Error::RateLimited { .. }));

        // The token that was available carried the first record through
        assert_eq!(transport.names(), vec!["r1"]);
    }
}
