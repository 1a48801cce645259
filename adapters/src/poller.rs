//! Inbound polling scheduler
//!
//! One scheduler drives one inbound adapter instance: on each tick it
//! fetches after the persisted cursor, filters duplicates, hands records
//! to the workflow engine in order, and only then advances the cursor.
//! Ticks never overlap; a tick arriving while the previous one is still
//! running is skipped, not queued. Failures feed the error budget and
//! push the instance into backoff or, once the budget trips, disable it
//! until an operator re-arms.

use crate::config::EffectiveConfig;
use crate::cursor::CursorStore;
use crate::dead_letter::DeadLetterSink;
use crate::dedup::{DedupIndex, DedupKey};
use crate::error::{Error, Result};
use crate::manager::{ManagedAdapter, StatusCell};
use crate::metrics::{
    ADAPTER_DEAD_LETTER_DEPTH, ADAPTER_FETCHES_TOTAL, ADAPTER_OPERATION_DURATION,
    ADAPTER_RECORDS_DEDUPED_TOTAL, ADAPTER_STATUS,
};
use crate::pool::{ConnectionLeaseManager, PoolConfig};
use crate::retry::{ErrorBudget, RetryPolicy, RetryState};
use crate::transport::{Sink, Transport};
use crate::types::{Acknowledgement, AdapterHealth, AdapterStatus, Batch, ConnectorKind, Record};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const STATE_IDLE: u8 = 0;
const STATE_FETCHING: u8 = 1;
const STATE_HANDING_OFF: u8 = 2;

/// What a tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Previous tick still running, instance disabled, or backoff pending
    Skipped,
    /// Fetch returned an empty batch; cursor untouched
    NothingNew,
    /// A batch was handed off and the cursor advanced
    Ingested {
        /// Records handed to the sink
        records: usize,
        /// Records suppressed as duplicates
        duplicates: usize,
    },
}

/// Drives the fetch/hand-off/advance cycle for one inbound adapter instance
pub struct PollingScheduler<T: Transport> {
    adapter_id: String,
    transport: Arc<T>,
    pool: ConnectionLeaseManager<T>,
    sink: Arc<dyn Sink>,
    cursor_store: Arc<dyn CursorStore>,
    dedup: Arc<dyn DedupIndex>,
    dead_letter: Arc<DeadLetterSink>,
    config: EffectiveConfig,
    retry: RetryPolicy,
    retry_state: Mutex<RetryState>,
    budget: ErrorBudget,
    status: Arc<StatusCell>,
    state: AtomicU8,
    backoff_until: parking_lot::Mutex<Option<Instant>>,
}

struct TickGuard<'a>(&'a AtomicU8);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(STATE_IDLE, Ordering::Release);
    }
}

impl<T: Transport> PollingScheduler<T> {
    /// Assemble a scheduler for one adapter instance
    pub fn new(
        adapter_id: impl Into<String>,
        transport: Arc<T>,
        sink: Arc<dyn Sink>,
        cursor_store: Arc<dyn CursorStore>,
        dedup: Arc<dyn DedupIndex>,
        dead_letter: Arc<DeadLetterSink>,
        config: EffectiveConfig,
    ) -> Self {
        let adapter_id = adapter_id.into();
        let pool = ConnectionLeaseManager::new(transport.clone(), PoolConfig::from_config(&config));
        let retry = RetryPolicy::from_config(&config);
        let budget = ErrorBudget::from_config(adapter_id.clone(), &config);
        let status = Arc::new(StatusCell::new(adapter_id.clone()));
        Self {
            adapter_id,
            transport,
            pool,
            sink,
            cursor_store,
            dedup,
            dead_letter,
            config,
            retry,
            retry_state: Mutex::new(RetryState::new()),
            budget,
            status,
            state: AtomicU8::new(STATE_IDLE),
            backoff_until: parking_lot::Mutex::new(None),
        }
    }

    /// Shared status cell (the manager reads health through it)
    pub fn status_cell(&self) -> Arc<StatusCell> {
        self.status.clone()
    }

    /// The instance's connection pool
    pub fn pool(&self) -> &ConnectionLeaseManager<T> {
        &self.pool
    }

    /// One polling cycle: fetch, dedup, hand off, advance.
    ///
    /// Skips without side effects when the instance is disabled, a backoff
    /// period is pending, or the previous tick is still running.
    pub async fn tick(&self) -> Result<TickOutcome> {
        if self.status.is_disabled().await {
            return Ok(TickOutcome::Skipped);
        }
        if self.in_backoff().await {
            return Ok(TickOutcome::Skipped);
        }

        if self
            .state
            .compare_exchange(
                STATE_IDLE,
                STATE_FETCHING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            debug!(
                "Adapter {}: previous tick still running, skipping",
                self.adapter_id
            );
            return Ok(TickOutcome::Skipped);
        }
        let _guard = TickGuard(&self.state);

        let cursor = self.cursor_store.load(&self.adapter_id).await?;

        let batch = match self.fetch_with_retry(cursor.as_ref().cloned()).await {
            Ok(batch) => batch,
            Err(e) => return Err(self.fail(e, None).await),
        };

        if batch.is_empty() {
            ADAPTER_FETCHES_TOTAL
                .with_label_values(&[&self.adapter_id, "empty"])
                .inc();
            self.status.record_success();
            return Ok(TickOutcome::NothingNew);
        }

        self.state.store(STATE_HANDING_OFF, Ordering::Release);
        match self.hand_off(&batch).await {
            Ok((records, duplicates)) => {
                ADAPTER_FETCHES_TOTAL
                    .with_label_values(&[&self.adapter_id, "ok"])
                    .inc();
                self.status.record_success();
                Ok(TickOutcome::Ingested {
                    records,
                    duplicates,
                })
            }
            Err(e) => Err(self.fail(e, Some(batch)).await),
        }
    }

    /// Run the polling loop until `shutdown` flips
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(
            "Adapter {} ({}) polling every {:?}",
            self.adapter_id,
            self.transport.kind(),
            self.config.polling_interval
        );
        let mut interval = tokio::time::interval(self.config.polling_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!("Adapter {} tick failed: {}", self.adapter_id, e);
                    }
                }
                _ = shutdown.changed() => {
                    info!("Adapter {} polling stopped", self.adapter_id);
                    break;
                }
            }
        }
    }

    async fn fetch_with_retry(&self, cursor: Option<crate::types::Cursor>) -> Result<Batch> {
        let mut retry_state = self.retry_state.lock().await;
        let fetch_timeout = self.config.fetch_timeout;
        let max_items = self.config.max_batch_size;

        let timer = ADAPTER_OPERATION_DURATION
            .with_label_values(&[&self.adapter_id, "fetch"])
            .start_timer();
        let result = self
            .retry
            .execute(&mut retry_state, || {
                let cursor = cursor.clone();
                async move {
                    let mut lease = self.pool.acquire().await?;
                    match tokio::time::timeout(
                        fetch_timeout,
                        self.transport
                            .fetch(lease.session_mut(), cursor.as_ref(), max_items),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(Error::Timeout {
                            seconds: fetch_timeout.as_secs(),
                            operation: "fetch".into(),
                        }),
                    }
                }
            })
            .await;
        timer.observe_duration();
        result
    }

    /// Hand a fetched batch to the sink in order, then advance the cursor.
    ///
    /// The cursor moves only after every fresh record is acknowledged, so a
    /// crash mid-batch replays the whole batch (at-least-once); the dedup
    /// index keeps the replay invisible downstream.
    async fn hand_off(&self, batch: &Batch) -> Result<(usize, usize)> {
        let (fresh, fresh_keys, duplicates) = self.filter_duplicates(&batch.records).await?;

        if duplicates > 0 {
            ADAPTER_RECORDS_DEDUPED_TOTAL
                .with_label_values(&[&self.adapter_id])
                .inc_by(duplicates as f64);
            self.status.record_deduped(duplicates as u64);
        }

        for record in &fresh {
            match self.sink.hand_off(record).await? {
                Acknowledgement::Ack => {}
                Acknowledgement::Nack => {
                    return Err(Error::Generic(format!(
                        "record {} refused by workflow engine",
                        record.name
                    )));
                }
            }
        }

        if let Some(end_cursor) = &batch.end_cursor {
            self.cursor_store
                .advance(&self.adapter_id, end_cursor.clone())
                .await?;
        }
        if !fresh_keys.is_empty() {
            self.dedup.insert(&self.adapter_id, &fresh_keys).await?;
        }

        Ok((fresh.len(), duplicates))
    }

    async fn filter_duplicates(
        &self,
        records: &[Record],
    ) -> Result<(Vec<Record>, Vec<DedupKey>, usize)> {
        if !self.config.dedup_enabled {
            return Ok((records.to_vec(), Vec::new(), 0));
        }

        let mut fresh = Vec::with_capacity(records.len());
        let mut fresh_keys = Vec::with_capacity(records.len());
        let mut duplicates = 0;
        for record in records {
            let key = DedupKey::from_record(record, self.config.dedup_strategy);
            if self.dedup.contains(&self.adapter_id, &key).await? {
                duplicates += 1;
            } else {
                fresh.push(record.clone());
                fresh_keys.push(key);
            }
        }
        Ok((fresh, fresh_keys, duplicates))
    }

    async fn in_backoff(&self) -> bool {
        let pending = {
            let mut backoff = self.backoff_until.lock();
            match *backoff {
                Some(until) if Instant::now() < until => true,
                Some(_) => {
                    *backoff = None;
                    false
                }
                None => false,
            }
        };
        if !pending && self.status.status().await == AdapterStatus::Backoff {
            info!("Adapter {} backoff elapsed, resuming", self.adapter_id);
            self.status.set_running().await;
        }
        pending
    }

    /// Classify a failed tick: count it against the budget, then either
    /// disable, or back off until the next eligible tick.
    async fn fail(&self, error: Error, batch: Option<Batch>) -> Error {
        ADAPTER_FETCHES_TOTAL
            .with_label_values(&[&self.adapter_id, "error"])
            .inc();
        self.status.record_failure();

        if let Err(budget_error) = self.budget.record_failures(1).await {
            if self.config.disable_on_exceed {
                self.status
                    .set_disabled(budget_error.to_string(), Some(error.class()))
                    .await;
                if let Some(batch) = batch {
                    if let Err(e) = self.dead_letter.push(&self.adapter_id, batch, &error).await {
                        warn!("Adapter {}: dead-letter push failed: {}", self.adapter_id, e);
                    }
                }
                return budget_error;
            }
        }

        let streak = self.retry_state.lock().await.consecutive_failures.max(1);
        let backoff = self.retry.delay_for_attempt(streak);
        *self.backoff_until.lock() = Some(Instant::now() + backoff);
        self.status.set_backoff(error.class()).await;
        warn!(
            "Adapter {} backing off {:?} after failure: {}",
            self.adapter_id, backoff, error
        );
        error
    }
}

#[async_trait]
impl<T: Transport> ManagedAdapter for PollingScheduler<T> {
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
            cursor: self.cursor_store.load(&self.adapter_id).await.ok().flatten(),
            dead_letter_depth: depth,
            last_check: Utc::now(),
        }
    }

    async fn disable(&self, reason: String) {
        self.status.set_disabled(reason, None).await;
    }

    async fn re_arm(&self) {
        self.budget.re_arm().await;
        *self.backoff_until.lock() = None;
        self.retry_state.lock().await.consecutive_failures = 0;
        self.status.set_running().await;
        ADAPTER_STATUS.with_label_values(&[&self.adapter_id]).set(0);
    }
}
