// End-to-end pipeline tests: source transport -> polling scheduler ->
// workflow sink -> delivery executor -> target transport.

use async_trait::async_trait;
use meshline_adapters::config::{self, AdapterConfig, ConfigScope, EffectiveConfig};
use meshline_adapters::cursor::{CursorStore, MemoryCursorStore};
use meshline_adapters::dead_letter::DeadLetterSink;
use meshline_adapters::dedup::MemoryDedupIndex;
use meshline_adapters::delivery::DeliveryExecutor;
use meshline_adapters::manager::{AdapterManager, ManagedAdapter};
use meshline_adapters::poller::{PollingScheduler, TickOutcome};
use meshline_adapters::webhook::{HmacAlgorithm, WebhookVerifier};
use meshline_adapters::{
    Acknowledgement, AdapterStatus, Batch, CommitResult, ConnectorKind, Cursor, Error, Record,
    Result, Sink, Transport,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Source serving a fixed record sequence behind a sequence cursor
struct SeqSource {
    records: Vec<Record>,
    failing: AtomicBool,
}

impl SeqSource {
    fn new(count: usize) -> Arc<Self> {
        Arc::new(Self {
            records: (1..=count)
                .map(|i| Record::new(format!("r{:03}", i), json!({"seq": i})))
                .collect(),
            failing: AtomicBool::new(false),
        })
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for SeqSource {
    type Session = ();

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn fetch(
        &self,
        _session: &mut (),
        cursor: Option<&Cursor>,
        max_items: usize,
    ) -> Result<Batch> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::TransportRetryable("source unreachable".into()));
        }
        let start = match cursor {
            Some(Cursor::Sequence(n)) => *n as usize,
            _ => 0,
        };
        let slice: Vec<Record> = self
            .records
            .iter()
            .skip(start)
            .take(max_items)
            .cloned()
            .collect();
        if slice.is_empty() {
            return Ok(Batch::empty());
        }
        let end = start + slice.len();
        Ok(Batch::new(slice, Some(Cursor::Sequence(end as u64))))
    }

    async fn deliver(&self, _session: &mut (), _batch: &Batch) -> Result<CommitResult> {
        Err(Error::TransportFatal("source is read-only".into()))
    }

    async fn test_connection(&self, _session: &mut ()) -> Result<()> {
        Ok(())
    }

    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Sftp
    }

    fn name(&self) -> &str {
        "seq-source"
    }
}

/// Target collecting delivered record names in order
struct MemoryTarget {
    delivered: parking_lot::Mutex<Vec<String>>,
}

impl MemoryTarget {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            delivered: parking_lot::Mutex::new(Vec::new()),
        })
    }

    fn names(&self) -> Vec<String> {
        self.delivered.lock().clone()
    }
}

#[async_trait]
impl Transport for MemoryTarget {
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

    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Http
    }

    fn name(&self) -> &str {
        "memory-target"
    }
}

/// Sink recording hand-offs in order
#[derive(Default)]
struct RecordingSink {
    seen: parking_lot::Mutex<Vec<String>>,
}

#[async_trait]
impl Sink for RecordingSink {
    async fn hand_off(&self, record: &Record) -> Result<Acknowledgement> {
        self.seen.lock().push(record.name.clone());
        Ok(Acknowledgement::Ack)
    }
}

/// Sink bridging inbound records straight into an outbound executor
struct BridgeSink {
    executor: Arc<DeliveryExecutor<MemoryTarget>>,
}

#[async_trait]
impl Sink for BridgeSink {
    async fn hand_off(&self, record: &Record) -> Result<Acknowledgement> {
        self.executor.submit(record.clone()).await?;
        Ok(Acknowledgement::Ack)
    }
}

fn fast_config(overrides: &[(&str, serde_json::Value)]) -> anyhow::Result<EffectiveConfig> {
    let mut instance = AdapterConfig::new("test", ConfigScope::Instance)
        .with("retry.max.attempts", json!(1))
        .with("retry.delay.ms", json!(1))
        .with("pool.acquire.timeout.ms", json!(100))
        .with("fetch.timeout.ms", json!(500));
    for (key, value) in overrides {
        instance = instance.with(*key, value.clone());
    }
    Ok(config::resolve(
        &instance,
        &AdapterConfig::new("tg", ConfigScope::TypeGlobal),
        &AdapterConfig::new("sd", ConfigScope::SystemDefault),
    )?)
}

fn poller<S: Sink + 'static>(
    source: Arc<SeqSource>,
    sink: Arc<S>,
    cursors: Arc<MemoryCursorStore>,
    cfg: EffectiveConfig,
) -> PollingScheduler<SeqSource> {
    PollingScheduler::new(
        "in-1",
        source,
        sink,
        cursors,
        Arc::new(MemoryDedupIndex::new(1_000)),
        Arc::new(DeadLetterSink::new(100)),
        cfg,
    )
}

#[tokio::test]
async fn test_pagination_advances_cursor_per_batch() -> anyhow::Result<()> {
    let source = SeqSource::new(150);
    let sink = Arc::new(RecordingSink::default());
    let cursors = Arc::new(MemoryCursorStore::new());
    let scheduler = poller(source, sink.clone(), cursors.clone(), fast_config(&[])?);

    // Default max batch size is 100: two batches, then nothing new
    assert_eq!(
        scheduler.tick().await?,
        TickOutcome::Ingested {
            records: 100,
            duplicates: 0
        }
    );
    assert_eq!(cursors.load("in-1").await?, Some(Cursor::Sequence(100)));

    assert_eq!(
        scheduler.tick().await?,
        TickOutcome::Ingested {
            records: 50,
            duplicates: 0
        }
    );
    assert_eq!(cursors.load("in-1").await?, Some(Cursor::Sequence(150)));

    assert_eq!(scheduler.tick().await?, TickOutcome::NothingNew);

    let seen = sink.seen.lock().clone();
    assert_eq!(seen.len(), 150);
    assert_eq!(seen.first().map(String::as_str), Some("r001"));
    assert_eq!(seen.last().map(String::as_str), Some("r150"));
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "order preserved");
    Ok(())
}

#[tokio::test]
async fn test_source_to_target_bridge() -> anyhow::Result<()> {
    let source = SeqSource::new(150);
    let target = MemoryTarget::new();
    let executor = Arc::new(DeliveryExecutor::new(
        "out-1",
        target.clone(),
        Arc::new(MemoryDedupIndex::new(1_000)),
        Arc::new(DeadLetterSink::new(100)),
        fast_config(&[("batch.flush.size", json!(100))])?,
    ));
    let cursors = Arc::new(MemoryCursorStore::new());
    let scheduler = poller(
        source,
        Arc::new(BridgeSink {
            executor: executor.clone(),
        }),
        cursors,
        fast_config(&[])?,
    );

    scheduler.tick().await?;
    scheduler.tick().await?;
    // The first hundred flushed on size; push the tail out explicitly
    executor.flush().await?;

    let names = target.names();
    assert_eq!(names.len(), 150);
    assert_eq!(names.first().map(String::as_str), Some("r001"));
    assert_eq!(names.last().map(String::as_str), Some("r150"));
    Ok(())
}

#[tokio::test]
async fn test_replayed_fetch_is_invisible_downstream() -> anyhow::Result<()> {
    let source = SeqSource::new(5);
    let sink = Arc::new(RecordingSink::default());
    let cursors = Arc::new(MemoryCursorStore::new());
    let scheduler = poller(
        source,
        sink.clone(),
        cursors.clone(),
        fast_config(&[("dedup.enabled", json!(true))])?,
    );

    assert!(matches!(
        scheduler.tick().await?,
        TickOutcome::Ingested { records: 5, .. }
    ));

    // Simulate a crash before the cursor advance was persisted
    cursors.reset("in-1", None).await?;
    assert_eq!(
        scheduler.tick().await?,
        TickOutcome::Ingested {
            records: 0,
            duplicates: 5
        }
    );
    assert_eq!(sink.seen.lock().len(), 5);
    Ok(())
}

#[tokio::test]
async fn test_operator_disable_and_re_arm_through_manager() -> anyhow::Result<()> {
    let source = SeqSource::new(10);
    let sink = Arc::new(RecordingSink::default());
    let cursors = Arc::new(MemoryCursorStore::new());
    let scheduler = Arc::new(poller(source, sink, cursors, fast_config(&[])?));

    let manager = AdapterManager::new();
    manager.register(scheduler.clone()).await;

    manager
        .disable("in-1", "source maintenance".into(), "ops")
        .await?;
    assert_eq!(scheduler.tick().await?, TickOutcome::Skipped);

    let health = manager.health("in-1").await?;
    assert_eq!(health.status, AdapterStatus::Disabled);
    assert_eq!(
        health.disabled_reason.as_deref(),
        Some("source maintenance")
    );

    manager.re_arm("in-1", "ops").await?;
    assert!(matches!(
        scheduler.tick().await?,
        TickOutcome::Ingested { records: 10, .. }
    ));
    Ok(())
}

#[tokio::test]
async fn test_budget_trip_then_re_arm_recovers() -> anyhow::Result<()> {
    let source = SeqSource::new(3);
    source.set_failing(true);
    let sink = Arc::new(RecordingSink::default());
    let cursors = Arc::new(MemoryCursorStore::new());
    let scheduler = Arc::new(poller(
        source.clone(),
        sink,
        cursors,
        fast_config(&[("error.threshold.max", json!(0))])?,
    ));

    let err = scheduler.tick().await.unwrap_err();
    assert!(matches!(err, Error::ErrorBudgetExceeded { .. }));
    assert_eq!(scheduler.health().await.status, AdapterStatus::Disabled);
    assert_eq!(scheduler.tick().await?, TickOutcome::Skipped);

    source.set_failing(false);
    scheduler.re_arm().await;
    assert!(matches!(
        scheduler.tick().await?,
        TickOutcome::Ingested { records: 3, .. }
    ));
    Ok(())
}

#[tokio::test]
async fn test_webhook_gates_push_triggered_poll() -> anyhow::Result<()> {
    let secret = b"mesh-secret";
    let body = br#"{"event":"objects.changed"}"#;
    let verifier = WebhookVerifier::new(HmacAlgorithm::Sha256);

    let source = SeqSource::new(2);
    let sink = Arc::new(RecordingSink::default());
    let cursors = Arc::new(MemoryCursorStore::new());
    let scheduler = poller(source, sink.clone(), cursors, fast_config(&[])?);

    // Tampered notification: rejected, nothing fetched
    assert!(!verifier.verify("sha256=deadbeef", body, secret));
    assert!(sink.seen.lock().is_empty());

    // Authentic notification triggers an immediate poll
    let signature = verifier.sign(body, secret);
    assert!(verifier.verify(&signature, body, secret));
    assert!(matches!(
        scheduler.tick().await?,
        TickOutcome::Ingested { records: 2, .. }
    ));
    Ok(())
}
