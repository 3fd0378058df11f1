//! Groups constituent row changes of one multi-row statement into a single
//! [`BulkOperationEvent`].
//!
//! Batches are keyed by `source:schema:table:operation:transaction_id`. A batch
//! completes when it reaches `max_batch_size` events, or when it has seen no new
//! event for `batch_timeout`. Timeouts are checked on every `process` call and by
//! a background sweep task that shares the same lock, so a batch that stops
//! receiving traffic is still finalized.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::bulk::{BulkOperationEvent, BulkOperationType, PipelineEvent};
use crate::filter::BulkFilter;
use crate::publisher::ChangePublisher;
use crate::types::{meta, ChangeEvent, Document};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(50);

/// Detector configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkDetectorConfig {
    /// When false every event passes through untouched.
    pub enabled: bool,
    /// A batch is finalized as soon as it holds this many events.
    pub max_batch_size: usize,
    /// A batch is finalized after this long without a new event.
    pub batch_timeout: Duration,
    /// How often the background sweep looks for timed-out batches.
    pub sweep_interval: Duration,
    /// Maximum number of row images kept in `sample_rows`.
    pub sample_cap: usize,
    pub filter: BulkFilter,
}

impl Default for BulkDetectorConfig {
    fn default() -> Self {
        let batch_timeout = Duration::from_secs(5);
        Self {
            enabled: true,
            max_batch_size: 1000,
            batch_timeout,
            sweep_interval: default_sweep_interval(batch_timeout),
            sample_cap: 5,
            filter: BulkFilter::default(),
        }
    }
}

impl BulkDetectorConfig {
    /// Set the timeout and derive the sweep interval from it.
    pub fn with_timeout(mut self, batch_timeout: Duration) -> Self {
        self.batch_timeout = batch_timeout;
        self.sweep_interval = default_sweep_interval(batch_timeout);
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn with_filter(mut self, filter: BulkFilter) -> Self {
        self.filter = filter;
        self
    }
}

/// A quarter of the timeout, but never below 50ms.
pub fn default_sweep_interval(batch_timeout: Duration) -> Duration {
    (batch_timeout / 4).max(MIN_SWEEP_INTERVAL)
}

/// What the detector did with an incoming event.
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    /// Not part of a bulk statement; the caller should handle it as a plain change.
    PassThrough(ChangeEvent),
    /// Absorbed into an active batch; it will surface as part of a bulk summary.
    Absorbed { batch_id: String },
}

/// Counters describing detector activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectorStats {
    pub batches_opened: u64,
    pub events_absorbed: u64,
    pub batches_completed: u64,
    pub published: u64,
    pub filtered: u64,
    /// Completed batches whose summary could not be published.
    pub dropped: u64,
}

/// Accumulator for one in-flight bulk operation.
#[derive(Debug)]
struct BulkOperationBatch {
    key: String,
    source: String,
    schema: String,
    table: String,
    operation_type: BulkOperationType,
    batch_id: String,
    transaction_id: Option<String>,
    start_time: Instant,
    last_update_time: Instant,
    events: Vec<ChangeEvent>,
}

impl BulkOperationBatch {
    fn new(key: String, first: &ChangeEvent, now: Instant) -> Self {
        Self {
            key,
            source: first.source.clone(),
            schema: first.schema.clone(),
            table: first.table.clone(),
            operation_type: first.operation.into(),
            batch_id: Uuid::new_v4().to_string(),
            transaction_id: first.transaction_id().map(str::to_string),
            start_time: now,
            last_update_time: now,
            events: Vec::new(),
        }
    }

    fn append(&mut self, event: ChangeEvent, now: Instant) {
        self.events.push(event);
        self.last_update_time = now;
    }

    fn len(&self) -> usize {
        self.events.len()
    }

    fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_update_time) >= timeout
    }

    fn into_event(self, sample_cap: usize) -> BulkOperationEvent {
        let final_offset = self
            .events
            .last()
            .map(|e| e.offset.clone())
            .unwrap_or_default();
        let first_offset = self
            .events
            .first()
            .map(|e| e.offset.clone())
            .unwrap_or_default();

        let sql_statement = self
            .events
            .iter()
            .find_map(|e| e.metadata.get(meta::SQL_STATEMENT).cloned());

        let sample_rows: Vec<Document> = self
            .events
            .iter()
            .filter_map(|e| e.after.as_ref().or(e.before.as_ref()).cloned())
            .take(sample_cap)
            .collect();

        let metadata = HashMap::from([
            (meta::BULK_OPERATION.to_string(), "true".to_string()),
            (meta::BATCH_KEY.to_string(), self.key),
            (meta::FIRST_OFFSET.to_string(), first_offset),
        ]);

        let duration = self.last_update_time.saturating_duration_since(self.start_time);

        BulkOperationEvent {
            source: self.source,
            schema: self.schema,
            table: self.table,
            operation_type: self.operation_type,
            affected_row_count: self.events.len() as u64,
            final_offset,
            batch_id: self.batch_id,
            transaction_id: self.transaction_id,
            sql_statement,
            execution_duration_ms: duration.as_millis() as u64,
            sample_rows,
            metadata,
        }
    }
}

/// Grouping key for an event: `source:schema:table:operation:transaction_id`.
pub fn batch_key(event: &ChangeEvent) -> String {
    format!(
        "{}:{}:{}:{}:{}",
        event.source,
        event.schema,
        event.table,
        event.operation.as_str(),
        event.transaction_id().unwrap_or("")
    )
}

#[derive(Default)]
struct DetectorState {
    batches: HashMap<String, BulkOperationBatch>,
    stats: DetectorStats,
}

struct Shared<P> {
    config: BulkDetectorConfig,
    publisher: P,
    state: Mutex<DetectorState>,
}

impl<P: ChangePublisher> Shared<P> {
    /// Finalize every batch that has been silent for the timeout, oldest first.
    async fn finalize_expired(&self, state: &mut DetectorState, now: Instant) -> usize {
        let mut expired: Vec<(Instant, String)> = state
            .batches
            .iter()
            .filter(|(_, b)| b.is_expired(now, self.config.batch_timeout))
            .map(|(key, b)| (b.last_update_time, key.clone()))
            .collect();
        expired.sort();

        let count = expired.len();
        for (_, key) in expired {
            if let Some(batch) = state.batches.remove(&key) {
                self.finalize(state, batch, "timeout").await;
            }
        }
        count
    }

    /// Finalize every open batch regardless of age, oldest first.
    async fn finalize_all(&self, state: &mut DetectorState) -> usize {
        let mut batches: Vec<BulkOperationBatch> = state.batches.drain().map(|(_, b)| b).collect();
        batches.sort_by_key(|b| b.start_time);

        let count = batches.len();
        for batch in batches {
            self.finalize(state, batch, "flush").await;
        }
        count
    }

    /// Build the summary for a batch already removed from the active set, filter and publish it.
    async fn finalize(&self, state: &mut DetectorState, batch: BulkOperationBatch, reason: &str) {
        let event = batch.into_event(self.config.sample_cap);
        state.stats.batches_completed += 1;

        info!(
            source = %event.source,
            table = %event.qualified_table(),
            operation = %event.operation_type,
            rows = event.affected_row_count,
            final_offset = %event.final_offset,
            batch_id = %event.batch_id,
            reason,
            "Bulk operation completed"
        );

        if let Some(rejection) = self.config.filter.evaluate(&event) {
            state.stats.filtered += 1;
            debug!(
                batch_id = %event.batch_id,
                table = %event.qualified_table(),
                reason = %rejection,
                "Bulk operation filtered"
            );
            return;
        }

        let batch_id = event.batch_id.clone();
        let table = event.qualified_table();
        let final_offset = event.final_offset.clone();

        match self.publisher.publish(&PipelineEvent::Bulk(event)).await {
            Ok(()) => state.stats.published += 1,
            Err(e) => {
                state.stats.dropped += 1;
                error!(
                    sink = self.publisher.name(),
                    batch_id = %batch_id,
                    table = %table,
                    final_offset = %final_offset,
                    error = %e,
                    "Dropping bulk operation summary after publish failure"
                );
            }
        }
    }
}

/// Correlates bulk constituent events for one adapter stream and publishes summaries.
///
/// Construction spawns the background sweep task, so it must happen inside a
/// tokio runtime. Call [`BulkOperationDetector::shutdown`] to stop the sweep and
/// flush open batches; dropping the detector only stops the sweep.
pub struct BulkOperationDetector<P: ChangePublisher + 'static> {
    shared: Arc<Shared<P>>,
    shutdown: CancellationToken,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
}

impl<P: ChangePublisher + 'static> BulkOperationDetector<P> {
    pub fn new(config: BulkDetectorConfig, publisher: P) -> Self {
        let shared = Arc::new(Shared {
            config,
            publisher,
            state: Mutex::new(DetectorState::default()),
        });
        let shutdown = CancellationToken::new();

        let sweeper = if shared.config.enabled {
            Some(tokio::spawn(run_sweeper(shared.clone(), shutdown.clone())))
        } else {
            None
        };

        Self {
            shared,
            shutdown,
            sweeper: StdMutex::new(sweeper),
        }
    }

    pub fn config(&self) -> &BulkDetectorConfig {
        &self.shared.config
    }

    pub fn publisher(&self) -> &P {
        &self.shared.publisher
    }

    /// Route one event: pass it through, or absorb it into a bulk batch.
    ///
    /// Completing a batch publishes its summary before this returns.
    pub async fn process(&self, event: ChangeEvent) -> Detection {
        if !self.shared.config.enabled || !event.is_bulk_operation() {
            return Detection::PassThrough(event);
        }

        let now = Instant::now();
        let key = batch_key(&event);
        let mut state = self.shared.state.lock().await;

        self.shared.finalize_expired(&mut state, now).await;

        let DetectorState { batches, stats } = &mut *state;
        let batch = batches.entry(key.clone()).or_insert_with(|| {
            let batch = BulkOperationBatch::new(key.clone(), &event, now);
            debug!(
                batch_key = %key,
                batch_id = %batch.batch_id,
                offset = %event.offset,
                "Opened bulk batch"
            );
            stats.batches_opened += 1;
            batch
        });
        stats.events_absorbed += 1;
        batch.append(event, now);

        let max_batch_size = self.shared.config.max_batch_size.max(1);
        let batch_id = batch.batch_id.clone();
        let full = batch.len() >= max_batch_size;

        if full {
            if let Some(batch) = state.batches.remove(&key) {
                self.shared.finalize(&mut state, batch, "max_batch_size").await;
            }
        }

        Detection::Absorbed { batch_id }
    }

    /// Finalize batches that have timed out. The sweep task calls this periodically.
    pub async fn sweep(&self) -> usize {
        let mut state = self.shared.state.lock().await;
        self.shared.finalize_expired(&mut state, Instant::now()).await
    }

    /// Finalize every open batch now.
    pub async fn flush(&self) -> usize {
        let mut state = self.shared.state.lock().await;
        self.shared.finalize_all(&mut state).await
    }

    pub async fn active_batches(&self) -> usize {
        self.shared.state.lock().await.batches.len()
    }

    pub async fn stats(&self) -> DetectorStats {
        self.shared.state.lock().await.stats
    }

    /// Stop the sweep task and flush open batches.
    pub async fn shutdown(&self) -> usize {
        self.shutdown.cancel();

        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Bulk sweep task ended abnormally");
            }
        }

        self.flush().await
    }
}

impl<P: ChangePublisher + 'static> Drop for BulkOperationDetector<P> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_sweeper<P: ChangePublisher + 'static>(
    shared: Arc<Shared<P>>,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(shared.config.sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let mut state = shared.state.lock().await;
                let finalized = shared.finalize_expired(&mut state, Instant::now()).await;
                if finalized > 0 {
                    debug!(finalized, "Sweep finalized timed-out bulk batches");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockPublisher;
    use crate::types::Operation;
    use serde_json::json;

    fn bulk_event(table: &str, op: Operation, offset: u64) -> ChangeEvent {
        ChangeEvent::new("db", "public", table, op, offset.to_string())
            .with_after(json!({ "id": offset }))
            .with_metadata(meta::AFFECTED_ROWS, "50")
    }

    fn config(max: usize, timeout_ms: u64) -> BulkDetectorConfig {
        BulkDetectorConfig::default()
            .with_max_batch_size(max)
            .with_timeout(Duration::from_millis(timeout_ms))
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_row_events_pass_through() {
        let publisher = MockPublisher::new("mock");
        let detector = BulkOperationDetector::new(config(10, 1000), publisher.clone());

        let event = ChangeEvent::new("db", "public", "orders", Operation::Insert, "1");
        let detection = detector.process(event.clone()).await;

        assert_eq!(detection, Detection::PassThrough(event));
        assert_eq!(detector.active_batches().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_detector_passes_bulk_through() {
        let publisher = MockPublisher::new("mock");
        let config = BulkDetectorConfig {
            enabled: false,
            ..config(10, 1000)
        };
        let detector = BulkOperationDetector::new(config, publisher);

        let detection = detector
            .process(bulk_event("orders", Operation::Insert, 1))
            .await;
        assert!(matches!(detection, Detection::PassThrough(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_size_finalizes_on_triggering_append() {
        let publisher = MockPublisher::new("mock");
        let detector = BulkOperationDetector::new(config(3, 60_000), publisher.clone());

        detector.process(bulk_event("orders", Operation::Update, 10)).await;
        detector.process(bulk_event("orders", Operation::Update, 11)).await;
        assert!(publisher.bulk_events().is_empty());

        detector.process(bulk_event("orders", Operation::Update, 12)).await;

        let bulk = publisher.bulk_events();
        assert_eq!(bulk.len(), 1);
        assert_eq!(bulk[0].operation_type, BulkOperationType::BulkUpdate);
        assert_eq!(bulk[0].affected_row_count, 3);
        assert_eq!(bulk[0].final_offset, "12");
        assert_eq!(bulk[0].metadata[meta::FIRST_OFFSET], "10");
        assert_eq!(detector.active_batches().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_finalizes_silent_batch() {
        let publisher = MockPublisher::new("mock");
        let detector = BulkOperationDetector::new(config(100, 1000), publisher.clone());

        detector.process(bulk_event("orders", Operation::Delete, 5)).await;
        assert_eq!(detector.active_batches().await, 1);

        tokio::time::sleep(Duration::from_millis(1600)).await;

        let bulk = publisher.bulk_events();
        assert_eq!(bulk.len(), 1);
        assert_eq!(bulk[0].affected_row_count, 1);
        assert_eq!(bulk[0].final_offset, "5");
        assert_eq!(bulk[0].operation_type, BulkOperationType::BulkDelete);
        assert_eq!(detector.active_batches().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_event_opens_new_batch_inline() {
        let publisher = MockPublisher::new("mock");
        let config = BulkDetectorConfig {
            sweep_interval: Duration::from_secs(3600),
            ..config(100, 1000)
        };
        let detector = BulkOperationDetector::new(config, publisher.clone());

        detector.process(bulk_event("orders", Operation::Insert, 1)).await;
        tokio::time::advance(Duration::from_millis(1500)).await;
        detector.process(bulk_event("orders", Operation::Insert, 2)).await;

        let bulk = publisher.bulk_events();
        assert_eq!(bulk.len(), 1);
        assert_eq!(bulk[0].final_offset, "1");
        assert_eq!(detector.active_batches().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transactions_are_grouped_separately() {
        let publisher = MockPublisher::new("mock");
        let detector = BulkOperationDetector::new(config(100, 1000), publisher.clone());

        for (offset, tx) in [(1, "a"), (2, "b"), (3, "a"), (4, "")] {
            let event = bulk_event("orders", Operation::Update, offset)
                .with_metadata(meta::TRANSACTION_ID, tx);
            detector.process(event).await;
        }
        assert_eq!(detector.active_batches().await, 3);

        detector.flush().await;
        let mut bulk = publisher.bulk_events();
        bulk.sort_by(|a, b| a.final_offset.cmp(&b.final_offset));

        assert_eq!(bulk.len(), 3);
        assert_eq!(bulk[0].final_offset, "2");
        assert_eq!(bulk[0].transaction_id.as_deref(), Some("b"));
        assert_eq!(bulk[1].final_offset, "3");
        assert_eq!(bulk[1].affected_row_count, 2);
        assert_eq!(bulk[2].transaction_id, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_excluded_table_is_never_published() {
        let publisher = MockPublisher::new("mock");
        let filter = BulkFilter {
            exclude_tables: vec!["audit_log".into()],
            ..Default::default()
        };
        let detector =
            BulkOperationDetector::new(config(2, 1000).with_filter(filter), publisher.clone());

        detector.process(bulk_event("audit_log", Operation::Insert, 1)).await;
        detector.process(bulk_event("audit_log", Operation::Insert, 2)).await;
        detector.process(bulk_event("orders", Operation::Insert, 3)).await;
        detector.process(bulk_event("orders", Operation::Insert, 4)).await;

        let bulk = publisher.bulk_events();
        assert_eq!(bulk.len(), 1);
        assert_eq!(bulk[0].table, "orders");

        let stats = detector.stats().await;
        assert_eq!(stats.batches_completed, 2);
        assert_eq!(stats.filtered, 1);
        assert_eq!(stats.published, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_failure_drops_summary() {
        let publisher = MockPublisher::new("mock").always_failing();
        let detector = BulkOperationDetector::new(config(2, 1000), publisher.clone());

        detector.process(bulk_event("orders", Operation::Insert, 1)).await;
        let detection = detector.process(bulk_event("orders", Operation::Insert, 2)).await;

        assert!(matches!(detection, Detection::Absorbed { .. }));
        assert_eq!(detector.active_batches().await, 0);
        assert_eq!(detector.stats().await.dropped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_and_samples_are_capped() {
        let publisher = MockPublisher::new("mock");
        let config = BulkDetectorConfig {
            sample_cap: 2,
            ..config(100, 60_000)
        };
        let detector = BulkOperationDetector::new(config, publisher.clone());

        for offset in 1..=5 {
            let event = bulk_event("orders", Operation::Insert, offset)
                .with_metadata(meta::SQL_STATEMENT, "INSERT INTO orders SELECT ...");
            detector.process(event).await;
            tokio::time::advance(Duration::from_millis(10)).await;
        }

        assert_eq!(detector.shutdown().await, 1);

        let bulk = publisher.bulk_events();
        assert_eq!(bulk.len(), 1);
        assert_eq!(bulk[0].affected_row_count, 5);
        assert_eq!(bulk[0].sample_rows, vec![json!({"id": 1}), json!({"id": 2})]);
        assert_eq!(
            bulk[0].sql_statement.as_deref(),
            Some("INSERT INTO orders SELECT ...")
        );
        assert_eq!(bulk[0].execution_duration_ms, 40);
    }
}
