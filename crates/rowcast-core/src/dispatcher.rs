//! Hand-off handlers that connect an adapter to its sinks.

use std::future::Future;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::adapter::EventHandler;
use crate::bulk::PipelineEvent;
use crate::detector::{BulkDetectorConfig, BulkOperationDetector, Detection, DetectorStats};
use crate::error::Result;
use crate::publisher::{ChangePublisher, Fanout};
use crate::types::ChangeEvent;

enum BulkRoute<P: ChangePublisher + 'static> {
    /// No detector: bulk-aware sinks see every raw event.
    Direct(Fanout<P>),
    Detecting(BulkOperationDetector<Fanout<P>>),
}

/// Routes one adapter's events to raw and bulk-aware sinks.
///
/// Raw sinks receive every change event. Bulk-aware sinks receive events the
/// detector passes through, plus the summaries it publishes for completed bulk
/// operations. A publish failure is returned to the adapter so the offset is
/// not advanced.
pub struct Dispatcher<P: ChangePublisher + 'static> {
    source_id: String,
    raw: Fanout<P>,
    bulk: BulkRoute<P>,
}

impl<P: ChangePublisher + 'static> Dispatcher<P> {
    /// Build a dispatcher. The detector is only created when there are bulk-aware sinks
    /// to receive its summaries. Must be called inside a tokio runtime.
    pub fn new(
        source_id: impl Into<String>,
        raw: Vec<P>,
        bulk_aware: Vec<P>,
        detector: Option<BulkDetectorConfig>,
    ) -> Self {
        let source_id = source_id.into();
        let raw = Fanout::new(format!("{source_id}/raw"), raw);
        let bulk_aware = Fanout::new(format!("{source_id}/bulk_aware"), bulk_aware);

        let bulk = match detector {
            Some(config) if config.enabled && !bulk_aware.is_empty() => {
                debug!(source = %source_id, sinks = bulk_aware.len(), "Bulk detection enabled");
                BulkRoute::Detecting(BulkOperationDetector::new(config, bulk_aware))
            }
            _ => BulkRoute::Direct(bulk_aware),
        };

        Self {
            source_id,
            raw,
            bulk,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn detector(&self) -> Option<&BulkOperationDetector<Fanout<P>>> {
        match &self.bulk {
            BulkRoute::Detecting(detector) => Some(detector),
            BulkRoute::Direct(_) => None,
        }
    }

    pub async fn detector_stats(&self) -> Option<DetectorStats> {
        match self.detector() {
            Some(detector) => Some(detector.stats().await),
            None => None,
        }
    }

    /// Route one change event.
    pub async fn dispatch(&self, event: ChangeEvent) -> Result<()> {
        if !self.raw.is_empty() {
            self.raw.publish(&PipelineEvent::Change(event.clone())).await?;
        }

        match &self.bulk {
            BulkRoute::Direct(sinks) if sinks.is_empty() => Ok(()),
            BulkRoute::Direct(sinks) => sinks.publish(&PipelineEvent::Change(event)).await,
            BulkRoute::Detecting(detector) => match detector.process(event).await {
                Detection::PassThrough(event) => {
                    detector
                        .publisher()
                        .publish(&PipelineEvent::Change(event))
                        .await
                }
                Detection::Absorbed { .. } => Ok(()),
            },
        }
    }

    /// Stop the detector's sweep and flush its open batches.
    pub async fn shutdown(&self) {
        if let BulkRoute::Detecting(detector) = &self.bulk {
            let flushed = detector.shutdown().await;
            let stats = detector.stats().await;
            info!(
                source = %self.source_id,
                flushed,
                batches_completed = stats.batches_completed,
                published = stats.published,
                filtered = stats.filtered,
                dropped = stats.dropped,
                "Bulk detector shut down"
            );
        }
    }
}

impl<P: ChangePublisher + 'static> EventHandler for Dispatcher<P> {
    fn handle(
        &self,
        event: ChangeEvent,
        _cancel: CancellationToken,
    ) -> impl Future<Output = Result<()>> + Send {
        self.dispatch(event)
    }
}

/// Buffers events and delivers them with `publish_batch`, for bulk re-delivery.
///
/// A failed batch is returned to the caller; events before it were delivered.
pub struct BatchForwarder<P> {
    publisher: P,
    batch_size: usize,
    buffer: Mutex<Vec<PipelineEvent>>,
}

impl<P: ChangePublisher> BatchForwarder<P> {
    pub fn new(publisher: P, batch_size: usize) -> Self {
        Self {
            publisher,
            batch_size: batch_size.max(1),
            buffer: Mutex::new(Vec::new()),
        }
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    /// Deliver whatever is buffered.
    pub async fn flush(&self) -> Result<()> {
        let mut buffer = self.buffer.lock().await;
        self.flush_locked(&mut buffer).await
    }

    async fn flush_locked(&self, buffer: &mut Vec<PipelineEvent>) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        let events = std::mem::take(buffer);
        debug!(sink = self.publisher.name(), events = events.len(), "Forwarding batch");
        self.publisher.publish_batch(&events).await.into_result()
    }
}

impl<P: ChangePublisher> EventHandler for BatchForwarder<P> {
    fn handle(
        &self,
        event: ChangeEvent,
        _cancel: CancellationToken,
    ) -> impl Future<Output = Result<()>> + Send {
        async move {
            let mut buffer = self.buffer.lock().await;
            buffer.push(PipelineEvent::Change(event));
            if buffer.len() >= self.batch_size {
                self.flush_locked(&mut buffer).await?;
            }
            Ok(())
        }
    }
}
