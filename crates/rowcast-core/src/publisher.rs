use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use tracing::warn;

use crate::bulk::PipelineEvent;
use crate::error::{Error, Result};

/// Trait for sinks that deliver pipeline events downstream.
///
/// Implementations wrap their transport call in [`crate::retry::with_retry`], so an
/// `Err` from `publish` means retries are already exhausted.
pub trait ChangePublisher: Send + Sync {
    /// Sink name used in logs and errors.
    fn name(&self) -> &str;

    /// Deliver one event.
    fn publish(&self, event: &PipelineEvent) -> impl Future<Output = Result<()>> + Send;

    /// Deliver several events, reporting each event's outcome.
    ///
    /// The default issues concurrent individual publishes.
    fn publish_batch(&self, events: &[PipelineEvent]) -> impl Future<Output = BatchReport> + Send {
        publish_individually(self, events)
    }
}

impl<P: ChangePublisher> ChangePublisher for Arc<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn publish(&self, event: &PipelineEvent) -> impl Future<Output = Result<()>> + Send {
        (**self).publish(event)
    }

    fn publish_batch(&self, events: &[PipelineEvent]) -> impl Future<Output = BatchReport> + Send {
        (**self).publish_batch(events)
    }
}

/// Publish each event on its own, concurrently, and collect the outcomes.
pub async fn publish_individually<P>(publisher: &P, events: &[PipelineEvent]) -> BatchReport
where
    P: ChangePublisher + ?Sized,
{
    let results = join_all(events.iter().map(|event| publisher.publish(event))).await;

    let mut report = BatchReport::new(events.len());
    for (index, result) in results.into_iter().enumerate() {
        if let Err(error) = result {
            report.fail(index, events[index].offset(), error);
        }
    }
    report
}

/// A failed event within a batch.
#[derive(Debug)]
pub struct BatchFailure {
    /// Position of the event in the submitted batch.
    pub index: usize,
    pub offset: String,
    pub error: Error,
}

/// Per-event outcome of a batch publish.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub total: usize,
    pub failures: Vec<BatchFailure>,
}

impl BatchReport {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            failures: Vec::new(),
        }
    }

    /// Record a failure for the event at `index`. Repeated failures for one index keep the first.
    pub fn fail(&mut self, index: usize, offset: &str, error: Error) {
        if self.failures.iter().any(|f| f.index == index) {
            return;
        }
        self.failures.push(BatchFailure {
            index,
            offset: offset.to_string(),
            error,
        });
        self.failures.sort_by_key(|f| f.index);
    }

    pub fn delivered(&self) -> usize {
        self.total - self.failures.len()
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Index of the first failed event, if any.
    pub fn first_failure(&self) -> Option<usize> {
        self.failures.first().map(|f| f.index)
    }

    pub fn into_result(self) -> Result<()> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(Error::PartialBatch {
                failed: self.failures.len(),
                total: self.total,
            })
        }
    }
}

/// Publishes every event to each inner publisher, in order.
pub struct Fanout<P> {
    name: String,
    publishers: Vec<P>,
}

impl<P: ChangePublisher> Fanout<P> {
    pub fn new(name: impl Into<String>, publishers: Vec<P>) -> Self {
        Self {
            name: name.into(),
            publishers,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.publishers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.publishers.len()
    }

    pub fn publishers(&self) -> &[P] {
        &self.publishers
    }
}

impl<P: ChangePublisher> ChangePublisher for Fanout<P> {
    fn name(&self) -> &str {
        &self.name
    }

    /// Stops at the first sink that fails; the caller redelivers to all of them.
    fn publish(&self, event: &PipelineEvent) -> impl Future<Output = Result<()>> + Send {
        async move {
            for publisher in &self.publishers {
                if let Err(e) = publisher.publish(event).await {
                    warn!(
                        sink = publisher.name(),
                        source = event.source(),
                        table = event.table(),
                        offset = event.offset(),
                        error = %e,
                        "Sink rejected event"
                    );
                    return Err(e);
                }
            }
            Ok(())
        }
    }

    fn publish_batch(&self, events: &[PipelineEvent]) -> impl Future<Output = BatchReport> + Send {
        async move {
            let mut merged = BatchReport::new(events.len());
            for publisher in &self.publishers {
                let report = publisher.publish_batch(events).await;
                for failure in report.failures {
                    merged.fail(failure.index, &failure.offset, failure.error);
                }
            }
            merged
        }
    }
}
