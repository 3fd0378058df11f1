mod error;
mod stdout;
mod webhook;

use std::future::Future;

use rowcast_core::{BatchReport, ChangePublisher, MockPublisher, PipelineEvent, Result};

pub use error::{SinkError, SinkResult};
pub use stdout::StdoutPublisher;
pub use webhook::{plan_chunks, BatchingConfig, WebhookConfig, WebhookPublisher};

/// Any configured sink.
pub enum Sink {
    Webhook(WebhookPublisher),
    Stdout(StdoutPublisher),
    Mock(MockPublisher),
}

impl ChangePublisher for Sink {
    fn name(&self) -> &str {
        match self {
            Sink::Webhook(s) => s.name(),
            Sink::Stdout(s) => s.name(),
            Sink::Mock(s) => s.name(),
        }
    }

    fn publish(&self, event: &PipelineEvent) -> impl Future<Output = Result<()>> + Send {
        async move {
            match self {
                Sink::Webhook(s) => s.publish(event).await,
                Sink::Stdout(s) => s.publish(event).await,
                Sink::Mock(s) => s.publish(event).await,
            }
        }
    }

    fn publish_batch(&self, events: &[PipelineEvent]) -> impl Future<Output = BatchReport> + Send {
        async move {
            match self {
                Sink::Webhook(s) => s.publish_batch(events).await,
                Sink::Stdout(s) => s.publish_batch(events).await,
                Sink::Mock(s) => s.publish_batch(events).await,
            }
        }
    }
}
