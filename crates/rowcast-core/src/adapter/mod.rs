//! The database adapter contract.
//!
//! An adapter watches one source database and hands each captured change to an
//! [`EventHandler`] in capture order. Offsets only advance after the handler
//! succeeds, so a crash re-delivers at most the events whose hand-off was not
//! yet recorded.

mod memory;
mod polling;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::ChangeEvent;

pub use memory::{MemoryRecord, MemorySource};
pub use polling::PollingAdapter;

/// Lifecycle of an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Stopped,
    Starting,
    Running,
    /// Fetching and handing off a batch of records.
    Polling,
    /// Sleeping until the next poll.
    Waiting,
    Stopping,
}

impl AdapterState {
    /// Whether the capture loop is active (any state between start and stop).
    pub fn is_active(&self) -> bool {
        !matches!(self, AdapterState::Stopped)
    }
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AdapterState::Stopped => "stopped",
            AdapterState::Starting => "starting",
            AdapterState::Running => "running",
            AdapterState::Polling => "polling",
            AdapterState::Waiting => "waiting",
            AdapterState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Which row images an adapter keeps on the events it emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureOptions {
    pub include_before: bool,
    pub include_after: bool,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            include_before: true,
            include_after: true,
        }
    }
}

impl CaptureOptions {
    /// Strip the images this adapter is configured to omit.
    pub fn apply(&self, event: &mut ChangeEvent) {
        if !self.include_before {
            event.before = None;
        }
        if !self.include_after {
            event.after = None;
        }
    }
}

/// Per-adapter configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterConfig {
    /// Logical source identifier; also the offset store key.
    pub source_id: String,
    /// Wait between polls when the source has no backlog.
    pub poll_interval: Duration,
    /// Maximum records fetched per poll.
    pub max_batch_size: usize,
    pub capture: CaptureOptions,
    /// How long `stop` waits for the in-flight iteration to finish.
    pub stop_timeout: Duration,
}

impl AdapterConfig {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            poll_interval: Duration::from_secs(1),
            max_batch_size: 500,
            capture: CaptureOptions::default(),
            stop_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn with_capture(mut self, capture: CaptureOptions) -> Self {
        self.capture = capture;
        self
    }
}

/// Database-specific capture mechanics behind a [`PollingAdapter`].
pub trait ChangeSource: Send + Sync + 'static {
    /// A native change record, before conversion.
    type Record: Send;

    /// Acquire connections. Opening an open source is a no-op.
    fn open(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Fetch up to `limit` records strictly after `after` (from the beginning when `None`),
    /// in capture order.
    fn fetch_after(
        &mut self,
        after: Option<&str>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Self::Record>>> + Send;

    /// The offset token of a record. Must not fail, so malformed records can be skipped.
    fn record_offset(&self, record: &Self::Record) -> String;

    /// Convert a native record into a change event attributed to `source_id`.
    fn convert(&self, record: Self::Record, source_id: &str) -> Result<ChangeEvent>;

    /// Release connections.
    fn close(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// Receives events handed off by an adapter.
///
/// Returning an error tells the adapter not to advance its offset past the event.
pub trait EventHandler: Send + Sync {
    fn handle(
        &self,
        event: ChangeEvent,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<()>> + Send;
}

impl<H: EventHandler> EventHandler for Arc<H> {
    fn handle(
        &self,
        event: ChangeEvent,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<()>> + Send {
        (**self).handle(event, cancel)
    }
}

/// An event handler that wraps an async function.
pub struct FnHandler<F> {
    func: F,
}

impl<F> FnHandler<F> {
    pub fn new<Fut>(func: F) -> Self
    where
        F: Fn(ChangeEvent, CancellationToken) -> Fut + Send + Sync,
        Fut: Future<Output = Result<()>> + Send,
    {
        Self { func }
    }
}

impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(ChangeEvent, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    fn handle(
        &self,
        event: ChangeEvent,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<()>> + Send {
        (self.func)(event, cancel)
    }
}

/// The boundary an orchestrator drives, one instance per monitored source.
pub trait DatabaseAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    fn state(&self) -> AdapterState;

    /// Run the capture loop until `cancel` fires or [`DatabaseAdapter::stop`] is called.
    ///
    /// Fails immediately with [`crate::Error::AlreadyRunning`] if the adapter is not stopped,
    /// and with [`crate::Error::SourceUnavailable`] if the source cannot be opened.
    fn start<H: EventHandler>(
        &self,
        handler: H,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Signal the capture loop to stop and wait until it has. `cancel` abandons the wait.
    fn stop(&self, cancel: CancellationToken) -> impl Future<Output = Result<()>> + Send;

    /// The offset of the last handed-off event, as cached by the adapter.
    fn current_offset(&self) -> Option<String>;

    /// Reposition the adapter: persist `offset` and use it for the next fetch.
    /// Refused with [`Error::AlreadyRunning`] while the adapter is active, since
    /// the capture loop would overwrite it on its next commit.
    fn set_offset(&self, offset: &str) -> impl Future<Output = Result<()>> + Send;

    /// Hand off every event after `offset` without touching the live offset.
    /// Returns the number of events handed off.
    fn replay_from_offset<H: EventHandler>(
        &self,
        offset: &str,
        handler: H,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<u64>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Operation;
    use serde_json::json;

    #[test]
    fn test_capture_options_strip_images() {
        let mut event = ChangeEvent::new("db", "public", "t", Operation::Update, "1")
            .with_before(json!({"v": 1}))
            .with_after(json!({"v": 2}));

        CaptureOptions {
            include_before: false,
            include_after: true,
        }
        .apply(&mut event);

        assert!(event.before.is_none());
        assert_eq!(event.after, Some(json!({"v": 2})));
    }

    #[tokio::test]
    async fn test_fn_handler() {
        let handler = FnHandler::new(|event: ChangeEvent, _cancel| async move {
            if event.table == "bad" {
                Err(crate::Error::Handler("rejected".into()))
            } else {
                Ok(())
            }
        });

        let ok = ChangeEvent::new("db", "public", "good", Operation::Insert, "1");
        let bad = ChangeEvent::new("db", "public", "bad", Operation::Insert, "2");
        assert!(handler.handle(ok, CancellationToken::new()).await.is_ok());
        assert!(handler.handle(bad, CancellationToken::new()).await.is_err());
    }
}
