use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::time::Instant;

use crate::bulk::{BulkOperationEvent, PipelineEvent};
use crate::error::{Error, Result};
use crate::offset::{MemoryOffsetStore, OffsetStore};
use crate::publisher::ChangePublisher;
use crate::retry::{with_retry, RetryPolicy};
use crate::types::ChangeEvent;

/// A publisher for testing: records delivered events and fails on demand.
///
/// Sends go through the shared retry policy like a real sink, so scripted
/// failures exercise the same backoff path.
#[derive(Clone)]
pub struct MockPublisher {
    name: String,
    policy: RetryPolicy,
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    /// Events that were accepted, in delivery order.
    published: Vec<PipelineEvent>,
    /// Time of every send attempt.
    attempts: Vec<Instant>,
    /// Number of upcoming attempts that will fail.
    fail_remaining: u32,
    always_fail: bool,
    /// Offsets that are always rejected.
    fail_offsets: HashSet<String>,
}

impl MockPublisher {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            policy: RetryPolicy::no_retry(),
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Fail the next `attempts` send attempts, then succeed.
    pub fn fail_first(self, attempts: u32) -> Self {
        self.state().fail_remaining = attempts;
        self
    }

    /// Fail every send attempt.
    pub fn always_failing(self) -> Self {
        self.state().always_fail = true;
        self
    }

    /// Reject events with these offsets on every attempt.
    pub fn fail_offsets<I, S>(self, offsets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state()
            .fail_offsets
            .extend(offsets.into_iter().map(Into::into));
        self
    }

    /// Stop failing from now on.
    pub fn recover(&self) {
        let mut state = self.state();
        state.fail_remaining = 0;
        state.always_fail = false;
        state.fail_offsets.clear();
    }

    /// All delivered events.
    pub fn published(&self) -> Vec<PipelineEvent> {
        self.state().published.clone()
    }

    /// Delivered raw change events.
    pub fn changes(&self) -> Vec<ChangeEvent> {
        self.state()
            .published
            .iter()
            .filter_map(|e| e.as_change().cloned())
            .collect()
    }

    /// Delivered bulk summaries.
    pub fn bulk_events(&self) -> Vec<BulkOperationEvent> {
        self.state()
            .published
            .iter()
            .filter_map(|e| e.as_bulk().cloned())
            .collect()
    }

    /// Total send attempts, including failed ones.
    pub fn attempt_count(&self) -> usize {
        self.state().attempts.len()
    }

    /// Times at which each send attempt was made.
    pub fn attempt_times(&self) -> Vec<Instant> {
        self.state().attempts.clone()
    }

    pub fn clear(&self) {
        let mut state = self.state();
        state.published.clear();
        state.attempts.clear();
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn try_send(&self, event: &PipelineEvent) -> Result<()> {
        let mut state = self.state();
        state.attempts.push(Instant::now());

        let rejected = if state.always_fail || state.fail_offsets.contains(event.offset()) {
            true
        } else if state.fail_remaining > 0 {
            state.fail_remaining -= 1;
            true
        } else {
            false
        };

        if rejected {
            return Err(Error::publish(&self.name, "simulated failure"));
        }

        state.published.push(event.clone());
        Ok(())
    }
}

impl ChangePublisher for MockPublisher {
    fn name(&self) -> &str {
        &self.name
    }

    fn publish(&self, event: &PipelineEvent) -> impl Future<Output = Result<()>> + Send {
        async move {
            with_retry(&self.policy, &self.name, |_| {
                let result = self.try_send(event);
                async move { result }
            })
            .await
        }
    }
}

/// An in-memory offset store that also records every write, in order.
#[derive(Clone, Default)]
pub struct RecordingOffsetStore {
    inner: MemoryOffsetStore,
    writes: Arc<Mutex<Vec<(String, String)>>>,
}

impl RecordingOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every successful `set_offset` call as `(source, offset)`.
    pub fn history(&self) -> Vec<(String, String)> {
        self.writes
            .lock()
            .map(|writes| writes.clone())
            .unwrap_or_default()
    }

    pub fn snapshot(&self, source: &str) -> Option<String> {
        self.inner.snapshot(source)
    }
}

impl OffsetStore for RecordingOffsetStore {
    fn get_offset(&self, source: &str) -> impl Future<Output = Result<Option<String>>> + Send {
        self.inner.get_offset(source)
    }

    fn set_offset(&self, source: &str, offset: &str) -> impl Future<Output = Result<()>> + Send {
        let write = self.inner.set_offset(source, offset);
        let entry = (source.to_string(), offset.to_string());
        let writes = self.writes.clone();
        async move {
            write.await?;
            if let Ok(mut writes) = writes.lock() {
                writes.push(entry);
            }
            Ok(())
        }
    }
}
