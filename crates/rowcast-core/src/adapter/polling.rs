use std::future::Future;
use std::sync::{Mutex as StdMutex, MutexGuard, RwLock};

use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{AdapterConfig, AdapterState, ChangeSource, DatabaseAdapter, EventHandler};
use crate::error::{Error, Result};
use crate::offset::OffsetStore;
use crate::types::ChangeEvent;

/// A fetched record after conversion. Malformed records keep their offset so
/// the adapter can step past them.
enum Converted {
    Event(ChangeEvent),
    Malformed { offset: String, error: Error },
}

/// How one poll iteration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Iteration {
    /// Every fetched record was handed off (or skipped).
    Completed,
    /// Stopped early without advancing past a record; back off before retrying.
    Failed,
    /// Cancellation was observed between events.
    Cancelled,
}

/// An adapter that polls a [`ChangeSource`] for records after its last offset.
///
/// Each iteration fetches up to `max_batch_size` records, hands them to the
/// handler one at a time, and persists the offset after every successful hand-off.
/// A full fetch is followed by an immediate re-poll; anything less waits
/// `poll_interval`.
pub struct PollingAdapter<S: ChangeSource, O: OffsetStore> {
    config: AdapterConfig,
    source: Mutex<S>,
    store: O,
    offset: RwLock<Option<String>>,
    state: watch::Sender<AdapterState>,
    run_token: StdMutex<Option<CancellationToken>>,
}

impl<S: ChangeSource, O: OffsetStore> PollingAdapter<S, O> {
    pub fn new(config: AdapterConfig, source: S, store: O) -> Self {
        let (state, _) = watch::channel(AdapterState::Stopped);
        Self {
            config,
            source: Mutex::new(source),
            store,
            offset: RwLock::new(None),
            state,
            run_token: StdMutex::new(None),
        }
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn offset_store(&self) -> &O {
        &self.store
    }

    /// Watch lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<AdapterState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: AdapterState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(source = %self.config.source_id, from = %previous, to = %next, "Adapter state changed");
        }
    }

    fn run_token(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.run_token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cache_offset(&self, offset: Option<String>) {
        let mut cached = self
            .offset
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *cached = offset;
    }

    /// Persist an offset, then adopt it as the fetch position.
    async fn commit(&self, offset: &str) -> Result<()> {
        self.store.set_offset(&self.config.source_id, offset).await?;
        self.cache_offset(Some(offset.to_string()));
        Ok(())
    }

    /// Fetch and convert one batch. The source lock is released before hand-off.
    async fn fetch(&self, after: Option<&str>) -> Result<Vec<Converted>> {
        let mut source = self.source.lock().await;
        let records = source
            .fetch_after(after, self.config.max_batch_size.max(1))
            .await?;

        let converted = records
            .into_iter()
            .map(|record| {
                let offset = source.record_offset(&record);
                match source.convert(record, &self.config.source_id) {
                    Ok(mut event) => {
                        self.config.capture.apply(&mut event);
                        Converted::Event(event)
                    }
                    Err(error) => Converted::Malformed { offset, error },
                }
            })
            .collect();
        Ok(converted)
    }

    async fn open_source(&self) -> Result<()> {
        let mut source = self.source.lock().await;
        source.open().await.map_err(|e| match e {
            Error::SourceUnavailable { .. } => e,
            other => Error::SourceUnavailable {
                source_id: self.config.source_id.clone(),
                message: other.to_string(),
            },
        })
    }

    async fn close_source(&self) {
        let mut source = self.source.lock().await;
        if let Err(e) = source.close().await {
            warn!(source = %self.config.source_id, error = %e, "Failed to close source cleanly");
        }
    }

    /// Sleep for the poll interval, waking early on cancellation.
    async fn wait(&self, token: &CancellationToken) {
        self.set_state(AdapterState::Waiting);
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(self.config.poll_interval) => {}
        }
    }

    async fn run<H: EventHandler>(&self, handler: &H, token: &CancellationToken) -> Result<()> {
        self.open_source().await?;

        let stored = self.store.get_offset(&self.config.source_id).await?;
        info!(
            source = %self.config.source_id,
            offset = stored.as_deref().unwrap_or("<beginning>"),
            "Adapter running"
        );
        self.cache_offset(stored);
        self.set_state(AdapterState::Running);

        while !token.is_cancelled() {
            self.set_state(AdapterState::Polling);

            let after = self.current_offset();
            let records = match self.fetch(after.as_deref()).await {
                Ok(records) => records,
                Err(e) => {
                    warn!(source = %self.config.source_id, error = %e, "Fetch failed; retrying after poll interval");
                    self.wait(token).await;
                    continue;
                }
            };

            let fetched = records.len();
            if fetched > 0 {
                debug!(source = %self.config.source_id, fetched, "Fetched change records");
            }

            match self.deliver(records, handler, token).await {
                Iteration::Cancelled => break,
                Iteration::Failed => self.wait(token).await,
                Iteration::Completed if fetched < self.config.max_batch_size.max(1) => {
                    self.wait(token).await
                }
                // A full batch means there is likely a backlog; poll again right away.
                Iteration::Completed => {}
            }
        }

        Ok(())
    }

    /// Hand off converted records in order, advancing the offset after each.
    async fn deliver<H: EventHandler>(
        &self,
        records: Vec<Converted>,
        handler: &H,
        token: &CancellationToken,
    ) -> Iteration {
        for record in records {
            if token.is_cancelled() {
                return Iteration::Cancelled;
            }

            let offset = match record {
                Converted::Malformed { offset, error } => {
                    warn!(
                        source = %self.config.source_id,
                        offset = %offset,
                        error = %error,
                        "Skipping malformed change record"
                    );
                    offset
                }
                Converted::Event(event) => {
                    let offset = event.offset.clone();
                    let schema = event.schema.clone();
                    let table = event.table.clone();
                    if let Err(e) = handler.handle(event, token.clone()).await {
                        error!(
                            source = %self.config.source_id,
                            schema = %schema,
                            table = %table,
                            offset = %offset,
                            error = %e,
                            "Event hand-off failed; will retry from last offset"
                        );
                        return Iteration::Failed;
                    }
                    offset
                }
            };

            if let Err(e) = self.commit(&offset).await {
                error!(
                    source = %self.config.source_id,
                    offset = %offset,
                    error = %e,
                    "Failed to persist offset; will retry from last persisted offset"
                );
                return Iteration::Failed;
            }
        }

        Iteration::Completed
    }
}

impl<S: ChangeSource, O: OffsetStore> DatabaseAdapter for PollingAdapter<S, O> {
    fn source_id(&self) -> &str {
        &self.config.source_id
    }

    fn state(&self) -> AdapterState {
        *self.state.borrow()
    }

    fn start<H: EventHandler>(
        &self,
        handler: H,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<()>> + Send {
        async move {
            let token = cancel.child_token();
            {
                // Claim and publish the token together so `stop` never sees
                // an active adapter without one.
                let mut run_token = self.run_token();
                let claimed = self.state.send_if_modified(|state| {
                    if *state == AdapterState::Stopped {
                        *state = AdapterState::Starting;
                        true
                    } else {
                        false
                    }
                });
                if !claimed {
                    return Err(Error::AlreadyRunning(self.config.source_id.clone()));
                }
                *run_token = Some(token.clone());
            }
            info!(source = %self.config.source_id, "Starting adapter");

            let result = self.run(&handler, &token).await;

            self.set_state(AdapterState::Stopping);
            self.close_source().await;
            *self.run_token() = None;
            self.set_state(AdapterState::Stopped);

            match &result {
                Ok(()) => info!(source = %self.config.source_id, "Adapter stopped"),
                Err(e) => error!(source = %self.config.source_id, error = %e, "Adapter failed"),
            }
            result
        }
    }

    fn stop(&self, cancel: CancellationToken) -> impl Future<Output = Result<()>> + Send {
        async move {
            let token = self.run_token().clone();
            let Some(token) = token else {
                return Ok(());
            };
            token.cancel();

            let mut rx = self.state.subscribe();
            let stopped = async move {
                loop {
                    let state = *rx.borrow_and_update();
                    if state == AdapterState::Stopped || rx.changed().await.is_err() {
                        return;
                    }
                }
            };

            tokio::select! {
                waited = tokio::time::timeout(self.config.stop_timeout, stopped) => {
                    waited.map_err(|_| Error::StopTimeout(self.config.source_id.clone()))
                }
                _ = cancel.cancelled() => Err(Error::StopTimeout(self.config.source_id.clone())),
            }
        }
    }

    fn current_offset(&self) -> Option<String> {
        self.offset
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_offset(&self, offset: &str) -> impl Future<Output = Result<()>> + Send {
        async move {
            if offset.trim().is_empty() {
                return Err(Error::InvalidOffset(offset.to_string()));
            }
            if self.state().is_active() {
                return Err(Error::AlreadyRunning(self.config.source_id.clone()));
            }
            self.commit(offset).await?;
            info!(source = %self.config.source_id, offset, "Offset repositioned");
            Ok(())
        }
    }

    fn replay_from_offset<H: EventHandler>(
        &self,
        offset: &str,
        handler: H,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<u64>> + Send {
        async move {
            let live = self.state().is_active();
            if !live {
                self.open_source().await?;
            }

            info!(source = %self.config.source_id, from = offset, "Replaying changes");
            let result = self.replay(offset, &handler, &cancel).await;

            if !live {
                self.close_source().await;
            }

            if let Ok(count) = &result {
                info!(source = %self.config.source_id, from = offset, count, "Replay finished");
            }
            result
        }
    }
}

impl<S: ChangeSource, O: OffsetStore> PollingAdapter<S, O> {
    async fn replay<H: EventHandler>(
        &self,
        from: &str,
        handler: &H,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let limit = self.config.max_batch_size.max(1);
        let mut cursor = from.to_string();
        let mut count = 0u64;

        loop {
            let records = self.fetch(Some(&cursor)).await?;
            let fetched = records.len();

            for record in records {
                if cancel.is_cancelled() {
                    return Ok(count);
                }
                match record {
                    Converted::Malformed { offset, error } => {
                        warn!(source = %self.config.source_id, offset = %offset, error = %error, "Skipping malformed change record");
                        cursor = offset;
                    }
                    Converted::Event(event) => {
                        let offset = event.offset.clone();
                        handler.handle(event, cancel.clone()).await?;
                        count += 1;
                        cursor = offset;
                    }
                }
            }

            if fetched < limit || cancel.is_cancelled() {
                return Ok(count);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{CaptureOptions, FnHandler, MemoryRecord, MemorySource};
    use crate::mock::RecordingOffsetStore;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex as AsyncMutex;

    type Seen = Arc<AsyncMutex<Vec<ChangeEvent>>>;

    fn recorder(seen: Seen) -> impl EventHandler {
        FnHandler::new(move |event: ChangeEvent, _cancel| {
            let seen = seen.clone();
            async move {
                seen.lock().await.push(event);
                Ok(())
            }
        })
    }

    fn adapter(
        source: MemorySource,
        store: RecordingOffsetStore,
        batch: usize,
    ) -> Arc<PollingAdapter<MemorySource, RecordingOffsetStore>> {
        let config = AdapterConfig::new("orders_db")
            .with_poll_interval(Duration::from_millis(100))
            .with_max_batch_size(batch);
        Arc::new(PollingAdapter::new(config, source, store))
    }

    async fn wait_until<F: Fn() -> bool>(check: F) {
        for _ in 0..1000 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivers_in_order_and_persists_offsets() {
        let source = MemorySource::new();
        for _ in 0..5 {
            source.append("public", "orders", "INSERT");
        }
        let store = RecordingOffsetStore::new();
        let adapter = adapter(source.clone(), store.clone(), 2);
        let seen: Seen = Arc::default();

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let adapter = adapter.clone();
            let handler = recorder(seen.clone());
            let cancel = cancel.clone();
            async move { adapter.start(handler, cancel).await }
        });

        wait_until(|| store.snapshot("orders_db").as_deref() == Some("5")).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        let offsets: Vec<String> = seen.lock().await.iter().map(|e| e.offset.clone()).collect();
        assert_eq!(offsets, ["1", "2", "3", "4", "5"]);
        assert_eq!(
            store.history().iter().map(|(_, o)| o.as_str()).collect::<Vec<_>>(),
            ["1", "2", "3", "4", "5"]
        );
        assert_eq!(adapter.state(), AdapterState::Stopped);
        assert!(!source.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumes_from_stored_offset() {
        let source = MemorySource::new();
        for _ in 0..4 {
            source.append("public", "orders", "UPDATE");
        }
        let store = RecordingOffsetStore::new();
        store.set_offset("orders_db", "2").await.unwrap();

        let adapter = adapter(source, store.clone(), 10);
        let seen: Seen = Arc::default();
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let adapter = adapter.clone();
            let handler = recorder(seen.clone());
            let cancel = cancel.clone();
            async move { adapter.start(handler, cancel).await }
        });

        wait_until(|| store.snapshot("orders_db").as_deref() == Some("4")).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        let offsets: Vec<String> = seen.lock().await.iter().map(|e| e.offset.clone()).collect();
        assert_eq!(offsets, ["3", "4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_failure_does_not_advance() {
        let source = MemorySource::new();
        for _ in 0..3 {
            source.append("public", "orders", "INSERT");
        }
        let store = RecordingOffsetStore::new();
        let adapter = adapter(source, store.clone(), 10);

        // Reject offset 2 on the first attempt only.
        let attempts = Arc::new(AsyncMutex::new(Vec::<String>::new()));
        let handler = FnHandler::new({
            let attempts = attempts.clone();
            move |event: ChangeEvent, _cancel| {
                let attempts = attempts.clone();
                async move {
                    let mut attempts = attempts.lock().await;
                    let first_try = !attempts.contains(&event.offset);
                    attempts.push(event.offset.clone());
                    if event.offset == "2" && first_try {
                        return Err(Error::Handler("downstream unavailable".into()));
                    }
                    Ok(())
                }
            }
        });

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let adapter = adapter.clone();
            let cancel = cancel.clone();
            async move { adapter.start(handler, cancel).await }
        });

        wait_until(|| store.snapshot("orders_db").as_deref() == Some("3")).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(*attempts.lock().await, ["1", "2", "2", "3"]);
        assert_eq!(
            store.history().iter().map(|(_, o)| o.as_str()).collect::<Vec<_>>(),
            ["1", "2", "3"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_record_is_skipped() {
        let source = MemorySource::new();
        source.append("public", "orders", "INSERT");
        source.append("public", "orders", "TRUNCATE");
        source.append("public", "orders", "DELETE");
        let store = RecordingOffsetStore::new();
        let adapter = adapter(source, store.clone(), 10);
        let seen: Seen = Arc::default();

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let adapter = adapter.clone();
            let handler = recorder(seen.clone());
            let cancel = cancel.clone();
            async move { adapter.start(handler, cancel).await }
        });

        wait_until(|| store.snapshot("orders_db").as_deref() == Some("3")).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        let offsets: Vec<String> = seen.lock().await.iter().map(|e| e.offset.clone()).collect();
        assert_eq!(offsets, ["1", "3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_is_retried() {
        let source = MemorySource::new();
        source.append("public", "orders", "INSERT");
        source.fail_next_fetches(2);
        let store = RecordingOffsetStore::new();
        let adapter = adapter(source.clone(), store.clone(), 10);
        let seen: Seen = Arc::default();

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let adapter = adapter.clone();
            let handler = recorder(seen.clone());
            let cancel = cancel.clone();
            async move { adapter.start(handler, cancel).await }
        });

        wait_until(|| store.snapshot("orders_db").as_deref() == Some("1")).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        assert!(source.fetch_count() >= 3);
        assert_eq!(seen.lock().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure_is_fatal() {
        let source = MemorySource::new();
        source.fail_open();
        let adapter = adapter(source, RecordingOffsetStore::new(), 10);
        let seen: Seen = Arc::default();

        let result = adapter
            .start(recorder(seen), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::SourceUnavailable { .. })));
        assert_eq!(adapter.state(), AdapterState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_is_rejected_and_stop_waits() {
        let source = MemorySource::new();
        let adapter = adapter(source, RecordingOffsetStore::new(), 10);
        let seen: Seen = Arc::default();

        let task = tokio::spawn({
            let adapter = adapter.clone();
            let handler = recorder(seen.clone());
            async move { adapter.start(handler, CancellationToken::new()).await }
        });
        wait_until(|| adapter.state() == AdapterState::Waiting).await;

        let second = adapter
            .start(recorder(seen), CancellationToken::new())
            .await;
        assert!(matches!(second, Err(Error::AlreadyRunning(_))));

        adapter.stop(CancellationToken::new()).await.unwrap();
        assert_eq!(adapter.state(), AdapterState::Stopped);
        task.await.unwrap().unwrap();

        // Stopping a stopped adapter is a no-op.
        adapter.stop(CancellationToken::new()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_does_not_touch_live_offset() {
        let source = MemorySource::new();
        for _ in 0..6 {
            source.append("public", "orders", "INSERT");
        }
        let store = RecordingOffsetStore::new();
        store.set_offset("orders_db", "6").await.unwrap();
        let adapter = adapter(source.clone(), store.clone(), 2);
        let seen: Seen = Arc::default();

        let count = adapter
            .replay_from_offset("3", recorder(seen.clone()), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(count, 3);
        let offsets: Vec<String> = seen.lock().await.iter().map(|e| e.offset.clone()).collect();
        assert_eq!(offsets, ["4", "5", "6"]);
        assert_eq!(store.snapshot("orders_db").as_deref(), Some("6"));
        assert_eq!(store.history().len(), 1);
        assert!(!source.is_open());
    }

    #[tokio::test]
    async fn test_set_offset_persists_and_caches() {
        let store = RecordingOffsetStore::new();
        let adapter = adapter(MemorySource::new(), store.clone(), 10);

        adapter.set_offset("42").await.unwrap();
        assert_eq!(adapter.current_offset().as_deref(), Some("42"));
        assert_eq!(store.snapshot("orders_db").as_deref(), Some("42"));

        assert!(matches!(
            adapter.set_offset(" ").await,
            Err(Error::InvalidOffset(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_options_are_applied() {
        let source = MemorySource::new();
        source.push(
            MemoryRecord::new(1, "public", "orders", "UPDATE")
                .with_before(serde_json::json!({"status": "new"}))
                .with_after(serde_json::json!({"status": "paid"})),
        );
        let store = RecordingOffsetStore::new();
        let config = AdapterConfig::new("orders_db").with_capture(CaptureOptions {
            include_before: false,
            include_after: true,
        });
        let adapter = Arc::new(PollingAdapter::new(config, source, store.clone()));
        let seen: Seen = Arc::default();

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let adapter = adapter.clone();
            let handler = recorder(seen.clone());
            let cancel = cancel.clone();
            async move { adapter.start(handler, cancel).await }
        });
        wait_until(|| store.snapshot("orders_db").is_some()).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        let seen = seen.lock().await;
        assert!(seen[0].before.is_none());
        assert_eq!(seen[0].after, Some(serde_json::json!({"status": "paid"})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_offset_is_refused_while_running() {
        let store = RecordingOffsetStore::new();
        let adapter = adapter(MemorySource::new(), store.clone(), 10);
        let seen: Seen = Arc::default();

        let task = tokio::spawn({
            let adapter = adapter.clone();
            let handler = recorder(seen);
            async move { adapter.start(handler, CancellationToken::new()).await }
        });
        wait_until(|| adapter.state() == AdapterState::Waiting).await;

        assert!(matches!(
            adapter.set_offset("42").await,
            Err(Error::AlreadyRunning(_))
        ));
        assert!(store.snapshot("orders_db").is_none());

        adapter.stop(CancellationToken::new()).await.unwrap();
        task.await.unwrap().unwrap();
        adapter.set_offset("42").await.unwrap();
        assert_eq!(store.snapshot("orders_db").as_deref(), Some("42"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_right_after_start_always_stops() {
        for _ in 0..50 {
            let adapter = adapter(MemorySource::new(), RecordingOffsetStore::new(), 10);
            let seen: Seen = Arc::default();

            let task = tokio::spawn({
                let adapter = adapter.clone();
                let handler = recorder(seen);
                async move { adapter.start(handler, CancellationToken::new()).await }
            });
            while adapter.state() == AdapterState::Stopped {
                tokio::task::yield_now().await;
            }

            adapter.stop(CancellationToken::new()).await.unwrap();
            let joined = tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .expect("adapter kept running after stop");
            joined.unwrap().unwrap();
            assert_eq!(adapter.state(), AdapterState::Stopped);
        }
    }
}
