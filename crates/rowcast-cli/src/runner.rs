use std::fs;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use rowcast_config::{
    adapter_config, detector_config, retry_policy, sink_format, sinks_for_source, OffsetBackend,
    OffsetsSection, RowcastConfig, SinkKind, SinkMode, SinkSection, SourceSection,
};
use rowcast_core::{
    BulkDetectorConfig, DatabaseAdapter, Dispatcher, MemoryOffsetStore, OffsetRecord, OffsetStore,
    PollingAdapter,
};
use rowcast_pg::{PgChangeSource, PostgresOffsetStore};
use rowcast_sink::{BatchingConfig, Sink, StdoutPublisher, WebhookConfig, WebhookPublisher};
use rowcast_state::SqliteOffsetStore;

/// The offset store selected by `[offsets]`, shared by every adapter.
pub enum Offsets {
    Sqlite(SqliteOffsetStore),
    Postgres(PostgresOffsetStore),
    Memory(MemoryOffsetStore),
}

impl Offsets {
    pub async fn open(section: &OffsetsSection) -> Result<Self> {
        match section.backend {
            OffsetBackend::Sqlite => {
                let path = Path::new(&section.path);
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent).with_context(|| {
                        format!("Failed to create offset directory: {}", parent.display())
                    })?;
                }
                let store = SqliteOffsetStore::open(path)
                    .with_context(|| format!("Failed to open offset database: {}", path.display()))?;
                Ok(Offsets::Sqlite(store))
            }
            OffsetBackend::Postgres => {
                let conn = section
                    .connection_string
                    .as_deref()
                    .context("offsets.connection_string is required for the postgres backend")?;
                let store = PostgresOffsetStore::connect(conn)
                    .await
                    .context("Failed to connect to Postgres offset store")?;
                Ok(Offsets::Postgres(store))
            }
            OffsetBackend::Memory => {
                warn!("Using in-memory offsets; progress is lost on exit");
                Ok(Offsets::Memory(MemoryOffsetStore::new()))
            }
        }
    }

    /// Every stored offset. The memory backend has nothing durable to list.
    pub async fn list(&self) -> Result<Vec<OffsetRecord>> {
        match self {
            Offsets::Sqlite(store) => Ok(store.list_offsets()?),
            Offsets::Postgres(store) => Ok(store.list_offsets().await?),
            Offsets::Memory(_) => Ok(Vec::new()),
        }
    }
}

impl OffsetStore for Offsets {
    fn get_offset(
        &self,
        source: &str,
    ) -> impl Future<Output = rowcast_core::Result<Option<String>>> + Send {
        async move {
            match self {
                Offsets::Sqlite(store) => store.get_offset(source).await,
                Offsets::Postgres(store) => store.get_offset(source).await,
                Offsets::Memory(store) => store.get_offset(source).await,
            }
        }
    }

    fn set_offset(
        &self,
        source: &str,
        offset: &str,
    ) -> impl Future<Output = rowcast_core::Result<()>> + Send {
        async move {
            match self {
                Offsets::Sqlite(store) => store.set_offset(source, offset).await,
                Offsets::Postgres(store) => store.set_offset(source, offset).await,
                Offsets::Memory(store) => store.set_offset(source, offset).await,
            }
        }
    }
}

pub type SourceAdapter = PollingAdapter<PgChangeSource, Arc<Offsets>>;

/// Build a sink from its config section.
pub fn build_sink(section: &SinkSection) -> Result<Sink> {
    let format = sink_format(section)?;
    match section.kind {
        SinkKind::Stdout => Ok(Sink::Stdout(
            StdoutPublisher::new(&section.name)
                .with_format(format)
                .with_retry_policy(retry_policy(&section.retry)),
        )),
        SinkKind::Webhook => {
            let url = section
                .url
                .clone()
                .with_context(|| format!("sink '{}' has no url", section.name))?;
            let mut config = WebhookConfig::new(&section.name, url);
            config.headers = section
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            config.timeout = std::time::Duration::from_secs(section.timeout_secs);
            config.retry = retry_policy(&section.retry);
            config.batching = BatchingConfig {
                enabled: section.batching.enabled,
                max_payload_bytes: section.batching.max_payload_bytes,
            };
            config.format = format;

            let publisher = WebhookPublisher::new(config)
                .with_context(|| format!("Invalid webhook sink '{}'", section.name))?;
            Ok(Sink::Webhook(publisher))
        }
    }
}

/// Sinks for one source, split into raw and bulk-aware.
pub fn build_sinks(config: &RowcastConfig, source: &str) -> Result<(Vec<Sink>, Vec<Sink>)> {
    let mut raw = Vec::new();
    let mut bulk_aware = Vec::new();
    for section in sinks_for_source(config, source) {
        let sink = build_sink(section)?;
        match section.mode {
            SinkMode::Raw => raw.push(sink),
            SinkMode::BulkAware => bulk_aware.push(sink),
        }
    }
    Ok((raw, bulk_aware))
}

/// Build the adapter for one source. Does not connect.
pub fn build_adapter(source: &SourceSection, offsets: Arc<Offsets>) -> Result<SourceAdapter> {
    let change_source = PgChangeSource::new(&source.connection_string, &source.change_table)
        .with_context(|| format!("Invalid change_table for source '{}'", source.name))?;
    Ok(PollingAdapter::new(
        adapter_config(source),
        change_source,
        offsets,
    ))
}

/// One source's adapter and the dispatcher it hands events to.
pub struct SourcePipeline {
    pub adapter: SourceAdapter,
    pub dispatcher: Arc<Dispatcher<Sink>>,
}

impl SourcePipeline {
    /// Must be called inside a tokio runtime (the detector spawns its sweep).
    pub fn build(
        config: &RowcastConfig,
        source: &SourceSection,
        offsets: Arc<Offsets>,
        detector: Option<BulkDetectorConfig>,
    ) -> Result<Self> {
        let adapter = build_adapter(source, offsets)?;
        let (raw, bulk_aware) = build_sinks(config, &source.name)?;
        if raw.is_empty() && bulk_aware.is_empty() {
            warn!(source = %source.name, "No sinks configured; changes will only advance the offset");
        }
        let dispatcher = Dispatcher::new(&source.name, raw, bulk_aware, detector);
        Ok(Self {
            adapter,
            dispatcher: Arc::new(dispatcher),
        })
    }

    pub fn source_id(&self) -> &str {
        self.adapter.source_id()
    }
}

/// Run every configured source until Ctrl-C.
///
/// A source that fails is reported and the rest keep running; the run fails
/// only when every source has failed.
pub async fn run_pipeline(config: &RowcastConfig) -> Result<()> {
    let offsets = Arc::new(Offsets::open(&config.offsets).await?);
    let detector = detector_config(&config.detector)?;

    let mut pipelines = Vec::with_capacity(config.sources.len());
    for source in &config.sources {
        let pipeline = SourcePipeline::build(config, source, offsets.clone(), detector.clone())?;
        pipelines.push(Arc::new(pipeline));
    }

    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();
    for pipeline in &pipelines {
        let pipeline = pipeline.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let result = pipeline
                .adapter
                .start(pipeline.dispatcher.clone(), cancel)
                .await;
            (pipeline.source_id().to_string(), result)
        });
    }
    info!(sources = pipelines.len(), "rowcast running; press Ctrl-C to stop");

    let total = pipelines.len();
    let mut failed = 0usize;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Received Ctrl-C, shutting down");
                break;
            }
            joined = tasks.join_next() => match joined {
                None => break,
                Some(Ok((source, Ok(())))) => info!(source = %source, "Adapter exited"),
                Some(Ok((source, Err(e)))) => {
                    error!(source = %source, error = %e, "Source failed");
                    failed += 1;
                }
                Some(Err(e)) => {
                    error!(error = %e, "Adapter task panicked");
                    failed += 1;
                }
            },
        }
    }

    cancel.cancel();
    for pipeline in &pipelines {
        if let Err(e) = pipeline.adapter.stop(CancellationToken::new()).await {
            warn!(source = %pipeline.source_id(), error = %e, "Adapter did not stop cleanly");
        }
    }
    while let Some(joined) = tasks.join_next().await {
        if let Ok((source, Err(e))) = joined {
            warn!(source = %source, error = %e, "Adapter ended with error");
        }
    }
    for pipeline in &pipelines {
        pipeline.dispatcher.shutdown().await;
        if let Some(offset) = pipeline.adapter.current_offset() {
            info!(source = %pipeline.source_id(), offset = %offset, "Final offset");
        }
    }

    if total > 0 && failed == total {
        anyhow::bail!("every source failed; see the log above");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(extra: &str) -> RowcastConfig {
        RowcastConfig::parse(&format!(
            r#"
[offsets]
backend = "memory"

[[sources]]
name = "orders_db"
connection_string = "postgres://localhost/orders"
change_table = "audit.changes"

[[sources]]
name = "billing_db"
connection_string = "postgres://localhost/billing"
{extra}
"#
        ))
        .unwrap()
    }

    #[test]
    fn test_sinks_split_by_mode_and_source() {
        let config = config(
            r#"
[[sinks]]
name = "console"
kind = "stdout"

[[sinks]]
name = "summaries"
kind = "webhook"
mode = "bulk_aware"
url = "http://localhost:9/hook"
sources = ["billing_db"]
"#,
        );

        let (raw, aware) = build_sinks(&config, "orders_db").unwrap();
        assert_eq!(raw.len(), 1);
        assert!(aware.is_empty());

        let (raw, aware) = build_sinks(&config, "billing_db").unwrap();
        assert_eq!(raw.len(), 1);
        assert_eq!(aware.len(), 1);
    }

    #[test]
    fn test_stdout_sink_uses_retry_section() {
        let config = config(
            r#"
[[sinks]]
name = "console"
kind = "stdout"

[sinks.retry]
max_attempts = 7
"#,
        );

        match build_sink(&config.sinks[0]).unwrap() {
            Sink::Stdout(publisher) => assert_eq!(publisher.retry().max_attempts, 7),
            _ => panic!("expected stdout sink"),
        }
    }

    #[test]
    fn test_build_adapter_validates_table() {
        let mut config = config("");
        let offsets = Arc::new(Offsets::Memory(MemoryOffsetStore::new()));
        assert!(build_adapter(&config.sources[0], offsets.clone()).is_ok());

        config.sources[0].change_table = "bad table".to_string();
        assert!(build_adapter(&config.sources[0], offsets).is_err());
    }

    #[tokio::test]
    async fn test_sqlite_offsets_create_parent_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let section = OffsetsSection {
            backend: OffsetBackend::Sqlite,
            path: dir
                .path()
                .join("state/offsets.db")
                .to_string_lossy()
                .into_owned(),
            connection_string: None,
        };

        let offsets = Offsets::open(&section).await.unwrap();
        offsets.set_offset("orders_db", "17").await.unwrap();

        let listed = offsets.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].offset, "17");
    }
}
