use std::sync::Arc;

use anyhow::{Context, Result};
use colored::Colorize;
use rowcast_config::{detector_config, RowcastConfig};
use rowcast_core::{BatchForwarder, DatabaseAdapter, Fanout};
use rowcast_sink::Sink;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::runner::{build_adapter, build_sinks, Offsets, SourcePipeline};

/// Re-deliver every change after `from`. The stored offset is not touched.
///
/// By default events take the normal route (raw sinks, then bulk detection).
/// With `batch_size`, every sink for the source receives the raw events through
/// `publish_batch` instead.
pub async fn cmd_replay(
    config: RowcastConfig,
    source: &str,
    from: &str,
    batch_size: Option<usize>,
) -> Result<()> {
    let section = config
        .source(source)
        .with_context(|| format!("Source '{source}' not found in config"))?;
    let offsets = Arc::new(Offsets::open(&config.offsets).await?);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl-C, stopping replay");
                cancel.cancel();
            }
        }
    });

    let count = match batch_size {
        Some(size) => {
            let adapter = build_adapter(section, offsets)?;
            let (raw, bulk_aware) = build_sinks(&config, source)?;
            let sinks: Vec<Sink> = raw.into_iter().chain(bulk_aware).collect();
            if sinks.is_empty() {
                anyhow::bail!("Source '{source}' has no sinks to replay to");
            }

            let forwarder = Arc::new(BatchForwarder::new(
                Fanout::new(format!("{source}/replay"), sinks),
                size,
            ));
            let count = adapter
                .replay_from_offset(from, forwarder.clone(), cancel)
                .await
                .with_context(|| format!("Replay of '{source}' failed"))?;
            forwarder
                .flush()
                .await
                .with_context(|| format!("Replay of '{source}' failed on the final batch"))?;
            count
        }
        None => {
            let detector = detector_config(&config.detector)?;
            let pipeline = SourcePipeline::build(&config, section, offsets, detector)?;
            let result = pipeline
                .adapter
                .replay_from_offset(from, pipeline.dispatcher.clone(), cancel)
                .await;
            pipeline.dispatcher.shutdown().await;
            result.with_context(|| format!("Replay of '{source}' failed"))?
        }
    };

    println!(
        "{} {count} change(s) from '{source}' after offset {from}.",
        "Replayed".green()
    );
    println!("The stored offset was not changed.");
    Ok(())
}
