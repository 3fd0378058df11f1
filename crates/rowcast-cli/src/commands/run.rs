use anyhow::Result;
use rowcast_config::RowcastConfig;
use tracing::info;

use crate::runner;

pub async fn cmd_run(config: RowcastConfig) -> Result<()> {
    info!(
        sources = config.sources.len(),
        sinks = config.sinks.len(),
        bulk_detection = config.detector.enabled,
        "Starting rowcast"
    );
    runner::run_pipeline(&config).await
}
