use std::sync::Arc;

use anyhow::{Context, Result};
use colored::Colorize;
use rowcast_config::RowcastConfig;
use rowcast_core::{DatabaseAdapter, OffsetStore};

use crate::runner::{build_adapter, Offsets};

pub async fn cmd_set_offset(config: RowcastConfig, source: &str, offset: &str) -> Result<()> {
    let section = config
        .source(source)
        .with_context(|| format!("Source '{source}' not found in config"))?;

    // Change-log offsets are change ids.
    offset
        .trim()
        .parse::<i64>()
        .with_context(|| format!("Offset '{offset}' is not a change id"))?;

    let offsets = Arc::new(Offsets::open(&config.offsets).await?);
    let adapter = build_adapter(section, offsets)?;
    let previous = adapter.offset_store().get_offset(source).await?;

    adapter
        .set_offset(offset.trim())
        .await
        .with_context(|| format!("Failed to store offset for '{source}'"))?;

    println!(
        "{} {}: {} -> {}",
        "Offset moved".green(),
        source,
        previous.as_deref().unwrap_or("(none)"),
        offset.trim()
    );
    println!("Capture resumes after this offset on the next 'rowcast run'.");
    Ok(())
}
