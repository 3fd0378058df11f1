use std::sync::Arc;

use anyhow::Result;
use colored::Colorize;
use rowcast_config::{detector_config, RowcastConfig, SinkMode};
use rowcast_core::MemoryOffsetStore;

use crate::runner::{build_adapter, build_sink, Offsets};

/// Everything `load_config` checks, plus what only the concrete sources and
/// sinks can check (table identifiers, header values).
pub fn cmd_validate(config: RowcastConfig) -> Result<()> {
    let offsets = Arc::new(Offsets::Memory(MemoryOffsetStore::new()));
    for source in &config.sources {
        build_adapter(source, offsets.clone())?;
    }
    for sink in &config.sinks {
        build_sink(sink)?;
    }
    let detector = detector_config(&config.detector)?;

    println!("{}", "Config is valid.".green().bold());
    println!("\nSources:");
    for source in &config.sources {
        println!(
            "  {} ({}, every {}ms, up to {} per poll)",
            source.name, source.change_table, source.poll_interval_ms, source.max_batch_size
        );
    }

    println!("\nSinks:");
    if config.sinks.is_empty() {
        println!("  {}", "(none: changes will only advance offsets)".yellow());
    }
    for sink in &config.sinks {
        let mode = match sink.mode {
            SinkMode::Raw => "raw",
            SinkMode::BulkAware => "bulk_aware",
        };
        let scope = if sink.sources.is_empty() {
            "all sources".to_string()
        } else {
            sink.sources.join(", ")
        };
        println!("  {} ({:?}, {mode}, {scope})", sink.name, sink.kind);
    }

    match detector {
        Some(d) => println!(
            "\nBulk detection: on (batch {} events, {:?} timeout)",
            d.max_batch_size, d.batch_timeout
        ),
        None => println!("\nBulk detection: off"),
    }
    Ok(())
}
