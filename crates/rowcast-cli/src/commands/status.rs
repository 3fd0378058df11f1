use anyhow::Result;
use colored::Colorize;
use rowcast_config::{OffsetBackend, RowcastConfig};

use crate::runner::Offsets;

pub async fn cmd_status(config: RowcastConfig) -> Result<()> {
    if config.offsets.backend == OffsetBackend::Memory {
        println!("The memory offset backend keeps nothing between runs.");
        return Ok(());
    }

    let offsets = Offsets::open(&config.offsets).await?;
    let stored = offsets.list().await?;

    println!("\n{}", "Capture Status:".bold());
    println!("{:<30} {:>20} {:>30}", "Source", "Offset", "Updated");
    println!("{:-<82}", "");

    for source in &config.sources {
        match stored.iter().find(|r| r.source == source.name) {
            Some(record) => println!(
                "{:<30} {:>20} {:>30}",
                source.name,
                record.offset.green(),
                record.updated_at
            ),
            None => println!(
                "{:<30} {:>20} {:>30}",
                source.name,
                "(not started)".yellow(),
                "-"
            ),
        }
    }

    // Offsets left behind by sources no longer in the config.
    for record in stored
        .iter()
        .filter(|r| config.source(&r.source).is_none())
    {
        println!(
            "{:<30} {:>20} {:>30}",
            record.source.dimmed(),
            record.offset.dimmed(),
            record.updated_at.dimmed()
        );
    }

    println!();
    Ok(())
}
