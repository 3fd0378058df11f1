use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "rowcast")]
#[command(about = "Stream database changes to webhooks, with bulk operation detection")]
#[command(version)]
pub struct Cli {
    /// Path to rowcast.toml
    #[arg(short, long, global = true, default_value = "rowcast.toml")]
    pub config: PathBuf,

    /// Environment to load (loads .env.{ENV} instead of .env)
    #[arg(short, long, global = true)]
    pub env: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a starter rowcast.toml and .env.example
    Init {
        /// Overwrite an existing config without asking
        #[arg(long)]
        force: bool,
    },

    /// Check the config file without connecting to anything
    Validate,

    /// Start capturing changes from every configured source
    Run,

    /// Show stored offsets
    Status,

    /// Re-deliver changes after an offset without moving the stored offset
    Replay {
        /// Source name from rowcast.toml
        #[arg(long)]
        source: String,

        /// Offset to replay after (exclusive)
        #[arg(long)]
        from: String,

        /// Deliver in batches of this size to every sink, bypassing bulk detection
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Move a source's stored offset
    SetOffset {
        /// Source name from rowcast.toml
        #[arg(long)]
        source: String,

        /// New offset; capture resumes after it
        offset: String,
    },
}
