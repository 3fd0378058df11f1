use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;
mod config;
mod env;
mod runner;

use cli::{Cli, Commands};
use config::load_config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load .env (or .env.{ENV}) before anything reads the environment.
    env::load_dotenv(cli.env.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("rowcast=info")),
        )
        .init();

    match cli.command {
        Commands::Init { force } => commands::cmd_init(&cli.config, force),
        Commands::Validate => commands::cmd_validate(load_config(&cli.config)?),
        Commands::Run => commands::cmd_run(load_config(&cli.config)?).await,
        Commands::Status => commands::cmd_status(load_config(&cli.config)?).await,
        Commands::Replay {
            source,
            from,
            batch_size,
        } => commands::cmd_replay(load_config(&cli.config)?, &source, &from, batch_size).await,
        Commands::SetOffset { source, offset } => {
            commands::cmd_set_offset(load_config(&cli.config)?, &source, &offset).await
        }
    }
}
