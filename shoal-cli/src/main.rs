//! Shoal CLI - Command-line interface
//!
//! Drives the swarm engine from a terminal.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use shoal_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "shoal")]
#[command(about = "A BitTorrent swarm client")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: commands::Commands,

    /// Console log level; the log file always records everything
    #[arg(long, value_enum, default_value_t = CliLogLevel::Warn, global = true)]
    log_level: CliLogLevel,

    /// Directory for the per-run debug log
    #[arg(long, default_value = "logs", global = true)]
    logs_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), Some(&cli.logs_dir))
        .map_err(|e| anyhow::anyhow!("failed to initialise logging: {e}"))?;

    if let Err(e) = commands::handle_command(cli.command).await {
        tracing::error!("{}", e);
        if e.is_user_error() {
            anyhow::bail!(e.user_message());
        }
        return Err(e.into());
    }

    Ok(())
}
