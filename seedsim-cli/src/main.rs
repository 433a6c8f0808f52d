//! SeedSim CLI - Command-line interface
//!
//! Seeds synthetic torrents against real trackers and peers and prints the
//! resulting telemetry.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use seedsim_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "seedsim")]
#[command(about = "BitTorrent client network-behavior emulator")]
#[command(version)]
struct Cli {
    /// Console log level; the trace file always records everything
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info, global = true)]
    log_level: CliLogLevel,

    /// Directory receiving the per-run trace file
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())
        .map_err(|e| anyhow::anyhow!(e))?;

    commands::handle_command(cli.command).await
}
