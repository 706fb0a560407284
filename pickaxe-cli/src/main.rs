use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use pickaxe_cli::commands::{hash, run, target};
use pickaxe_cli::utils::banner;

/// Pickaxe - Stratum pool miner
#[derive(Parser)]
#[command(name = "pickaxe")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbose mode (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a pool and mine
    Run(run::RunArgs),

    /// Print the double SHA-256 of a block header
    Hash(hash::HashArgs),

    /// Print the target for compact bits or a difficulty
    Target(target::TargetArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Run(_) = &cli.command {
        banner::show_compact_banner();
    }

    // RUST_LOG wins over -v
    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_line_number(cli.verbose > 1)
        .init();

    match cli.command {
        Commands::Run(args) => run::execute(args, cli.config.as_deref()).await?,
        Commands::Hash(args) => hash::execute(args).await?,
        Commands::Target(args) => target::execute(args).await?,
    }

    Ok(())
}
