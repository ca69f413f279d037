//! functest - boots guest kernels under an emulator and checks their console
//!
//! Scenarios are YAML files describing which assets to fetch, how to launch
//! the VM and which console output to expect.

use std::path::PathBuf;

use clap::Parser;
use commands::Commands;
use functest::{cli, commands, common::logging};

#[derive(Parser)]
#[command(name = "functest", about = "Emulator functional-test harness")]
#[command(version, long_about = None)]
struct Cli {
    /// Configuration file (default: platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let verbose = matches!(cli.command, Commands::Run { verbose: true, .. });
    logging::init_cli(verbose);

    if let Err(e) = cli::dispatch(cli.command, cli.config.as_deref()).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
