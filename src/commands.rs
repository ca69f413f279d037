//! CLI command definitions
//!
//! Defines the clap commands for the functest CLI.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Run one or more YAML test scenarios
    Run {
        /// Scenario files to run
        #[arg(required = true)]
        scenarios: Vec<PathBuf>,

        /// Shared asset registry (YAML mapping of name: {url, sha256})
        #[arg(long)]
        assets: Option<PathBuf>,

        /// Number of scenarios to run concurrently
        #[arg(long, short, default_value_t = 1)]
        jobs: usize,

        /// Show each step as it starts and mirror the guest console
        #[arg(long, short)]
        verbose: bool,
    },

    /// Download and verify an asset into the cache
    Fetch {
        /// Source URL
        url: String,

        /// Expected SHA-256 or SHA-512 hex digest
        checksum: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Extract a member from an archive asset
    Extract {
        /// Source URL of the archive
        url: String,

        /// Expected digest of the archive
        checksum: String,

        /// Path inside the archive (e.g. boot/vmlinux-4.5.0-2-4kc-malta)
        member: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Asset cache management
    #[command(subcommand)]
    Cache(CacheCommands),
}

#[derive(Subcommand)]
pub enum CacheCommands {
    /// Print the cache root
    Path,

    /// Remove every cached asset and derived entry
    Clean,
}
