//! CLI command handling
//!
//! Builds the shared harness from configuration and dispatches commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use colored::Colorize;
use futures_util::stream::{self, StreamExt};

use crate::archive::ArchiveExtractor;
use crate::assets::{AssetDescriptor, AssetRegistry, AssetStore, FetchPolicy, HttpTransport};
use crate::commands::{CacheCommands, Commands};
use crate::common::config::Config;
use crate::common::{Error, Result};
use crate::testing::{self, Harness, TestResult};
use crate::vm::QemuController;

/// Dispatch a CLI command
pub async fn dispatch(command: Commands, config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;

    match command {
        Commands::Run {
            scenarios,
            assets,
            jobs,
            verbose,
        } => run(scenarios, assets, jobs, verbose, config).await,

        Commands::Fetch {
            url,
            checksum,
            json,
        } => {
            let descriptor = AssetDescriptor::new(url, &checksum)?;
            let store = open_store(&config)?;
            let path = store.fetch(&descriptor).await?;
            print_path(&descriptor, None, &path, json)
        }

        Commands::Extract {
            url,
            checksum,
            member,
            json,
        } => {
            let descriptor = AssetDescriptor::new(url, &checksum)?;
            let store = open_store(&config)?;
            let extractor = ArchiveExtractor::for_store(&store);
            let handle = extractor
                .extract_asset(&store, &descriptor, &member)
                .await?;
            print_path(&descriptor, Some(&handle.member), &handle.path, json)
        }

        Commands::Cache(CacheCommands::Path) => {
            println!("{}", config.cache_dir()?.display());
            Ok(())
        }

        Commands::Cache(CacheCommands::Clean) => {
            let store = open_store(&config)?;
            store.purge()?;
            println!("Removed {}", store.root().display());
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => {
            let mut config = Config::load_from(path)?;
            config.apply_env();
            Ok(config)
        }
        None => Config::load(),
    }
}

fn open_store(config: &Config) -> Result<AssetStore> {
    let transport = HttpTransport::new(std::time::Duration::from_secs(
        config.timeouts.connect_secs,
    ))?;
    Ok(AssetStore::new(
        config.cache_dir()?,
        Arc::new(transport),
        FetchPolicy::from_config(config),
    ))
}

fn print_path(
    descriptor: &AssetDescriptor,
    member: Option<&str>,
    path: &Path,
    json: bool,
) -> Result<()> {
    if json {
        let value = serde_json::json!({
            "url": descriptor.url,
            "checksum": descriptor.checksum.as_str(),
            "member": member,
            "path": path,
        });
        let text = serde_json::to_string_pretty(&value)
            .map_err(|e| Error::Internal(format!("Failed to encode JSON: {}", e)))?;
        println!("{}", text);
    } else {
        println!("{}", path.display());
    }
    Ok(())
}

async fn run(
    scenarios: Vec<PathBuf>,
    assets: Option<PathBuf>,
    jobs: usize,
    verbose: bool,
    config: Config,
) -> Result<()> {
    let registry = match assets {
        Some(path) => AssetRegistry::load(&path)?,
        None => AssetRegistry::new(),
    };
    let store = Arc::new(open_store(&config)?);
    let harness = Harness {
        extractor: Arc::new(ArchiveExtractor::for_store(&store)),
        store,
        controller: Arc::new(QemuController::from_config(&config)?),
        registry: Arc::new(registry),
        config: Arc::new(config),
    };

    let results: Vec<(PathBuf, Result<TestResult>)> = stream::iter(scenarios)
        .map(|path| {
            let harness = &harness;
            async move {
                let result = testing::run_scenario(&path, harness, verbose).await;
                (path, result)
            }
        })
        .buffered(jobs.max(1))
        .inspect(|(_, result)| {
            if let Ok(result) = result {
                println!("{}", result.report);
            }
        })
        .collect()
        .await;

    let total = results.len();
    let mut failed = 0;
    println!("{}", "Summary:".cyan());
    for (path, result) in &results {
        match result {
            Ok(r) if r.passed => {
                println!("  {} {} ({}/{} steps)", "✓".green(), r.name, r.steps_run, r.steps_total);
            }
            Ok(r) => {
                failed += 1;
                println!(
                    "  {} {} (failed at step {}/{})",
                    "✗".red(),
                    r.name,
                    r.steps_run,
                    r.steps_total
                );
            }
            Err(e) => {
                failed += 1;
                println!("  {} {}: {}", "✗".red(), path.display(), e);
            }
        }
    }

    if failed > 0 {
        return Err(Error::ScenariosFailed { failed, total });
    }
    println!(
        "\n{} {}",
        "✓".green().bold(),
        format!("All {} scenario(s) passed", total).green().bold()
    );
    Ok(())
}
