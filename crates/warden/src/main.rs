//! Warden - one reconciliation pass per invocation
//!
//! Exit codes: 0 completed, 75 lock contention, 66 manifest missing,
//! 65 manifest invalid, 78 bad config, 1 anything else fatal.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use warden::cli::{Cli, Commands};
use warden::{Coordinator, RunOptions, SystemRunner};
use warden_common::error::{EXIT_GENERAL_ERROR, EXIT_MANIFEST_INVALID, EXIT_SUCCESS};
use warden_common::{Manifest, WardenConfig, WardenError};

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(false)
        .with_writer(std::io::stdout)
        .init();
}

fn exit_code(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<WardenError>())
        .map(WardenError::exit_code)
        .unwrap_or(EXIT_GENERAL_ERROR)
}

async fn run(cli: &Cli, config: WardenConfig) -> Result<i32> {
    let options = RunOptions {
        dry_run: cli.dry_run,
        manifest_path: cli.manifest.clone(),
        lock_wait: cli.lock_wait.map(Duration::from_secs),
    };
    let coordinator = Coordinator::new(config, Arc::new(SystemRunner), options);
    let report = coordinator.run().await?;

    if let Some(path) = &cli.report {
        match report.write_to(path) {
            Ok(()) => info!("Run report written to {}", path.display()),
            Err(e) => error!("Failed to write run report {}: {}", path.display(), e),
        }
    }
    Ok(EXIT_SUCCESS)
}

fn validate(cli: &Cli, config: &WardenConfig) -> Result<i32> {
    let path = cli.manifest.clone().unwrap_or_else(|| config.manifest_path.clone());
    let manifest = Manifest::load(&path, &config.entry_defaults())?;

    for entry in &manifest.entries {
        let json = serde_json::to_string(entry).context("serializing manifest entry")?;
        println!("{}", json);
    }
    for rejected in &manifest.rejected {
        error!("manifest entry {} rejected: {}", rejected.index, rejected.reason);
    }
    info!(
        "{}: {} valid entries, {} rejected",
        path.display(),
        manifest.entries.len(),
        manifest.rejected.len()
    );

    Ok(if manifest.rejected.is_empty() {
        EXIT_SUCCESS
    } else {
        EXIT_MANIFEST_INVALID
    })
}

async fn execute(cli: Cli) -> Result<i32> {
    let config = WardenConfig::load(cli.config.as_deref()).context("loading configuration")?;
    match cli.subcommand() {
        Commands::Run => run(&cli, config).await,
        Commands::Validate => validate(&cli, &config),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = match execute(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            exit_code(&e)
        }
    };
    std::process::exit(code);
}
