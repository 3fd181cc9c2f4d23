//! CLI - Command-line argument parsing
//!
//! Kept separate from execution so tests can parse argument vectors.

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

/// Warden CLI
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(about = "Reconcile containers and VMs against a declared manifest", long_about = None)]
#[command(version)]
#[command(disable_help_subcommand = true)]
pub struct Cli {
    /// Config file (default: /etc/warden/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Manifest file (overrides manifest_path from the config)
    #[arg(long, global = true, value_name = "PATH")]
    pub manifest: Option<PathBuf>,

    /// Log every mutating command instead of running it
    #[arg(
        long,
        global = true,
        env = "WARDEN_DRY_RUN",
        action = ArgAction::SetTrue,
        value_parser = BoolishValueParser::new()
    )]
    pub dry_run: bool,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Write a JSON run report to this path
    #[arg(long, global = true, value_name = "PATH")]
    pub report: Option<PathBuf>,

    /// Seconds to wait for another run's lock (overrides lock_wait_secs)
    #[arg(long, global = true, value_name = "SECS")]
    pub lock_wait: Option<u64>,

    /// Subcommand (default: run)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Reconcile the host against the manifest
    Run,

    /// Parse the manifest and print the normalized entries (no lock, no host access)
    Validate,
}

impl Cli {
    pub fn subcommand(&self) -> Commands {
        self.command.unwrap_or(Commands::Run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_run() {
        let cli = Cli::try_parse_from(["warden"]).unwrap();
        assert_eq!(cli.subcommand(), Commands::Run);
        assert!(!cli.verbose);
        assert!(cli.manifest.is_none());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "warden",
            "validate",
            "--manifest",
            "/tmp/m.json",
            "--dry-run",
            "-v",
        ])
        .unwrap();
        assert_eq!(cli.subcommand(), Commands::Validate);
        assert_eq!(cli.manifest, Some(PathBuf::from("/tmp/m.json")));
        assert!(cli.dry_run);
        assert!(cli.verbose);
    }

    #[test]
    fn test_report_and_lock_wait() {
        let cli = Cli::try_parse_from(["warden", "--report", "/tmp/r.json", "--lock-wait", "5", "run"])
            .unwrap();
        assert_eq!(cli.report, Some(PathBuf::from("/tmp/r.json")));
        assert_eq!(cli.lock_wait, Some(5));
    }

    #[test]
    fn test_unknown_subcommand_rejected() {
        assert!(Cli::try_parse_from(["warden", "destroy"]).is_err());
    }
}
