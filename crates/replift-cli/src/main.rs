use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod config;
mod download;
mod flows;
mod render;

#[cfg(test)]
mod tests;

#[derive(Parser, Debug)]
#[command(name = "replift")]
#[command(about = "Transactional application updater", long_about = None)]
struct Cli {
    /// Path to the application's update configuration.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Disable progress bars and styled output.
    #[arg(long)]
    plain: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check the catalog and apply any pending update.
    Update {
        /// Use this catalog instead of the configured one.
        #[arg(long)]
        catalog: Option<String>,
    },
    /// Continue an interrupted update from its handoff file.
    Resume { handoff: PathBuf },
    /// Remove everything the updates installed.
    Uninstall,
    /// Show the installed and latest known versions.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Build a binary delta between two files.
    MakeDelta {
        original: PathBuf,
        target: PathBuf,
        out: PathBuf,
    },
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let code = match cli.command {
        // make-delta is a packaging tool; it runs without an app config
        Commands::MakeDelta {
            original,
            target,
            out,
        } => flows::run_make_delta(&original, &target, &out)?,
        command => {
            let config = config::AppConfig::locate(cli.config.as_deref())?;
            match command {
                Commands::Update { catalog } => {
                    flows::run_update(&config, catalog.as_deref(), cli.plain)?
                }
                Commands::Resume { handoff } => flows::run_resume(&config, &handoff, cli.plain)?,
                Commands::Uninstall => flows::run_uninstall(&config, cli.plain)?,
                Commands::Status { json } => flows::run_status(&config, json)?,
                Commands::MakeDelta { .. } => return Ok(ExitCode::SUCCESS),
            }
        }
    };

    Ok(ExitCode::from(code))
}
