//! XtraBackup Automator - Main entry point
//!
//! One invocation runs one backup cycle and exits; the systemd timer (or
//! any other external trigger) provides the cadence.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use xtrabackup_automator::{config::Config, engine, utils};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Load configuration
    let config = match args.config {
        Some(ref config_path) => match Config::from_file(config_path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load {}: {e}", config_path.display());
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };

    // Initialize logging
    if config.log.enabled {
        let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
        if let Err(e) = utils::logger::init(log_level, config.log.file.as_deref()) {
            eprintln!("Failed to initialize logging: {e}");
            return ExitCode::FAILURE;
        }
    }

    tracing::info!(
        "Starting xtrabackup-automator v{} (base_dir: {})",
        env!("CARGO_PKG_VERSION"),
        config.paths.base_dir.display()
    );

    let started = Instant::now();
    match engine::run_cycle(&config).await {
        Ok(outcome) => {
            tracing::info!(
                ?outcome,
                elapsed_secs = started.elapsed().as_secs(),
                "Backup cycle finished"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(
                kind = e.kind(),
                error = %e,
                elapsed_secs = started.elapsed().as_secs(),
                "Backup cycle failed"
            );
            ExitCode::FAILURE
        }
    }
}
