//! Sesgo CLI
//!
//! # Usage
//!
//! ```bash
//! # Train one run
//! sesgo train --config run.yaml
//!
//! # Run every variant of a protocol
//! sesgo train --config run.yaml --expt-type seed_repeat
//!
//! # Show the resolved config
//! sesgo resolve --config run.yaml
//!
//! # List protocols
//! sesgo protocols
//! ```

use clap::Parser;
use sesgo::config::{Cli, Command, RunArgs};
use sesgo::experiment::{run_experiment, PROTOCOLS};
use sesgo::run::{resolve_only, run};
use std::fs::{self, OpenOptions};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "train.log";

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.quiet {
        "warn"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };

    let result = match cli.command {
        Command::Train(args) => run_train(&args, level),
        Command::Resolve(args) => {
            init_logging(level, None);
            run_resolve(&args)
        }
        Command::Protocols => {
            for protocol in PROTOCOLS {
                println!("{:<24} {}", protocol.name, protocol.description);
            }
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Log to stderr, and also to `log_path` when one is given
fn init_logging(level: &str, log_path: Option<&std::path::Path>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let file = log_path.and_then(|path| {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).ok()?;
        }
        OpenOptions::new().create(true).append(true).open(path).ok()
    });
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    match file {
        Some(file) => builder
            .with_ansi(false)
            .with_writer(std::io::stderr.and(std::sync::Mutex::new(file)))
            .init(),
        None => builder.with_writer(std::io::stderr).init(),
    }
}

fn run_train(args: &RunArgs, level: &str) -> sesgo::Result<()> {
    let config = match args.to_run_config() {
        Ok(config) => config,
        Err(e) => {
            init_logging(level, None);
            return Err(e);
        }
    };
    init_logging(level, Some(&config.run_dir().join(LOG_FILE)));

    let reports = run_experiment(&config, |variant| run(&variant))?;
    for (label, report) in &reports {
        info!(
            run = %label,
            epochs = report.epochs_completed,
            stopped_early = report.stopped_early,
            best_test_acc = ?report.best_test_accuracy,
            checkpoint = %report.final_checkpoint.display(),
            "run finished"
        );
    }
    Ok(())
}

fn run_resolve(args: &RunArgs) -> sesgo::Result<()> {
    let resolved = resolve_only(&args.to_run_config()?)?;
    let yaml = serde_yaml::to_string(&resolved)
        .map_err(|e| sesgo::Error::Serialization(e.to_string()))?;
    print!("{yaml}");
    Ok(())
}
