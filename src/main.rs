//! cask-torture command-line entry point.
//!
//! Exit code 0 when the run completes without a worker crash, 1 on any
//! fatal failure or bad argument. Consistency anomalies are logged and
//! counted but do not change the exit code.

mod cli;

use std::io;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cask_torture::{CaskStore, Outcome, run};
use cli::Cli;

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // --help and --version are not failures.
            return if e.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    init_logging();

    match run(CaskStore::new(), cli.to_config()) {
        Ok(report) => {
            let c = report.counters;
            match report.outcome {
                Outcome::Passed => {
                    if c.anomalies > 0 {
                        warn!(anomalies = c.anomalies, "run completed with consistency anomalies");
                    }
                    info!(
                        seq = c.current_seq,
                        reads = c.reads,
                        folds = c.folds,
                        key_folds = c.key_folds,
                        merges = c.merges,
                        anomalies = c.anomalies,
                        "torture run passed"
                    );
                    ExitCode::SUCCESS
                }
                Outcome::Failed(reason) => {
                    error!(%reason, seq = c.current_seq, anomalies = c.anomalies, "torture run failed");
                    ExitCode::from(1)
                }
            }
        }
        Err(e) => {
            error!(error = %e, "torture run aborted");
            ExitCode::from(1)
        }
    }
}

/// Logs to stderr; `RUST_LOG` overrides the default `info` level.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}
