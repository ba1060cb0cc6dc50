mod args;
mod duration;

use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use pgslap::error::BenchError;
use pgslap::executor::make_connector;
use pgslap::run::{Progress, ProgressReporter, Task};

use crate::args::PgslapArgs;

// Rewrites a single stderr line once per second
struct ProgressPrinter;

impl ProgressReporter for ProgressPrinter {
    fn report(&self, progress: &Progress) {
        let secs = progress.elapsed.as_secs();
        let mut stderr = std::io::stderr().lock();
        let _ = write!(
            stderr,
            "\r{:02}:{:02} | {} agents / run {} queries ({:.0} qps)",
            secs / 60,
            secs % 60,
            progress.active_agents,
            progress.executions,
            progress.rate,
        );
        let _ = stderr.flush();
    }

    fn finish(&self) {
        eprintln!();
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run().await {
        if !matches!(err, BenchError::Interrupted) {
            eprintln!("Error: {err}");
        }
        std::process::exit(err.exit_code());
    }
}

async fn run() -> Result<(), BenchError> {
    let args = PgslapArgs::parse();
    let config = args.to_configuration()?;
    let print_report = !config.dry_run;
    let show_progress = !config.no_progress && !config.dry_run;

    let connector = make_connector(&args.url, &config).map_err(BenchError::Connection)?;
    let mut task = Task::new(config, connector)?;
    if show_progress {
        task = task.with_progress(Arc::new(ProgressPrinter));
    }

    let interrupt = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for the interrupt signal");
            // Never resolve; the run just cannot be interrupted
            std::future::pending::<()>().await;
        }
    };

    let report = task.run(interrupt).await?;

    if print_report {
        let json = serde_json::to_string_pretty(&report).context("Failed to serialize the report")?;
        println!("{json}");
    }
    Ok(())
}
