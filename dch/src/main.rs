//! Distributed Cluster Harness - CLI
//!
//! Runs the built-in smoke scenarios against an in-process mock cluster
//! and reports per-scenario outcomes.

#![forbid(unsafe_code)]

mod scenarios;

use anyhow::Result;
use clap::{Parser, Subcommand};
use dch_common::scenario::ScenarioRunner;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "dch")]
#[command(author, version, about = "Distributed Cluster Harness - cluster scenario runner")]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the built-in smoke scenarios against a mock cluster
    Smoke {
        /// Only run scenarios whose name contains this substring
        #[arg(short, long)]
        filter: Option<String>,
    },
    /// List the built-in scenarios
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Command::List => {
            for scenario in scenarios::builtin() {
                println!("{}", scenario.name());
            }
            Ok(())
        }
        Command::Smoke { filter } => run_smoke(filter).await,
    }
}

async fn run_smoke(filter: Option<String>) -> Result<()> {
    let mut selected: Vec<_> = scenarios::builtin()
        .into_iter()
        .filter(|s| {
            filter
                .as_deref()
                .is_none_or(|needle| s.name().contains(needle))
        })
        .collect();
    if selected.is_empty() {
        anyhow::bail!("no scenario matches the filter");
    }

    info!(count = selected.len(), "running smoke scenarios");
    let runner = ScenarioRunner::new();
    let reports = runner.run_all(&mut selected).await;

    let mut failures = 0usize;
    for report in &reports {
        println!("{}", report.summary());
        if !report.passed() {
            failures += 1;
        }
    }
    println!(
        "{} passed, {} failed, {} total",
        reports.len() - failures,
        failures,
        reports.len()
    );
    if failures > 0 {
        anyhow::bail!("{failures} scenario(s) failed");
    }
    Ok(())
}
