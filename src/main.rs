use anyhow::Result;
use clap::{Parser, Subcommand};
use std::ffi::OsString;

mod analyze;
mod args;
mod artifacts;
mod batch;
mod cache;
mod compare;
mod config;
mod devicefarm;
mod env;
mod events;
mod interrupt;
mod logging;
mod metrics;
mod monitor;
mod run;
mod scheduler;
#[cfg(test)]
mod testing;
mod ui;
mod utils;

use crate::args::CLIArgs;

const DEFAULT_CANARY_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-canary.dev");
const CLI_VERSION: &str = match option_env!("PERFRUN_VERSION_STRING") {
    Some(version) => version,
    None => DEFAULT_CANARY_VERSION,
};

#[derive(Debug, Parser)]
#[command(
    name = "perfrun",
    about = "Run Android startup benchmarks on a device farm and compare their traces",
    version = CLI_VERSION
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Schedule a benchmark in batches and collect its traces
    Run(CLIArgs<run::RunArgs>),
    /// Extract latency metrics from two trace directories and compare them
    Analyze(CLIArgs<analyze::AnalyzeArgs>),
    /// Inspect or clear cached metrics
    Cache(CLIArgs<cache::CacheArgs>),
    /// Manage persistent configuration
    Config(CLIArgs<config::ConfigArgs>),
}

#[tokio::main]
async fn main() -> Result<()> {
    let argv: Vec<OsString> = std::env::args_os().collect();
    env::bootstrap_from_args(&argv)?;
    let cli = Cli::parse_from(argv);

    match cli.command {
        Commands::Run(cmd) => {
            logging::init(cmd.base.verbose);
            run::run(cmd.base, cmd.args).await?
        }
        Commands::Analyze(cmd) => {
            logging::init(cmd.base.verbose);
            analyze::run(cmd.base, cmd.args).await?
        }
        Commands::Cache(cmd) => {
            logging::init(cmd.base.verbose);
            cache::run(cmd.base, cmd.args)?
        }
        Commands::Config(cmd) => {
            logging::init(cmd.base.verbose);
            config::run(cmd.base, cmd.args)?
        }
    }

    Ok(())
}
