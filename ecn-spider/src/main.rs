use anyhow::Result;
use clap::Parser;
use spider_crab::helpers::{bootstrap, logging};

/// Reply capture & routing of captured packets to the flows waiting for them.
mod capture;
/// Per-flow packet analysis, one chain per concern.
mod chain;
mod cmd_logic;
/// Single-run exclusivity & collection of a run's results.
mod coordinator;
mod error;
mod flow;
mod jobs_io;
mod packet;
/// Bounded set of workers, each probing one destination at a time.
mod pool;
mod probe;

#[cfg(test)]
mod test_utils;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[clap(flatten)]
    logging: logging::Params,

    #[command(subcommand)]
    command: cmd_logic::Commands,
}

fn main() -> Result<()> {
    bootstrap::run(Cli::parse, |cli: &Cli| &cli.logging, do_run)
}

async fn do_run(cli: Cli) -> Result<()> {
    cmd_logic::handle(cli.command).await
}
