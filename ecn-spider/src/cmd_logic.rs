use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use log::debug;
use spider_crab::helpers::stop;

use crate::capture::{self, DatalinkCapture};
use crate::coordinator::Coordinator;
use crate::jobs_io;
use crate::pool::{self, Mode};
use crate::probe::RawSender;

pub mod measure;
pub mod trace;

pub async fn handle(cmd: Commands) -> Result<()> {
    let command_result = match cmd {
        Commands::Measure(data) => measure::handle(data).await,
        Commands::Trace(data) => trace::handle(data).await,
    };
    debug!("Finished command execution. Result: {:?}", command_result);
    command_result
}

#[derive(Subcommand)]
pub enum Commands {
    /// Probe each destination with a plain and an ECN-setup SYN and classify how it
    /// copes with ECN.
    Measure(measure::Params),

    /// Probe each destination with hop-limited SYNs to discover the routers on the way
    /// and how far away it is.
    Trace(trace::Params),
}

#[derive(Args, Clone, Debug)]
#[group(id = "io")]
pub struct IoParams {
    /// Job file with `destination_address`, `destination_port` & `correlation_id` per
    /// record, as newline-delimited JSON unless `--csv-input` is given.
    #[arg(long, default_value = "/dev/stdin")]
    input: PathBuf,

    /// Read the job file as CSV with a header row.
    #[arg(long)]
    csv_input: bool,

    /// Where to write one JSON object per result.
    #[arg(long, default_value = "/dev/stdout")]
    output: PathBuf,

    /// Include what every chain observed on both flows of each job.
    #[arg(long)]
    output_flows: bool,
}

/// Runs a single measurement over the job file, stopping early on SIGINT & co.
async fn execute(
    io: IoParams,
    pool: pool::Params,
    capture: capture::Params,
    mode: Mode,
) -> Result<()> {
    let request = jobs_io::read_request(&io.input, io.csv_input)?;
    let family = request.family;

    let sig_handler = stop::new();
    let stop_rx = sig_handler.subscribe_stop();
    let sig_handle = tokio::spawn(sig_handler.wait_for_signal());

    let coordinator = Coordinator::new(
        pool,
        mode,
        Arc::new(RawSender),
        Arc::new(DatalinkCapture::new(capture.interface)),
    )
    .with_flow_details(io.output_flows);
    let run_result = coordinator
        .start_run(request, &stop_rx)
        .await
        .context("Measurement run failed");

    // lets the signal handler return if no signal came
    stop_rx.cancel();
    stop::flatten(sig_handle).await?;

    jobs_io::write_results(&io.output, &run_result?, family)
}
