use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use human_panic::setup_panic;
use log::{debug, error, warn};

use crate::helpers::logging;

/// Probe workers drain in-flight connections up to their own timeout; this only bounds
/// stragglers such as the capture thread noticing its stop token.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

pub fn run<CliType, Fut>(
    fn_cli_parse: fn() -> CliType,
    fn_extract_logging: fn(&CliType) -> &logging::Params,
    fn_run: fn(CliType) -> Fut,
) -> Result<()>
where
    Fut: Future<Output = Result<()>>,
{
    setup_panic!();
    let dotenv_found = match dotenvy::dotenv() {
        Ok(_) => true,
        Err(env_err) if env_err.not_found() => false,
        Err(env_err) => return Err(env_err).with_context(|| "Failed to load `.env` file"),
    };

    let cli = fn_cli_parse();
    let logger_handle = logging::configure_from(fn_extract_logging(&cli))?;
    if !dotenv_found {
        warn!("No `.env` file found (recursively), using CLI arguments & environment only.");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .with_context(|| "Failed to start Tokio runtime")?;

    let command_result = runtime.block_on(fn_run(cli));
    if let Err(e) = &command_result {
        error!("Command failed: {:#}", e);
    }

    debug!(
        "Waiting up to {} seconds for remaining tasks to finish",
        SHUTDOWN_GRACE.as_secs()
    );
    runtime.shutdown_timeout(SHUTDOWN_GRACE);

    // Important with non-direct write mode
    // Handle needs to be kept alive until end of program
    logger_handle.flush();

    command_result
}
