use anyhow::{bail, Result};
use clap::Args;

use crate::capture;
use crate::pool::{self, Mode};

use super::IoParams;

#[derive(Args)]
pub struct Params {
    #[clap(flatten)]
    io: IoParams,

    #[clap(flatten)]
    pool: pool::Params,

    #[clap(flatten)]
    capture: capture::Params,

    /// TTL of the first hop-limited probe.
    #[arg(long, default_value = "1", value_parser = clap::value_parser!(u8).range(1..))]
    min_ttl: u8,

    /// TTL of the last hop-limited probe. Every TTL in between gets one probe.
    #[arg(long, default_value = "30")]
    max_ttl: u8,
}

pub async fn handle(params: Params) -> Result<()> {
    if params.max_ttl < params.min_ttl {
        bail!(
            "--max-ttl ({}) must not be less than --min-ttl ({})",
            params.max_ttl,
            params.min_ttl
        );
    }
    let mode = Mode::Trace {
        min_ttl: params.min_ttl,
        max_ttl: params.max_ttl,
    };
    super::execute(params.io, params.pool, params.capture, mode).await
}
