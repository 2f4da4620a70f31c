use anyhow::Result;
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
}

pub async fn handle(params: Params) -> Result<()> {
    super::execute(params.io, params.pool, params.capture, Mode::Ecn).await
}
