use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::Args;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;

pub use self::datalink::DatalinkCapture;
pub use self::router::PacketRouter;

mod datalink;
mod router;

#[derive(Args, Clone, Debug)]
#[group(id = "capture")]
pub struct Params {
    /// Network interface to capture replies on. Needs CAP_NET_RAW.
    #[arg(long, default_value = "eth0", env = "CAPTURE_INTERFACE")]
    pub interface: String,
}

/// One IP packet (no link-layer header) as routed to the flow it belongs to.
#[derive(Debug, Clone)]
pub struct ObservedPacket {
    pub bytes: Vec<u8>,
    /// Travelling towards us.
    pub reverse: bool,
    pub captured_at: DateTime<Utc>,
}

/// Source of captured packets for one run. The returned task keeps feeding the router
/// until `stop` is cancelled, or fails with the reason it can't.
pub trait PacketCapture: Send + Sync {
    fn start(
        &self,
        router: Arc<PacketRouter>,
        stop: CancellationToken,
    ) -> Result<JoinHandle<Result<(), EngineError>>, EngineError>;
}
