use std::io;
use std::net::SocketAddr;

use spider_models::{AddressFamily, RequestError};
use thiserror::Error;

/// Failures of the local machinery, as opposed to destinations misbehaving.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("source port range {min}-{max} cannot give {workers} workers two ports each")]
    PortsExhausted { min: u16, max: u16, workers: usize },

    #[error("no source address configured for {0}")]
    NoSourceAddress(AddressFamily),

    #[error("unable to {action} raw socket")]
    Socket {
        action: &'static str,
        source: io::Error,
    },

    #[error("probe to {destination} not accepted by the kernel")]
    Send {
        destination: SocketAddr,
        source: io::Error,
    },

    #[error("packet capture on {interface} failed: {reason}")]
    Capture { interface: String, reason: String },

    #[error("a worker task died: {0}")]
    WorkerLost(String),
}

impl EngineError {
    /// Whether the worker that hit this can go on with the next job. A probe the kernel
    /// refused to send (e.g. no route) is the destination's problem, not the engine's.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Send { .. })
    }
}

#[derive(Error, Debug)]
pub enum RunError {
    #[error("a measurement run is already in progress, try again later")]
    AlreadyRunning,

    #[error("malformed run request")]
    MalformedRequest(#[from] RequestError),

    #[error("run aborted")]
    EngineResource(#[from] EngineError),
}
