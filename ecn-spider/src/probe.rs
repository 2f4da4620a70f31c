use rand::Rng;

use crate::error::EngineError;
use crate::flow::FlowKey;
use crate::packet::{flags, SegmentSpec, INITIAL_SEQ};

pub use self::ports::PortSlice;
pub use self::sender::RawSender;

pub mod ports;
mod sender;

/// What distinguishes the probes of one flow from a plain connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Treatment {
    Baseline,
    /// ECN-setup SYN as of RFC 3168, i.e. ECE & CWR set.
    EcnSetup,
    /// TTL / hop limit capped, sequence number encoding the cap.
    HopLimited { ttl: u8 },
}

impl Treatment {
    pub fn extra_flags(&self) -> u8 {
        match self {
            Self::EcnSetup => flags::ECE | flags::CWR,
            _ => 0,
        }
    }

    pub fn ttl(&self) -> Option<u8> {
        match self {
            Self::HopLimited { ttl } => Some(*ttl),
            _ => None,
        }
    }

    fn sequence(&self) -> u32 {
        match self {
            Self::HopLimited { ttl } => INITIAL_SEQ + *ttl as u32 - 1,
            // well clear of anything a hop-limited probe could be acknowledged with
            _ => rand::thread_rng().gen_range(INITIAL_SEQ + 0x1_0000..=u32::MAX),
        }
    }
}

/// One SYN to be sent on a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub flow: FlowKey,
    pub treatment: Treatment,
    pub sequence: u32,
}

impl Probe {
    pub fn new(flow: FlowKey, treatment: Treatment) -> Self {
        Self {
            flow,
            treatment,
            sequence: treatment.sequence(),
        }
    }

    pub fn segment(&self) -> SegmentSpec {
        SegmentSpec::syn(
            self.flow.local,
            self.flow.remote,
            self.sequence,
            self.treatment.extra_flags(),
        )
    }
}

/// Puts probes on the wire. Sending is fire-and-forget, replies come in through capture.
pub trait ProbeSender: Send + Sync {
    fn send(&self, probe: &Probe) -> Result<(), EngineError>;
}
