use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{Display, EnumString};

use crate::job::AddressFamily;

/// Whether a destination accepted connections with and without the ECN treatment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectivityState {
    /// Both the baseline and the treatment connection completed.
    Ok,
    /// Only the baseline completed, the treatment was dropped somewhere.
    Broken,
    /// Only the treatment completed, so the baseline failure is probably not ECN-related.
    Transient,
    Unreachable,
}

impl ConnectivityState {
    pub fn from_handshakes(baseline_completed: bool, treatment_completed: bool) -> Self {
        match (baseline_completed, treatment_completed) {
            (true, true) => Self::Ok,
            (true, false) => Self::Broken,
            (false, true) => Self::Transient,
            (false, false) => Self::Unreachable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EcnState {
    Negotiated,
    NotNegotiated,
    /// No SYN-ACK was observed for the treatment flow.
    Unknown,
}

/// One ICMP time-exceeded quote, attributed to a hop via the probe's sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopObservation {
    pub hop_number: u32,
    pub address: IpAddr,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TraceSummary {
    /// Ordered by hop number. Load-balanced paths may yield several addresses per hop.
    pub hops: Vec<HopObservation>,
    /// Hop distance derived from the acknowledgement of a hop-limited probe that made it
    /// all the way to the destination.
    pub destination_hop: Option<u32>,
    /// Return path length estimated from the minimum reverse TTL.
    pub return_hops: Option<u8>,
}

/// Flow-level data as recorded by the analysis chains, keyed by chain name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDetail {
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub first_seen: DateTime<Utc>,
    pub chains: BTreeMap<String, Value>,
}

/// Per-job outcome. Flags are OR-ed TCP flag bytes, zero if nothing was seen in that
/// direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawResult {
    pub source_port: u16,
    pub destination_address: IpAddr,
    pub destination_port: u16,
    pub correlation_id: String,
    pub connectivity_state: ConnectivityState,
    pub ecn_state: Option<EcnState>,
    pub init_flags_fwd: u8,
    pub syn_flags_fwd: u8,
    pub union_flags_fwd: u8,
    pub init_flags_rev: u8,
    pub syn_flags_rev: u8,
    pub union_flags_rev: u8,
    pub min_ttl_rev: Option<u8>,
    pub trace: Option<TraceSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flows: Vec<FlowDetail>,
}

pub const COL_SOURCE_PORT: &str = "source.port";
pub const COL_DESTINATION_PORT: &str = "destination.port";
pub const COL_CORRELATION_ID: &str = "correlation.id";
pub const COL_CONNECTIVITY: &str = "connectivity.ip";
pub const COL_ECN_STATE: &str = "ecn.state";
pub const COL_FLAGS: [&str; 6] = [
    "flags.init.fwd",
    "flags.syn.fwd",
    "flags.union.fwd",
    "flags.init.rev",
    "flags.syn.rev",
    "flags.union.rev",
];
pub const COL_MIN_TTL_REV: &str = "ttl.rev.min";
pub const COL_TRACE: &str = "trace";
pub const COL_FLOWS: &str = "flows";

fn destination_column(family: AddressFamily) -> String {
    format!("destination.{}", family)
}

/// Stable column layout of a result row for the given address family. The trace & flow
/// columns are only present on rows that carry them.
pub fn result_columns(family: AddressFamily) -> Vec<String> {
    let mut columns = vec![
        COL_SOURCE_PORT.to_string(),
        destination_column(family),
        COL_DESTINATION_PORT.to_string(),
        COL_CORRELATION_ID.to_string(),
        COL_CONNECTIVITY.to_string(),
        COL_ECN_STATE.to_string(),
    ];
    columns.extend(COL_FLAGS.iter().map(|it| it.to_string()));
    columns.push(COL_MIN_TTL_REV.to_string());
    columns
}

impl RawResult {
    pub fn flags(&self) -> [u8; 6] {
        [
            self.init_flags_fwd,
            self.syn_flags_fwd,
            self.union_flags_fwd,
            self.init_flags_rev,
            self.syn_flags_rev,
            self.union_flags_rev,
        ]
    }

    /// Fails only if the trace or the flow details cannot be encoded as JSON.
    pub fn to_row(&self, family: AddressFamily) -> Result<Map<String, Value>, serde_json::Error> {
        let mut row = Map::new();
        row.insert(COL_SOURCE_PORT.into(), self.source_port.into());
        row.insert(
            destination_column(family),
            self.destination_address.to_string().into(),
        );
        row.insert(COL_DESTINATION_PORT.into(), self.destination_port.into());
        row.insert(COL_CORRELATION_ID.into(), self.correlation_id.clone().into());
        row.insert(
            COL_CONNECTIVITY.into(),
            self.connectivity_state.to_string().into(),
        );
        row.insert(
            COL_ECN_STATE.into(),
            self.ecn_state.map(|it| it.to_string()).into(),
        );
        for (name, value) in COL_FLAGS.iter().zip(self.flags()) {
            row.insert(name.to_string(), value.into());
        }
        row.insert(COL_MIN_TTL_REV.into(), self.min_ttl_rev.into());
        if let Some(trace) = &self.trace {
            row.insert(
                COL_TRACE.into(),
                serde_json::to_value(trace)?,
            );
        }
        if !self.flows.is_empty() {
            row.insert(
                COL_FLOWS.into(),
                serde_json::to_value(&self.flows)?,
            );
        }
        Ok(row)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub results: Vec<RawResult>,
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
    /// Set if the run was stopped before every job was processed. `results` then holds
    /// only the jobs that completed.
    pub cancelled: bool,
}

impl RunResult {
    pub fn duration(&self) -> Duration {
        self.stopped_at - self.started_at
    }

    pub fn to_rows(&self, family: AddressFamily) -> Result<Vec<Map<String, Value>>, serde_json::Error> {
        self.results.iter().map(|it| it.to_row(family)).collect()
    }
}
