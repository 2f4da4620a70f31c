use itertools::Itertools;
use log::warn;
use spider_models::{
    ConnectivityState, EcnState, FlowDetail, HopObservation, Job, RawResult, TraceSummary,
};

use crate::chain::ecn::EcnFields;
use crate::chain::TtlBands;
use crate::flow::FlowRecord;

/// Flags, reverse TTL & source port come from the treated flow, since that is the one
/// whose fate is in question.
pub fn ecn(job: &Job, baseline: &FlowRecord, treated: &FlowRecord, with_flows: bool) -> RawResult {
    let mut result = from_flow(job, treated, connectivity(baseline, treated));
    result.ecn_state = Some(treated.ecn().map_or(EcnState::Unknown, EcnFields::state));
    result.flows = details(with_flows, &[baseline, treated]);
    result
}

/// Flags, reverse TTL & source port come from the baseline here, the burst of
/// hop-limited probes only contributes the hop table.
pub fn trace(
    job: &Job,
    baseline: &FlowRecord,
    traced: &FlowRecord,
    bands: &TtlBands,
    with_flows: bool,
) -> RawResult {
    let mut result = from_flow(job, baseline, connectivity(baseline, traced));
    result.trace = Some(summarize(baseline, traced, bands));
    result.flows = details(with_flows, &[baseline, traced]);
    result
}

fn connectivity(baseline: &FlowRecord, treated: &FlowRecord) -> ConnectivityState {
    ConnectivityState::from_handshakes(baseline.is_completed(), treated.is_completed())
}

fn from_flow(job: &Job, flow: &FlowRecord, connectivity_state: ConnectivityState) -> RawResult {
    let basic = flow.basic().cloned().unwrap_or_default();
    RawResult {
        source_port: flow.key.local.port(),
        destination_address: job.destination,
        destination_port: job.port,
        correlation_id: job.correlation_id.clone(),
        connectivity_state,
        ecn_state: None,
        init_flags_fwd: basic.fwd.init.unwrap_or(0),
        syn_flags_fwd: basic.fwd.syn.unwrap_or(0),
        union_flags_fwd: basic.fwd.union,
        init_flags_rev: basic.rev.init.unwrap_or(0),
        syn_flags_rev: basic.rev.syn.unwrap_or(0),
        union_flags_rev: basic.rev.union,
        min_ttl_rev: basic.min_ttl_rev,
        trace: None,
        flows: vec![],
    }
}

fn summarize(baseline: &FlowRecord, traced: &FlowRecord, bands: &TtlBands) -> TraceSummary {
    let Some(fields) = traced.traceroute() else {
        return TraceSummary::default();
    };
    let hops = fields
        .hops
        .iter()
        .map(|(address, entry)| HopObservation {
            hop_number: entry.hop_number,
            address: *address,
            captured_at: entry.captured_at,
        })
        .sorted_by_key(|it| (it.hop_number, it.address))
        .collect();
    TraceSummary {
        hops,
        destination_hop: fields.destination_hop,
        return_hops: baseline
            .basic()
            .and_then(|it| it.min_ttl_rev)
            .and_then(|ttl| bands.hops(ttl)),
    }
}

fn details(with_flows: bool, flows: &[&FlowRecord]) -> Vec<FlowDetail> {
    if !with_flows {
        return vec![];
    }
    flows
        .iter()
        .filter_map(|flow| match flow.to_detail() {
            Ok(detail) => Some(detail),
            Err(e) => {
                warn!("Leaving out details of flow {}: {}", flow.key, e);
                None
            }
        })
        .collect()
}
