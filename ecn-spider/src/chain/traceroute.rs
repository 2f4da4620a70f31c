use std::collections::BTreeMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use log::trace;
use serde::Serialize;

use crate::packet::{
    flags, IcmpMessage, TcpHeader, ICMP4_TIME_EXCEEDED, ICMP6_TIME_EXCEEDED, INITIAL_SEQ,
};

use super::{own_fields, Capabilities, Chain, ChainError, ChainFields, ChainId, PacketContext};

/// Hop-limited probes are sent with TTLs of at most this much.
const MAX_HOP: u32 = u8::MAX as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HopEntry {
    pub hop_number: u32,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TracerouteFields {
    pub ttl_exceeded: bool,
    /// Keyed by the address of the router that sent the time-exceeded error. A router
    /// answering twice keeps its latest answer.
    pub hops: BTreeMap<IpAddr, HopEntry>,
    /// Destination of the probe as quoted by the last router, to spot rewriting middleboxes.
    pub echoed_destination: Option<IpAddr>,
    /// Smallest TTL that still made it to the destination, read off its acknowledgement.
    pub destination_hop: Option<u32>,
}

/// Hop distance of a probe from the sequence number it was sent with.
pub fn hop_from_sequence(sequence: u32) -> u32 {
    sequence.wrapping_sub(INITIAL_SEQ - 1)
}

pub struct TracerouteChain;

impl Chain for TracerouteChain {
    fn id(&self) -> ChainId {
        ChainId::Traceroute
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            tcp: true,
            icmp4: true,
            icmp6: true,
        }
    }

    fn new_flow(&self) -> ChainFields {
        ChainFields::Traceroute(TracerouteFields::default())
    }

    fn tcp(
        &self,
        fields: &mut ChainFields,
        tcp: &TcpHeader,
        ctx: &PacketContext,
    ) -> Result<(), ChainError> {
        let it = own_fields!(fields, Traceroute);
        if !ctx.reverse || !(tcp.is_syn_ack() || flags::has(tcp.flags, flags::RST)) {
            return Ok(());
        }
        // acknowledges INITIAL_SEQ + ttl - 1, plus one
        let hop = tcp.acknowledgement.wrapping_sub(INITIAL_SEQ);
        if (1..=MAX_HOP).contains(&hop) {
            it.destination_hop = Some(it.destination_hop.map_or(hop, |prev| prev.min(hop)));
        }
        Ok(())
    }

    fn icmp4(
        &self,
        fields: &mut ChainFields,
        icmp: &IcmpMessage,
        ctx: &PacketContext,
    ) -> Result<bool, ChainError> {
        record_hop(own_fields!(fields, Traceroute), icmp, ctx, ICMP4_TIME_EXCEEDED)
    }

    fn icmp6(
        &self,
        fields: &mut ChainFields,
        icmp: &IcmpMessage,
        ctx: &PacketContext,
    ) -> Result<bool, ChainError> {
        record_hop(own_fields!(fields, Traceroute), icmp, ctx, ICMP6_TIME_EXCEEDED)
    }
}

/// Time-exceeded errors only mean something on the way back to us.
fn record_hop(
    it: &mut TracerouteFields,
    icmp: &IcmpMessage,
    ctx: &PacketContext,
    time_exceeded_type: u8,
) -> Result<bool, ChainError> {
    if !ctx.reverse || icmp.icmp_type != time_exceeded_type {
        return Ok(false);
    }
    it.ttl_exceeded = true;
    let Some((quoted_ip, quoted_tcp)) = icmp.quoted_tcp() else {
        trace!("Time exceeded from {} quotes no TCP header, no hop recorded", ctx.ip.source);
        return Ok(true);
    };
    it.echoed_destination = Some(quoted_ip.destination);
    it.hops.insert(
        ctx.ip.source,
        HopEntry {
            hop_number: hop_from_sequence(quoted_tcp.sequence),
            captured_at: ctx.captured_at,
        },
    );
    Ok(true)
}
