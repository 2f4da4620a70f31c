use serde::Serialize;

use crate::packet::{flags, IcmpMessage, TcpHeader, ICMP4_UNREACHABLE, ICMP6_UNREACHABLE};

use super::{own_fields, Capabilities, Chain, ChainError, ChainFields, ChainId, PacketContext};

/// TCP flags of one direction. `init` is the first segment seen, `syn` the first one
/// carrying SYN (SYN-ACK on the reverse path), `union` everything OR-ed together.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DirectionFlags {
    pub init: Option<u8>,
    pub syn: Option<u8>,
    pub union: u8,
}

impl DirectionFlags {
    fn observe(&mut self, value: u8) {
        self.init.get_or_insert(value);
        if flags::has(value, flags::SYN) {
            self.syn.get_or_insert(value);
        }
        self.union |= value;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BasicFields {
    pub fwd: DirectionFlags,
    pub rev: DirectionFlags,
    pub syn_ack_seen: bool,
    pub rst_seen: bool,
    /// Only counts TCP from the destination, ICMP from routers on the way has its own TTL.
    pub min_ttl_rev: Option<u8>,
    pub icmp_unreachable: bool,
}

impl BasicFields {
    pub fn is_resolved(&self) -> bool {
        self.syn_ack_seen || self.rst_seen || self.icmp_unreachable
    }
}

pub struct BasicChain;

impl Chain for BasicChain {
    fn id(&self) -> ChainId {
        ChainId::Basic
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            tcp: true,
            icmp4: true,
            icmp6: true,
        }
    }

    fn new_flow(&self) -> ChainFields {
        ChainFields::Basic(BasicFields::default())
    }

    fn tcp(
        &self,
        fields: &mut ChainFields,
        tcp: &TcpHeader,
        ctx: &PacketContext,
    ) -> Result<(), ChainError> {
        let it = own_fields!(fields, Basic);
        if !ctx.reverse {
            it.fwd.observe(tcp.flags);
            return Ok(());
        }
        it.rev.observe(tcp.flags);
        it.syn_ack_seen |= tcp.is_syn_ack();
        it.rst_seen |= flags::has(tcp.flags, flags::RST);
        it.min_ttl_rev = Some(match it.min_ttl_rev {
            Some(prev) => prev.min(ctx.ip.ttl),
            None => ctx.ip.ttl,
        });
        Ok(())
    }

    fn icmp4(
        &self,
        fields: &mut ChainFields,
        icmp: &IcmpMessage,
        ctx: &PacketContext,
    ) -> Result<bool, ChainError> {
        mark_unreachable(own_fields!(fields, Basic), icmp, ctx, ICMP4_UNREACHABLE)
    }

    fn icmp6(
        &self,
        fields: &mut ChainFields,
        icmp: &IcmpMessage,
        ctx: &PacketContext,
    ) -> Result<bool, ChainError> {
        mark_unreachable(own_fields!(fields, Basic), icmp, ctx, ICMP6_UNREACHABLE)
    }
}

fn mark_unreachable(
    it: &mut BasicFields,
    icmp: &IcmpMessage,
    ctx: &PacketContext,
    unreachable_type: u8,
) -> Result<bool, ChainError> {
    if !ctx.reverse || icmp.icmp_type != unreachable_type {
        return Ok(false);
    }
    it.icmp_unreachable = true;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use assertor::*;

    use crate::chain::ChainSet;
    use crate::packet::{EcnCodepoint, SegmentSpec, ICMP4_UNREACHABLE};
    use crate::test_utils::*;

    use super::*;

    #[test]
    fn handshake_flags_per_direction() {
        // given
        let set = ChainSet::for_ecn();
        let mut record = given_record(&set);
        let key = any_key();
        let syn = SegmentSpec::syn(key.local, key.remote, 1, flags::ECE | flags::CWR);
        let syn_ack = SegmentSpec {
            source: key.remote,
            destination: key.local,
            sequence: 5,
            acknowledgement: 2,
            flags: flags::SYN | flags::ACK,
        };
        let rst = SegmentSpec { flags: flags::RST, ..syn_ack };
        // when
        set.observe(&mut record, &observed(ipv4_tcp(&syn, 64, EcnCodepoint::NotEct), false));
        set.observe(&mut record, &observed(ipv4_tcp(&syn_ack, 57, EcnCodepoint::NotEct), true));
        set.observe(&mut record, &observed(ipv4_tcp(&rst, 51, EcnCodepoint::NotEct), true));
        // then
        let basic = record.basic().unwrap();
        assert_that!(basic.fwd.init).has_value(0xc2);
        assert_that!(basic.fwd.syn).has_value(0xc2);
        assert_that!(basic.rev.init).has_value(0x12);
        assert_that!(basic.rev.syn).has_value(0x12);
        assert_that!(basic.rev.union).is_equal_to(0x16);
        assert_that!(basic.min_ttl_rev).has_value(51);
        assert_that!(basic.syn_ack_seen).is_true();
        assert_that!(basic.rst_seen).is_true();
        assert_that!(basic.icmp_unreachable).is_false();
    }

    #[test]
    fn reverse_unreachable_resolves_flow() {
        // given
        let set = ChainSet::for_ecn();
        let mut record = given_record(&set);
        let key = any_key();
        let probe = SegmentSpec::syn(key.local, key.remote, 1, 0);
        let bytes = icmp4_quoting(ICMP4_UNREACHABLE, "198.51.100.1", &probe, 64);
        // when
        let matched = set.observe(&mut record, &observed(bytes, true));
        // then
        assert_that!(matched).is_true();
        assert_that!(record.is_resolved()).is_true();
        assert_that!(record.is_completed()).is_false();
        assert_that!(record.basic().unwrap().min_ttl_rev).is_none();
    }

    #[test]
    fn forward_unreachable_is_ignored() {
        // given
        let set = ChainSet::for_ecn();
        let mut record = given_record(&set);
        let key = any_key();
        let probe = SegmentSpec::syn(key.local, key.remote, 1, 0);
        let bytes = icmp4_quoting(ICMP4_UNREACHABLE, "198.51.100.1", &probe, 64);
        // when
        let matched = set.observe(&mut record, &observed(bytes, false));
        // then
        assert_that!(matched).is_false();
        assert_that!(record.is_resolved()).is_false();
    }
}
