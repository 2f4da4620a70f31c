use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{trace, warn};
use serde::Serialize;
use strum::Display;
use thiserror::Error;

use crate::capture::ObservedPacket;
use crate::flow::FlowRecord;
use crate::packet::{IcmpMessage, IpHeader, TcpHeader, IPPROTO_TCP};

pub use self::ttl::TtlBands;

/// Connection outcome & per-direction TCP flags.
pub mod basic;
/// ECN negotiation as seen on the reverse SYN-ACK.
pub mod ecn;
/// Hop discovery from ICMP time-exceeded quotes.
pub mod traceroute;
mod ttl;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ChainId {
    Basic,
    Ecn,
    Traceroute,
}

/// The slot a chain owns in a [FlowRecord].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ChainFields {
    Basic(basic::BasicFields),
    Ecn(ecn::EcnFields),
    Traceroute(traceroute::TracerouteFields),
}

impl ChainFields {
    pub fn chain_id(&self) -> ChainId {
        match self {
            Self::Basic(_) => ChainId::Basic,
            Self::Ecn(_) => ChainId::Ecn,
            Self::Traceroute(_) => ChainId::Traceroute,
        }
    }

    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// Which callbacks a chain wants to receive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub tcp: bool,
    pub icmp4: bool,
    pub icmp6: bool,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ChainError {
    #[error("{chain} chain was handed the fields of the {got} chain")]
    ForeignFields { chain: ChainId, got: ChainId },
}

/// Everything about a packet that isn't its transport header.
#[derive(Debug, Clone)]
pub struct PacketContext<'a> {
    pub ip: &'a IpHeader<'a>,
    pub reverse: bool,
    pub captured_at: DateTime<Utc>,
}

/// A stateful packet classifier. Holds no per-flow state itself, all of that lives in
/// the slot it creates with [Chain::new_flow].
///
/// Callbacks only ever receive the chain's own slot. If a callback fails, the slot is
/// restored to what it was before the call.
pub trait Chain: Send + Sync {
    fn id(&self) -> ChainId;

    fn capabilities(&self) -> Capabilities;

    /// Fresh slot for a new flow. Called again for the same flow, it simply starts over.
    fn new_flow(&self) -> ChainFields;

    fn tcp(
        &self,
        _fields: &mut ChainFields,
        _tcp: &TcpHeader,
        _ctx: &PacketContext,
    ) -> Result<(), ChainError> {
        Ok(())
    }

    /// Returns whether the message was recognised by this chain.
    fn icmp4(
        &self,
        _fields: &mut ChainFields,
        _icmp: &IcmpMessage,
        _ctx: &PacketContext,
    ) -> Result<bool, ChainError> {
        Ok(false)
    }

    fn icmp6(
        &self,
        _fields: &mut ChainFields,
        _icmp: &IcmpMessage,
        _ctx: &PacketContext,
    ) -> Result<bool, ChainError> {
        Ok(false)
    }
}

/// Which chains a measurement mode attaches to each of its flows.
#[derive(Clone)]
pub struct ChainSet {
    chains: Vec<Arc<dyn Chain>>,
}

impl ChainSet {
    pub fn new(chains: Vec<Arc<dyn Chain>>) -> Self {
        Self { chains }
    }

    pub fn for_ecn() -> Self {
        Self::new(vec![Arc::new(basic::BasicChain), Arc::new(ecn::EcnChain)])
    }

    pub fn for_traceroute() -> Self {
        Self::new(vec![
            Arc::new(basic::BasicChain),
            Arc::new(traceroute::TracerouteChain),
        ])
    }

    pub fn init(&self, record: &mut FlowRecord) {
        for chain in self.chains.iter() {
            record.put(chain.new_flow());
        }
    }

    /// Hands one captured packet to every interested chain. Returns whether any chain
    /// recognised it as an ICMP message meant for it.
    pub fn observe(&self, record: &mut FlowRecord, packet: &ObservedPacket) -> bool {
        let ip = match IpHeader::parse(&packet.bytes) {
            Some(ip) => ip,
            None => {
                trace!("Unreadable packet on flow {}", record.key);
                return false;
            }
        };
        let ctx = PacketContext {
            ip: &ip,
            reverse: packet.reverse,
            captured_at: packet.captured_at,
        };
        if ip.protocol == IPPROTO_TCP {
            if let Some(tcp) = TcpHeader::parse(ip.payload) {
                self.dispatch(record, |caps| caps.tcp, |chain, fields| {
                    chain.tcp(fields, &tcp, &ctx).map(|_| false)
                });
            }
            return false;
        }
        if !ip.carries_icmp() {
            return false;
        }
        let Some(icmp) = IcmpMessage::parse(ip.payload) else {
            return false;
        };
        if ip.is_v6() {
            self.dispatch(record, |caps| caps.icmp6, |chain, fields| {
                chain.icmp6(fields, &icmp, &ctx)
            })
        } else {
            self.dispatch(record, |caps| caps.icmp4, |chain, fields| {
                chain.icmp4(fields, &icmp, &ctx)
            })
        }
    }

    fn dispatch(
        &self,
        record: &mut FlowRecord,
        wants: impl Fn(&Capabilities) -> bool,
        call: impl Fn(&dyn Chain, &mut ChainFields) -> Result<bool, ChainError>,
    ) -> bool {
        let mut matched = false;
        for chain in self.chains.iter().filter(|it| wants(&it.capabilities())) {
            let id = chain.id();
            if record.slot(id).is_none() {
                record.put(chain.new_flow());
            }
            let Some(slot) = record.slot_mut(id) else {
                continue;
            };
            let before = slot.clone();
            match call(chain.as_ref(), slot) {
                Ok(hit) => matched |= hit,
                Err(e) => {
                    warn!("Discarding update of {} chain on flow {}: {}", id, record.key, e);
                    record.put(before);
                }
            }
        }
        matched
    }
}

/// Borrows the chain's own variant out of a slot, or complains.
macro_rules! own_fields {
    ($fields: expr, $variant: ident) => {
        match $fields {
            $crate::chain::ChainFields::$variant(it) => it,
            other => {
                return Err($crate::chain::ChainError::ForeignFields {
                    chain: $crate::chain::ChainId::$variant,
                    got: other.chain_id(),
                })
            }
        }
    };
}
pub(crate) use own_fields;

#[cfg(test)]
mod tests {
    use assertor::*;

    use crate::packet::{flags, EcnCodepoint, SegmentSpec};
    use crate::test_utils::*;

    use super::basic::BasicFields;
    use super::*;

    /// Scribbles over its slot and then fails, on every TCP segment.
    struct ScribblingChain;

    impl Chain for ScribblingChain {
        fn id(&self) -> ChainId {
            ChainId::Traceroute
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities { tcp: true, ..Default::default() }
        }

        fn new_flow(&self) -> ChainFields {
            ChainFields::Traceroute(Default::default())
        }

        fn tcp(
            &self,
            fields: &mut ChainFields,
            _tcp: &TcpHeader,
            _ctx: &PacketContext,
        ) -> Result<(), ChainError> {
            let it = own_fields!(fields, Traceroute);
            it.ttl_exceeded = true;
            it.destination_hop = Some(99);
            Err(ChainError::ForeignFields {
                chain: ChainId::Traceroute,
                got: ChainId::Basic,
            })
        }
    }

    fn syn_ack_from_destination() -> ObservedPacket {
        let spec = SegmentSpec {
            source: any_key().remote,
            destination: any_key().local,
            sequence: 1,
            acknowledgement: 2,
            flags: flags::SYN | flags::ACK,
        };
        observed(ipv4_tcp(&spec, 60, EcnCodepoint::NotEct), true)
    }

    #[test]
    fn failing_chain_is_rolled_back_and_isolated() {
        // given
        let set = ChainSet::new(vec![Arc::new(basic::BasicChain), Arc::new(ScribblingChain)]);
        let mut record = given_record(&set);
        // when
        set.observe(&mut record, &syn_ack_from_destination());
        // then
        assert_that!(record.is_completed()).is_true();
        let trace = record.traceroute().unwrap();
        assert_that!(trace.ttl_exceeded).is_false();
        assert_that!(trace.destination_hop).is_none();
    }

    #[test]
    fn init_twice_is_a_fresh_start() {
        // given
        let set = ChainSet::for_traceroute();
        let mut record = given_record(&set);
        set.observe(&mut record, &syn_ack_from_destination());
        // when
        set.init(&mut record);
        set.init(&mut record);
        // then
        assert_that!(record.basic().unwrap()).is_equal_to(&BasicFields::default());
        assert_that!(record.traceroute().unwrap().ttl_exceeded).is_false();
    }

    #[test]
    fn foreign_fields_are_refused() {
        // given
        let mut fields = ChainFields::Basic(BasicFields::default());
        let ip_bytes = ipv4_tcp(&SegmentSpec::syn(any_key().local, any_key().remote, 1, 0), 64, EcnCodepoint::NotEct);
        let ip = IpHeader::parse(&ip_bytes).unwrap();
        let tcp = TcpHeader::parse(ip.payload).unwrap();
        let ctx = PacketContext { ip: &ip, reverse: false, captured_at: Utc::now() };
        // when
        let res = ecn::EcnChain.tcp(&mut fields, &tcp, &ctx);
        // then
        assert_that!(res).is_equal_to(Err(ChainError::ForeignFields {
            chain: ChainId::Ecn,
            got: ChainId::Basic,
        }));
    }

    #[test]
    fn garbage_is_ignored() {
        // given
        let set = ChainSet::for_ecn();
        let mut record = given_record(&set);
        // when
        let matched = set.observe(&mut record, &observed(vec![0x45, 0, 1], true));
        // then
        assert_that!(matched).is_false();
        assert_that!(record.basic().unwrap()).is_equal_to(&BasicFields::default());
    }
}
