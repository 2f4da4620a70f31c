use serde::Serialize;
use spider_models::EcnState;

use crate::packet::{flags, EcnCodepoint, TcpHeader};

use super::{own_fields, Capabilities, Chain, ChainError, ChainFields, ChainId, PacketContext};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EcnFields {
    /// Flags of the first reverse SYN-ACK, if any.
    pub syn_ack_flags: Option<u8>,
    pub ect0_rev: bool,
    pub ect1_rev: bool,
    pub ce_rev: bool,
}

impl EcnFields {
    /// RFC 3168 6.1.1: an ECN-setup SYN-ACK has ECE set & CWR cleared.
    pub fn state(&self) -> EcnState {
        match self.syn_ack_flags {
            None => EcnState::Unknown,
            Some(it) if flags::has(it, flags::ECE) && !flags::has(it, flags::CWR) => {
                EcnState::Negotiated
            }
            Some(_) => EcnState::NotNegotiated,
        }
    }
}

pub struct EcnChain;

impl Chain for EcnChain {
    fn id(&self) -> ChainId {
        ChainId::Ecn
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            tcp: true,
            ..Default::default()
        }
    }

    fn new_flow(&self) -> ChainFields {
        ChainFields::Ecn(EcnFields::default())
    }

    fn tcp(
        &self,
        fields: &mut ChainFields,
        tcp: &TcpHeader,
        ctx: &PacketContext,
    ) -> Result<(), ChainError> {
        let it = own_fields!(fields, Ecn);
        if !ctx.reverse {
            return Ok(());
        }
        if tcp.is_syn_ack() {
            it.syn_ack_flags.get_or_insert(tcp.flags);
        }
        match ctx.ip.ecn {
            EcnCodepoint::Ect0 => it.ect0_rev = true,
            EcnCodepoint::Ect1 => it.ect1_rev = true,
            EcnCodepoint::Ce => it.ce_rev = true,
            EcnCodepoint::NotEct => {}
        }
        Ok(())
    }
}
