use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use spider_models::FlowDetail;

use crate::chain::basic::BasicFields;
use crate::chain::ecn::EcnFields;
use crate::chain::traceroute::TracerouteFields;
use crate::chain::{ChainFields, ChainId};

/// Identifies one probe connection. `local` is always our side, regardless of which
/// direction a packet travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

impl Display for FlowKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.local, self.remote)
    }
}

/// State of one flow, split into disjoint slots owned by the chain of the same id.
/// Owned by the worker driving the flow and consumed once it is folded into a result.
#[derive(Debug, Clone)]
pub struct FlowRecord {
    pub key: FlowKey,
    pub first_seen: DateTime<Utc>,
    slots: HashMap<ChainId, ChainFields>,
}

impl FlowRecord {
    pub fn new(key: FlowKey, first_seen: DateTime<Utc>) -> Self {
        Self {
            key,
            first_seen,
            slots: HashMap::new(),
        }
    }

    /// Replaces the slot of the chain that owns `fields`.
    pub fn put(&mut self, fields: ChainFields) {
        self.slots.insert(fields.chain_id(), fields);
    }

    pub fn slot(&self, id: ChainId) -> Option<&ChainFields> {
        self.slots.get(&id)
    }

    pub(crate) fn slot_mut(&mut self, id: ChainId) -> Option<&mut ChainFields> {
        self.slots.get_mut(&id)
    }

    pub fn basic(&self) -> Option<&BasicFields> {
        match self.slot(ChainId::Basic) {
            Some(ChainFields::Basic(it)) => Some(it),
            _ => None,
        }
    }

    pub fn ecn(&self) -> Option<&EcnFields> {
        match self.slot(ChainId::Ecn) {
            Some(ChainFields::Ecn(it)) => Some(it),
            _ => None,
        }
    }

    pub fn traceroute(&self) -> Option<&TracerouteFields> {
        match self.slot(ChainId::Traceroute) {
            Some(ChainFields::Traceroute(it)) => Some(it),
            _ => None,
        }
    }

    /// Reverse SYN-ACK seen, i.e. the destination accepted the connection.
    pub fn is_completed(&self) -> bool {
        self.basic().map_or(false, |it| it.syn_ack_seen)
    }

    /// Nothing more is expected on this flow: accepted, reset or reported unreachable.
    pub fn is_resolved(&self) -> bool {
        self.basic().map_or(false, BasicFields::is_resolved)
    }

    pub fn to_detail(&self) -> Result<FlowDetail, serde_json::Error> {
        let mut chains = BTreeMap::new();
        for (id, fields) in self.slots.iter() {
            chains.insert(id.to_string(), fields.to_json()?);
        }
        Ok(FlowDetail {
            source: self.key.local,
            destination: self.key.remote,
            first_seen: self.first_seen,
            chains,
        })
    }
}
