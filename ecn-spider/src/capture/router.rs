use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::trace;
use parking_lot::RwLock;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::flow::FlowKey;
use crate::packet::{IcmpMessage, IpHeader, QuotedTcp, IPPROTO_TCP};

use super::ObservedPacket;

/// Hands captured packets to the worker owning their flow. Workers subscribe before
/// sending anything, so no reply can arrive for a flow nobody listens to yet.
#[derive(Default)]
pub struct PacketRouter {
    routes: RwLock<HashMap<FlowKey, Route>>,
    next_id: AtomicU64,
}

struct Route {
    subscription_id: u64,
    tx: UnboundedSender<ObservedPacket>,
}

/// Receiving end of one flow's packets. The route is removed when this is dropped.
pub struct FlowSubscription {
    key: FlowKey,
    id: u64,
    router: Arc<PacketRouter>,
    rx: UnboundedReceiver<ObservedPacket>,
}

impl PacketRouter {
    pub fn subscribe(self: &Arc<Self>, key: FlowKey) -> FlowSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let route = Route {
            subscription_id: id,
            tx,
        };
        if self.routes.write().insert(key, route).is_some() {
            trace!("Flow {} re-subscribed, previous subscriber won't see further packets", key);
        }
        FlowSubscription {
            key,
            id,
            router: Arc::clone(self),
            rx,
        }
    }

    /// Returns whether the packet belonged to a subscribed flow.
    pub fn route(&self, ip_bytes: &[u8], captured_at: DateTime<Utc>) -> bool {
        let Some((key, reverse)) = self.classify(ip_bytes) else {
            return false;
        };
        let routes = self.routes.read();
        let Some(route) = routes.get(&key) else {
            return false;
        };
        let packet = ObservedPacket {
            bytes: ip_bytes.to_vec(),
            reverse,
            captured_at,
        };
        route.tx.send(packet).is_ok()
    }

    pub fn active_flows(&self) -> usize {
        self.routes.read().len()
    }

    fn classify(&self, ip_bytes: &[u8]) -> Option<(FlowKey, bool)> {
        let ip = IpHeader::parse(ip_bytes)?;
        if ip.protocol == IPPROTO_TCP {
            let tcp = QuotedTcp::parse(ip.payload)?;
            let source = SocketAddr::new(ip.source, tcp.source_port);
            let destination = SocketAddr::new(ip.destination, tcp.destination_port);
            return self.match_either_way(source, destination);
        }
        if !ip.carries_icmp() {
            return None;
        }
        let icmp = IcmpMessage::parse(ip.payload)?;
        if !icmp.is_error(ip.is_v6()) {
            return None;
        }
        // the quote is of a packet we sent, so its source is our end of the flow
        let (quoted_ip, quoted_tcp) = icmp.quoted_tcp()?;
        let key = FlowKey {
            local: SocketAddr::new(quoted_ip.source, quoted_tcp.source_port),
            remote: SocketAddr::new(quoted_ip.destination, quoted_tcp.destination_port),
        };
        if !self.routes.read().contains_key(&key) {
            return None;
        }
        Some((key, ip.destination == key.local.ip()))
    }

    fn match_either_way(&self, source: SocketAddr, destination: SocketAddr) -> Option<(FlowKey, bool)> {
        let routes = self.routes.read();
        let outbound = FlowKey {
            local: source,
            remote: destination,
        };
        if routes.contains_key(&outbound) {
            return Some((outbound, false));
        }
        let inbound = FlowKey {
            local: destination,
            remote: source,
        };
        if routes.contains_key(&inbound) {
            return Some((inbound, true));
        }
        None
    }
}

impl FlowSubscription {
    pub async fn recv(&mut self) -> Option<ObservedPacket> {
        self.rx.recv().await
    }
}

impl Drop for FlowSubscription {
    fn drop(&mut self) {
        let mut routes = self.router.routes.write();
        // a later subscription for the same key replaced ours, leave it be
        if routes.get(&self.key).map_or(false, |it| it.subscription_id == self.id) {
            routes.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use assertor::*;

    use crate::packet::{flags, EcnCodepoint, SegmentSpec, ICMP4_TIME_EXCEEDED, INITIAL_SEQ};
    use crate::test_utils::*;

    use super::*;

    #[tokio::test]
    async fn tcp_both_ways() {
        // given
        let router = Arc::new(PacketRouter::default());
        let key = any_key();
        let mut sub = router.subscribe(key);
        let syn = SegmentSpec::syn(key.local, key.remote, 1, 0);
        let syn_ack = SegmentSpec {
            source: key.remote,
            destination: key.local,
            sequence: 9,
            acknowledgement: 2,
            flags: flags::SYN | flags::ACK,
        };
        // when
        router.route(&ipv4_tcp(&syn, 64, EcnCodepoint::NotEct), Utc::now());
        router.route(&ipv4_tcp(&syn_ack, 60, EcnCodepoint::NotEct), Utc::now());
        // then
        assert_that!(sub.recv().await.map(|it| it.reverse)).has_value(false);
        assert_that!(sub.recv().await.map(|it| it.reverse)).has_value(true);
    }

    #[test]
    fn icmp_routed_by_quote() {
        // given
        let router = Arc::new(PacketRouter::default());
        let key = any_key();
        let _sub = router.subscribe(key);
        let probe = SegmentSpec::syn(key.local, key.remote, INITIAL_SEQ, 0);
        let bytes = icmp4_quoting(ICMP4_TIME_EXCEEDED, "198.51.100.1", &probe, 1);
        // when
        let classified = router.classify(&bytes);
        // then
        assert_that!(classified).has_value((key, true));
    }

    #[test]
    fn unknown_flow_is_dropped() {
        // given
        let router = Arc::new(PacketRouter::default());
        let key = any_key();
        let other = FlowKey {
            local: sock("192.0.2.10:61001"),
            remote: key.remote,
        };
        let _sub = router.subscribe(other);
        let syn = SegmentSpec::syn(key.local, key.remote, 1, 0);
        // when
        let routed = router.route(&ipv4_tcp(&syn, 64, EcnCodepoint::NotEct), Utc::now());
        // then
        assert_that!(routed).is_false();
    }

    #[test]
    fn dropping_subscription_unregisters() {
        // given
        let router = Arc::new(PacketRouter::default());
        let sub = router.subscribe(any_key());
        assert_that!(router.active_flows()).is_equal_to(1);
        // when
        drop(sub);
        // then
        assert_that!(router.active_flows()).is_equal_to(0);
    }

    #[test]
    fn stale_drop_keeps_newer_subscription() {
        // given
        let router = Arc::new(PacketRouter::default());
        let old = router.subscribe(any_key());
        let _new = router.subscribe(any_key());
        // when
        drop(old);
        // then
        assert_that!(router.active_flows()).is_equal_to(1);
    }
}
