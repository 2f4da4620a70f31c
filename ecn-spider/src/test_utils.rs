use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use pnet::packet::ip::IpNextHeaderProtocol;
use pnet::packet::ipv4::{self, MutableIpv4Packet};
use pnet::packet::ipv6::MutableIpv6Packet;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capture::{ObservedPacket, PacketCapture, PacketRouter};
use crate::chain::{ChainSet, TtlBands};
use crate::coordinator::ResultOrder;
use crate::error::EngineError;
use crate::flow::{FlowKey, FlowRecord};
use crate::packet::{
    flags, EcnCodepoint, SegmentSpec, ICMP4_TIME_EXCEEDED, ICMP4_UNREACHABLE,
    ICMP6_TIME_EXCEEDED, ICMP6_UNREACHABLE, IPPROTO_ICMP, IPPROTO_ICMPV6, IPPROTO_TCP,
};
use crate::pool;
use crate::probe::{Probe, ProbeSender, Treatment};

pub fn sock(input: &str) -> SocketAddr {
    input.parse().expect(input)
}

pub fn any_key() -> FlowKey {
    FlowKey {
        local: sock("192.0.2.10:61000"),
        remote: sock("203.0.113.1:80"),
    }
}

pub fn any_key_v6() -> FlowKey {
    FlowKey {
        local: sock("[2001:db8::a]:61000"),
        remote: sock("[2001:db8::1]:443"),
    }
}

pub fn ipv4_wrap(
    source: Ipv4Addr,
    destination: Ipv4Addr,
    protocol: u8,
    ttl: u8,
    ecn: EcnCodepoint,
    payload: &[u8],
) -> Vec<u8> {
    let total = 20 + payload.len();
    let mut buf = vec![0u8; total];
    let mut ip = MutableIpv4Packet::new(&mut buf).expect("buffer fits header");
    ip.set_version(4);
    ip.set_header_length(5);
    ip.set_ecn(ecn.bits());
    ip.set_total_length(total as u16);
    ip.set_ttl(ttl);
    ip.set_next_level_protocol(IpNextHeaderProtocol(protocol));
    ip.set_source(source);
    ip.set_destination(destination);
    ip.set_payload(payload);
    let checksum = ipv4::checksum(&ip.to_immutable());
    ip.set_checksum(checksum);
    buf
}

pub fn ipv6_wrap(
    source: Ipv6Addr,
    destination: Ipv6Addr,
    next_header: u8,
    hop_limit: u8,
    ecn: EcnCodepoint,
    payload: &[u8],
) -> Vec<u8> {
    let mut buf = vec![0u8; 40 + payload.len()];
    let mut ip = MutableIpv6Packet::new(&mut buf).expect("buffer fits header");
    ip.set_version(6);
    ip.set_traffic_class(ecn.bits());
    ip.set_payload_length(payload.len() as u16);
    ip.set_next_header(IpNextHeaderProtocol(next_header));
    ip.set_hop_limit(hop_limit);
    ip.set_source(source);
    ip.set_destination(destination);
    ip.set_payload(payload);
    buf
}

pub fn ipv4_tcp(spec: &SegmentSpec, ttl: u8, ecn: EcnCodepoint) -> Vec<u8> {
    match (spec.source.ip(), spec.destination.ip()) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            ipv4_wrap(src, dst, IPPROTO_TCP, ttl, ecn, &spec.to_bytes())
        }
        _ => panic!("not a v4 segment: {:?}", spec),
    }
}

pub fn ipv6_tcp(spec: &SegmentSpec, hop_limit: u8, ecn: EcnCodepoint) -> Vec<u8> {
    match (spec.source.ip(), spec.destination.ip()) {
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            ipv6_wrap(src, dst, IPPROTO_TCP, hop_limit, ecn, &spec.to_bytes())
        }
        _ => panic!("not a v6 segment: {:?}", spec),
    }
}

/// Whichever of the two fits the segment's addresses.
pub fn ip_tcp(spec: &SegmentSpec, ttl: u8, ecn: EcnCodepoint) -> Vec<u8> {
    if spec.source.is_ipv6() {
        ipv6_tcp(spec, ttl, ecn)
    } else {
        ipv4_tcp(spec, ttl, ecn)
    }
}

fn icmp_header(icmp_type: u8) -> Vec<u8> {
    vec![icmp_type, 0, 0, 0, 0, 0, 0, 0]
}

/// ICMPv4 error from `router` back to the sender of `probe`, quoting the IP header and
/// the first eight bytes of TCP as most routers do.
pub fn icmp4_quoting(icmp_type: u8, router: &str, probe: &SegmentSpec, probe_ttl: u8) -> Vec<u8> {
    let mut quote = ipv4_tcp(probe, probe_ttl, EcnCodepoint::NotEct);
    quote.truncate(28);
    let mut message = icmp_header(icmp_type);
    message.extend_from_slice(&quote);
    let (IpAddr::V4(router), IpAddr::V4(target)) = (router.parse::<IpAddr>().expect(router), probe.source.ip())
    else {
        panic!("not a v4 probe: {:?}", probe);
    };
    ipv4_wrap(router, target, IPPROTO_ICMP, 250, EcnCodepoint::NotEct, &message)
}

/// ICMPv6 error from `router`, quoting the whole probe.
pub fn icmp6_quoting(icmp_type: u8, router: &str, probe: &SegmentSpec, probe_hop_limit: u8) -> Vec<u8> {
    let mut message = icmp_header(icmp_type);
    message.extend_from_slice(&ipv6_tcp(probe, probe_hop_limit, EcnCodepoint::NotEct));
    let (IpAddr::V6(router), IpAddr::V6(target)) = (router.parse::<IpAddr>().expect(router), probe.source.ip())
    else {
        panic!("not a v6 probe: {:?}", probe);
    };
    ipv6_wrap(router, target, IPPROTO_ICMPV6, 250, EcnCodepoint::NotEct, &message)
}

pub fn observed(bytes: Vec<u8>, reverse: bool) -> ObservedPacket {
    ObservedPacket {
        bytes,
        reverse,
        captured_at: Utc::now(),
    }
}

pub fn given_record(set: &ChainSet) -> FlowRecord {
    let mut record = FlowRecord::new(any_key(), Utc::now());
    set.init(&mut record);
    record
}

pub fn pool_params(workers: usize) -> pool::Params {
    pool::Params {
        workers,
        timeout_ms: 50,
        source_ip4: Some("192.0.2.10".parse().expect("v4")),
        source_ip6: Some("2001:db8::a".parse().expect("v6")),
        source_port_min: 61000,
        source_port_max: 61999,
        result_order: ResultOrder::Arrival,
        ttl_bands: TtlBands::default(),
    }
}

/// How a scripted destination (and the path to it) answers probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    /// SYN-ACK to everything; with ECE on ECN-setup SYNs if `ecn`.
    Accept { ecn: bool },
    Silent,
    Refuse,
    /// A router on the way reports it unreachable.
    Unreachable,
    /// `distance` hops away, each router on the way answers hop-limited probes.
    Path { distance: u8 },
}

type RouterSlot = Arc<Mutex<Option<Arc<PacketRouter>>>>;

#[derive(Debug, Clone, Copy)]
enum CaptureScript {
    Loopback,
    FailAtStart,
    FailAfter(Duration),
}

/// A fake network: probes go to a [ScriptedSender], which plays both the wire and the
/// destinations, injecting the probe & whatever replies it scripts straight into the
/// router of the current capture.
pub struct Script {
    behaviours: HashMap<IpAddr, Behaviour>,
    router: RouterSlot,
    sent: Arc<AtomicUsize>,
    capture: CaptureScript,
}

impl Script {
    pub fn new() -> Self {
        Self {
            behaviours: HashMap::new(),
            router: Arc::new(Mutex::new(None)),
            sent: Arc::new(AtomicUsize::new(0)),
            capture: CaptureScript::Loopback,
        }
    }

    pub fn with(mut self, destination: &str, behaviour: Behaviour) -> Self {
        self.behaviours
            .insert(destination.parse().expect(destination), behaviour);
        self
    }

    pub fn failing_capture(mut self) -> Self {
        self.capture = CaptureScript::FailAtStart;
        self
    }

    pub fn failing_capture_after(mut self, delay: Duration) -> Self {
        self.capture = CaptureScript::FailAfter(delay);
        self
    }

    pub fn sender(&self) -> Arc<dyn ProbeSender> {
        Arc::new(ScriptedSender {
            behaviours: self.behaviours.clone(),
            router: Arc::clone(&self.router),
            sent: Arc::clone(&self.sent),
        })
    }

    pub fn capture(&self) -> Arc<dyn PacketCapture> {
        Arc::new(ScriptedCapture {
            router: Arc::clone(&self.router),
            script: self.capture,
        })
    }

    pub fn probes_sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }
}

pub struct ScriptedSender {
    behaviours: HashMap<IpAddr, Behaviour>,
    router: RouterSlot,
    sent: Arc<AtomicUsize>,
}

impl ProbeSender for ScriptedSender {
    fn send(&self, probe: &Probe) -> Result<(), EngineError> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        let Some(router) = self.router.lock().clone() else {
            return Ok(());
        };
        let segment = probe.segment();
        let outbound_ttl = probe.treatment.ttl().unwrap_or(64);
        router.route(&ip_tcp(&segment, outbound_ttl, EcnCodepoint::NotEct), Utc::now());
        let behaviour = self
            .behaviours
            .get(&probe.flow.remote.ip())
            .copied()
            .unwrap_or(Behaviour::Silent);
        for reply in replies(behaviour, probe, &segment) {
            router.route(&reply, Utc::now());
        }
        Ok(())
    }
}

fn replies(behaviour: Behaviour, probe: &Probe, segment: &SegmentSpec) -> Vec<Vec<u8>> {
    match behaviour {
        Behaviour::Silent => vec![],
        Behaviour::Accept { ecn } => {
            let ece = if ecn && probe.treatment == Treatment::EcnSetup {
                flags::ECE
            } else {
                0
            };
            vec![answer(segment, flags::SYN | flags::ACK | ece, 58)]
        }
        Behaviour::Refuse => vec![answer(segment, flags::RST | flags::ACK, 58)],
        Behaviour::Unreachable => vec![router_error(segment, 254, false)],
        Behaviour::Path { distance } => match probe.treatment.ttl() {
            Some(ttl) if ttl < distance => vec![router_error(segment, ttl, true)],
            _ => vec![answer(segment, flags::SYN | flags::ACK, 65 - distance)],
        },
    }
}

fn answer(probe: &SegmentSpec, reply_flags: u8, ttl: u8) -> Vec<u8> {
    let reply = SegmentSpec {
        source: probe.destination,
        destination: probe.source,
        sequence: 777,
        acknowledgement: probe.sequence.wrapping_add(1),
        flags: reply_flags,
    };
    ip_tcp(&reply, ttl, EcnCodepoint::NotEct)
}

fn router_error(probe: &SegmentSpec, hop: u8, time_exceeded: bool) -> Vec<u8> {
    if probe.source.is_ipv6() {
        let icmp_type = if time_exceeded { ICMP6_TIME_EXCEEDED } else { ICMP6_UNREACHABLE };
        icmp6_quoting(icmp_type, &format!("2001:db8:ffff::{:x}", hop), probe, 1)
    } else {
        let icmp_type = if time_exceeded { ICMP4_TIME_EXCEEDED } else { ICMP4_UNREACHABLE };
        icmp4_quoting(icmp_type, &format!("198.51.100.{}", hop), probe, 1)
    }
}

struct ScriptedCapture {
    router: RouterSlot,
    script: CaptureScript,
}

impl PacketCapture for ScriptedCapture {
    fn start(
        &self,
        router: Arc<PacketRouter>,
        stop: CancellationToken,
    ) -> Result<JoinHandle<Result<(), EngineError>>, EngineError> {
        let failure = || EngineError::Capture {
            interface: "script0".to_string(),
            reason: "scripted failure".to_string(),
        };
        match self.script {
            CaptureScript::FailAtStart => Err(failure()),
            CaptureScript::FailAfter(delay) => Ok(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                Err(failure())
            })),
            CaptureScript::Loopback => {
                *self.router.lock() = Some(router);
                let slot = Arc::clone(&self.router);
                Ok(tokio::spawn(async move {
                    stop.cancelled().await;
                    slot.lock().take();
                    Ok(())
                }))
            }
        }
    }
}
