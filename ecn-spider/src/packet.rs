//! Read-only views over captured IP packets & construction of the TCP segments we send.
//!
//! Nothing in here panics on short or garbage input; a view that cannot be read is `None`.

use std::net::{IpAddr, SocketAddr};

use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_ICMPV6: u8 = 58;

pub const ICMP4_UNREACHABLE: u8 = 3;
pub const ICMP4_TIME_EXCEEDED: u8 = 11;
pub const ICMP6_UNREACHABLE: u8 = 1;
pub const ICMP6_TIME_EXCEEDED: u8 = 3;

/// Sequence number of a hop-limited probe sent with TTL 1. A probe sent with TTL `n`
/// carries `INITIAL_SEQ + n - 1`, which routers quote back to us in time-exceeded errors.
pub const INITIAL_SEQ: u32 = 10000;

const TCP_HEADER_LEN: usize = 20;
const ICMP_HEADER_LEN: usize = 8;
const IPV6_HEADER_LEN: usize = 40;

pub mod flags {
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const ACK: u8 = 0x10;
    pub const ECE: u8 = 0x40;
    pub const CWR: u8 = 0x80;

    pub fn has(value: u8, mask: u8) -> bool {
        value & mask == mask
    }
}

/// The two ECN bits of the IP traffic class / TOS byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcnCodepoint {
    NotEct,
    Ect1,
    Ect0,
    Ce,
}

impl EcnCodepoint {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0b01 => Self::Ect1,
            0b10 => Self::Ect0,
            0b11 => Self::Ce,
            _ => Self::NotEct,
        }
    }

    #[cfg(test)]
    pub fn bits(&self) -> u8 {
        match self {
            Self::NotEct => 0b00,
            Self::Ect1 => 0b01,
            Self::Ect0 => 0b10,
            Self::Ce => 0b11,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpHeader<'a> {
    pub source: IpAddr,
    pub destination: IpAddr,
    /// TTL for v4, hop limit for v6.
    pub ttl: u8,
    pub ecn: EcnCodepoint,
    /// Protocol for v4, next header for v6. Extension headers are not followed.
    pub protocol: u8,
    /// Whatever follows the header, cut at the advertised length if the capture
    /// has that much. Quoted packets are usually truncated.
    pub payload: &'a [u8],
}

impl<'a> IpHeader<'a> {
    pub fn parse(bytes: &'a [u8]) -> Option<Self> {
        match bytes.first()? >> 4 {
            4 => Self::parse_v4(bytes),
            6 => Self::parse_v6(bytes),
            _ => None,
        }
    }

    fn parse_v4(bytes: &'a [u8]) -> Option<Self> {
        let packet = Ipv4Packet::new(bytes)?;
        let header_len = packet.get_header_length() as usize * 4;
        if header_len < Ipv4Packet::minimum_packet_size() || header_len > bytes.len() {
            return None;
        }
        let end = (packet.get_total_length() as usize).clamp(header_len, bytes.len());
        Some(Self {
            source: IpAddr::V4(packet.get_source()),
            destination: IpAddr::V4(packet.get_destination()),
            ttl: packet.get_ttl(),
            ecn: EcnCodepoint::from_bits(packet.get_ecn()),
            protocol: packet.get_next_level_protocol().0,
            payload: &bytes[header_len..end],
        })
    }

    fn parse_v6(bytes: &'a [u8]) -> Option<Self> {
        let packet = Ipv6Packet::new(bytes)?;
        let end = (IPV6_HEADER_LEN + packet.get_payload_length() as usize)
            .min(bytes.len());
        Some(Self {
            source: IpAddr::V6(packet.get_source()),
            destination: IpAddr::V6(packet.get_destination()),
            ttl: packet.get_hop_limit(),
            ecn: EcnCodepoint::from_bits(packet.get_traffic_class()),
            protocol: packet.get_next_header().0,
            payload: &bytes[IPV6_HEADER_LEN..end],
        })
    }

    pub fn is_v6(&self) -> bool {
        self.source.is_ipv6()
    }

    pub fn carries_icmp(&self) -> bool {
        match self.source {
            IpAddr::V4(_) => self.protocol == IPPROTO_ICMP,
            IpAddr::V6(_) => self.protocol == IPPROTO_ICMPV6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub source_port: u16,
    pub destination_port: u16,
    pub sequence: u32,
    pub acknowledgement: u32,
    pub flags: u8,
}

impl TcpHeader {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < TCP_HEADER_LEN {
            return None;
        }
        Some(Self {
            source_port: read_u16(bytes, 0),
            destination_port: read_u16(bytes, 2),
            sequence: read_u32(bytes, 4),
            acknowledgement: read_u32(bytes, 8),
            flags: bytes[13],
        })
    }

    pub fn is_syn_ack(&self) -> bool {
        flags::has(self.flags, flags::SYN | flags::ACK)
    }
}

/// The first eight bytes of a TCP header, which is all an ICMPv4 error is required
/// to quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotedTcp {
    pub source_port: u16,
    pub destination_port: u16,
    pub sequence: u32,
}

impl QuotedTcp {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 8 {
            return None;
        }
        Some(Self {
            source_port: read_u16(bytes, 0),
            destination_port: read_u16(bytes, 2),
            sequence: read_u32(bytes, 4),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpMessage<'a> {
    pub icmp_type: u8,
    pub code: u8,
    /// The offending datagram as quoted by the sender of the error, if any.
    pub quoted: &'a [u8],
}

impl<'a> IcmpMessage<'a> {
    pub fn parse(bytes: &'a [u8]) -> Option<Self> {
        if bytes.len() < ICMP_HEADER_LEN {
            return None;
        }
        Some(Self {
            icmp_type: bytes[0],
            code: bytes[1],
            quoted: &bytes[ICMP_HEADER_LEN..],
        })
    }

    pub fn quoted_ip(&self) -> Option<IpHeader<'a>> {
        IpHeader::parse(self.quoted)
    }

    /// The quoted IP header & the start of the quoted TCP header, if the error
    /// is about a TCP segment.
    pub fn quoted_tcp(&self) -> Option<(IpHeader<'a>, QuotedTcp)> {
        let ip = self.quoted_ip()?;
        if ip.protocol != IPPROTO_TCP {
            return None;
        }
        let tcp = QuotedTcp::parse(ip.payload)?;
        Some((ip, tcp))
    }

    /// Error messages quote the datagram that caused them, informational ones don't.
    pub fn is_error(&self, v6: bool) -> bool {
        if v6 {
            self.icmp_type < 128
        } else {
            matches!(self.icmp_type, 3 | 4 | 5 | 11 | 12)
        }
    }
}

/// Fields of an option-less TCP segment, enough to express probes and the
/// replies we expect to them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSpec {
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub sequence: u32,
    pub acknowledgement: u32,
    pub flags: u8,
}

impl SegmentSpec {
    pub fn syn(source: SocketAddr, destination: SocketAddr, sequence: u32, extra_flags: u8) -> Self {
        Self {
            source,
            destination,
            sequence,
            acknowledgement: 0,
            flags: flags::SYN | extra_flags,
        }
    }

    /// The TCP header with a valid checksum, without an IP header.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut segment = vec![0u8; TCP_HEADER_LEN];
        segment[0..2].copy_from_slice(&self.source.port().to_be_bytes());
        segment[2..4].copy_from_slice(&self.destination.port().to_be_bytes());
        segment[4..8].copy_from_slice(&self.sequence.to_be_bytes());
        segment[8..12].copy_from_slice(&self.acknowledgement.to_be_bytes());
        segment[12] = 0x50; // data offset: 5 words
        segment[13] = self.flags;
        segment[14..16].copy_from_slice(&65535u16.to_be_bytes());
        let checksum = tcp_checksum(&segment, self.source.ip(), self.destination.ip());
        segment[16..18].copy_from_slice(&checksum.to_be_bytes());
        segment
    }
}

/// RFC 793 checksum over the pseudo-header & segment, skipping the checksum field itself.
/// Mixed address families have no pseudo-header and yield zero.
pub fn tcp_checksum(segment: &[u8], source: IpAddr, destination: IpAddr) -> u16 {
    let mut sum: u32 = match (source, destination) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            sum_words(&src.octets()) + sum_words(&dst.octets())
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            sum_words(&src.octets()) + sum_words(&dst.octets())
        }
        _ => return 0,
    };
    sum += IPPROTO_TCP as u32;
    sum += segment.len() as u32;

    for (i, chunk) in segment.chunks(2).enumerate() {
        if i == 8 {
            continue;
        }
        sum += match chunk {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]) as u32,
            [hi] => (*hi as u32) << 8,
            _ => 0,
        };
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

fn sum_words(bytes: &[u8]) -> u32 {
    bytes
        .chunks(2)
        .map(|it| u16::from_be_bytes([it[0], *it.get(1).unwrap_or(&0)]) as u32)
        .sum()
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}
