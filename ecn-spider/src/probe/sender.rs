use std::io;
use std::net::{IpAddr, SocketAddr};

use log::trace;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::error::EngineError;

use super::{Probe, ProbeSender};

/// Sends each probe through a fresh raw TCP socket bound to the flow's local address;
/// the kernel adds the IP header. Needs CAP_NET_RAW.
///
/// Nothing listens on the local port, so the kernel answers a SYN-ACK with a RST of
/// its own. That is fine, the SYN-ACK has been captured by then.
#[derive(Debug, Default)]
pub struct RawSender;

impl ProbeSender for RawSender {
    fn send(&self, probe: &Probe) -> Result<(), EngineError> {
        let local = probe.flow.local.ip();
        let socket = open_socket(local, probe.treatment.ttl())?;
        let segment = probe.segment().to_bytes();
        trace!("Sending {:?} probe on {}", probe.treatment, probe.flow);
        // raw sockets take no port, and v6 ones refuse anything but zero
        let target = SockAddr::from(SocketAddr::new(probe.flow.remote.ip(), 0));
        socket
            .send_to(&segment, &target)
            .map_err(|source| EngineError::Send {
                destination: probe.flow.remote,
                source,
            })?;
        Ok(())
    }
}

fn open_socket(local: IpAddr, ttl: Option<u8>) -> Result<Socket, EngineError> {
    let domain = match local {
        IpAddr::V4(_) => Domain::IPV4,
        IpAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::RAW, Some(Protocol::TCP))
        .map_err(socket_error("open"))?;
    socket
        .bind(&SockAddr::from(SocketAddr::new(local, 0)))
        .map_err(socket_error("bind"))?;
    if let Some(ttl) = ttl {
        match local {
            IpAddr::V4(_) => socket.set_ttl(ttl as u32),
            IpAddr::V6(_) => socket.set_unicast_hops_v6(ttl as u32),
        }
        .map_err(socket_error("limit hops on"))?;
    }
    Ok(socket)
}

fn socket_error(action: &'static str) -> impl FnOnce(io::Error) -> EngineError {
    move |source| EngineError::Socket { action, source }
}
