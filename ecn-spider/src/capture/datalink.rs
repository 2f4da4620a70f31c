use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, trace};
use pnet::datalink::{self, Channel, DataLinkReceiver};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;

use super::{PacketCapture, PacketRouter};

/// How often the capture thread gets to look at its stop token when the link is quiet.
const READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Captures every frame on an Ethernet interface through a pnet datalink channel,
/// on a blocking thread of its own.
#[derive(Debug)]
pub struct DatalinkCapture {
    interface: String,
}

impl DatalinkCapture {
    pub fn new(interface: String) -> Self {
        Self { interface }
    }

    fn capture_error(&self, reason: impl ToString) -> EngineError {
        EngineError::Capture {
            interface: self.interface.clone(),
            reason: reason.to_string(),
        }
    }
}

impl PacketCapture for DatalinkCapture {
    fn start(
        &self,
        router: Arc<PacketRouter>,
        stop: CancellationToken,
    ) -> Result<JoinHandle<Result<(), EngineError>>, EngineError> {
        let interface = datalink::interfaces()
            .into_iter()
            .find(|it| it.name == self.interface)
            .ok_or_else(|| self.capture_error("no such interface"))?;
        let config = datalink::Config {
            read_timeout: Some(READ_TIMEOUT),
            ..Default::default()
        };
        let rx = match datalink::channel(&interface, config) {
            Ok(Channel::Ethernet(_, rx)) => rx,
            Ok(_) => return Err(self.capture_error("not an Ethernet channel")),
            Err(e) => return Err(self.capture_error(e)),
        };
        info!("Capturing on {}", self.interface);
        let name = self.interface.clone();
        Ok(tokio::task::spawn_blocking(move || {
            receive_until_stopped(rx, &router, &stop).map_err(|e| EngineError::Capture {
                interface: name,
                reason: e.to_string(),
            })
        }))
    }
}

fn receive_until_stopped(
    mut rx: Box<dyn DataLinkReceiver>,
    router: &PacketRouter,
    stop: &CancellationToken,
) -> io::Result<()> {
    let mut routed: u64 = 0;
    while !stop.is_cancelled() {
        match rx.next() {
            Ok(frame) => {
                if let Some(ip) = ip_payload(frame) {
                    if router.route(ip, Utc::now()) {
                        routed += 1;
                    }
                } else {
                    trace!("Skipping non-IP frame of {} bytes", frame.len());
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    debug!("Capture stopped after routing {} packets", routed);
    Ok(())
}

fn ip_payload(frame: &[u8]) -> Option<&[u8]> {
    let ethertype = EthernetPacket::new(frame)?.get_ethertype();
    if ethertype == EtherTypes::Ipv4 || ethertype == EtherTypes::Ipv6 {
        frame.get(EthernetPacket::minimum_packet_size()..)
    } else {
        None
    }
}
