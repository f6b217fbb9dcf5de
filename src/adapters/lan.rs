use super::udp::{UdpSender};
use super::tcp::{self};

use crate::config::{Config};
use crate::transport::{Transport, Destination, SendStatus};
use crate::util::net::{self};

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration};
use std::io::{self};

/// Socket transport: UDP datagrams and one TCP connection per stream packet,
/// both to the well-known port of the node.
pub struct LanTransport {
    udp: UdpSender,
    port: u16,
    connect_timeout: Duration,
}

impl LanTransport {
    pub fn new(config: &Config) -> io::Result<Self> {
        let broadcast = net::broadcast_address(config.address);
        let udp = UdpSender::bind(
            config.listen_address,
            config.port,
            broadcast,
            config.transfer.max_packet_len,
        )?;
        log::debug!("Broadcast address for {} resolved to {}", config.address, broadcast);
        Ok(Self { udp, port: config.port, connect_timeout: config.connect_timeout })
    }

    pub fn broadcast_address(&self) -> Ipv4Addr {
        self.udp.broadcast_address()
    }
}

impl Transport for LanTransport {
    fn send_datagram(&self, destination: Destination, data: &str) -> SendStatus {
        let address = match destination {
            Destination::Unicast(address) => Some(address),
            Destination::Broadcast => None,
        };
        self.udp.send_to(address, data.as_bytes())
    }

    fn send_stream(&self, address: Ipv4Addr, data: &str) -> SendStatus {
        tcp::send(SocketAddrV4::new(address, self.port), data.as_bytes(), self.connect_timeout)
    }
}
