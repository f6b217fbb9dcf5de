use crate::transport::{SendStatus};

use mio::net::{UdpSocket as MioUdpSocket};

use socket2::{Socket, Domain, Type, Protocol};

use std::net::{SocketAddr, SocketAddrV4, Ipv4Addr, UdpSocket};
use std::io::{self, ErrorKind};

/// Largest datagram that can be read.
/// Localhost can handle a bigger MTU than the internet so the whole UDP range is accepted.
pub const MAX_LOCAL_PAYLOAD_LEN: usize = 65535 - 20 - 8;
// - 20: max IP header
// - 8: max udp header

/// Creates the non-blocking socket where the datagrams of the node are received.
/// Broadcasts are only received if `addr` uses the unspecified address.
pub fn bind_listener(addr: SocketAddrV4) -> io::Result<MioUdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;
    socket.bind(&SocketAddr::V4(addr).into())?;

    Ok(MioUdpSocket::from_std(socket.into()))
}

/// Reads every pending datagram of a non-blocking socket.
/// `process_data` receives the text of each datagram and its source.
/// Datagrams that are not valid UTF-8 are dropped.
pub fn receive(
    socket: &MioUdpSocket,
    input_buffer: &mut [u8],
    mut process_data: impl FnMut(SocketAddr, &str),
) {
    loop {
        match socket.recv_from(input_buffer) {
            Ok((size, addr)) => match std::str::from_utf8(&input_buffer[..size]) {
                Ok(text) => process_data(addr, text),
                Err(_) => log::trace!("Dropped non UTF-8 datagram from {}", addr),
            },
            Err(ref err) if err.kind() == ErrorKind::WouldBlock => break,
            Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
            // Avoid ICMP generated error to be logged
            Err(ref err) if err.kind() == ErrorKind::ConnectionRefused => continue,
            Err(err) => break log::error!("UDP receive error: {}", err),
        }
    }
}

/// Blocking socket used to send every datagram of the node.
pub struct UdpSender {
    socket: UdpSocket,
    port: u16,
    broadcast: Ipv4Addr,
    max_payload_len: usize,
}

impl UdpSender {
    /// Binds an ephemeral port on `source` able to send broadcasts to `broadcast`.
    pub fn bind(
        source: Ipv4Addr,
        port: u16,
        broadcast: Ipv4Addr,
        max_payload_len: usize,
    ) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_broadcast(true)?;
        socket.bind(&SocketAddr::V4(SocketAddrV4::new(source, 0)).into())?;
        Ok(Self { socket: socket.into(), port, broadcast, max_payload_len })
    }

    pub fn broadcast_address(&self) -> Ipv4Addr {
        self.broadcast
    }

    /// Sends to `Some(address)` or broadcasts with `None`.
    pub fn send_to(&self, address: Option<Ipv4Addr>, data: &[u8]) -> SendStatus {
        if data.len() > self.max_payload_len {
            log::warn!("Datagram of {} bytes exceeds {}", data.len(), self.max_payload_len);
            return SendStatus::MaxPacketSizeExceeded(data.len(), self.max_payload_len)
        }
        let target = SocketAddrV4::new(address.unwrap_or(self.broadcast), self.port);
        send_packet(data, |data| self.socket.send_to(data, target))
    }
}

fn send_packet(data: &[u8], send_method: impl Fn(&[u8]) -> io::Result<usize>) -> SendStatus {
    loop {
        match send_method(data) {
            Ok(_) => break SendStatus::Sent,
            // Avoid ICMP generated error to be logged
            Err(ref err) if err.kind() == ErrorKind::ConnectionRefused => {
                break SendStatus::Unreachable
            }
            Err(ref err) if err.kind() == ErrorKind::WouldBlock => continue,
            Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                log::error!("UDP send error: {}", err);
                break SendStatus::Unreachable
            }
        }
    }
}
