use crate::packet::{Packet, Channel};

use std::net::{Ipv4Addr};

/// Where a datagram is sent.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Destination {
    Unicast(Ipv4Addr),
    /// Every node of the subnet.
    Broadcast,
}

impl From<Ipv4Addr> for Destination {
    fn from(address: Ipv4Addr) -> Self {
        Destination::Unicast(address)
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::Unicast(address) => write!(f, "{}", address),
            Destination::Broadcast => write!(f, "broadcast"),
        }
    }
}

/// The following represents the posible status that a send call can return.
/// Sending never fails with an error: the best-effort protocol drops what can not be sent
/// and the caller decides whether the status matters (e.g. to mark a peer offline).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SendStatus {
    /// The entire data was handed to the OS.
    /// It does not guarantee that the packet has been received by the remote.
    Sent,

    /// The data exceeds the datagram limit.
    /// The first value is the length of the data that was attempt to send
    /// and the second one is the maximum allowed.
    MaxPacketSizeExceeded(usize, usize),

    /// The remote could not be reached: connection refused, connect timeout or socket error.
    Unreachable,
}

impl SendStatus {
    pub fn is_sent(self) -> bool {
        self == SendStatus::Sent
    }
}

/// Moves encoded packets between nodes.
/// [`crate::adapters::lan::LanTransport`] uses real sockets and
/// [`crate::adapters::memory::MemoryNetwork`] connects nodes of the same process.
pub trait Transport: Send + Sync + 'static {
    /// Fire-and-forget datagram: unordered, unconfirmed.
    fn send_datagram(&self, destination: Destination, data: &str) -> SendStatus;

    /// Reliable unicast: a fresh connection for this data only.
    fn send_stream(&self, address: Ipv4Addr, data: &str) -> SendStatus;

    /// Sends the packet by the channel its kind requires.
    /// Stream packets can not be broadcast: they are reported as `Unreachable`.
    fn send_packet(&self, destination: Destination, packet: &Packet) -> SendStatus {
        let data = packet.encode();
        log::trace!("Sending {} to {}", packet.kind(), destination);
        match (packet.channel(), destination) {
            (Channel::Datagram, destination) => self.send_datagram(destination, &data),
            (Channel::Stream, Destination::Unicast(address)) => self.send_stream(address, &data),
            (Channel::Stream, Destination::Broadcast) => {
                log::error!("{} can not be broadcast", packet.kind());
                SendStatus::Unreachable
            }
        }
    }
}
