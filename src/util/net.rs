use std::net::{Ipv4Addr, UdpSocket, SocketAddrV4};
use std::io::{self};

#[cfg(target_os = "linux")]
use nix::ifaddrs::{getifaddrs};

/// Finds the IPv4 address used by this host to reach the local network.
/// No packet is sent: connecting an UDP socket only selects the outgoing interface.
pub fn local_ipv4() -> io::Result<Ipv4Addr> {
    let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect(SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 80))?;
    match socket.local_addr()?.ip() {
        std::net::IpAddr::V4(ip) if !ip.is_unspecified() => Ok(ip),
        _ => Err(io::Error::new(io::ErrorKind::AddrNotAvailable, "No local IPv4 address")),
    }
}

/// Resolves the subnet broadcast address of the interface that owns `address`.
/// If the interface is not found or has no broadcast support (e.g. loopback or some VPN
/// adapters) the limited broadcast address `255.255.255.255` is used instead.
pub fn broadcast_address(address: Ipv4Addr) -> Ipv4Addr {
    subnet_broadcast(address).unwrap_or(Ipv4Addr::BROADCAST)
}

#[cfg(target_os = "linux")]
fn subnet_broadcast(address: Ipv4Addr) -> Option<Ipv4Addr> {
    let ifaddrs = match getifaddrs() {
        Ok(ifaddrs) => ifaddrs,
        Err(err) => {
            log::error!("Unable to list network interfaces: {}", err);
            return None
        }
    };

    ifaddrs
        .filter(|ifaddr| {
            ifaddr
                .address
                .as_ref()
                .and_then(|ss| ss.as_sockaddr_in())
                .map(|si| Ipv4Addr::from(si.ip()) == address)
                .unwrap_or(false)
        })
        .find_map(|ifaddr| {
            ifaddr.broadcast.as_ref().and_then(|ss| ss.as_sockaddr_in()).map(|si| si.ip().into())
        })
}

#[cfg(not(target_os = "linux"))]
fn subnet_broadcast(_address: Ipv4Addr) -> Option<Ipv4Addr> {
    None
}
