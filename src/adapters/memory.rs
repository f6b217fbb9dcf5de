use crate::node::{Dispatcher};
use crate::packet::{Channel, Packet};
use crate::transport::{Transport, Destination, SendStatus};
use crate::util::thread::{OTHER_THREAD_ERR};

use std::collections::{HashMap};
use std::net::{Ipv4Addr};
use std::sync::{Arc, Weak, RwLock};

/// A unit travelling through a [`MemoryNetwork`].
pub struct Delivery<'a> {
    pub from: Ipv4Addr,
    pub to: Ipv4Addr,
    pub channel: Channel,
    pub data: &'a str,
}

impl<'a> Delivery<'a> {
    /// Decoded content, `None` if it is not a valid packet.
    pub fn packet(&self) -> Option<Packet> {
        Packet::decode(self.data).ok()
    }
}

type Filter = Arc<dyn Fn(&Delivery) -> bool + Send + Sync>;

struct NetworkInner {
    endpoints: RwLock<HashMap<Ipv4Addr, Weak<Dispatcher>>>,
    filter: RwLock<Option<Filter>>,
}

/// In-process network connecting nodes of the same process.
/// Data is delivered synchronously to the dispatcher of the destination node,
/// in the thread that sends it. A filter can drop deliveries to model packet loss.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        let inner = NetworkInner { endpoints: RwLock::default(), filter: RwLock::default() };
        Self { inner: Arc::new(inner) }
    }

    /// Transport for the node identified by `address`.
    pub fn transport(&self, address: Ipv4Addr) -> MemoryTransport {
        MemoryTransport { network: self.clone(), address }
    }

    /// Makes the node reachable at `address`.
    /// The network only keeps a weak reference: a dropped node becomes unreachable.
    pub fn attach(&self, address: Ipv4Addr, dispatcher: &Arc<Dispatcher>) {
        let mut endpoints = self.inner.endpoints.write().expect(OTHER_THREAD_ERR);
        endpoints.insert(address, Arc::downgrade(dispatcher));
        log::debug!("Memory endpoint {} attached", address);
    }

    pub fn detach(&self, address: Ipv4Addr) {
        if self.inner.endpoints.write().expect(OTHER_THREAD_ERR).remove(&address).is_some() {
            log::debug!("Memory endpoint {} detached", address);
        }
    }

    /// Deliveries for which `filter` returns `false` are silently dropped.
    pub fn set_filter<F>(&self, filter: F)
    where F: Fn(&Delivery) -> bool + Send + Sync + 'static {
        *self.inner.filter.write().expect(OTHER_THREAD_ERR) = Some(Arc::new(filter));
    }

    pub fn clear_filter(&self) {
        *self.inner.filter.write().expect(OTHER_THREAD_ERR) = None;
    }

    fn endpoint(&self, address: Ipv4Addr) -> Option<Arc<Dispatcher>> {
        let endpoints = self.inner.endpoints.read().expect(OTHER_THREAD_ERR);
        endpoints.get(&address).and_then(Weak::upgrade)
    }

    fn others(&self, address: Ipv4Addr) -> Vec<(Ipv4Addr, Arc<Dispatcher>)> {
        let endpoints = self.inner.endpoints.read().expect(OTHER_THREAD_ERR);
        endpoints
            .iter()
            .filter(|(other, _)| **other != address)
            .filter_map(|(other, endpoint)| endpoint.upgrade().map(|endpoint| (*other, endpoint)))
            .collect()
    }

    /// Returns `false` if the delivery was dropped by the filter.
    fn deliver(&self, delivery: Delivery, endpoint: &Dispatcher) -> bool {
        // The filter is cloned so no lock is held while the endpoint processes the data.
        let filter = self.inner.filter.read().expect(OTHER_THREAD_ERR).clone();
        if let Some(filter) = filter {
            if !filter(&delivery) {
                log::trace!("Memory delivery {} -> {} dropped", delivery.from, delivery.to);
                return false
            }
        }
        endpoint.dispatch(delivery.channel, delivery.data);
        true
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// Endpoint of one node in a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: MemoryNetwork,
    address: Ipv4Addr,
}

impl MemoryTransport {
    pub fn address(&self) -> Ipv4Addr {
        self.address
    }
}

impl Transport for MemoryTransport {
    fn send_datagram(&self, destination: Destination, data: &str) -> SendStatus {
        match destination {
            Destination::Unicast(to) => {
                // A datagram to nowhere is lost without notice, as with a real socket.
                if let Some(endpoint) = self.network.endpoint(to) {
                    let delivery = Delivery { from: self.address, to, channel: Channel::Datagram, data };
                    self.network.deliver(delivery, &endpoint);
                }
            }
            Destination::Broadcast => {
                for (to, endpoint) in self.network.others(self.address) {
                    let delivery = Delivery { from: self.address, to, channel: Channel::Datagram, data };
                    self.network.deliver(delivery, &endpoint);
                }
            }
        }
        SendStatus::Sent
    }

    fn send_stream(&self, to: Ipv4Addr, data: &str) -> SendStatus {
        match self.network.endpoint(to) {
            Some(endpoint) => {
                let delivery = Delivery { from: self.address, to, channel: Channel::Stream, data };
                match self.network.deliver(delivery, &endpoint) {
                    true => SendStatus::Sent,
                    false => SendStatus::Unreachable,
                }
            }
            None => SendStatus::Unreachable,
        }
    }
}
