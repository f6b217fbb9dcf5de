use crate::util::thread::{OTHER_THREAD_ERR};

use std::collections::{BTreeMap};
use std::net::{Ipv4Addr};
use std::sync::{Mutex};

/// A peer seen in the network.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct PresenceEntry {
    pub address: Ipv4Addr,
    pub alias: String,
}

/// Result of [`PresenceDirectory::upsert()`].
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Upsert {
    Added,
    Renamed { previous: String },
    Unchanged,
    /// The address is the own node address, it is never stored.
    Ignored,
}

/// Ephemeral table of the peers in the network: address -> alias.
/// It is filled by discovery traffic and entries only leave it with a goodbye.
pub struct PresenceDirectory {
    own_address: Ipv4Addr,
    peers: Mutex<BTreeMap<Ipv4Addr, String>>,
}

impl PresenceDirectory {
    /// Creates an empty directory that will never contain `own_address`.
    pub fn new(own_address: Ipv4Addr) -> Self {
        Self { own_address, peers: Mutex::new(BTreeMap::new()) }
    }

    pub fn upsert(&self, address: Ipv4Addr, alias: &str) -> Upsert {
        if address == self.own_address {
            return Upsert::Ignored
        }

        let mut peers = self.peers.lock().expect(OTHER_THREAD_ERR);
        match peers.insert(address, alias.into()) {
            None => {
                log::info!("Peer {} joined as '{}'", address, alias);
                Upsert::Added
            }
            Some(previous) if previous != alias => {
                log::info!("Peer {} renamed from '{}' to '{}'", address, previous, alias);
                Upsert::Renamed { previous }
            }
            Some(_) => Upsert::Unchanged,
        }
    }

    /// Removes the peer, returning its alias if it was known.
    pub fn remove(&self, address: Ipv4Addr) -> Option<String> {
        let removed = self.peers.lock().expect(OTHER_THREAD_ERR).remove(&address);
        if let Some(alias) = &removed {
            log::info!("Peer {} ('{}') left", address, alias);
        }
        removed
    }

    pub fn alias_of(&self, address: Ipv4Addr) -> Option<String> {
        self.peers.lock().expect(OTHER_THREAD_ERR).get(&address).cloned()
    }

    pub fn contains(&self, address: Ipv4Addr) -> bool {
        self.peers.lock().expect(OTHER_THREAD_ERR).contains_key(&address)
    }

    /// Copy of the directory ordered by address.
    pub fn snapshot(&self) -> Vec<PresenceEntry> {
        self.peers
            .lock()
            .expect(OTHER_THREAD_ERR)
            .iter()
            .map(|(address, alias)| PresenceEntry { address: *address, alias: alias.clone() })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().expect(OTHER_THREAD_ERR).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
