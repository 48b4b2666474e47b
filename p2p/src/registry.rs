//! The peer registry: the set of live peers, indexed by address and by
//! numeric id, plus the singleton loader slot.
use std::collections::HashMap;

use crate::error::DisconnectReason;
use crate::output::Outbox;
use crate::peer::Peer;
use crate::PeerId;

/// `addr -> Peer`, `id -> addr`, insertion order, and the loader slot.
/// Invariant upheld throughout: `load != None ⇒ registry[load].outbound &&
/// registry[load].loader`.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<PeerId, Peer>,
    ids: HashMap<u64, PeerId>,
    order: Vec<PeerId>,
    inbound: usize,
    outbound: usize,
    loader: Option<PeerId>,
}

impl PeerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new peer. Fails if the address is already registered.
    pub fn add(&mut self, peer: Peer) -> Result<(), &'static str> {
        if self.peers.contains_key(&peer.addr) {
            return Err("address already registered");
        }
        if peer.outbound {
            self.outbound += 1;
        } else {
            self.inbound += 1;
        }
        self.ids.insert(peer.id, peer.addr);
        self.order.push(peer.addr);
        self.peers.insert(peer.addr, peer);
        Ok(())
    }

    /// Remove a peer by address, freeing the loader slot if it held it.
    pub fn remove(&mut self, addr: &PeerId) -> Option<Peer> {
        let peer = self.peers.remove(addr)?;
        self.ids.remove(&peer.id);
        self.order.retain(|a| a != addr);
        if peer.outbound {
            self.outbound -= 1;
        } else {
            self.inbound -= 1;
        }
        if self.loader == Some(*addr) {
            self.loader = None;
        }
        Some(peer)
    }

    /// Whether an address is currently registered.
    pub fn has(&self, addr: &PeerId) -> bool {
        self.peers.contains_key(addr)
    }

    /// Look up a peer by address.
    pub fn get(&self, addr: &PeerId) -> Option<&Peer> {
        self.peers.get(addr)
    }

    /// Look up a peer by address, mutably.
    pub fn get_mut(&mut self, addr: &PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(addr)
    }

    /// Look up a peer by numeric id.
    pub fn find(&self, id: u64) -> Option<&Peer> {
        self.ids.get(&id).and_then(|addr| self.peers.get(addr))
    }

    /// Iterate over peers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.order.iter().filter_map(|a| self.peers.get(a))
    }

    /// Iterate over peers mutably. Order is not guaranteed.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.values_mut()
    }

    /// Number of inbound connections.
    pub fn inbound(&self) -> usize {
        self.inbound
    }

    /// Number of outbound connections.
    pub fn outbound(&self) -> usize {
        self.outbound
    }

    /// Total connections.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether the registry holds no peers.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// The current loader peer's address, if any.
    pub fn loader(&self) -> Option<PeerId> {
        self.loader
    }

    /// Designate a peer as the loader. Must be an existing outbound peer.
    pub fn set_loader(&mut self, addr: PeerId) {
        if let Some(peer) = self.peers.get_mut(&addr) {
            if peer.outbound {
                peer.loader = true;
                self.loader = Some(addr);
            }
        }
    }

    /// Close and remove every registered peer.
    pub fn close_all(&mut self, outbox: &mut Outbox, reason: DisconnectReason) {
        for peer in self.peers.values_mut() {
            peer.close(outbox, reason.clone());
        }
        self.peers.clear();
        self.ids.clear();
        self.order.clear();
        self.inbound = 0;
        self.outbound = 0;
        self.loader = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerpool_common::LocalTime;
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

    fn addr(port: u16) -> PeerId {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), port))
    }

    #[test]
    fn counts_track_inbound_and_outbound() {
        let mut registry = PeerRegistry::new();
        registry.add(Peer::new(1, addr(1), true, 1, LocalTime::default())).unwrap();
        registry.add(Peer::new(2, addr(2), false, 2, LocalTime::default())).unwrap();
        assert_eq!(registry.outbound(), 1);
        assert_eq!(registry.inbound(), 1);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn removing_the_loader_clears_the_slot() {
        let mut registry = PeerRegistry::new();
        registry.add(Peer::new(1, addr(1), true, 1, LocalTime::default())).unwrap();
        registry.set_loader(addr(1));
        assert_eq!(registry.loader(), Some(addr(1)));
        registry.remove(&addr(1));
        assert_eq!(registry.loader(), None);
    }

    #[test]
    fn duplicate_address_is_rejected() {
        let mut registry = PeerRegistry::new();
        registry.add(Peer::new(1, addr(1), true, 1, LocalTime::default())).unwrap();
        assert!(registry.add(Peer::new(2, addr(1), true, 2, LocalTime::default())).is_err());
    }

    #[test]
    fn find_by_id_matches_get_by_addr() {
        let mut registry = PeerRegistry::new();
        registry.add(Peer::new(42, addr(1), true, 1, LocalTime::default())).unwrap();
        assert_eq!(registry.find(42).unwrap().addr, addr(1));
    }
}
