// Copyright (c) 2024 Botho Foundation

//! Registry of known peers and their connection records.
//!
//! The registry keeps an ordered list of [`PeerAddress`] entries and, keyed by
//! endpoint, the [`PeerConnection`] record of peers we have completed a
//! handshake with. Both live behind a single lock so an address and its
//! connection record always appear and disappear together.
//!
//! Sampling never runs under the lock: the peer list is copied out first and
//! the random choice is made on the copy.

use crate::{
    gossip::GossipResponse,
    peer::{Endpoint, PeerAddress},
};
use parking_lot::RwLock;
use rand::{seq::SliceRandom, Rng};
use std::{collections::HashMap, sync::Arc, time::Instant};
use tracing::{debug, trace};

/// Which side opened the connection a record was created from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDirection {
    /// The peer connected to us.
    Inbound,
    /// We connected to the peer.
    Outbound,
}

/// Live connection record of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerConnection {
    /// Side that opened the connection
    pub direction: ConnectionDirection,

    /// When the handshake completed
    pub established_at: Instant,

    /// Last time a frame was exchanged with the peer
    pub last_activity: Instant,
}

impl PeerConnection {
    fn new(direction: ConnectionDirection) -> Self {
        let now = Instant::now();
        Self {
            direction,
            established_at: now,
            last_activity: now,
        }
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    peers: Vec<PeerAddress>,
    connections: HashMap<Endpoint, PeerConnection>,
}

impl RegistryInner {
    fn position(&self, host: &str, port: u16) -> Option<usize> {
        self.peers.iter().position(|p| p.is_at(host, port))
    }
}

/// Thread-safe set of known peers, owned by one node.
#[derive(Debug)]
pub struct PeerRegistry {
    /// Our own address; never stored as a peer
    self_address: PeerAddress,

    inner: RwLock<RegistryInner>,
}

impl PeerRegistry {
    /// Create an empty registry for the node at `self_address`.
    pub fn new(self_address: PeerAddress) -> Self {
        Self {
            self_address,
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// The owning node's address.
    pub fn self_address(&self) -> &PeerAddress {
        &self.self_address
    }

    /// Whether `host:port` is the owning node itself.
    pub fn is_self(&self, host: &str, port: u16) -> bool {
        self.self_address.is_at(host, port)
    }

    /// Insert a peer unless its endpoint is already known.
    ///
    /// Returns `true` if the peer was inserted. Our own endpoint is never
    /// inserted. When the endpoint is known under a different id, the id is
    /// refreshed but `false` is still returned.
    pub fn add(&self, peer: PeerAddress) -> bool {
        if self.is_self(&peer.host, peer.port) {
            trace!(%peer, "Ignoring own address");
            return false;
        }

        let mut inner = self.inner.write();
        if let Some(index) = inner.position(&peer.host, peer.port) {
            let existing = &mut inner.peers[index];
            if existing.id != peer.id {
                debug!(
                    old = %existing.id,
                    new = %peer.id,
                    host = %peer.host,
                    port = peer.port,
                    "Refreshed peer id"
                );
                existing.id = peer.id;
            }
            return false;
        }

        debug!(%peer, "Registered peer");
        inner.peers.push(peer);
        true
    }

    /// Replace the id stored for a known endpoint with `peer.id`.
    ///
    /// Unknown endpoints are not inserted. Returns `true` if the id changed.
    pub fn refresh_id(&self, peer: &PeerAddress) -> bool {
        let mut inner = self.inner.write();
        let Some(index) = inner.position(&peer.host, peer.port) else {
            return false;
        };

        let existing = &mut inner.peers[index];
        if existing.id == peer.id {
            return false;
        }
        debug!(
            old = %existing.id,
            new = %peer.id,
            host = %peer.host,
            port = peer.port,
            "Refreshed peer id"
        );
        existing.id = peer.id.clone();
        true
    }

    /// Insert many peers; returns the ones that were new.
    pub fn merge(&self, peers: impl IntoIterator<Item = PeerAddress>) -> Vec<PeerAddress> {
        peers
            .into_iter()
            .filter(|peer| self.add(peer.clone()))
            .collect()
    }

    /// Remove the peer at `host:port` together with its connection record.
    ///
    /// Returns `true` if an entry was removed. Removing an unknown peer is a
    /// no-op.
    pub fn remove(&self, host: &str, port: u16) -> bool {
        let mut inner = self.inner.write();
        let Some(index) = inner.position(host, port) else {
            if inner.connections.remove(&(host.to_string(), port)).is_some() {
                debug!(%host, port, "Dropped orphaned connection record");
            }
            return false;
        };

        let peer = inner.peers.remove(index);
        inner.connections.remove(&peer.endpoint());
        debug!(%peer, "Removed peer");
        true
    }

    /// Remove a peer by address.
    pub fn remove_peer(&self, peer: &PeerAddress) -> bool {
        self.remove(&peer.host, peer.port)
    }

    /// Remove every peer, returning the removed addresses.
    pub fn clear(&self) -> Vec<PeerAddress> {
        let mut inner = self.inner.write();
        inner.connections.clear();
        std::mem::take(&mut inner.peers)
    }

    /// Index of the peer at `host:port`, if known.
    pub fn find(&self, host: &str, port: u16) -> Option<usize> {
        self.inner.read().position(host, port)
    }

    /// Peer at `index` in insertion order.
    pub fn get(&self, index: usize) -> Option<PeerAddress> {
        self.inner.read().peers.get(index).cloned()
    }

    /// Look up a peer by endpoint.
    pub fn lookup(&self, host: &str, port: u16) -> Option<PeerAddress> {
        let inner = self.inner.read();
        inner.position(host, port).map(|i| inner.peers[i].clone())
    }

    /// Whether a peer listens at `host:port`.
    pub fn contains(&self, host: &str, port: u16) -> bool {
        self.find(host, port).is_some()
    }

    /// Number of known peers.
    pub fn size(&self) -> usize {
        self.inner.read().peers.len()
    }

    /// Whether no peers are known.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Snapshot of all known peers in insertion order.
    pub fn peers(&self) -> Vec<PeerAddress> {
        self.inner.read().peers.clone()
    }

    /// Record a live connection for a known peer.
    ///
    /// Returns `false` (and records nothing) for unknown endpoints, so every
    /// connection record always has a matching address entry.
    pub fn attach_connection(
        &self,
        host: &str,
        port: u16,
        direction: ConnectionDirection,
    ) -> bool {
        let mut inner = self.inner.write();
        if inner.position(host, port).is_none() {
            debug!(%host, port, ?direction, "Not recording connection for unknown peer");
            return false;
        }

        inner
            .connections
            .entry((host.to_string(), port))
            .and_modify(|conn| conn.last_activity = Instant::now())
            .or_insert_with(|| PeerConnection::new(direction));
        true
    }

    /// Drop the connection record of a peer but keep its address.
    ///
    /// A peer without a record is left untouched and `false` is returned.
    pub fn detach_connection(&self, host: &str, port: u16) -> bool {
        let removed = self
            .inner
            .write()
            .connections
            .remove(&(host.to_string(), port))
            .is_some();
        if !removed {
            debug!(%host, port, "No connection record to detach");
        }
        removed
    }

    /// Connection record of a peer, if any.
    pub fn connection(&self, host: &str, port: u16) -> Option<PeerConnection> {
        self.inner
            .read()
            .connections
            .get(&(host.to_string(), port))
            .copied()
    }

    /// Number of peers with a connection record.
    pub fn connected_count(&self) -> usize {
        self.inner.read().connections.len()
    }

    /// Mark activity on a peer's connection record.
    pub fn touch(&self, host: &str, port: u16) {
        if let Some(conn) = self
            .inner
            .write()
            .connections
            .get_mut(&(host.to_string(), port))
        {
            conn.last_activity = Instant::now();
        }
    }

    /// A uniformly random peer, or our own address when no peers are known.
    pub fn sample_one(&self) -> PeerAddress {
        self.sample_one_with(&mut rand::thread_rng())
    }

    /// [`PeerRegistry::sample_one`] with a caller-supplied rng.
    pub fn sample_one_with<R: Rng>(&self, rng: &mut R) -> PeerAddress {
        let peers = self.peers();
        if peers.is_empty() {
            return self.self_address.clone();
        }
        peers[rng.gen_range(0..peers.len())].clone()
    }

    /// Random subset of peers plus ourselves to advertise to another node.
    ///
    /// - no peers: an announcement of our own address
    /// - one peer: that peer and our own address
    /// - `n >= 2` peers: `k` distinct entries drawn from the `n` peers plus our
    ///   own address, with `k` uniform in `[2, n + 1]`
    pub fn sample_subset(&self) -> GossipResponse {
        self.sample_subset_with(&mut rand::thread_rng())
    }

    /// [`PeerRegistry::sample_subset`] with a caller-supplied rng.
    pub fn sample_subset_with<R: Rng>(&self, rng: &mut R) -> GossipResponse {
        let mut candidates = self.peers();
        let total = candidates.len();

        if total == 0 {
            return GossipResponse::Announcement(self.self_address.clone());
        }

        candidates.push(self.self_address.clone());
        if total == 1 {
            return GossipResponse::PeerList(candidates);
        }

        // Slot `total` is our own address.
        let count = rng.gen_range(2..=total + 1);
        let mut slots: Vec<usize> = (0..=total).collect();
        slots.shuffle(rng);
        slots.truncate(count);
        trace!(total, count, ?slots, "Sampled gossip subset");

        GossipResponse::PeerList(slots.into_iter().map(|i| candidates[i].clone()).collect())
    }
}

/// A shared, reference-counted peer registry.
pub type SharedRegistry = Arc<PeerRegistry>;

/// Create a new shared registry for the node at `self_address`.
pub fn new_shared_registry(self_address: PeerAddress) -> SharedRegistry {
    Arc::new(PeerRegistry::new(self_address))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::{rngs::StdRng, SeedableRng};
    use std::collections::HashSet;

    fn me() -> PeerAddress {
        PeerAddress::new("me", "127.0.0.1", 5050)
    }

    fn peer(port: u16) -> PeerAddress {
        PeerAddress::new(format!("peer-{port}"), "127.0.0.1", port)
    }

    fn registry_with(n: u16) -> PeerRegistry {
        let registry = PeerRegistry::new(me());
        for port in 0..n {
            assert!(registry.add(peer(6000 + port)));
        }
        registry
    }

    #[test]
    fn test_add_is_deduplicated_by_endpoint() {
        let registry = PeerRegistry::new(me());
        assert!(registry.add(peer(6000)));
        assert!(!registry.add(peer(6000)));
        assert!(!registry.add(PeerAddress::new("renamed", "127.0.0.1", 6000)));

        assert_eq!(registry.size(), 1);
        assert_eq!(registry.get(0).unwrap().id.as_str(), "renamed");
    }

    #[test]
    fn test_refresh_id_only_touches_known_peers() {
        let registry = PeerRegistry::new(me());
        registry.add(PeerAddress::from_endpoint("127.0.0.1", 6000));

        assert!(registry.refresh_id(&peer(6000)));
        assert!(!registry.refresh_id(&peer(6000)));
        assert_eq!(registry.lookup("127.0.0.1", 6000), Some(peer(6000)));

        assert!(!registry.refresh_id(&peer(7000)));
        assert_eq!(registry.lookup("127.0.0.1", 7000), None);
        assert_eq!(registry.size(), 1);
    }

    #[test]
    fn test_add_self_is_ignored() {
        let registry = PeerRegistry::new(me());
        assert!(!registry.add(me()));
        assert!(!registry.add(PeerAddress::new("other-id", "127.0.0.1", 5050)));
        assert!(registry.is_empty());
        assert!(registry.is_self("127.0.0.1", 5050));
        assert!(!registry.is_self("127.0.0.1", 5051));
    }

    #[test]
    fn test_find_and_remove() {
        let registry = registry_with(3);
        assert_eq!(registry.find("127.0.0.1", 6001), Some(1));
        assert_eq!(registry.find("127.0.0.1", 7000), None);

        assert!(registry.remove("127.0.0.1", 6001));
        assert!(!registry.remove("127.0.0.1", 6001));
        assert_eq!(registry.size(), 2);
        assert_eq!(registry.find("127.0.0.1", 6002), Some(1));
    }

    #[test]
    fn test_merge_returns_new_entries() {
        let registry = registry_with(1);
        let added = registry.merge(vec![peer(6000), peer(6001), me(), peer(6001)]);
        assert_eq!(added, vec![peer(6001)]);
        assert_eq!(registry.size(), 2);
    }

    #[test]
    fn test_connection_record_requires_address() {
        let registry = registry_with(1);
        assert!(!registry.attach_connection("127.0.0.1", 7000, ConnectionDirection::Inbound));
        assert_eq!(registry.connected_count(), 0);

        assert!(registry.attach_connection("127.0.0.1", 6000, ConnectionDirection::Outbound));
        let conn = registry.connection("127.0.0.1", 6000).unwrap();
        assert_eq!(conn.direction, ConnectionDirection::Outbound);
    }

    #[test]
    fn test_remove_drops_connection_record() {
        let registry = registry_with(2);
        registry.attach_connection("127.0.0.1", 6000, ConnectionDirection::Inbound);
        registry.attach_connection("127.0.0.1", 6001, ConnectionDirection::Inbound);

        registry.remove("127.0.0.1", 6000);
        assert!(registry.connection("127.0.0.1", 6000).is_none());
        assert_eq!(registry.connected_count(), 1);
    }

    #[test]
    fn test_detach_without_record_is_noop() {
        let registry = registry_with(1);
        assert!(!registry.detach_connection("127.0.0.1", 6000));
        assert!(!registry.detach_connection("127.0.0.1", 9999));
        assert_eq!(registry.size(), 1);
    }

    #[test]
    fn test_clear() {
        let registry = registry_with(3);
        registry.attach_connection("127.0.0.1", 6000, ConnectionDirection::Inbound);
        let removed = registry.clear();
        assert_eq!(removed.len(), 3);
        assert!(registry.is_empty());
        assert_eq!(registry.connected_count(), 0);
    }

    #[test]
    fn test_sample_one_empty_returns_self() {
        let registry = PeerRegistry::new(me());
        assert_eq!(registry.sample_one(), me());
    }

    #[test]
    fn test_sample_one_picks_a_peer() {
        let registry = registry_with(4);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let picked = registry.sample_one_with(&mut rng);
            assert!(registry.contains(&picked.host, picked.port));
        }
    }

    #[test]
    fn test_sample_subset_empty_is_announcement() {
        let registry = PeerRegistry::new(me());
        assert_eq!(registry.sample_subset(), GossipResponse::Announcement(me()));
    }

    #[test]
    fn test_sample_subset_single_peer() {
        let registry = registry_with(1);
        assert_eq!(
            registry.sample_subset(),
            GossipResponse::PeerList(vec![peer(6000), me()])
        );
    }

    #[test]
    fn test_sample_subset_size_bounds() {
        let mut rng = StdRng::seed_from_u64(42);
        for n in 2..8u16 {
            let registry = registry_with(n);
            let mut sizes = HashSet::new();

            for _ in 0..200 {
                let GossipResponse::PeerList(list) = registry.sample_subset_with(&mut rng) else {
                    panic!("expected a peer list for {n} peers");
                };

                assert!(list.len() >= 2 && list.len() <= n as usize + 1);
                let unique: HashSet<_> = list.iter().map(|p| p.endpoint()).collect();
                assert_eq!(unique.len(), list.len(), "subset must not repeat entries");
                assert!(list.iter().filter(|p| **p == me()).count() <= 1);
                assert!(list
                    .iter()
                    .all(|p| *p == me() || registry.contains(&p.host, p.port)));
                sizes.insert(list.len());
            }

            // Every size in [2, n + 1] shows up over 200 draws.
            assert_eq!(sizes.len(), n as usize);
        }
    }

    #[test]
    fn test_sample_subset_eventually_includes_self() {
        let registry = registry_with(3);
        let mut rng = StdRng::seed_from_u64(1);
        let seen_self = (0..100).any(|_| match registry.sample_subset_with(&mut rng) {
            GossipResponse::PeerList(list) => list.contains(&me()),
            GossipResponse::Announcement(_) => false,
        });
        assert!(seen_self);
    }

    #[test]
    fn test_concurrent_adds_and_removes() {
        let registry = Arc::new(PeerRegistry::new(me()));
        let handles: Vec<_> = (0..8u16)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..100u16 {
                        let port = 10_000 + (t * 100) + i;
                        registry.add(peer(port));
                        registry.attach_connection("127.0.0.1", port, ConnectionDirection::Inbound);
                        if i % 2 == 0 {
                            registry.remove("127.0.0.1", port);
                        }
                        let _ = registry.sample_subset();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.size(), 400);
        assert_eq!(registry.connected_count(), 400);
    }

    proptest! {
        /// For n >= 2 peers every subset has between 2 and n + 1 distinct
        /// entries, holds our own address at most once and only known peers
        /// otherwise.
        #[test]
        fn prop_sample_subset_bounds(n in 2u16..40, seed in any::<u64>()) {
            let registry = registry_with(n);
            let mut rng = StdRng::seed_from_u64(seed);

            let GossipResponse::PeerList(list) = registry.sample_subset_with(&mut rng) else {
                panic!("expected a peer list for {n} peers");
            };

            prop_assert!(list.len() >= 2);
            prop_assert!(list.len() <= n as usize + 1);
            let unique: HashSet<_> = list.iter().map(|p| p.endpoint()).collect();
            prop_assert_eq!(unique.len(), list.len());
            prop_assert!(list.iter().filter(|p| **p == me()).count() <= 1);
            prop_assert!(list.iter().all(|p| *p == me() || registry.contains(&p.host, p.port)));
        }

        /// `sample_one` always returns a registered peer, never ourselves.
        #[test]
        fn prop_sample_one_is_known(n in 1u16..40, seed in any::<u64>()) {
            let registry = registry_with(n);
            let picked = registry.sample_one_with(&mut StdRng::seed_from_u64(seed));
            prop_assert!(registry.contains(&picked.host, picked.port));
        }
    }
}
