//! # K-Bucket
//!
//! One distance band of the routing table: at most `capacity` peers, most
//! recently active first. Every member is mirrored in the store under
//! `bkt:<id-bytes>` so a restarted node can rebuild its table.
//!
//! Eviction is purely by recency: when an upsert pushes the bucket over
//! capacity, the least recently seen peers are dropped and their records
//! deleted. A store failure is logged and never undoes the in-memory change.

use std::sync::Arc;

use rand::Rng;
use tracing::{trace, warn};

use crate::identity::{NodeId, Peer};
use crate::store::{Store, prefixed};

/// Store namespace of bucket member records.
pub const BUCKET_RECORD_PREFIX: &[u8] = b"bkt:";

#[derive(Debug)]
pub struct KBucket {
    peers: Vec<Peer>,
    capacity: usize,
    store: Arc<dyn Store>,
}

impl KBucket {
    pub fn new(capacity: usize, store: Arc<dyn Store>) -> Self {
        Self {
            peers: Vec::with_capacity(capacity + 1),
            capacity,
            store,
        }
    }

    /// Insert or refresh `peers`, stamping each as seen now.
    ///
    /// Newer entries win ties on `last_seen`, so a batch keeps its own order
    /// of recency even when the clock does not advance between stamps.
    pub fn upsert<I>(&mut self, peers: I)
    where
        I: IntoIterator<Item = Peer>,
    {
        for mut peer in peers {
            if peer.is_incomplete() {
                trace!(peer = %peer.id(), "skipping incomplete peer");
                continue;
            }
            peer.touch();
            if let Some(pos) = self.position(peer.id()) {
                self.peers.remove(pos);
            }
            self.persist(&peer);
            self.peers.insert(0, peer);
        }

        // Stable, so equal stamps keep newest-inserted first.
        self.peers.sort_by(|a, b| b.last_seen().cmp(&a.last_seen()));

        if self.peers.len() > self.capacity {
            let evicted: Vec<Peer> = self.peers.drain(self.capacity..).collect();
            for peer in &evicted {
                trace!(peer = %peer.id(), "evicting least recently seen peer");
                self.forget(peer.id());
            }
        }
    }

    /// Remove peers by identity. Missing IDs are ignored.
    pub fn evict(&mut self, ids: &[NodeId]) {
        for id in ids {
            if let Some(pos) = self.position(id) {
                self.peers.remove(pos);
            }
            self.forget(id);
        }
    }

    /// A uniformly chosen member, or `None` for an empty bucket.
    pub fn sample_random<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&Peer> {
        if self.peers.is_empty() {
            return None;
        }
        self.peers.get(rng.gen_range(0..self.peers.len()))
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, peer: &Peer) -> bool {
        self.position(peer.id()).is_some()
    }

    pub fn get(&self, index: usize) -> Option<&Peer> {
        self.peers.get(index)
    }

    pub fn find(&self, id: &NodeId) -> Option<&Peer> {
        self.peers.iter().find(|p| p.id() == id)
    }

    /// Members, most recently seen first.
    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter()
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.peers.iter().position(|p| p.id() == id)
    }

    fn persist(&self, peer: &Peer) {
        let key = prefixed(BUCKET_RECORD_PREFIX, peer.id().as_bytes());
        if let Err(e) = self.store.set(&key, peer.url().as_bytes()) {
            warn!(peer = %peer.id(), error = %e, "failed to persist bucket entry");
        }
    }

    fn forget(&self, id: &NodeId) {
        let key = prefixed(BUCKET_RECORD_PREFIX, id.as_bytes());
        if let Err(e) = self.store.delete(&key) {
            warn!(peer = %id, error = %e, "failed to delete bucket entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ID_BYTES;
    use crate::store::MemoryStore;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::net::SocketAddr;

    fn peer(n: u8) -> Peer {
        let mut bytes = [0u8; ID_BYTES];
        bytes[0] = 0x80;
        bytes[ID_BYTES - 1] = n;
        let addr: SocketAddr = format!("10.0.0.{n}:{}", 4000 + n as u16).parse().unwrap();
        Peer::new(NodeId::from_bytes(bytes), addr)
    }

    fn record_key(p: &Peer) -> Vec<u8> {
        prefixed(BUCKET_RECORD_PREFIX, p.id().as_bytes())
    }

    #[test]
    fn upsert_keeps_newest_first() {
        let store = Arc::new(MemoryStore::new());
        let mut bucket = KBucket::new(16, store);
        bucket.upsert([peer(1)]);
        bucket.upsert([peer(2)]);
        bucket.upsert([peer(1)]);

        assert_eq!(bucket.len(), 2);
        assert_eq!(bucket.get(0), Some(&peer(1)));
        assert_eq!(bucket.get(1), Some(&peer(2)));
    }

    #[test]
    fn twenty_inserts_evict_the_four_oldest() {
        let store = Arc::new(MemoryStore::new());
        let mut bucket = KBucket::new(16, store.clone());
        for n in 1..=20 {
            bucket.upsert([peer(n)]);
            assert!(bucket.len() <= 16);
        }

        assert_eq!(bucket.len(), 16);
        for n in 1..=4 {
            assert!(!bucket.contains(&peer(n)), "peer {n} should be evicted");
            assert_eq!(store.get(&record_key(&peer(n))).unwrap(), None);
        }
        for n in 5..=20 {
            assert!(bucket.contains(&peer(n)), "peer {n} should remain");
            assert!(store.get(&record_key(&peer(n))).unwrap().is_some());
        }
    }

    #[test]
    fn batch_upsert_respects_capacity() {
        let store = Arc::new(MemoryStore::new());
        let mut bucket = KBucket::new(4, store);
        bucket.upsert((1..=10).map(peer));
        assert_eq!(bucket.len(), 4);
        for n in 7..=10 {
            assert!(bucket.contains(&peer(n)));
        }
    }

    #[test]
    fn incomplete_peers_are_not_admitted() {
        let store = Arc::new(MemoryStore::new());
        let mut bucket = KBucket::new(4, store);
        bucket.upsert([Peer::incomplete(*peer(1).id())]);
        assert!(bucket.is_empty());
    }

    #[test]
    fn evict_removes_member_and_record() {
        let store = Arc::new(MemoryStore::new());
        let mut bucket = KBucket::new(4, store.clone());
        bucket.upsert([peer(1), peer(2)]);
        bucket.evict(&[*peer(1).id(), *peer(9).id()]);

        assert!(!bucket.contains(&peer(1)));
        assert!(bucket.contains(&peer(2)));
        assert_eq!(store.get(&record_key(&peer(1))).unwrap(), None);
    }

    #[test]
    fn sample_random_returns_member_or_none() {
        let store = Arc::new(MemoryStore::new());
        let mut rng = StdRng::seed_from_u64(11);
        let mut bucket = KBucket::new(4, store);
        assert!(bucket.sample_random(&mut rng).is_none());

        bucket.upsert([peer(1), peer(2), peer(3)]);
        for _ in 0..20 {
            let sampled = bucket.sample_random(&mut rng).expect("non-empty bucket");
            assert!(bucket.contains(sampled));
        }
    }
}
