//! # Routing Table
//!
//! `HASH_BITS + 1` K-buckets indexed by [`logdist`] from the local ID. A peer
//! lives in exactly one bucket, `buckets[logdist(self, peer)]`. The local
//! node is held beside the buckets and is never a bucket member.
//!
//! The table itself ([`RoutingTable`]) is plain synchronous state. Inside a
//! node it is owned by an actor and reached through [`TableHandle`]: every
//! read and write is a command processed in order, which gives the table a
//! single point of mutual exclusion without a lock held across await points.
//! The actor also owns the node's random generator, so sampling is
//! reproducible under a fixed seed.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use crate::bucket::KBucket;
use crate::identity::{HASH_BITS, NodeId, Peer, closer_cmp, logdist};
use crate::store::Store;

/// Result count used when a caller asks for zero peers.
pub const DEFAULT_QUERY_SIZE: usize = 5;

const COMMAND_QUEUE_LEN: usize = 256;

#[derive(Debug)]
pub struct RoutingTable {
    local: Peer,
    buckets: Vec<KBucket>,
    rng: StdRng,
}

impl RoutingTable {
    pub fn new(local: Peer, bucket_size: usize, store: Arc<dyn Store>) -> Self {
        Self::with_rng(local, bucket_size, store, StdRng::from_entropy())
    }

    pub fn with_rng(local: Peer, bucket_size: usize, store: Arc<dyn Store>, rng: StdRng) -> Self {
        let buckets = (0..=HASH_BITS)
            .map(|_| KBucket::new(bucket_size, store.clone()))
            .collect();
        Self { local, buckets, rng }
    }

    pub fn local(&self) -> &Peer {
        &self.local
    }

    /// Insert or refresh a peer in its owning bucket.
    pub fn add(&mut self, peer: Peer) {
        if peer.id() == self.local.id() {
            return;
        }
        let idx = logdist(self.local.id(), peer.id());
        self.buckets[idx].upsert([peer]);
    }

    /// Record confirmed liveness of a peer.
    pub fn update(&mut self, mut peer: Peer) {
        peer.touch();
        self.add(peer);
    }

    pub fn delete(&mut self, id: &NodeId) {
        let idx = logdist(self.local.id(), id);
        self.buckets[idx].evict(&[*id]);
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(KBucket::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(KBucket::is_empty)
    }

    pub fn buckets(&self) -> &[KBucket] {
        &self.buckets
    }

    pub fn lookup(&self, id: &NodeId) -> Option<&Peer> {
        let idx = logdist(self.local.id(), id);
        self.buckets[idx].find(id)
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.buckets
            .iter()
            .flat_map(KBucket::iter)
            .cloned()
            .collect()
    }

    /// Up to `n` distinct peers chosen uniformly at random.
    ///
    /// `n == 0` means [`DEFAULT_QUERY_SIZE`]; `n` is capped at the bucket count.
    pub fn find_random(&mut self, n: usize) -> Vec<Peer> {
        let n = self.clamp_query(n);
        let all = self.peers();
        if all.len() <= n {
            return all;
        }

        let mut seen = HashSet::with_capacity(n);
        let mut picked = Vec::with_capacity(n);
        while picked.len() < n {
            let idx = self.rng.gen_range(0..all.len());
            if seen.insert(idx) {
                picked.push(all[idx].clone());
            }
        }
        picked
    }

    /// One random member from every non-empty bucket.
    pub fn random_per_bucket(&mut self) -> Vec<Peer> {
        let rng = &mut self.rng;
        self.buckets
            .iter()
            .filter_map(|bucket| bucket.sample_random(&mut *rng).cloned())
            .collect()
    }

    /// Up to `n` peers in ascending XOR distance to `target`.
    pub fn find_closest(&self, target: &NodeId, n: usize) -> Vec<Peer> {
        let n = self.clamp_query(n);
        let mut closest: Vec<Peer> = Vec::with_capacity(n + 1);

        for peer in self.buckets.iter().flat_map(KBucket::iter) {
            let ix = closest
                .partition_point(|c| closer_cmp(target, c.id(), peer.id()) != Ordering::Greater);
            if ix < n {
                closest.insert(ix, peer.clone());
                closest.truncate(n);
            }
        }
        closest
    }

    /// The part of `find_closest(target, n)` strictly closer to `target`
    /// than `reference` is.
    pub fn find_closer_than(&self, target: &NodeId, reference: &NodeId, n: usize) -> Vec<Peer> {
        let mut closest = self.find_closest(target, n);
        closest.retain(|p| closer_cmp(target, p.id(), reference) == Ordering::Less);
        closest
    }

    fn clamp_query(&self, n: usize) -> usize {
        match n {
            0 => DEFAULT_QUERY_SIZE,
            n => n.min(self.buckets.len()),
        }
    }
}

// ============================================================================
// Actor
// ============================================================================

enum Command {
    Add(Peer),
    Update(Peer),
    Delete(NodeId),
    Len(oneshot::Sender<usize>),
    OccupiedBuckets(oneshot::Sender<usize>),
    Lookup(NodeId, oneshot::Sender<Option<Peer>>),
    Peers(oneshot::Sender<Vec<Peer>>),
    FindRandom(usize, oneshot::Sender<Vec<Peer>>),
    RandomPerBucket(oneshot::Sender<Vec<Peer>>),
    FindClosest(NodeId, usize, oneshot::Sender<Vec<Peer>>),
    FindCloserThan(NodeId, NodeId, usize, oneshot::Sender<Vec<Peer>>),
}

/// Cheap, cloneable handle to a routing table owned by its actor task.
///
/// Commands are processed strictly in send order, so a query issued after an
/// `add` from the same task observes that add.
#[derive(Clone, Debug)]
pub struct TableHandle {
    cmd_tx: mpsc::Sender<Command>,
}

struct TableActor {
    table: RoutingTable,
    cmd_rx: mpsc::Receiver<Command>,
}

impl TableHandle {
    /// Move `table` into a new actor task. Requires a Tokio runtime.
    pub fn spawn(table: RoutingTable) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_LEN);
        tokio::spawn(TableActor { table, cmd_rx }.run());
        Self { cmd_tx }
    }

    pub async fn add(&self, peer: Peer) {
        let _ = self.cmd_tx.send(Command::Add(peer)).await;
    }

    pub async fn update(&self, peer: Peer) {
        let _ = self.cmd_tx.send(Command::Update(peer)).await;
    }

    pub async fn delete(&self, id: NodeId) {
        let _ = self.cmd_tx.send(Command::Delete(id)).await;
    }

    pub async fn len(&self) -> usize {
        self.query(Command::Len).await.unwrap_or(0)
    }

    pub async fn occupied_buckets(&self) -> usize {
        self.query(Command::OccupiedBuckets).await.unwrap_or(0)
    }

    pub async fn lookup(&self, id: NodeId) -> Option<Peer> {
        self.query(|tx| Command::Lookup(id, tx)).await.flatten()
    }

    pub async fn peers(&self) -> Vec<Peer> {
        self.query(Command::Peers).await.unwrap_or_default()
    }

    pub async fn find_random(&self, n: usize) -> Vec<Peer> {
        self.query(|tx| Command::FindRandom(n, tx))
            .await
            .unwrap_or_default()
    }

    pub async fn random_per_bucket(&self) -> Vec<Peer> {
        self.query(Command::RandomPerBucket).await.unwrap_or_default()
    }

    pub async fn find_closest(&self, target: NodeId, n: usize) -> Vec<Peer> {
        self.query(|tx| Command::FindClosest(target, n, tx))
            .await
            .unwrap_or_default()
    }

    pub async fn find_closer_than(&self, target: NodeId, reference: NodeId, n: usize) -> Vec<Peer> {
        self.query(|tx| Command::FindCloserThan(target, reference, n, tx))
            .await
            .unwrap_or_default()
    }

    async fn query<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(make(tx)).await.is_err() {
            return None;
        }
        rx.await.ok()
    }
}

impl TableActor {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::Add(peer) => {
                    trace!(peer = %peer.id(), "add peer");
                    self.table.add(peer);
                }
                Command::Update(peer) => {
                    trace!(peer = %peer.id(), "refresh peer");
                    self.table.update(peer);
                }
                Command::Delete(id) => {
                    self.table.delete(&id);
                }
                Command::Len(reply) => {
                    let _ = reply.send(self.table.len());
                }
                Command::OccupiedBuckets(reply) => {
                    let occupied = self.table.buckets().iter().filter(|b| !b.is_empty()).count();
                    let _ = reply.send(occupied);
                }
                Command::Lookup(id, reply) => {
                    let _ = reply.send(self.table.lookup(&id).cloned());
                }
                Command::Peers(reply) => {
                    let _ = reply.send(self.table.peers());
                }
                Command::FindRandom(n, reply) => {
                    let _ = reply.send(self.table.find_random(n));
                }
                Command::RandomPerBucket(reply) => {
                    let _ = reply.send(self.table.random_per_bucket());
                }
                Command::FindClosest(target, n, reply) => {
                    let _ = reply.send(self.table.find_closest(&target, n));
                }
                Command::FindCloserThan(target, reference, n, reply) => {
                    let _ = reply.send(self.table.find_closer_than(&target, &reference, n));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ID_BYTES;
    use crate::store::MemoryStore;
    use std::net::SocketAddr;

    fn id_from(first: u8, last: u8) -> NodeId {
        let mut bytes = [0u8; ID_BYTES];
        bytes[0] = first;
        bytes[ID_BYTES - 1] = last;
        NodeId::from_bytes(bytes)
    }

    fn peer(first: u8, last: u8) -> Peer {
        let addr: SocketAddr = format!("10.1.{first}.{last}:7000").parse().unwrap();
        Peer::new(id_from(first, last), addr)
    }

    fn table(bucket_size: usize) -> RoutingTable {
        let local = Peer::new(id_from(0, 0), "127.0.0.1:7000".parse().unwrap());
        RoutingTable::with_rng(
            local,
            bucket_size,
            Arc::new(MemoryStore::new()),
            StdRng::seed_from_u64(42),
        )
    }

    #[test]
    fn re_adding_a_peer_refreshes_its_recency() {
        let mut t = table(2);
        let (old, mid, new) = (peer(0x80, 1), peer(0x80, 2), peer(0x80, 3));
        let mut stale = old.clone();
        stale.set_last_seen(std::time::SystemTime::UNIX_EPOCH);

        t.add(old.clone());
        t.add(mid.clone());
        t.add(stale);
        t.add(new.clone());

        let bucket = &t.buckets()[logdist(t.local().id(), old.id())];
        let members: Vec<Peer> = bucket.iter().cloned().collect();
        assert_eq!(members, vec![new, old]);
    }

    #[test]
    fn peers_land_in_their_logdist_bucket() {
        let mut t = table(16);
        let samples = [peer(0x80, 1), peer(0x40, 2), peer(0x01, 3), peer(0, 9)];
        for p in &samples {
            t.add(p.clone());
        }

        for p in &samples {
            let owner = logdist(t.local().id(), p.id());
            let holders: Vec<usize> = t
                .buckets()
                .iter()
                .enumerate()
                .filter(|(_, b)| b.contains(p))
                .map(|(i, _)| i)
                .collect();
            assert_eq!(holders, vec![owner]);
        }
        assert_eq!(t.len(), samples.len());
    }

    #[test]
    fn local_node_is_never_a_member() {
        let mut t = table(16);
        let me = t.local().clone();
        t.update(me);
        assert!(t.is_empty());
    }

    #[test]
    fn delete_removes_peer() {
        let mut t = table(16);
        t.add(peer(0x80, 1));
        t.delete(peer(0x80, 1).id());
        assert!(t.lookup(peer(0x80, 1).id()).is_none());
        assert_eq!(t.len(), 0);
    }

    #[test]
    fn closest_orders_by_distance() {
        let mut t = table(16);
        for first in [0x80, 0x40, 0x20, 0x10, 0x08] {
            for last in 1..=3 {
                t.add(peer(first, last));
            }
        }
        let target = id_from(0x20, 2);
        let closest = t.find_closest(&target, 6);
        assert_eq!(closest.len(), 6);
        assert_eq!(closest[0].id(), &target);
        for pair in closest.windows(2) {
            assert_ne!(closer_cmp(&target, pair[0].id(), pair[1].id()), Ordering::Greater);
        }
    }

    #[test]
    fn closer_than_is_strict() {
        let mut t = table(16);
        t.add(peer(0x80, 1));
        t.add(peer(0x80, 2));
        t.add(peer(0x01, 1));

        let target = id_from(0x80, 0);
        let closer = t.find_closer_than(&target, t.local().id(), 8);
        assert_eq!(closer.len(), 2);
        assert!(closer.iter().all(|p| p.id().as_bytes()[0] == 0x80));

        let none = t.find_closer_than(&target, &id_from(0x80, 1), 8);
        assert!(none.is_empty());
    }

    #[test]
    fn random_sample_is_distinct_and_bounded() {
        let mut t = table(16);
        for last in 1..=30 {
            t.add(peer(1 << (last % 8), last));
        }
        let sample = t.find_random(10);
        assert_eq!(sample.len(), 10);
        let unique: HashSet<_> = sample.iter().map(|p| *p.id()).collect();
        assert_eq!(unique.len(), 10);
        assert!(sample.iter().all(|p| t.lookup(p.id()).is_some()));

        assert_eq!(t.find_random(0).len(), DEFAULT_QUERY_SIZE);
        assert_eq!(t.len(), 30);
        assert_eq!(t.find_random(1000).len(), 30);
    }

    #[test]
    fn random_per_bucket_hits_each_occupied_bucket() {
        let mut t = table(16);
        t.add(peer(0x80, 1));
        t.add(peer(0x80, 2));
        t.add(peer(0x40, 1));
        t.add(peer(0x01, 1));
        let picks = t.random_per_bucket();
        assert_eq!(picks.len(), 3);
        let buckets: HashSet<usize> = picks.iter().map(|p| logdist(t.local().id(), p.id())).collect();
        assert_eq!(buckets.len(), 3);
    }

    #[tokio::test]
    async fn handle_serializes_commands() {
        let handle = TableHandle::spawn(table(16));
        handle.add(peer(0x80, 1)).await;
        handle.update(peer(0x40, 1)).await;
        assert_eq!(handle.len().await, 2);
        assert_eq!(handle.occupied_buckets().await, 2);
        assert!(handle.lookup(*peer(0x80, 1).id()).await.is_some());

        handle.delete(*peer(0x80, 1).id()).await;
        assert_eq!(handle.len().await, 1);
        assert_eq!(handle.peers().await, vec![peer(0x40, 1)]);
        assert_eq!(handle.find_closest(id_from(0x40, 0), 4).await.len(), 1);
    }
}
