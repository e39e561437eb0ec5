//! # High-Level Node API
//!
//! A [`Node`] is the context object every component receives: configuration,
//! the local peer, the routing table handle, the store, the outbound queue,
//! and the dedup cache. It is cheap to clone and is what protocol handlers
//! get alongside each message.
//!
//! ## Quick Start
//!
//! ```ignore
//! let mut config = Config::loopback();
//! config.seeds.push("kad://…@10.0.0.1:4100".into());
//! let node = Node::bind(config, Arc::new(MemoryStore::new())).await?;
//!
//! node.gkv_set(b"greeting", b"hello", None).await;
//! let peers = node.find_closest(&target_hex, 8).await?;
//! ```
//!
//! ## Tasks
//!
//! `bind` starts three long-lived tasks: the socket reader, the socket
//! writer, and the control loop. The control loop multiplexes inbound
//! messages with the maintenance timers and spawns a task per message and
//! per timer fire, so no handler or fan-out can stall the others.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::rngs::OsRng;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};
use tracing::{debug, info, trace, warn};

use crate::clock::{ClockCheck, SntpClock, report_drift};
use crate::config::Config;
use crate::discovery;
use crate::identity::{NodeId, ParseError, Peer};
use crate::kv;
use crate::messages::{Header, KvEntry, KvKey, Message};
use crate::protocols;
use crate::routing::{RoutingTable, TableHandle};
use crate::store::{Store, StoreError};
use crate::transport::{IdPool, OutboundDefaults, Reader, SeenCache, Writer, new_message_id};

/// Store key of the persisted local node ID.
const SELF_ID_KEY: &[u8] = b"self:id";

/// Point-in-time view of a node, for periodic logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub peers: usize,
    pub occupied_buckets: usize,
    pub seen_ids: usize,
}

#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    config: Config,
    local: Peer,
    table: TableHandle,
    store: Arc<dyn Store>,
    outbound: mpsc::Sender<Message>,
    seen: SeenCache,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("local", &self.inner.local)
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Bind the UDP socket, start the node's tasks, and bootstrap from the
    /// persisted peer list and the configured seeds.
    ///
    /// Fails if the configuration is invalid, a configured seed does not
    /// parse, or the socket cannot be bound. Nothing is spawned on failure.
    pub async fn bind(config: Config, store: Arc<dyn Store>) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let seeds = discovery::parse_seeds(&config.seeds)?;
        let id = load_identity(&config, store.as_ref())?;

        let socket = UdpSocket::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;
        let local_addr = socket.local_addr().context("socket has no local address")?;
        let socket = Arc::new(socket);

        let advertise = config.advertise.unwrap_or(local_addr);
        let local = Peer::new(id, advertise);

        let table = TableHandle::spawn(RoutingTable::new(
            local.clone(),
            config.bucket_size,
            store.clone(),
        ));
        let (outbound_tx, outbound_rx) = mpsc::channel(config.queue_len);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.queue_len);

        let writer = Writer {
            socket: socket.clone(),
            outbound: outbound_rx,
            ids: IdPool::spawn(config.id_pool_size),
            defaults: OutboundDefaults {
                version: config.protocol_version.clone(),
                source_addr: advertise.to_string(),
                source_id: id,
            },
            table: table.clone(),
            write_timeout: config.write_timeout(),
        };
        let reader = Reader {
            socket,
            inbound: inbound_tx,
            max_buf_len: config.max_buf_len,
            read_timeout: config.read_timeout(),
        };

        let node = Self::from_parts(config, local, table, store, outbound_tx);

        tokio::spawn(writer.run());
        tokio::spawn(reader.run());
        tokio::spawn(node.clone().control_loop(inbound_rx));

        info!("Node {}/{}", local_addr, id);
        discovery::bootstrap(&node, seeds).await;
        Ok(node)
    }

    fn from_parts(
        config: Config,
        local: Peer,
        table: TableHandle,
        store: Arc<dyn Store>,
        outbound: mpsc::Sender<Message>,
    ) -> Self {
        let seen = SeenCache::new(config.dedup_capacity, config.dedup_ttl());
        Self {
            inner: Arc::new(NodeInner {
                config,
                local,
                table,
                store,
                outbound,
                seen,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn local_peer(&self) -> &Peer {
        &self.inner.local
    }

    pub fn id(&self) -> NodeId {
        *self.inner.local.id()
    }

    /// The local node's canonical URL.
    pub fn self_node(&self) -> String {
        self.inner.local.url().to_string()
    }

    pub(crate) fn table(&self) -> &TableHandle {
        &self.inner.table
    }

    pub(crate) fn store(&self) -> &dyn Store {
        self.inner.store.as_ref()
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Queue a message for the writer. Waits while the queue is full.
    pub async fn write(&self, msg: Message) {
        if self.inner.outbound.send(msg).await.is_err() {
            warn!("outbound queue closed, message dropped");
        }
    }

    /// Send a copy of `msg` to every known peer.
    pub async fn broadcast(&self, msg: Message) {
        let peers = self.inner.table.peers().await;
        self.send_each(msg, &peers).await;
    }

    /// Send a copy of `msg` to a random sample of `node_broadcast_number` peers.
    pub async fn random_cast(&self, msg: Message) {
        let peers = self
            .inner
            .table
            .find_random(self.inner.config.node_broadcast_number)
            .await;
        self.send_each(msg, &peers).await;
    }

    /// Send a copy of `msg` to each of `peers`. Only the target fields change.
    pub(crate) async fn send_each(&self, msg: Message, peers: &[Peer]) {
        for peer in peers {
            let mut copy = msg.clone();
            copy.address_to(peer);
            self.write(copy).await;
        }
    }

    /// Header for a request this node originates.
    pub(crate) fn origin_header(&self) -> Header {
        let id = new_message_id();
        self.inner.seen.first_sighting(&id);
        Header {
            version: Some(self.inner.config.protocol_version.clone()),
            id: Some(id),
            source_addr: self.inner.local.addr().map(|a| a.to_string()),
            source_id: Some(self.id()),
            ..Header::default()
        }
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Dedup `msg` by ID and hand it to its handler on a new task.
    ///
    /// Returns `None` when the ID was already seen. Messages without an ID
    /// cannot be deduplicated and are always dispatched.
    pub(crate) fn deliver(&self, from: SocketAddr, msg: Message) -> Option<JoinHandle<()>> {
        if let Some(id) = msg.header.id.as_deref()
            && !self.inner.seen.first_sighting(id)
        {
            trace!(id, %from, "dropping duplicate message");
            return None;
        }
        let node = self.clone();
        Some(tokio::spawn(async move {
            protocols::dispatch(&node, from, msg).await;
        }))
    }

    async fn control_loop(self, mut inbound: mpsc::Receiver<(SocketAddr, Message)>) {
        let config = &self.inner.config;
        let mut ping = periodic(config.ping_interval());
        let mut find = periodic(config.find_node_interval());
        let mut backup = periodic(config.backup_interval());
        let mut sweep = periodic(config.dedup_ttl().max(Duration::from_secs(1)));
        let mut clock = periodic(config.ntp_interval());
        let clock_check: Option<Arc<dyn ClockCheck>> = config
            .ntp
            .enabled
            .then(|| Arc::new(SntpClock::new(&config.ntp)) as Arc<dyn ClockCheck>);
        let drift_threshold_ms = config.ntp.drift_threshold_ms;

        loop {
            tokio::select! {
                received = inbound.recv() => match received {
                    Some((from, msg)) => {
                        self.deliver(from, msg);
                    }
                    None => {
                        debug!("inbound queue closed, control loop exiting");
                        break;
                    }
                },
                _ = ping.tick() => {
                    let node = self.clone();
                    tokio::spawn(async move { node.ping_random_peers().await });
                }
                _ = find.tick() => {
                    let node = self.clone();
                    tokio::spawn(async move { node.find_random_peers().await });
                }
                _ = backup.tick() => {
                    let node = self.clone();
                    tokio::spawn(async move { discovery::backup_peers(&node).await });
                }
                _ = sweep.tick() => {
                    self.inner.seen.expire();
                }
                _ = clock.tick(), if clock_check.is_some() => {
                    if let Some(check) = clock_check.clone() {
                        tokio::spawn(async move {
                            report_drift(check.as_ref(), drift_threshold_ms).await;
                        });
                    }
                }
            }
        }
    }

    // ========================================================================
    // Routing table
    // ========================================================================

    pub async fn table_size(&self) -> usize {
        self.inner.table.len().await
    }

    /// Canonical URLs of every peer in the table.
    pub async fn dump_all_known_peers(&self) -> Vec<String> {
        urls(self.inner.table.peers().await)
    }

    /// Refresh (or insert) peers as freshly contacted.
    ///
    /// Every URL is parsed before any is applied, so a bad entry leaves the
    /// table untouched.
    pub async fn update_peers(&self, raw: &[&str]) -> Result<(), ParseError> {
        let peers = raw
            .iter()
            .map(|s| Peer::parse(s))
            .collect::<Result<Vec<_>, _>>()?;
        for peer in peers {
            self.inner.table.update(peer).await;
        }
        Ok(())
    }

    /// Insert a peer. Like every bucket insert, this stamps it as seen now.
    pub async fn add_peer(&self, raw: &str) -> Result<(), ParseError> {
        let peer = Peer::parse(raw)?;
        self.inner.table.add(peer).await;
        Ok(())
    }

    /// Remove peers by hex ID (or peer URL).
    pub async fn delete_peers(&self, ids: &[&str]) -> Result<(), ParseError> {
        let ids = ids
            .iter()
            .map(|s| Peer::parse(s).map(|p| *p.id()))
            .collect::<Result<Vec<_>, _>>()?;
        for id in ids {
            self.inner.table.delete(id).await;
        }
        Ok(())
    }

    pub async fn find_closest(&self, target: &str, n: usize) -> Result<Vec<String>, ParseError> {
        let target = NodeId::from_hex(target)?;
        Ok(urls(self.inner.table.find_closest(target, n).await))
    }

    pub async fn find_random(&self, n: usize) -> Vec<String> {
        urls(self.inner.table.find_random(n).await)
    }

    /// Known peers closer to `target` than `measure` is.
    pub async fn find_closer_than(&self, target: &str, measure: &str) -> Result<Vec<String>, ParseError> {
        let target = NodeId::from_hex(target)?;
        let measure = NodeId::from_hex(measure)?;
        let n = self.inner.config.node_response_number;
        Ok(urls(self.inner.table.find_closer_than(target, measure, n).await))
    }

    /// Known peers closer to `target` than this node is.
    pub async fn find_closer_than_self(&self, target: &str) -> Result<Vec<String>, ParseError> {
        let target = NodeId::from_hex(target)?;
        let n = self.inner.config.node_response_number;
        Ok(urls(self.inner.table.find_closer_than(target, self.id(), n).await))
    }

    /// Ping a random sample of known peers now.
    pub async fn ping_random_peers(&self) {
        discovery::ping_random_peers(self).await;
    }

    /// Send FindNode to one random member of every non-empty bucket now.
    pub async fn find_random_peers(&self) {
        discovery::find_random_peers(self).await;
    }

    // ========================================================================
    // Key-value
    // ========================================================================

    /// Store `value` with the key's custodians (possibly this node).
    pub async fn kv_set(&self, key: &[u8], value: &[u8], ttl: Option<Duration>) {
        let entry = kv::new_entry(key, value, ttl);
        kv::on_kv_set(self, self.origin_header(), entry).await;
    }

    /// Ask the key's custodians for its value. The answer is cached locally;
    /// read it with [`Node::kv_local`].
    pub async fn kv_get(&self, key: &[u8]) {
        let key = KvKey { key: key.to_vec() };
        kv::on_kv_get(self, self.origin_header(), key).await;
    }

    /// Store `value` locally if absent and gossip it to random peers.
    pub async fn gkv_set(&self, key: &[u8], value: &[u8], ttl: Option<Duration>) {
        let entry: KvEntry = kv::new_entry(key, value, ttl);
        kv::on_gkv_set(self, self.origin_header(), entry).await;
    }

    /// Pull a gossiped value. Read the result with [`Node::gkv_local`].
    pub async fn gkv_get(&self, key: &[u8]) {
        let key = KvKey { key: key.to_vec() };
        kv::on_gkv_get(self, self.origin_header(), key).await;
    }

    pub fn kv_local(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(kv::read_value(self.store(), kv::PARTITION_PREFIX, key)?.map(|v| v.value))
    }

    pub fn gkv_local(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(kv::read_value(self.store(), kv::GOSSIP_PREFIX, key)?.map(|v| v.value))
    }

    pub async fn telemetry(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            peers: self.inner.table.len().await,
            occupied_buckets: self.inner.table.occupied_buckets().await,
            seen_ids: self.inner.seen.len(),
        }
    }
}

fn urls(peers: Vec<Peer>) -> Vec<String> {
    peers.into_iter().map(|p| p.url().to_string()).collect()
}

/// An interval whose first tick is one full period away.
fn periodic(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

fn load_identity(config: &Config, store: &dyn Store) -> Result<NodeId> {
    if let Some(hex) = &config.node_id {
        return NodeId::from_hex(hex).context("invalid node_id in configuration");
    }
    if let Some(bytes) = store.get(SELF_ID_KEY).context("failed to read persisted node ID")? {
        match NodeId::from_slice(&bytes) {
            Ok(id) => return Ok(id),
            Err(e) => warn!(error = %e, "ignoring malformed persisted node ID"),
        }
    }
    let id = NodeId::random(&mut OsRng);
    store
        .set(SELF_ID_KEY, id.as_bytes())
        .context("failed to persist node ID")?;
    Ok(id)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::routing::RoutingTable;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    /// A node with no socket: outbound messages land on the returned receiver.
    pub(crate) fn detached(
        config: Config,
        local: Peer,
        store: Arc<dyn Store>,
    ) -> (Node, mpsc::Receiver<Message>) {
        let table = TableHandle::spawn(RoutingTable::with_rng(
            local.clone(),
            config.bucket_size,
            store.clone(),
            StdRng::seed_from_u64(0x5eed),
        ));
        let (tx, rx) = mpsc::channel(1024);
        (Node::from_parts(config, local, table, store, tx), rx)
    }

    /// Everything queued so far, without waiting.
    pub(crate) fn drain(rx: &mut mpsc::Receiver<Message>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }
}
