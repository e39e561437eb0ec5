//! # Transport
//!
//! Datagram I/O for the overlay. Two long-lived tasks share one UDP socket:
//!
//! - the **reader** frames incoming datagrams per remote address, decodes
//!   them, and pushes `(from, Message)` onto the bounded inbound queue;
//! - the **writer** is the single consumer of the bounded outbound queue. It
//!   completes missing header fields, resolves the destination, and sends.
//!
//! Neither task ever retries. A failed decode, resolve, or send is logged and
//! the record is dropped; higher layers recover through periodic re-pings.
//!
//! Also here: [`IdPool`], which pre-generates message IDs, and [`SeenCache`],
//! the time-bounded record of message IDs already dispatched.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use thiserror::Error;
use tokio::net::{UdpSocket, lookup_host};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::framing::PeerFramers;
use crate::identity::NodeId;
use crate::messages::{DELIMITER, Message, MessageKind};
use crate::routing::TableHandle;

/// Pause after a read error or idle read deadline.
pub const READ_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("message has neither a target address nor a routable target ID")]
    MissingTarget,

    #[error("cannot resolve {addr:?}: {reason}")]
    Resolve { addr: String, reason: String },

    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("send timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Message IDs
// ============================================================================

/// Bounded queue of fresh message IDs filled by a background task.
#[derive(Debug)]
pub struct IdPool {
    rx: mpsc::Receiver<String>,
}

impl IdPool {
    /// Start the filler task. Requires a Tokio runtime.
    pub fn spawn(size: usize) -> Self {
        let (tx, rx) = mpsc::channel(size.max(1));
        tokio::spawn(async move {
            while tx.send(new_message_id()).await.is_ok() {}
        });
        Self { rx }
    }

    /// Next unused ID. Waits only if the filler has fallen behind.
    pub async fn next(&mut self) -> String {
        match self.rx.recv().await {
            Some(id) => id,
            None => new_message_id(),
        }
    }
}

pub fn new_message_id() -> String {
    Uuid::new_v4().simple().to_string()
}

// ============================================================================
// Dedup
// ============================================================================

/// Message IDs seen within the last `ttl`, bounded to `capacity` entries.
#[derive(Debug)]
pub struct SeenCache {
    entries: Mutex<LruCache<String, Instant>>,
    ttl: Duration,
}

impl SeenCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
            ttl,
        }
    }

    /// Record `id`. Returns `true` the first time an ID is seen within the TTL.
    pub fn first_sighting(&self, id: &str) -> bool {
        let now = Instant::now();
        let Ok(mut entries) = self.entries.lock() else {
            return true;
        };
        if let Some(seen_at) = entries.get(id)
            && now.duration_since(*seen_at) < self.ttl
        {
            return false;
        }
        entries.put(id.to_string(), now);
        true
    }

    /// Drop entries older than the TTL.
    pub fn expire(&self) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        let now = Instant::now();
        while let Some((_, seen_at)) = entries.peek_lru() {
            if now.duration_since(*seen_at) < self.ttl {
                break;
            }
            entries.pop_lru();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Socket tasks
// ============================================================================

/// Header values the writer fills in when a message leaves them empty.
#[derive(Debug, Clone)]
pub struct OutboundDefaults {
    pub version: String,
    pub source_addr: String,
    pub source_id: NodeId,
}

impl OutboundDefaults {
    fn apply(&self, msg: &mut Message) {
        let header = &mut msg.header;
        if header.version.is_none() {
            header.version = Some(self.version.clone());
        }
        if header.source_addr.is_none() {
            header.source_addr = Some(self.source_addr.clone());
        }
        if header.source_id.is_none() {
            header.source_id = Some(self.source_id);
        }
    }
}

pub struct Writer {
    pub socket: Arc<UdpSocket>,
    pub outbound: mpsc::Receiver<Message>,
    pub ids: IdPool,
    pub defaults: OutboundDefaults,
    pub table: TableHandle,
    pub write_timeout: Duration,
}

impl Writer {
    pub async fn run(mut self) {
        while let Some(mut msg) = self.outbound.recv().await {
            self.defaults.apply(&mut msg);
            if msg.header.id.is_none() {
                msg.header.id = Some(self.ids.next().await);
            }
            if let Err(e) = self.send(&msg).await {
                warn!(
                    kind = ?msg.kind(),
                    target = ?msg.header.target_addr,
                    error = %e,
                    "dropping outbound message"
                );
            }
        }
        debug!("outbound queue closed, writer exiting");
    }

    async fn send(&self, msg: &Message) -> Result<(), TransportError> {
        let dest = resolve(msg, &self.table).await?;
        let bytes = msg.encode()?;
        match timeout(self.write_timeout, self.socket.send_to(&bytes, dest)).await {
            Ok(Ok(_)) => {
                trace!(kind = ?msg.kind(), %dest, len = bytes.len(), "sent");
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(TransportError::Timeout(self.write_timeout)),
        }
    }
}

/// Destination of `msg`: its target address, else the routing-table address
/// of its target ID.
pub async fn resolve(msg: &Message, table: &TableHandle) -> Result<SocketAddr, TransportError> {
    if let Some(addr) = msg.header.target_addr.as_deref() {
        if let Ok(parsed) = addr.parse() {
            return Ok(parsed);
        }
        let mut found = lookup_host(addr).await.map_err(|e| TransportError::Resolve {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;
        return found.next().ok_or_else(|| TransportError::Resolve {
            addr: addr.to_string(),
            reason: "no addresses".to_string(),
        });
    }

    if let Some(id) = msg.header.target_id
        && let Some(addr) = table.lookup(id).await.and_then(|p| p.addr())
    {
        return Ok(addr);
    }
    Err(TransportError::MissingTarget)
}

pub struct Reader {
    pub socket: Arc<UdpSocket>,
    pub inbound: mpsc::Sender<(SocketAddr, Message)>,
    pub max_buf_len: usize,
    pub read_timeout: Duration,
}

impl Reader {
    pub async fn run(self) {
        let mut buf = vec![0u8; self.max_buf_len];
        let mut framers =
            PeerFramers::new(DELIMITER, self.max_buf_len).with_record_start(MessageKind::is_kind_byte);

        loop {
            let (len, from) = match timeout(self.read_timeout, self.socket.recv_from(&mut buf)).await {
                Ok(Ok(received)) => received,
                Ok(Err(e)) => {
                    warn!(error = %e, "socket read failed");
                    sleep(READ_BACKOFF).await;
                    continue;
                }
                Err(_) => {
                    trace!("read deadline elapsed");
                    sleep(READ_BACKOFF).await;
                    continue;
                }
            };

            for record in framers.push(from, &buf[..len]) {
                match Message::decode(&record) {
                    Ok(msg) => {
                        if self.inbound.send((from, msg)).await.is_err() {
                            debug!("inbound queue closed, reader exiting");
                            return;
                        }
                    }
                    Err(e) => {
                        debug!(%from, error = %e, "dropping undecodable record");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{ID_BYTES, Peer};
    use crate::messages::{Payload, Ping};
    use crate::routing::RoutingTable;
    use crate::store::MemoryStore;
    use std::collections::HashSet;

    #[test]
    fn seen_cache_reports_each_id_once() {
        let cache = SeenCache::new(16, Duration::from_secs(60));
        assert!(cache.first_sighting("a"));
        assert!(!cache.first_sighting("a"));
        assert!(cache.first_sighting("b"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn seen_cache_forgets_after_ttl() {
        let cache = SeenCache::new(16, Duration::ZERO);
        assert!(cache.first_sighting("a"));
        assert!(cache.first_sighting("a"));
        cache.expire();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn id_pool_yields_unique_ids() {
        let mut pool = IdPool::spawn(8);
        let mut ids = HashSet::new();
        for _ in 0..100 {
            assert!(ids.insert(pool.next().await));
        }
    }

    fn table_with(peer: &Peer) -> TableHandle {
        let local = Peer::new(NodeId::from_bytes([0; ID_BYTES]), "127.0.0.1:1".parse().unwrap());
        let mut table = RoutingTable::new(local, 16, Arc::new(MemoryStore::new()));
        table.add(peer.clone());
        TableHandle::spawn(table)
    }

    #[tokio::test]
    async fn resolve_prefers_address_then_table() {
        let known = Peer::new(NodeId::from_bytes([7; ID_BYTES]), "10.9.9.9:4000".parse().unwrap());
        let table = table_with(&known);

        let mut msg = Message::new(Payload::Ping(Ping {}));
        assert!(matches!(
            resolve(&msg, &table).await,
            Err(TransportError::MissingTarget)
        ));

        msg.header.target_id = Some(*known.id());
        assert_eq!(resolve(&msg, &table).await.unwrap(), known.addr().unwrap());

        msg.header.target_addr = Some("127.0.0.1:5000".into());
        assert_eq!(
            resolve(&msg, &table).await.unwrap(),
            "127.0.0.1:5000".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn defaults_fill_only_missing_fields() {
        let defaults = OutboundDefaults {
            version: "1.0.0".into(),
            source_addr: "10.0.0.1:1".into(),
            source_id: NodeId::from_bytes([1; ID_BYTES]),
        };
        let mut msg = Message::new(Payload::Ping(Ping {}));
        msg.header.source_addr = Some("10.0.0.5:5".into());
        defaults.apply(&mut msg);
        assert_eq!(msg.header.version.as_deref(), Some("1.0.0"));
        assert_eq!(msg.header.source_addr.as_deref(), Some("10.0.0.5:5"));
        assert_eq!(msg.header.source_id, Some(NodeId::from_bytes([1; ID_BYTES])));
    }

    #[tokio::test]
    async fn reader_and_writer_exchange_a_datagram() {
        let a = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let b = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let b_addr = b.local_addr().unwrap();

        let (out_tx, out_rx) = mpsc::channel(8);
        let (in_tx, mut in_rx) = mpsc::channel(8);
        let local = Peer::new(NodeId::from_bytes([1; ID_BYTES]), a.local_addr().unwrap());
        let table = TableHandle::spawn(RoutingTable::new(
            local.clone(),
            16,
            Arc::new(MemoryStore::new()),
        ));

        tokio::spawn(
            Writer {
                socket: a.clone(),
                outbound: out_rx,
                ids: IdPool::spawn(4),
                defaults: OutboundDefaults {
                    version: "1.0.0".into(),
                    source_addr: local.addr().unwrap().to_string(),
                    source_id: *local.id(),
                },
                table,
                write_timeout: Duration::from_secs(1),
            }
            .run(),
        );
        tokio::spawn(
            Reader {
                socket: b,
                inbound: in_tx,
                max_buf_len: 16 * 1024,
                read_timeout: Duration::from_secs(1),
            }
            .run(),
        );

        let mut msg = Message::new(Payload::Ping(Ping {}));
        msg.header.target_addr = Some(b_addr.to_string());
        out_tx.send(msg).await.unwrap();

        let (from, received) = timeout(Duration::from_secs(5), in_rx.recv())
            .await
            .expect("datagram within deadline")
            .expect("reader alive");
        assert_eq!(from, a.local_addr().unwrap());
        assert!(received.header.id.is_some());
        assert_eq!(received.source_peer(), Some(local));
    }

    #[tokio::test]
    async fn reader_recovers_after_unterminated_datagram() {
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();

        let (in_tx, mut in_rx) = mpsc::channel(8);
        tokio::spawn(
            Reader {
                socket,
                inbound: in_tx,
                max_buf_len: 16 * 1024,
                read_timeout: Duration::from_secs(1),
            }
            .run(),
        );

        sender.send_to(b"\x01{\"data\":", addr).await.unwrap();
        let mut ping = Message::new(Payload::Ping(Ping {}));
        ping.header.id = Some("after-junk".into());
        sender.send_to(&ping.encode().unwrap(), addr).await.unwrap();

        let (_, received) = timeout(Duration::from_secs(5), in_rx.recv())
            .await
            .expect("datagram within deadline")
            .expect("reader alive");
        assert_eq!(received.header.id.as_deref(), Some("after-junk"));
    }
}
