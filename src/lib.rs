//! # Kadmesh - Kademlia-style Overlay Node
//!
//! Kadmesh runs a peer-to-peer overlay node over plain UDP:
//!
//! - **Identity**: fixed-width XOR-metric node IDs and `kad://` peer URLs
//! - **Routing**: k-buckets by log-distance, most recently seen first
//! - **Discovery**: `Ping` / `FindNode` maintenance and bootstrap
//! - **Key-value**: partitioned replication to a key's closest custodians,
//!   and first-writer-wins gossip replication with pull-based repair
//!
//! ## Architecture
//!
//! The routing table is owned by an actor task behind a cloneable
//! [`TableHandle`]. A [`Node`] owns the socket reader, the socket writer, and
//! a control loop that dispatches inbound messages and fires the maintenance
//! timers. Bucket members, the node-list backup, the node ID, and KV values
//! live in a pluggable [`Store`].
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API and task wiring |
//! | `identity` | Node IDs, XOR distance, peer URLs |
//! | `bucket` | One k-bucket with recency eviction |
//! | `routing` | Routing table queries and its actor handle |
//! | `messages` | Wire format: kind byte, JSON body, delimiter |
//! | `framing` | Per-sender record reassembly |
//! | `transport` | Socket reader/writer, dedup cache, message IDs |
//! | `discovery` | Ping, FindNode, bootstrap, node-list backup |
//! | `kv` | Partitioned and gossip key-value handlers |
//! | `protocols` | Inbound dispatch |
//! | `store` | Storage trait with in-memory and sled backends |
//! | `config` | TOML configuration |
//! | `clock` | SNTP clock drift check |

mod bucket;
mod clock;
mod config;
mod discovery;
mod framing;
mod identity;
mod kv;
mod messages;
mod node;
mod protocols;
mod routing;
mod store;
mod transport;

pub use bucket::KBucket;
pub use clock::{ClockCheck, Drift, SntpClock};
pub use config::{Config, ConfigError, NtpConfig};
pub use framing::{FrameBuffer, PeerFramers};
pub use identity::{HASH_BITS, ID_BYTES, NodeId, ParseError, Peer, closer_cmp, distance_cmp, logdist};
pub use kv::KvError;
pub use messages::{
    DELIMITER, DecodeError, FindNode, FindNodeResp, Header, KvEntry, KvKey, Message, MessageKind,
    Payload, Ping,
};
pub use node::{Node, TelemetrySnapshot};
pub use routing::{RoutingTable, TableHandle};
pub use store::{MemoryStore, SledStore, Store, StoreError};
pub use transport::{SeenCache, TransportError};
