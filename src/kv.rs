//! # Distributed Key-Value
//!
//! Two replication policies share the persistent store:
//!
//! | Policy | Keys | Replicas | Messages |
//! |--------|------|----------|----------|
//! | Partitioned | `kv:<key>` | peers closer to the key than this node | `KvSet`, `KvGet`, `KvGetResp` |
//! | Gossip | `gkv:<key>` | random sample of `node_broadcast_number` peers | `GkvSet`, `GkvGet`, `GkvGetResp` |
//!
//! A partitioned request stops at the first node that knows fewer than
//! `node_partition_number` better custodians; every other node forwards the
//! request unchanged to the better custodians it knows. Gossip sets are
//! first-writer-wins and only the first write re-broadcasts, so a flood dies
//! out once the sample saturates. A gossip get that misses is re-broadcast
//! with its original ID, so the dedup cache bounds the repair flood.
//!
//! Values are stored as JSON `{ value, expires_at }`. An expired value reads
//! as absent and is deleted on the way out.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::identity::{NodeId, Peer};
use crate::messages::{Header, KvEntry, KvKey, Message, Payload};
use crate::node::Node;
use crate::store::{Store, StoreError, prefixed};

/// Store namespace of partitioned values.
pub const PARTITION_PREFIX: &[u8] = b"kv:";

/// Store namespace of gossiped values.
pub const GOSSIP_PREFIX: &[u8] = b"gkv:";

#[derive(Debug, Error)]
pub enum KvError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("value encoding failed: {0}")]
    Codec(#[from] serde_json::Error),
}

/// A value as persisted, with its absolute expiry in unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredValue {
    #[serde(with = "hex::serde")]
    pub value: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

impl StoredValue {
    fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn into_entry(self, key: Vec<u8>) -> KvEntry {
        KvEntry {
            key,
            value: self.value,
            expires_at: self.expires_at,
        }
    }
}

impl From<&KvEntry> for StoredValue {
    fn from(entry: &KvEntry) -> Self {
        Self {
            value: entry.value.clone(),
            expires_at: entry.expires_at,
        }
    }
}

/// An entry that expires `ttl` from now, or never.
pub fn new_entry(key: &[u8], value: &[u8], ttl: Option<Duration>) -> KvEntry {
    KvEntry {
        key: key.to_vec(),
        value: value.to_vec(),
        expires_at: ttl.map(|ttl| now_secs().saturating_add(ttl.as_secs())),
    }
}

/// The live value under `prefix` + `key`.
///
/// Expired and undecodable records are deleted and read as absent.
pub fn read_value(
    store: &dyn Store,
    prefix: &[u8],
    key: &[u8],
) -> Result<Option<StoredValue>, StoreError> {
    let record = prefixed(prefix, key);
    let Some(raw) = store.get(&record)? else {
        return Ok(None);
    };
    match serde_json::from_slice::<StoredValue>(&raw) {
        Ok(value) if !value.is_expired(now_secs()) => Ok(Some(value)),
        Ok(_) => {
            trace!(key = %hex::encode(key), "dropping expired value");
            store.delete(&record)?;
            Ok(None)
        }
        Err(e) => {
            warn!(key = %hex::encode(key), error = %e, "dropping undecodable value");
            store.delete(&record)?;
            Ok(None)
        }
    }
}

/// Overwrite the value for `entry.key`. Already-expired entries are skipped.
fn write_value(store: &dyn Store, prefix: &[u8], entry: &KvEntry) -> Result<bool, KvError> {
    let value = StoredValue::from(entry);
    if value.is_expired(now_secs()) {
        return Ok(false);
    }
    store.set(&prefixed(prefix, &entry.key), &serde_json::to_vec(&value)?)?;
    Ok(true)
}

/// Write the value only if no live value exists. Returns whether it was written.
fn write_value_if_absent(store: &dyn Store, prefix: &[u8], entry: &KvEntry) -> Result<bool, KvError> {
    let value = StoredValue::from(entry);
    if value.is_expired(now_secs()) {
        return Ok(false);
    }
    // Purges an expired record so the insert below can succeed.
    if read_value(store, prefix, &entry.key)?.is_some() {
        return Ok(false);
    }
    let written = store.insert_if_absent(&prefixed(prefix, &entry.key), &serde_json::to_vec(&value)?)?;
    Ok(written)
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ============================================================================
// Partitioned KV
// ============================================================================

/// Known peers that are better custodians of `key` than this node.
async fn better_custodians(node: &Node, key: &[u8]) -> Vec<Peer> {
    let n = node.config().node_response_number;
    node.table()
        .find_closer_than(NodeId::for_key(key), node.id(), n)
        .await
}

fn is_custodian(node: &Node, better: &[Peer]) -> bool {
    better.len() < node.config().node_partition_number
}

pub(crate) async fn on_kv_set(node: &Node, header: Header, entry: KvEntry) {
    let better = better_custodians(node, &entry.key).await;
    if is_custodian(node, &better) {
        match write_value(node.store(), PARTITION_PREFIX, &entry) {
            Ok(true) => debug!(key = %hex::encode(&entry.key), "stored partitioned value"),
            Ok(false) => debug!(key = %hex::encode(&entry.key), "ignoring expired value"),
            Err(e) => warn!(key = %hex::encode(&entry.key), error = %e, "failed to store value"),
        }
        return;
    }

    trace!(
        key = %hex::encode(&entry.key),
        custodians = better.len(),
        "forwarding KvSet"
    );
    let msg = Message {
        header,
        payload: Payload::KvSet(entry),
    };
    node.send_each(msg, &better).await;
}

pub(crate) async fn on_kv_get(node: &Node, header: Header, req: KvKey) {
    let better = better_custodians(node, &req.key).await;
    if !is_custodian(node, &better) {
        trace!(key = %hex::encode(&req.key), custodians = better.len(), "forwarding KvGet");
        let msg = Message {
            header,
            payload: Payload::KvGet(req),
        };
        node.send_each(msg, &better).await;
        return;
    }

    let value = match read_value(node.store(), PARTITION_PREFIX, &req.key) {
        Ok(Some(value)) => value,
        Ok(None) => {
            debug!(key = %hex::encode(&req.key), "KvGet miss at custodian");
            return;
        }
        Err(e) => {
            warn!(key = %hex::encode(&req.key), error = %e, "failed to read value");
            return;
        }
    };
    respond(node, &header, Payload::KvGetResp(value.into_entry(req.key))).await;
}

pub(crate) async fn on_kv_get_resp(node: &Node, entry: KvEntry) {
    if let Err(e) = write_value(node.store(), PARTITION_PREFIX, &entry) {
        warn!(key = %hex::encode(&entry.key), error = %e, "failed to cache value");
    }
}

// ============================================================================
// Gossip KV
// ============================================================================

/// A random sample of peers, minus whoever sent the request.
async fn gossip_targets(node: &Node, header: &Header) -> Vec<Peer> {
    let mut peers = node
        .table()
        .find_random(node.config().node_broadcast_number)
        .await;
    if let Some(source) = header.source_id {
        peers.retain(|p| *p.id() != source);
    }
    peers
}

pub(crate) async fn on_gkv_set(node: &Node, header: Header, entry: KvEntry) {
    match write_value_if_absent(node.store(), GOSSIP_PREFIX, &entry) {
        Ok(true) => debug!(key = %hex::encode(&entry.key), "stored gossiped value"),
        Ok(false) => {
            trace!(key = %hex::encode(&entry.key), "gossiped value already present");
            return;
        }
        Err(e) => {
            warn!(key = %hex::encode(&entry.key), error = %e, "failed to store gossiped value");
            return;
        }
    }

    let targets = gossip_targets(node, &header).await;
    let msg = Message {
        header,
        payload: Payload::GkvSet(entry),
    };
    node.send_each(msg, &targets).await;
}

pub(crate) async fn on_gkv_get(node: &Node, header: Header, req: KvKey) {
    match read_value(node.store(), GOSSIP_PREFIX, &req.key) {
        Ok(Some(value)) => {
            respond(node, &header, Payload::GkvGetResp(value.into_entry(req.key))).await;
        }
        Ok(None) => {
            let targets = gossip_targets(node, &header).await;
            trace!(key = %hex::encode(&req.key), peers = targets.len(), "re-broadcasting GkvGet");
            let msg = Message {
                header,
                payload: Payload::GkvGet(req),
            };
            node.send_each(msg, &targets).await;
        }
        Err(e) => warn!(key = %hex::encode(&req.key), error = %e, "failed to read gossiped value"),
    }
}

pub(crate) async fn on_gkv_get_resp(node: &Node, entry: KvEntry) {
    if let Err(e) = write_value(node.store(), GOSSIP_PREFIX, &entry) {
        warn!(key = %hex::encode(&entry.key), error = %e, "failed to cache gossiped value");
    }
}

/// Answer the requester. A request this node originated needs no answer,
/// the value is already local.
async fn respond(node: &Node, request: &Header, payload: Payload) {
    if request.source_id == Some(node.id()) {
        return;
    }
    match Message::reply_to(request, payload) {
        Some(reply) => node.write(reply).await,
        None => debug!("request has no source address, dropping response"),
    }
}
