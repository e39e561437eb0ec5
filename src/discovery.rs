//! # Discovery
//!
//! Liveness and peer discovery over `Ping` and `FindNode`.
//!
//! | Trigger | Action |
//! |---------|--------|
//! | bootstrap | add seeds and persisted peers, ping them, then `FindNode` |
//! | ping timer | `Ping` to `ping_node_num` random peers |
//! | find timer | `FindNode(self)` to one random peer per non-empty bucket |
//! | backup timer | write every known peer under `nbk:<id>` |
//! | `FindNode` in | reply with up to `find_node_max_response` closest peers |
//! | `FindNodeResp` in | refresh every complete, foreign peer listed |
//!
//! A `Ping` gets no reply. Receiving any message already refreshes its
//! sender, which is all a ping is for.

use std::collections::HashSet;

use anyhow::{Context, Result};
use tracing::{debug, info, trace, warn};

use crate::bucket::BUCKET_RECORD_PREFIX;
use crate::identity::{NodeId, Peer};
use crate::messages::{FindNode, FindNodeResp, Header, Message, Payload, Ping};
use crate::node::Node;
use crate::store::{Store, prefixed};

/// Store namespace of the periodic node-list backup.
pub const BACKUP_PREFIX: &[u8] = b"nbk:";

// ============================================================================
// Inbound
// ============================================================================

pub(crate) async fn on_find_node(node: &Node, header: &Header, req: FindNode) {
    let max = node.config().find_node_max_response;
    let count = req.count.max(1).min(max);
    let peers = node.table().find_closest(req.target, count).await;
    let resp = FindNodeResp {
        peers: peers.iter().map(|p| p.url().to_string()).collect(),
    };

    match Message::reply_to(header, Payload::FindNodeResp(resp)) {
        Some(reply) => {
            trace!(lookup = %req.target, returned = peers.len(), "answering FindNode");
            node.write(reply).await;
        }
        None => debug!("FindNode without source address, not answering"),
    }
}

pub(crate) async fn on_find_node_resp(node: &Node, resp: FindNodeResp) {
    let mut learned = 0usize;
    for raw in &resp.peers {
        let peer = match Peer::parse(raw) {
            Ok(peer) => peer,
            Err(e) => {
                debug!(url = %raw, error = %e, "skipping malformed peer in FindNodeResp");
                continue;
            }
        };
        if peer.is_incomplete() || *peer.id() == node.id() {
            continue;
        }
        node.table().update(peer).await;
        learned += 1;
    }
    trace!(listed = resp.peers.len(), learned, "processed FindNodeResp");
}

// ============================================================================
// Maintenance
// ============================================================================

pub(crate) async fn ping_random_peers(node: &Node) {
    let peers = node.table().find_random(node.config().ping_node_num).await;
    debug!(peers = peers.len(), "pinging random peers");
    for peer in &peers {
        node.write(Message::to_peer(peer, Payload::Ping(Ping {}))).await;
    }
}

pub(crate) async fn find_random_peers(node: &Node) {
    let peers = node.table().random_per_bucket().await;
    debug!(peers = peers.len(), "refreshing buckets");
    send_find_node(node, &peers).await;
}

/// Replace the `nbk:` backup with the current table contents.
pub(crate) async fn backup_peers(node: &Node) {
    let peers = node.table().peers().await;
    let store = node.store();

    let current: HashSet<NodeId> = peers.iter().map(|p| *p.id()).collect();
    match store.scan_prefix(BACKUP_PREFIX) {
        Ok(records) => {
            for (key, _) in records {
                let stale = NodeId::from_slice(&key[BACKUP_PREFIX.len()..])
                    .map(|id| !current.contains(&id))
                    .unwrap_or(true);
                if stale && let Err(e) = store.delete(&key) {
                    warn!(error = %e, "failed to delete stale backup entry");
                }
            }
        }
        Err(e) => warn!(error = %e, "failed to scan node backup"),
    }

    let mut written = 0usize;
    for peer in &peers {
        let key = prefixed(BACKUP_PREFIX, peer.id().as_bytes());
        match store.set(&key, peer.url().as_bytes()) {
            Ok(()) => written += 1,
            Err(e) => warn!(peer = %peer.id(), error = %e, "failed to back up peer"),
        }
    }
    if let Err(e) = store.flush() {
        warn!(error = %e, "failed to flush node backup");
    }
    debug!(peers = written, "node list backed up");
}

/// Parse the configured seed URLs.
///
/// A seed that does not parse is an error. Seeds without an address are
/// skipped with a warning.
pub(crate) fn parse_seeds(raw_seeds: &[String]) -> Result<Vec<Peer>> {
    let mut seeds = Vec::with_capacity(raw_seeds.len());
    for raw in raw_seeds {
        let seed = Peer::parse(raw).with_context(|| format!("invalid seed {raw:?}"))?;
        if seed.is_incomplete() {
            warn!(seed = %raw, "seed has no address, skipping");
            continue;
        }
        seeds.push(seed);
    }
    Ok(seeds)
}

/// Join the overlay.
///
/// Seeds, backed-up peers, and persisted bucket members are added and
/// pinged. While the table holds fewer than `min_node_size` peers every
/// known peer gets a `FindNode`; below `max_node_size` one random peer per
/// bucket does.
pub(crate) async fn bootstrap(node: &Node, seeds: Vec<Peer>) {
    let config = node.config();
    let mut candidates = seeds;
    let seeds = candidates.len();
    candidates.extend(persisted_peers(node.store(), BACKUP_PREFIX));
    candidates.extend(persisted_peers(node.store(), BUCKET_RECORD_PREFIX));

    let local = node.id();
    let mut seen = HashSet::new();
    candidates.retain(|p| *p.id() != local && seen.insert(*p.id()));

    for peer in &candidates {
        node.table().add(peer.clone()).await;
        node.write(Message::to_peer(peer, Payload::Ping(Ping {}))).await;
    }

    let size = node.table().len().await;
    let targets = if size < config.min_node_size {
        node.table().peers().await
    } else if size < config.max_node_size {
        node.table().random_per_bucket().await
    } else {
        Vec::new()
    };
    send_find_node(node, &targets).await;

    info!(
        seeds,
        candidates = candidates.len(),
        peers = size,
        queried = targets.len(),
        "bootstrap complete"
    );
}

async fn send_find_node(node: &Node, peers: &[Peer]) {
    let req = FindNode {
        target: node.id(),
        count: node.config().find_node_num,
    };
    for peer in peers {
        node.write(Message::to_peer(peer, Payload::FindNode(req.clone()))).await;
    }
}

/// Peer URLs stored under `prefix`. Unreadable records are skipped.
fn persisted_peers(store: &dyn Store, prefix: &[u8]) -> Vec<Peer> {
    let records = match store.scan_prefix(prefix) {
        Ok(records) => records,
        Err(e) => {
            warn!(error = %e, "failed to read persisted peers");
            return Vec::new();
        }
    };
    records
        .into_iter()
        .filter_map(|(_, raw)| {
            let url = String::from_utf8(raw).ok()?;
            match Peer::parse(&url) {
                Ok(peer) if !peer.is_incomplete() => Some(peer),
                Ok(_) => None,
                Err(e) => {
                    debug!(url = %url, error = %e, "skipping unreadable persisted peer");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::identity::ID_BYTES;
    use crate::messages::MessageKind;
    use crate::node::testing::{detached, drain};
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn local() -> Peer {
        Peer::new(NodeId::from_bytes([0; ID_BYTES]), "127.0.0.1:4100".parse().unwrap())
    }

    fn remote(lead: u8, tail: u8) -> Peer {
        let mut bytes = [0u8; ID_BYTES];
        bytes[0] = lead;
        bytes[ID_BYTES - 1] = tail;
        Peer::new(
            NodeId::from_bytes(bytes),
            format!("10.0.{lead}.{tail}:4100").parse().unwrap(),
        )
    }

    fn header_from(peer: &Peer) -> Header {
        Header {
            source_id: Some(*peer.id()),
            source_addr: peer.addr().map(|a| a.to_string()),
            ..Header::default()
        }
    }

    #[tokio::test]
    async fn find_node_reply_is_clamped() {
        let mut config = Config::loopback();
        config.find_node_max_response = 2;
        let (node, mut rx) = detached(config, local(), Arc::new(MemoryStore::new()));
        for tail in 1..=5 {
            node.table().add(remote(0x80, tail)).await;
        }
        let asker = remote(0x40, 9);

        on_find_node(&node, &header_from(&asker), FindNode { target: *asker.id(), count: 100 }).await;
        on_find_node(&node, &header_from(&asker), FindNode { target: *asker.id(), count: 0 }).await;

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 2);
        let sizes: Vec<usize> = sent
            .iter()
            .map(|m| match &m.payload {
                Payload::FindNodeResp(resp) => resp.peers.len(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(sizes, vec![2, 1]);
        assert!(sent.iter().all(|m| m.header.target_id == Some(*asker.id())));
    }

    #[tokio::test]
    async fn find_node_without_source_is_not_answered() {
        let (node, mut rx) = detached(Config::loopback(), local(), Arc::new(MemoryStore::new()));
        node.table().add(remote(0x80, 1)).await;
        let req = FindNode { target: *remote(0x80, 1).id(), count: 4 };
        on_find_node(&node, &Header::default(), req).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn find_node_resp_learns_only_usable_peers() {
        let (node, _rx) = detached(Config::loopback(), local(), Arc::new(MemoryStore::new()));
        let good = remote(0x80, 1);
        let resp = FindNodeResp {
            peers: vec![
                good.url().to_string(),
                local().url().to_string(),
                remote(0x40, 2).id().to_hex(),
                "kad://nothex@10.0.0.1:1".to_string(),
            ],
        };
        on_find_node_resp(&node, resp).await;
        assert_eq!(node.table().peers().await, vec![good]);
    }

    #[tokio::test]
    async fn ping_fan_out_is_bounded() {
        let mut config = Config::loopback();
        config.ping_node_num = 2;
        let (node, mut rx) = detached(config, local(), Arc::new(MemoryStore::new()));
        for tail in 1..=3 {
            node.table().add(remote(0x80, tail)).await;
        }

        ping_random_peers(&node).await;
        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|m| m.kind() == MessageKind::Ping));
    }

    #[tokio::test]
    async fn bucket_refresh_targets_self() {
        let (node, mut rx) = detached(Config::loopback(), local(), Arc::new(MemoryStore::new()));
        node.table().add(remote(0x80, 1)).await;
        node.table().add(remote(0x80, 2)).await;
        node.table().add(remote(0x01, 3)).await;

        find_random_peers(&node).await;
        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 2);
        for msg in sent {
            match msg.payload {
                Payload::FindNode(req) => {
                    assert_eq!(req.target, node.id());
                    assert_eq!(req.count, node.config().find_node_num);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn backup_replaces_stale_entries() {
        let store = Arc::new(MemoryStore::new());
        let gone = remote(0x20, 7);
        store
            .set(&prefixed(BACKUP_PREFIX, gone.id().as_bytes()), gone.url().as_bytes())
            .unwrap();

        let (node, _rx) = detached(Config::loopback(), local(), store.clone());
        let kept = remote(0x80, 1);
        node.table().add(kept.clone()).await;
        backup_peers(&node).await;

        let backed_up = persisted_peers(store.as_ref(), BACKUP_PREFIX);
        assert_eq!(backed_up, vec![kept]);
    }

    #[tokio::test]
    async fn bootstrap_restores_and_queries() {
        let store = Arc::new(MemoryStore::new());
        let restored = remote(0x80, 1);
        store
            .set(&prefixed(BACKUP_PREFIX, restored.id().as_bytes()), restored.url().as_bytes())
            .unwrap();

        let seed = remote(0x40, 2);
        let mut config = Config::loopback();
        config.seeds = vec![seed.url().to_string(), restored.url().to_string()];
        let seeds = parse_seeds(&config.seeds).unwrap();
        let (node, mut rx) = detached(config, local(), store);

        bootstrap(&node, seeds).await;
        assert_eq!(node.table().len().await, 2);

        let sent = drain(&mut rx);
        let pings = sent.iter().filter(|m| m.kind() == MessageKind::Ping).count();
        let finds = sent.iter().filter(|m| m.kind() == MessageKind::FindNode).count();
        assert_eq!(pings, 2);
        assert_eq!(finds, 2);
    }

    #[test]
    fn bad_seed_is_rejected() {
        let seeds = vec![remote(0x40, 2).url().to_string(), "kad://short@10.0.0.1:1".into()];
        assert!(parse_seeds(&seeds).is_err());
    }

    #[test]
    fn seed_without_address_is_skipped() {
        let seed = remote(0x40, 2);
        let seeds = vec![seed.id().to_hex(), seed.url().to_string()];
        assert_eq!(parse_seeds(&seeds).unwrap(), vec![seed]);
    }
}
