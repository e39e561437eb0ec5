//! # Protocol Dispatch
//!
//! Routes each decoded, deduplicated message to its handler.
//!
//! | Kind | Handler |
//! |------|---------|
//! | `Ping` | none beyond the sender refresh |
//! | `FindNode`, `FindNodeResp` | [`discovery`] |
//! | `KvSet`, `KvGet`, `KvGetResp` | [`kv`], partitioned |
//! | `GkvSet`, `GkvGet`, `GkvGetResp` | [`kv`], gossip |
//!
//! Before any handler runs, a sender that names both its ID and a routable
//! address is refreshed in the routing table. Forwarded KV requests keep the
//! originator's source fields, so they refresh the originator.

use std::net::SocketAddr;

use tracing::trace;

use crate::discovery;
use crate::kv;
use crate::messages::{Message, Payload};
use crate::node::Node;

pub(crate) async fn dispatch(node: &Node, from: SocketAddr, msg: Message) {
    trace!(%from, kind = ?msg.kind(), id = ?msg.header.id, "dispatching");

    if let Some(peer) = msg.source_peer()
        && *peer.id() != node.id()
    {
        node.table().update(peer).await;
    }

    let Message { header, payload } = msg;
    match payload {
        Payload::Ping(_) => trace!(%from, "ping"),
        Payload::FindNode(req) => discovery::on_find_node(node, &header, req).await,
        Payload::FindNodeResp(resp) => discovery::on_find_node_resp(node, resp).await,
        Payload::KvSet(entry) => kv::on_kv_set(node, header, entry).await,
        Payload::KvGet(req) => kv::on_kv_get(node, header, req).await,
        Payload::KvGetResp(entry) => kv::on_kv_get_resp(node, entry).await,
        Payload::GkvSet(entry) => kv::on_gkv_set(node, header, entry).await,
        Payload::GkvGet(req) => kv::on_gkv_get(node, header, req).await,
        Payload::GkvGetResp(entry) => kv::on_gkv_get_resp(node, entry).await,
    }
}
