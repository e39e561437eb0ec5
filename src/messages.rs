//! # Wire Messages
//!
//! Every datagram record is `[kind byte][JSON body][b'\n']`. The kind byte
//! selects the payload variant; the body carries the routing header and the
//! payload fields under `data`:
//!
//! ```text
//! 0x02 {"version":"1.0.0","id":"…","source_addr":"10.0.0.1:4100",
//!       "source_id":"ab…","target_addr":"10.0.0.2:4100",
//!       "data":{"target":"cd…","count":8}} \n
//! ```
//!
//! Byte strings inside payloads are hex encoded, so a well-formed body never
//! contains the record delimiter.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::{NodeId, Peer};

/// Record delimiter terminating every encoded message.
pub const DELIMITER: u8 = b'\n';

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,

    #[error("unknown message kind 0x{0:02x}")]
    UnknownKind(u8),

    #[error("malformed {kind:?} body: {source}")]
    Body {
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },
}

/// One-byte payload discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Ping = 0x01,
    FindNode = 0x02,
    FindNodeResp = 0x03,
    KvSet = 0x04,
    KvGet = 0x05,
    KvGetResp = 0x06,
    GkvSet = 0x07,
    GkvGet = 0x08,
    GkvGetResp = 0x09,
}

impl TryFrom<u8> for MessageKind {
    type Error = DecodeError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Ok(match byte {
            0x01 => Self::Ping,
            0x02 => Self::FindNode,
            0x03 => Self::FindNodeResp,
            0x04 => Self::KvSet,
            0x05 => Self::KvGet,
            0x06 => Self::KvGetResp,
            0x07 => Self::GkvSet,
            0x08 => Self::GkvGet,
            0x09 => Self::GkvGetResp,
            other => return Err(DecodeError::UnknownKind(other)),
        })
    }
}

impl MessageKind {
    /// Whether `byte` opens a record. JSON bodies never contain these bytes.
    pub fn is_kind_byte(byte: u8) -> bool {
        Self::try_from(byte).is_ok()
    }
}

/// Routing and bookkeeping fields shared by every message.
///
/// The outbound writer fills `version`, `id`, `source_addr` and `source_id`
/// when they are left empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<NodeId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindNode {
    pub target: NodeId,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindNodeResp {
    pub peers: Vec<String>,
}

/// A key with its value and optional absolute expiry (unix seconds).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvEntry {
    #[serde(with = "hex::serde")]
    pub key: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub value: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvKey {
    #[serde(with = "hex::serde")]
    pub key: Vec<u8>,
}

/// Every payload the overlay understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Ping(Ping),
    FindNode(FindNode),
    FindNodeResp(FindNodeResp),
    KvSet(KvEntry),
    KvGet(KvKey),
    KvGetResp(KvEntry),
    GkvSet(KvEntry),
    GkvGet(KvKey),
    GkvGetResp(KvEntry),
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Ping(_) => MessageKind::Ping,
            Payload::FindNode(_) => MessageKind::FindNode,
            Payload::FindNodeResp(_) => MessageKind::FindNodeResp,
            Payload::KvSet(_) => MessageKind::KvSet,
            Payload::KvGet(_) => MessageKind::KvGet,
            Payload::KvGetResp(_) => MessageKind::KvGetResp,
            Payload::GkvSet(_) => MessageKind::GkvSet,
            Payload::GkvGet(_) => MessageKind::GkvGet,
            Payload::GkvGetResp(_) => MessageKind::GkvGetResp,
        }
    }
}

#[derive(Serialize)]
struct BodyRef<'a, T> {
    #[serde(flatten)]
    header: &'a Header,
    data: &'a T,
}

#[derive(Deserialize)]
struct Body<T> {
    #[serde(flatten)]
    header: Header,
    data: T,
}

/// A header plus one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub payload: Payload,
}

impl Message {
    pub fn new(payload: Payload) -> Self {
        Self {
            header: Header::default(),
            payload,
        }
    }

    /// A message addressed to `peer`.
    pub fn to_peer(peer: &Peer, payload: Payload) -> Self {
        let mut msg = Self::new(payload);
        msg.address_to(peer);
        msg
    }

    /// Point the message at `peer`, leaving every other field untouched.
    pub fn address_to(&mut self, peer: &Peer) {
        self.header.target_addr = peer.addr().map(|a| a.to_string());
        self.header.target_id = Some(*peer.id());
    }

    /// A response routed back to the sender named in `request`.
    ///
    /// `None` when the request carries no source address.
    pub fn reply_to(request: &Header, payload: Payload) -> Option<Self> {
        let addr = request.source_addr.clone()?;
        let mut msg = Self::new(payload);
        msg.header.target_addr = Some(addr);
        msg.header.target_id = request.source_id;
        Some(msg)
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// The sender as a routable peer, when both source fields are present and valid.
    pub fn source_peer(&self) -> Option<Peer> {
        let id = self.header.source_id?;
        let addr = self.header.source_addr.as_deref()?.parse().ok()?;
        Some(Peer::new(id, addr))
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut out = vec![self.kind() as u8];
        let header = &self.header;
        match &self.payload {
            Payload::Ping(data) => write_body(&mut out, header, data)?,
            Payload::FindNode(data) => write_body(&mut out, header, data)?,
            Payload::FindNodeResp(data) => write_body(&mut out, header, data)?,
            Payload::KvSet(data)
            | Payload::KvGetResp(data)
            | Payload::GkvSet(data)
            | Payload::GkvGetResp(data) => write_body(&mut out, header, data)?,
            Payload::KvGet(data) | Payload::GkvGet(data) => write_body(&mut out, header, data)?,
        }
        out.push(DELIMITER);
        Ok(out)
    }

    /// Decode one record. A trailing delimiter is tolerated.
    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        let frame = frame.strip_suffix(&[DELIMITER]).unwrap_or(frame);
        let (&first, body) = frame.split_first().ok_or(DecodeError::Empty)?;
        let kind = MessageKind::try_from(first)?;

        let (header, payload) = match kind {
            MessageKind::Ping => read_body(kind, body, Payload::Ping)?,
            MessageKind::FindNode => read_body(kind, body, Payload::FindNode)?,
            MessageKind::FindNodeResp => read_body(kind, body, Payload::FindNodeResp)?,
            MessageKind::KvSet => read_body(kind, body, Payload::KvSet)?,
            MessageKind::KvGet => read_body(kind, body, Payload::KvGet)?,
            MessageKind::KvGetResp => read_body(kind, body, Payload::KvGetResp)?,
            MessageKind::GkvSet => read_body(kind, body, Payload::GkvSet)?,
            MessageKind::GkvGet => read_body(kind, body, Payload::GkvGet)?,
            MessageKind::GkvGetResp => read_body(kind, body, Payload::GkvGetResp)?,
        };
        Ok(Self { header, payload })
    }
}

fn write_body<T: Serialize>(
    out: &mut Vec<u8>,
    header: &Header,
    data: &T,
) -> Result<(), serde_json::Error> {
    serde_json::to_writer(out, &BodyRef { header, data })
}

fn read_body<T: DeserializeOwned>(
    kind: MessageKind,
    body: &[u8],
    wrap: fn(T) -> Payload,
) -> Result<(Header, Payload), DecodeError> {
    let parsed: Body<T> =
        serde_json::from_slice(body).map_err(|source| DecodeError::Body { kind, source })?;
    Ok((parsed.header, wrap(parsed.data)))
}
