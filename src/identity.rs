//! # Node Identity
//!
//! Identity and addressing types for overlay peers:
//!
//! - [`NodeId`]: fixed-width identifier, used verbatim as the XOR-metric coordinate
//! - [`Peer`]: an identifier plus (optionally) the UDP address it answers on
//! - [`logdist`] / [`distance_cmp`]: the metric primitives the routing table is built on
//!
//! ## Peer URLs
//!
//! Peers travel between nodes as canonical URL strings:
//!
//! ```text
//! kad://<hex-id>@<ip>:<port>[?discport=<udp-port>]   complete
//! kad://<hex-id>                                     incomplete
//! <hex-id>                                           incomplete
//! ```
//!
//! An incomplete peer has no address. It can be named (deleted, used as a
//! lookup target) but it never becomes a bucket member until a message from
//! it fills in the address.
//!
//! ## Invariants
//!
//! - `logdist(a, b) == logdist(b, a)` and `logdist(a, a) == 0`
//! - `Peer::parse(p.url())` yields a peer with the same ID and address as `p`
//! - Two peers with the same ID and address render to the same URL

use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::SystemTime;

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Width of a node identifier in bytes.
#[cfg(not(feature = "wide-ids"))]
pub const ID_BYTES: usize = 32;

/// Width of a node identifier in bytes.
#[cfg(feature = "wide-ids")]
pub const ID_BYTES: usize = 64;

/// Width of a node identifier in bits. The routing table has `HASH_BITS + 1` buckets.
pub const HASH_BITS: usize = ID_BYTES * 8;

/// URL scheme of a peer's canonical string form.
pub const SCHEME: &str = "kad";

const DISCPORT_PARAM: &str = "discport";

// ============================================================================
// Errors
// ============================================================================

/// Why a peer URL or hex identifier was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid URL scheme {0:?}, want \"{SCHEME}\"")]
    InvalidScheme(String),

    #[error("peer URL does not contain a node ID")]
    MissingId,

    #[error("invalid node ID: {0}")]
    InvalidId(String),

    #[error("invalid host {0:?}")]
    InvalidHost(String),

    #[error("invalid port {0:?}")]
    InvalidPort(String),
}

// ============================================================================
// NodeId
// ============================================================================

/// A fixed-width node identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; ID_BYTES]);

impl NodeId {
    #[inline]
    pub const fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// Copy an identifier out of a slice, which must be exactly `ID_BYTES` long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ParseError> {
        let arr: [u8; ID_BYTES] = bytes.try_into().map_err(|_| {
            ParseError::InvalidId(format!("expected {} bytes, got {}", ID_BYTES, bytes.len()))
        })?;
        Ok(Self(arr))
    }

    /// Parse a hex identifier, with or without a `0x` prefix.
    pub fn from_hex(s: &str) -> Result<Self, ParseError> {
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        if digits.len() != ID_BYTES * 2 {
            return Err(ParseError::InvalidId(format!(
                "expected {} hex characters, got {}",
                ID_BYTES * 2,
                digits.len()
            )));
        }
        let mut out = [0u8; ID_BYTES];
        hex::decode_to_slice(digits, &mut out)
            .map_err(|e| ParseError::InvalidId(e.to_string()))?;
        Ok(Self(out))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// A uniformly random identifier drawn from `rng`.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut out = [0u8; ID_BYTES];
        rng.fill(&mut out[..]);
        Self(out)
    }

    /// Project an arbitrary key onto the identifier space (BLAKE3 XOF).
    pub fn for_key(key: &[u8]) -> Self {
        let mut out = [0u8; ID_BYTES];
        let mut hasher = blake3::Hasher::new();
        hasher.update(key);
        hasher.finalize_xof().fill(&mut out);
        Self(out)
    }

    pub fn xor_distance(&self, other: &NodeId) -> [u8; ID_BYTES] {
        let mut out = [0u8; ID_BYTES];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..16])
    }
}

impl FromStr for NodeId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<[u8; ID_BYTES]> for NodeId {
    fn from(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Metric
// ============================================================================

/// Logarithmic XOR distance: the bit length of `a ^ b`.
///
/// Ranges from 0 (identical IDs) to `HASH_BITS` (top bit differs).
pub fn logdist(a: &NodeId, b: &NodeId) -> usize {
    for (i, (x, y)) in a.0.iter().zip(b.0.iter()).enumerate() {
        let diff = x ^ y;
        if diff != 0 {
            return HASH_BITS - i * 8 - diff.leading_zeros() as usize;
        }
    }
    0
}

/// Compare two XOR distances as big-endian unsigned integers.
#[inline]
pub fn distance_cmp(a: &[u8; ID_BYTES], b: &[u8; ID_BYTES]) -> Ordering {
    for i in 0..ID_BYTES {
        match a[i].cmp(&b[i]) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Which of `a` and `b` is closer to `target`.
#[inline]
pub fn closer_cmp(target: &NodeId, a: &NodeId, b: &NodeId) -> Ordering {
    for i in 0..ID_BYTES {
        let da = a.0[i] ^ target.0[i];
        let db = b.0[i] ^ target.0[i];
        match da.cmp(&db) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

// ============================================================================
// Peer
// ============================================================================

/// A known (or named) peer of the overlay.
///
/// Only `last_seen` changes after construction; the URL is rendered once.
#[derive(Clone)]
pub struct Peer {
    id: NodeId,
    addr: Option<SocketAddr>,
    last_seen: SystemTime,
    url: String,
}

impl Peer {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self::build(id, Some(addr))
    }

    /// A peer known only by its identifier.
    pub fn incomplete(id: NodeId) -> Self {
        Self::build(id, None)
    }

    fn build(id: NodeId, addr: Option<SocketAddr>) -> Self {
        let url = match addr {
            Some(addr) => format!("{SCHEME}://{}@{}", id.to_hex(), addr),
            None => format!("{SCHEME}://{}", id.to_hex()),
        };
        Self {
            id,
            addr,
            last_seen: SystemTime::now(),
            url,
        }
    }

    /// Parse a peer URL or bare hex identifier.
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let raw = raw.trim();
        let Some((scheme, rest)) = raw.split_once("://") else {
            if raw.is_empty() {
                return Err(ParseError::MissingId);
            }
            return Ok(Self::incomplete(NodeId::from_hex(raw)?));
        };
        if scheme != SCHEME {
            return Err(ParseError::InvalidScheme(scheme.to_string()));
        }

        let (authority, query) = match rest.split_once('?') {
            Some((authority, query)) => (authority, Some(query)),
            None => (rest, None),
        };

        let Some((id_part, host_port)) = authority.split_once('@') else {
            if authority.is_empty() {
                return Err(ParseError::MissingId);
            }
            return Ok(Self::incomplete(NodeId::from_hex(authority)?));
        };
        if id_part.is_empty() {
            return Err(ParseError::MissingId);
        }
        let id = NodeId::from_hex(id_part)?;

        let (host, port) = split_host_port(host_port)?;
        let ip: IpAddr = host
            .parse()
            .map_err(|_| ParseError::InvalidHost(host.to_string()))?;
        let mut port: u16 = port
            .parse()
            .map_err(|_| ParseError::InvalidPort(port.to_string()))?;

        if let Some(query) = query {
            for pair in query.split('&') {
                if let Some((name, value)) = pair.split_once('=')
                    && name == DISCPORT_PARAM
                {
                    port = value
                        .parse()
                        .map_err(|_| ParseError::InvalidPort(value.to_string()))?;
                }
            }
        }

        Ok(Self::new(id, SocketAddr::new(ip, port)))
    }

    /// Parse trusted, self-supplied input. Panics on malformed input.
    #[track_caller]
    pub fn must_parse(raw: &str) -> Self {
        match Self::parse(raw) {
            Ok(peer) => peer,
            Err(e) => panic!("invalid peer URL {raw:?}: {e}"),
        }
    }

    #[inline]
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    #[inline]
    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.addr.map(|a| a.ip())
    }

    pub fn port(&self) -> Option<u16> {
        self.addr.map(|a| a.port())
    }

    #[inline]
    pub fn last_seen(&self) -> SystemTime {
        self.last_seen
    }

    /// Mark the peer as contacted now.
    pub fn touch(&mut self) {
        self.last_seen = SystemTime::now();
    }

    #[cfg(test)]
    pub(crate) fn set_last_seen(&mut self, at: SystemTime) {
        self.last_seen = at;
    }

    /// The canonical URL string.
    #[inline]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[inline]
    pub fn is_incomplete(&self) -> bool {
        self.addr.is_none()
    }
}

fn split_host_port(s: &str) -> Result<(&str, &str), ParseError> {
    if let Some(rest) = s.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| ParseError::InvalidHost(s.to_string()))?;
        let port = tail
            .strip_prefix(':')
            .ok_or_else(|| ParseError::InvalidPort(tail.to_string()))?;
        return Ok((host, port));
    }
    s.rsplit_once(':')
        .ok_or_else(|| ParseError::InvalidPort(s.to_string()))
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.addr == other.addr
    }
}

impl Eq for Peer {}

impl std::hash::Hash for Peer {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.addr.hash(state);
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .finish()
    }
}

impl FromStr for Peer {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
