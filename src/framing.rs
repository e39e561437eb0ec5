//! # Framing
//!
//! Delimiter-based record reassembly. A [`FrameBuffer`] accumulates chunks
//! and hands back every complete record, holding the trailing partial one
//! until more bytes arrive.
//!
//! Datagrams from different peers interleave on one socket, so the reader
//! keeps one buffer per remote address ([`PeerFramers`]). A stray partial
//! record from one peer can then never be glued onto another peer's bytes.
//!
//! When the caller supplies a record-start test, a chunk that opens a new
//! record discards the sender's pending partial. Junk or a truncated
//! datagram then costs only itself, not the next valid record.

use std::net::SocketAddr;
use std::num::NonZeroUsize;

use lru::LruCache;
use tracing::debug;

/// Remote addresses with a framing buffer kept at any one time.
pub const MAX_FRAMED_PEERS: usize = 4096;

#[derive(Debug)]
pub struct FrameBuffer {
    pending: Vec<u8>,
    delimiter: u8,
    max_pending: usize,
    record_start: Option<fn(u8) -> bool>,
}

impl FrameBuffer {
    /// `max_pending` bounds the partial record carried between chunks.
    pub fn new(delimiter: u8, max_pending: usize) -> Self {
        Self {
            pending: Vec::new(),
            delimiter,
            max_pending,
            record_start: None,
        }
    }

    /// Drop the pending partial whenever a chunk begins with a byte that
    /// satisfies `starts_record`.
    pub fn with_record_start(mut self, starts_record: fn(u8) -> bool) -> Self {
        self.record_start = Some(starts_record);
        self
    }

    /// Append `chunk` and drain every complete, non-empty record.
    ///
    /// Returned records exclude the delimiter.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        if !self.pending.is_empty()
            && let (Some(starts_record), Some(first)) = (self.record_start, chunk.first())
            && starts_record(*first)
        {
            debug!(pending = self.pending.len(), "discarding unterminated partial record");
            self.pending.clear();
        }
        self.pending.extend_from_slice(chunk);

        let mut records = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|b| *b == self.delimiter) {
            let end = start + offset;
            if end > start {
                records.push(self.pending[start..end].to_vec());
            }
            start = end + 1;
        }
        self.pending.drain(..start);

        if self.pending.len() > self.max_pending {
            debug!(
                pending = self.pending.len(),
                limit = self.max_pending,
                "discarding oversized partial record"
            );
            self.pending.clear();
        }
        records
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// One [`FrameBuffer`] per remote address, least recently used dropped first.
#[derive(Debug)]
pub struct PeerFramers {
    buffers: LruCache<SocketAddr, FrameBuffer>,
    delimiter: u8,
    max_pending: usize,
    record_start: Option<fn(u8) -> bool>,
}

impl PeerFramers {
    pub fn new(delimiter: u8, max_pending: usize) -> Self {
        Self::with_capacity(delimiter, max_pending, MAX_FRAMED_PEERS)
    }

    pub fn with_capacity(delimiter: u8, max_pending: usize, peers: usize) -> Self {
        let cap = NonZeroUsize::new(peers).unwrap_or(NonZeroUsize::MIN);
        Self {
            buffers: LruCache::new(cap),
            delimiter,
            max_pending,
            record_start: None,
        }
    }

    /// See [`FrameBuffer::with_record_start`].
    pub fn with_record_start(mut self, starts_record: fn(u8) -> bool) -> Self {
        self.record_start = Some(starts_record);
        self
    }

    pub fn push(&mut self, from: SocketAddr, chunk: &[u8]) -> Vec<Vec<u8>> {
        let (delimiter, max_pending, record_start) =
            (self.delimiter, self.max_pending, self.record_start);
        let buffer = self.buffers.get_or_insert_mut(from, || {
            let buffer = FrameBuffer::new(delimiter, max_pending);
            match record_start {
                Some(starts_record) => buffer.with_record_start(starts_record),
                None => buffer,
            }
        });
        let records = buffer.push(chunk);
        if buffer.pending_len() == 0 {
            self.buffers.pop(&from);
        }
        records
    }

    pub fn tracked(&self) -> usize {
        self.buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_coalesced_records() {
        let mut buf = FrameBuffer::new(b'\n', 1024);
        let records = buf.push(b"one\ntwo\nthr");
        assert_eq!(records, vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(buf.pending_len(), 3);

        let records = buf.push(b"ee\n");
        assert_eq!(records, vec![b"three".to_vec()]);
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn skips_empty_records() {
        let mut buf = FrameBuffer::new(b'\n', 1024);
        assert_eq!(buf.push(b"\n\na\n\n"), vec![b"a".to_vec()]);
    }

    #[test]
    fn oversized_partial_is_dropped() {
        let mut buf = FrameBuffer::new(b'\n', 4);
        assert!(buf.push(b"abcdefgh").is_empty());
        assert_eq!(buf.pending_len(), 0);
        assert_eq!(buf.push(b"ok\n"), vec![b"ok".to_vec()]);
    }

    #[test]
    fn interleaved_peers_do_not_mix() {
        let a: SocketAddr = "10.0.0.1:1".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:1".parse().unwrap();
        let mut framers = PeerFramers::new(b'\n', 1024);

        assert!(framers.push(a, b"hel").is_empty());
        assert_eq!(framers.push(b, b"world\n"), vec![b"world".to_vec()]);
        assert_eq!(framers.push(a, b"lo\n"), vec![b"hello".to_vec()]);
        assert_eq!(framers.tracked(), 0);
    }

    #[test]
    fn new_record_discards_unterminated_partial() {
        let a: SocketAddr = "10.0.0.1:1".parse().unwrap();
        let mut framers = PeerFramers::new(b'\n', 1024).with_record_start(|b| b == 0x01);

        assert!(framers.push(a, b"\x01{\"data\":").is_empty());
        assert_eq!(framers.push(a, b"\x01{}\n"), vec![b"\x01{}".to_vec()]);
        assert_eq!(framers.tracked(), 0);

        assert!(framers.push(a, b"\x01{\"da").is_empty());
        assert_eq!(framers.push(a, b"ta\":1}\n"), vec![b"\x01{\"data\":1}".to_vec()]);
    }

    #[test]
    fn least_recent_partial_is_dropped_at_capacity() {
        let mut framers = PeerFramers::with_capacity(b'\n', 1024, 1);
        let a: SocketAddr = "10.0.0.1:1".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:1".parse().unwrap();
        framers.push(a, b"partial");
        framers.push(b, b"other");
        assert_eq!(framers.tracked(), 1);
        assert_eq!(framers.push(a, b"\n"), Vec::<Vec<u8>>::new());
    }
}
