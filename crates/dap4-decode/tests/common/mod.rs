//! Builders for synthetic chunked DAP4 responses.
//!
//! Test-only encoders: the library itself never writes DAP4 data.

use dap4_decode::checksum::ChecksumTracker;
use dap4_decode::dechunk::{CHUNK_END, CHUNK_ERROR, CHUNK_LITTLE_ENDIAN};

/// Frame one chunk: flag byte, 3-byte big-endian length, payload.
pub fn chunk(flags: u8, payload: &[u8]) -> Vec<u8> {
    assert!(payload.len() <= 0x00FF_FFFF, "chunk payload too large");
    let mut out = Vec::with_capacity(4 + payload.len());
    out.push(flags);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes()[1..]);
    out.extend_from_slice(payload);
    out
}

/// Assemble a complete data response: DMR chunk first (carrying the
/// endian flag), then the payload split into `chunk_size` data chunks,
/// the last one flagged END.
pub fn build_stream(dmr: &str, payload: &[u8], little: bool, chunk_size: usize) -> Vec<u8> {
    let order_flag = if little { CHUNK_LITTLE_ENDIAN } else { 0 };
    let mut out = chunk(order_flag, dmr.as_bytes());
    if payload.is_empty() {
        out.extend(chunk(CHUNK_END, &[]));
        return out;
    }
    let mut pieces = payload.chunks(chunk_size).peekable();
    while let Some(piece) = pieces.next() {
        let flags = if pieces.peek().is_none() { CHUNK_END } else { 0 };
        out.extend(chunk(flags, piece));
    }
    out
}

/// A response whose second chunk is a server error.
pub fn build_error_stream(dmr: &str, message: &str) -> Vec<u8> {
    let mut out = chunk(0, dmr.as_bytes());
    out.extend(chunk(CHUNK_ERROR, message.as_bytes()));
    out
}

/// Serialized payload under a fixed byte order, with helpers for the
/// DAP4 on-wire forms (8-byte counts, length-prefixed strings, trailing
/// per-variable checksums).
pub struct Payload {
    bytes: Vec<u8>,
    little: bool,
}

impl Payload {
    pub fn new(little: bool) -> Self {
        Self {
            bytes: Vec::new(),
            little,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Current offset; pair with [`append_checksum`](Self::append_checksum)
    /// to delimit a top-level variable's span.
    pub fn mark(&self) -> usize {
        self.bytes.len()
    }

    pub fn push_raw(&mut self, raw: &[u8]) -> &mut Self {
        self.bytes.extend_from_slice(raw);
        self
    }

    pub fn push_i32(&mut self, v: i32) -> &mut Self {
        self.push_ordered(&v.to_be_bytes(), &v.to_le_bytes())
    }

    pub fn push_u32(&mut self, v: u32) -> &mut Self {
        self.push_ordered(&v.to_be_bytes(), &v.to_le_bytes())
    }

    pub fn push_f64(&mut self, v: f64) -> &mut Self {
        self.push_ordered(&v.to_be_bytes(), &v.to_le_bytes())
    }

    /// 8-byte count field (record counts, string lengths).
    pub fn push_count(&mut self, v: u64) -> &mut Self {
        self.push_ordered(&v.to_be_bytes(), &v.to_le_bytes())
    }

    /// Length-prefixed string element.
    pub fn push_str(&mut self, s: &str) -> &mut Self {
        self.push_count(s.len() as u64);
        self.push_raw(s.as_bytes())
    }

    /// Append the CRC32 of everything since `mark`, in stream order.
    pub fn append_checksum(&mut self, mark: usize) -> &mut Self {
        let crc = ChecksumTracker::digest(&self.bytes[mark..]);
        self.push_u32(crc)
    }

    fn push_ordered(&mut self, be: &[u8], le: &[u8]) -> &mut Self {
        self.bytes
            .extend_from_slice(if self.little { le } else { be });
        self
    }
}
