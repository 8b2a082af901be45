//! Chunked-stream reassembly.
//!
//! A DAP4 response body is a sequence of framed chunks, each a 4-byte
//! header (flag byte + 3-byte big-endian length) followed by that many
//! payload bytes. The first chunk carries the DMR text and fixes the byte
//! order for the entire stream; subsequent chunks are concatenated into
//! the data payload until one carries the END flag. An ERROR chunk aborts
//! the stream and its payload is the server's error message.

use std::io::Read;

use bytes::Bytes;

use crate::error::{DecodeError, DecodeResult};

/// Chunk header size in bytes.
pub const HDR_SIZE: usize = 4;

/// Flag bit: this is the last data chunk.
pub const CHUNK_END: u8 = 0x01;
/// Flag bit: the payload is a UTF-8 error message and the stream ends.
pub const CHUNK_ERROR: u8 = 0x02;
/// Flag bit: all multi-byte values in this stream are little-endian.
pub const CHUNK_LITTLE_ENDIAN: u8 = 0x04;

/// What was requested from the source: schema only, or schema plus data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    /// Metadata only; the input is the DMR text verbatim, unframed.
    Dmr,
    /// Metadata plus data; the input is a chunked stream.
    Dap,
}

/// Byte order of the serialized payload, declared by the first chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Big,
    Little,
}

impl ByteOrder {
    fn from_flags(flags: u8) -> Self {
        if flags & CHUNK_LITTLE_ENDIAN == 0 {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }
}

/// A fully reassembled response: recovered schema text, contiguous data
/// payload, negotiated byte order, and the server's error message if the
/// stream ended with an ERROR chunk.
///
/// Callers must check [`error`](Self::error) before trusting
/// [`data`](Self::data); the payload is undefined after a server error.
#[derive(Debug, Clone)]
pub struct DechunkedResponse {
    pub dmr: String,
    pub data: Bytes,
    pub order: ByteOrder,
    pub error: Option<String>,
}

/// Reassemble a chunked source into a [`DechunkedResponse`].
///
/// In [`RequestMode::Dmr`] no chunk framing is applied: the entire input
/// is the schema text by convention.
pub fn dechunk<R: Read>(source: &mut R, mode: RequestMode) -> DecodeResult<DechunkedResponse> {
    match mode {
        RequestMode::Dmr => {
            let mut raw = Vec::new();
            source.read_to_end(&mut raw)?;
            Ok(DechunkedResponse {
                dmr: utf8_text(raw, "DMR")?,
                data: Bytes::new(),
                // No header to consult; the order is only meaningful for
                // data payloads, which a DMR response does not carry.
                order: ByteOrder::Big,
                error: None,
            })
        }
        RequestMode::Dap => dechunk_dap(source),
    }
}

fn dechunk_dap<R: Read>(source: &mut R) -> DecodeResult<DechunkedResponse> {
    let mut dmr = String::new();
    let mut data: Vec<u8> = Vec::new();
    let mut error = None;
    let mut order = ByteOrder::Big;
    let mut first = true;

    loop {
        let (flags, size) = read_header(source)?;
        if first {
            // The first header's endian flag is authoritative for the
            // whole stream; later chunks do not re-declare it.
            order = ByteOrder::from_flags(flags);
        }
        let payload = read_payload(source, size)?;
        if flags & CHUNK_ERROR != 0 {
            error = Some(String::from_utf8_lossy(&payload).into_owned());
            data.clear();
            break;
        }
        if first {
            dmr = utf8_text(payload, "DMR")?;
            first = false;
            if flags & CHUNK_END != 0 {
                // Degenerate but legal: a schema-only data response.
                break;
            }
            continue;
        }
        let end = flags & CHUNK_END != 0;
        data.extend_from_slice(&payload);
        if end {
            break;
        }
    }

    tracing::debug!(
        dmr_len = dmr.len(),
        data_len = data.len(),
        ?order,
        server_error = error.is_some(),
        "dechunked response"
    );
    Ok(DechunkedResponse {
        dmr,
        data: Bytes::from(data),
        order,
        error,
    })
}

/// Read one 4-byte chunk header: flag byte plus 3-byte big-endian length.
fn read_header<R: Read>(source: &mut R) -> DecodeResult<(u8, usize)> {
    let mut hdr = [0u8; HDR_SIZE];
    source
        .read_exact(&mut hdr)
        .map_err(|e| DecodeError::Transport(format!("short read of chunk header: {e}")))?;
    let flags = hdr[0];
    let size = u32::from_be_bytes([0, hdr[1], hdr[2], hdr[3]]) as usize;
    Ok((flags, size))
}

fn read_payload<R: Read>(source: &mut R, size: usize) -> DecodeResult<Vec<u8>> {
    let mut payload = vec![0u8; size];
    source.read_exact(&mut payload).map_err(|e| {
        DecodeError::MalformedStream(format!(
            "declared chunk length {size} exceeds remaining input: {e}"
        ))
    })?;
    Ok(payload)
}

fn utf8_text(raw: Vec<u8>, what: &str) -> DecodeResult<String> {
    String::from_utf8(raw)
        .map_err(|_| DecodeError::MalformedStream(format!("{what} text is not valid UTF-8")))
}
