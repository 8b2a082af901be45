//! The data-source object: owns one response end to end.
//!
//! A `Dap4Source` opens a transport, dechunks the response, parses the
//! recovered DMR, and compiles the payload into a cursor tree. It owns
//! the byte buffer and the cursor arena; every `Cursor` handed out
//! borrows both, so nothing can outlive the source that produced it.
//! `ensure_schema`/`ensure_data` are idempotent: repeated calls never
//! re-parse or re-compile.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use dap4_dmr::{parse_dmr, Dataset};

use crate::checksum::{ChecksumMode, CHECKSUM_QUERY_KEY};
use crate::compile::{compile, CompiledData};
use crate::cursor::{Cursor, DataBuffer};
use crate::dechunk::{dechunk, ByteOrder, DechunkedResponse, RequestMode};
use crate::error::{DecodeError, DecodeResult};
use crate::transport::{transport_for, DEFAULT_TIMEOUT};

/// Per-request settings, set before `open`.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Checksum negotiation; `Unspecified` resolves to the engine
    /// default (on, the DAP4 protocol default).
    pub checksum: ChecksumMode,
    /// Compatibility escape for servers whose trailing checksums are not
    /// conformant (notably Hyrax): skips the local-vs-remote comparison,
    /// never the attribute-declared one.
    pub skip_remote_verify: bool,
    /// Whole-request deadline for remote transports.
    pub timeout: Duration,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            checksum: ChecksumMode::Unspecified,
            skip_remote_verify: false,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl RequestContext {
    /// Set a context entry by its external key. Returns false for keys
    /// this engine does not recognize.
    pub fn set(&mut self, key: &str, value: &str) -> bool {
        if key == CHECKSUM_QUERY_KEY {
            self.checksum = ChecksumMode::from_key_value(Some(value));
            true
        } else {
            false
        }
    }

    fn resolved_checksum(&self) -> ChecksumMode {
        self.checksum.resolve(ChecksumMode::On)
    }
}

/// An opened DAP4 response: buffer, schema, and compiled cursors.
#[derive(Debug)]
pub struct Dap4Source {
    location: String,
    context: RequestContext,
    checksum: ChecksumMode,
    response: DechunkedResponse,
    buffer: DataBuffer,
    dataset: Option<Arc<Dataset>>,
    compiled: Option<CompiledData>,
}

impl Dap4Source {
    /// Open a location (local capture file or DAP4 server URL), fetch
    /// the data response, and dechunk it. Schema parsing and compilation
    /// are deferred to the `ensure_*` calls.
    pub fn open(location: &str, context: RequestContext) -> DecodeResult<Self> {
        let checksum = context.resolved_checksum();
        let mut transport = transport_for(location, checksum, context.timeout)?;
        let raw = transport.fetch(RequestMode::Dap)?;
        Self::from_stream(location, &mut raw.as_slice(), context)
    }

    /// Build a source from an already-fetched chunked stream.
    pub fn from_stream<R: Read>(
        location: &str,
        stream: &mut R,
        context: RequestContext,
    ) -> DecodeResult<Self> {
        let response = dechunk(stream, RequestMode::Dap)?;
        if let Some(message) = &response.error {
            return Err(DecodeError::Server(message.clone()));
        }
        let buffer = DataBuffer::new(response.data.clone(), response.order);
        Ok(Self {
            location: location.to_string(),
            checksum: context.resolved_checksum(),
            context,
            response,
            buffer,
            dataset: None,
            compiled: None,
        })
    }

    /// Fetch and parse only the schema for a location, without touching
    /// any data payload.
    pub fn fetch_schema(location: &str, context: &RequestContext) -> DecodeResult<Arc<Dataset>> {
        let mut transport =
            transport_for(location, context.resolved_checksum(), context.timeout)?;
        let raw = transport.fetch(RequestMode::Dmr)?;
        let response = dechunk(&mut raw.as_slice(), RequestMode::Dmr)?;
        Ok(Arc::new(parse_dmr(&response.dmr)?))
    }

    /// Parse the recovered DMR text. Idempotent: the schema is parsed at
    /// most once per source.
    pub fn ensure_schema(&mut self) -> DecodeResult<Arc<Dataset>> {
        if let Some(ds) = &self.dataset {
            return Ok(Arc::clone(ds));
        }
        let ds = Arc::new(parse_dmr(&self.response.dmr)?);
        if let Some(le) = ds.declared_little_endian() {
            let header_le = self.buffer.order() == ByteOrder::Little;
            if le != header_le {
                // The first chunk's header flag decides decoding; the
                // DMR attribute is informational only.
                tracing::warn!(
                    declared_little_endian = le,
                    header_order = ?self.buffer.order(),
                    "DMR byte-order attribute disagrees with the chunk header"
                );
            }
        }
        tracing::debug!(
            location = %self.location,
            variables = ds.variables.len(),
            "schema ready"
        );
        self.dataset = Some(Arc::clone(&ds));
        Ok(ds)
    }

    /// Compile the payload into cursors and, when checksumming is on,
    /// verify every top-level variable. Idempotent: compilation happens
    /// at most once per source; a failed compile leaves no partial state.
    pub fn ensure_data(&mut self) -> DecodeResult<()> {
        let dataset = self.ensure_schema()?;
        if self.compiled.is_some() {
            return Ok(());
        }
        let compiled = compile(&dataset, &self.buffer, self.checksum)?;
        if self.checksum.enabled() {
            compiled
                .checksums
                .verify(&dataset, self.context.skip_remote_verify)?;
        }
        tracing::debug!(
            location = %self.location,
            cursors = compiled.arena.len(),
            "data compiled"
        );
        self.compiled = Some(compiled);
        Ok(())
    }

    /// The compiled cursor for a top-level variable.
    pub fn variable_cursor(&self, name: &str) -> DecodeResult<Cursor<'_>> {
        let compiled = self
            .compiled
            .as_ref()
            .ok_or_else(|| DecodeError::NotFound(format!("{name} (data not compiled yet)")))?;
        let id = compiled
            .variables
            .get(name)
            .copied()
            .ok_or_else(|| DecodeError::NotFound(name.to_string()))?;
        Ok(compiled.arena.cursor(&self.buffer, id))
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Byte order declared by the first chunk of the response.
    pub fn byte_order(&self) -> ByteOrder {
        self.buffer.order()
    }

    /// The negotiated (resolved) checksum mode for this request.
    pub fn checksum_mode(&self) -> ChecksumMode {
        self.checksum
    }

    /// Raw DMR text as recovered from the stream.
    pub fn dmr_text(&self) -> &str {
        &self.response.dmr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_keys_map_to_checksum_mode() {
        let mut ctx = RequestContext::default();
        assert!(ctx.set(CHECKSUM_QUERY_KEY, "off"));
        assert_eq!(ctx.checksum, ChecksumMode::Off);
        assert!(ctx.set(CHECKSUM_QUERY_KEY, "YES"));
        assert_eq!(ctx.checksum, ChecksumMode::On);
        assert!(!ctx.set("dap4.ce", "v"));
    }

    #[test]
    fn unspecified_checksum_defaults_on() {
        let ctx = RequestContext::default();
        assert_eq!(ctx.resolved_checksum(), ChecksumMode::On);
        let ctx = RequestContext {
            checksum: ChecksumMode::Off,
            ..Default::default()
        };
        assert_eq!(ctx.resolved_checksum(), ChecksumMode::Off);
    }

    #[test]
    fn server_error_chunk_surfaces_before_compile() {
        // header(flags=ERROR) on the second chunk
        let mut stream = Vec::new();
        let dmr = br#"<Dataset name="d"><Int32 name="v"/></Dataset>"#;
        stream.push(0u8);
        stream.extend_from_slice(&(dmr.len() as u32).to_be_bytes()[1..]);
        stream.extend_from_slice(dmr);
        let msg = b"access denied";
        stream.push(crate::dechunk::CHUNK_ERROR);
        stream.extend_from_slice(&(msg.len() as u32).to_be_bytes()[1..]);
        stream.extend_from_slice(msg);

        let err = Dap4Source::from_stream("test", &mut stream.as_slice(), Default::default())
            .unwrap_err();
        match err {
            DecodeError::Server(m) => assert_eq!(m, "access denied"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
