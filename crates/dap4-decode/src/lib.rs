//! DAP4 wire-protocol decoding engine.
//!
//! Turns a chunked, schema-described DAP4 byte stream (from a server or a
//! local capture file) into lazily materialized, cursor-addressed
//! variable values:
//!
//! - [`dechunk`]: reassembles the framed stream into schema text plus a
//!   contiguous payload, fixing the byte order and surfacing server
//!   errors.
//! - [`odometer`]: flat-index generation over multi-dimensional slices.
//! - [`compile`]: the single forward pass that walks schema and buffer in
//!   lock-step and builds one cursor tree per top-level variable.
//! - [`cursor`]: typed random-access reads against the shared buffer.
//! - [`checksum`]: per-variable CRC32 negotiation and verification.
//! - [`source`]: the owning object tying transport, schema, and compiled
//!   cursors together.
//!
//! Compilation is strictly sequential (sequences and byte-strings are
//! self-delimiting); the compiled tree and buffer are immutable afterward
//! and safe to read from many threads.

pub mod checksum;
pub mod compile;
pub mod cursor;
pub mod dechunk;
pub mod error;
pub mod odometer;
pub mod source;
pub mod transport;

pub use checksum::{ChecksumMode, ChecksumSource, ChecksumTracker};
pub use compile::{compile, CompiledData};
pub use cursor::{Cursor, CursorScheme, CursorValue, DapValue, DataBuffer};
pub use dechunk::{dechunk, ByteOrder, DechunkedResponse, RequestMode};
pub use error::{DecodeError, DecodeResult};
pub use odometer::{Odometer, Slice};
pub use source::{Dap4Source, RequestContext};
pub use transport::{FileTransport, HttpTransport, Transport};
