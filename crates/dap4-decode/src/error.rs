//! Error types for DAP4 stream decoding.
//!
//! Every error here is terminal for the request that produced it: the
//! engine never retries internally, and a failed compile discards all
//! partial results.

use thiserror::Error;

/// Result type alias for decode operations.
pub type DecodeResult<T> = Result<T, DecodeError>;

/// Primary error type for the decoding engine.
#[derive(Debug, Error)]
pub enum DecodeError {
    // === Transport ===
    /// Short or failed read of a chunk header or payload
    #[error("Transport failure: {0}")]
    Transport(String),

    /// The stream carried an explicit error chunk; the message is the
    /// server's verbatim error text
    #[error("Server error: {0}")]
    Server(String),

    // === Wire format ===
    /// Chunk framing or length-prefix bookkeeping internally inconsistent
    #[error("Malformed stream: {0}")]
    MalformedStream(String),

    // === Schema/data agreement ===
    /// An access does not match the compiled schema shape
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Local and remote CRC32 digests disagree for a variable
    #[error("Checksum mismatch for variable '{variable}': local {local:#010x}, remote {remote:#010x}")]
    ChecksumMismatch {
        variable: String,
        local: u32,
        remote: u32,
    },

    /// The atomic-conversion table does not recognize this type/operation
    #[error("Unsupported type: {0}")]
    UnsupportedType(String),

    /// Named variable is not part of the compiled dataset
    #[error("Variable not found: {0}")]
    NotFound(String),

    // === Wrapped collaborators ===
    /// I/O failure in a file transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The recovered schema text did not parse
    #[error("DMR parse error: {0}")]
    Dmr(#[from] dap4_dmr::DmrError),
}
