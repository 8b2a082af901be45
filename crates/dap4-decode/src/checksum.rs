//! Per-variable CRC32 negotiation, computation, and verification.
//!
//! When checksumming is negotiated on, every top-level variable's byte
//! extent is digested twice: once locally over the dechunked buffer, and
//! once by the server, which appends the 4-byte value right after the
//! variable's data span. Verification requires both values per variable
//! and compares them for equality.

use std::collections::HashMap;

use dap4_dmr::Dataset;

use crate::error::{DecodeError, DecodeResult};

/// Request-context key negotiating checksums with the server.
pub const CHECKSUM_QUERY_KEY: &str = "dap4.checksum";

/// Size of the trailing per-variable checksum on the wire.
pub const CHECKSUM_SIZE: usize = 4;

const ON_WORDS: [&str; 4] = ["true", "on", "yes", "1"];
const OFF_WORDS: [&str; 4] = ["false", "off", "no", "0"];

/// Tri-state checksum negotiation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumMode {
    /// Not specified by the caller; a default resolves it.
    #[default]
    Unspecified,
    Off,
    On,
}

impl ChecksumMode {
    /// Map an external string form, case-insensitively. Absent or
    /// unrecognized values are `Unspecified`.
    pub fn from_key_value(value: Option<&str>) -> Self {
        let Some(v) = value else {
            return ChecksumMode::Unspecified;
        };
        let v = v.trim();
        if OFF_WORDS.iter().any(|w| v.eq_ignore_ascii_case(w)) {
            ChecksumMode::Off
        } else if ON_WORDS.iter().any(|w| v.eq_ignore_ascii_case(w)) {
            ChecksumMode::On
        } else {
            ChecksumMode::Unspecified
        }
    }

    /// Collapse `Unspecified` using the caller-supplied default.
    pub fn resolve(self, default: ChecksumMode) -> Self {
        match self {
            ChecksumMode::Unspecified => default,
            other => other,
        }
    }

    pub fn enabled(self) -> bool {
        self == ChecksumMode::On
    }

    /// The query-string form sent to servers (`Unspecified` never reaches
    /// the wire; resolve it first).
    pub fn as_query_value(self) -> &'static str {
        match self {
            ChecksumMode::On => "true",
            _ => "false",
        }
    }
}

/// Who produced a recorded checksum value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumSource {
    /// Recomputed here over the dechunked buffer.
    Local,
    /// Declared by the sender in the stream (or DMR attributes).
    Remote,
}

/// Computes and stores per-variable CRC32 digests, keyed by top-level
/// variable name, separately for local and remote sources.
#[derive(Debug, Default)]
pub struct ChecksumTracker {
    hasher: Option<crc32fast::Hasher>,
    local: HashMap<String, u32>,
    remote: HashMap<String, u32>,
}

impl ChecksumTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the running digest for a new variable span.
    pub fn begin(&mut self) {
        self.hasher = Some(crc32fast::Hasher::new());
    }

    /// Feed bytes into the running digest.
    pub fn update(&mut self, bytes: &[u8]) {
        if let Some(h) = self.hasher.as_mut() {
            h.update(bytes);
        }
    }

    /// Finalize the running digest, masked to 32 bits.
    pub fn end(&mut self) -> u32 {
        self.hasher.take().map(|h| h.finalize()).unwrap_or(0)
    }

    /// One-shot digest over a complete byte span.
    pub fn digest(bytes: &[u8]) -> u32 {
        crc32fast::hash(bytes)
    }

    pub fn record(&mut self, source: ChecksumSource, variable: &str, value: u32) {
        let map = match source {
            ChecksumSource::Local => &mut self.local,
            ChecksumSource::Remote => &mut self.remote,
        };
        map.insert(variable.to_string(), value);
    }

    pub fn get(&self, source: ChecksumSource, variable: &str) -> Option<u32> {
        match source {
            ChecksumSource::Local => self.local.get(variable).copied(),
            ChecksumSource::Remote => self.remote.get(variable).copied(),
        }
    }

    /// Verify every top-level variable of `dataset`.
    ///
    /// Requires a local and a remote entry per variable and compares them;
    /// also compares any DMR-declared checksum attribute against the local
    /// value. `skip_remote_verify` is a compatibility escape for servers
    /// that send non-conformant trailing checksums (notably Hyrax); it
    /// suppresses the stream comparison, never the attribute one, and logs
    /// whenever it does so.
    pub fn verify(&self, dataset: &Dataset, skip_remote_verify: bool) -> DecodeResult<()> {
        for var in &dataset.variables {
            let local = self.get(ChecksumSource::Local, &var.name).ok_or_else(|| {
                DecodeError::MalformedStream(format!(
                    "no locally computed checksum for variable '{}'",
                    var.name
                ))
            })?;
            if skip_remote_verify {
                tracing::warn!(
                    variable = %var.name,
                    "skipping remote checksum comparison (server compatibility flag)"
                );
            } else {
                let remote = self.get(ChecksumSource::Remote, &var.name).ok_or_else(|| {
                    DecodeError::MalformedStream(format!(
                        "no remote-declared checksum for variable '{}'",
                        var.name
                    ))
                })?;
                if local != remote {
                    return Err(DecodeError::ChecksumMismatch {
                        variable: var.name.clone(),
                        local,
                        remote,
                    });
                }
            }
            if let Some(declared) = var.declared_checksum() {
                if declared != local {
                    return Err(DecodeError::ChecksumMismatch {
                        variable: var.name.clone(),
                        local,
                        remote: declared,
                    });
                }
            }
        }
        Ok(())
    }
}
