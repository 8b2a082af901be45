//! Byte transports for DAP4 requests.
//!
//! A transport produces the raw (still chunked) response body for a
//! request mode; dechunking and decoding happen above it. Reads are
//! blocking and sequential by design: chunk boundaries are only
//! discoverable by consuming exactly header-then-payload, so there is
//! nothing to gain from readahead. The only deadline is the fixed
//! whole-request timeout on the HTTP client; retry policy belongs to
//! callers, never to this layer.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use crate::checksum::{ChecksumMode, CHECKSUM_QUERY_KEY};
use crate::dechunk::RequestMode;
use crate::error::{DecodeError, DecodeResult};

/// Default whole-request deadline for remote transports.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// File extensions recognized as raw DAP4 response captures.
const FILE_EXTENSIONS: [&str; 2] = [".dap", ".raw"];

/// A source of raw DAP4 response bytes.
pub trait Transport {
    /// Fetch the complete response body for `mode`.
    fn fetch(&mut self, mode: RequestMode) -> DecodeResult<Vec<u8>>;
}

/// Pick a transport for a location: `http(s)` URLs go remote, everything
/// else is treated as a local file path (with an optional `file://`
/// prefix).
pub fn transport_for(
    location: &str,
    checksum: ChecksumMode,
    timeout: Duration,
) -> DecodeResult<Box<dyn Transport>> {
    if location.starts_with("http://") || location.starts_with("https://") {
        Ok(Box::new(HttpTransport::new(location, checksum, timeout)?))
    } else {
        Ok(Box::new(FileTransport::new(location)))
    }
}

/// Reads a previously captured response from the local filesystem.
#[derive(Debug)]
pub struct FileTransport {
    path: PathBuf,
}

impl FileTransport {
    pub fn new(location: &str) -> Self {
        let path = location.strip_prefix("file://").unwrap_or(location);
        Self {
            path: PathBuf::from(path),
        }
    }

    /// True if the location looks like a raw capture this transport owns.
    pub fn matches(location: &str) -> bool {
        let path = location.strip_prefix("file://").unwrap_or(location);
        FILE_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
    }
}

impl Transport for FileTransport {
    fn fetch(&mut self, _mode: RequestMode) -> DecodeResult<Vec<u8>> {
        // A capture file holds the whole chunked response; both modes
        // read it in full.
        let mut raw = Vec::new();
        File::open(&self.path)?.read_to_end(&mut raw)?;
        tracing::debug!(path = %self.path.display(), size = raw.len(), "read capture file");
        Ok(raw)
    }
}

/// Fetches responses from a DAP4 server over HTTP.
pub struct HttpTransport {
    location: String,
    checksum: ChecksumMode,
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new(location: &str, checksum: ChecksumMode, timeout: Duration) -> DecodeResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DecodeError::Transport(format!("building HTTP client: {e}")))?;
        Ok(Self {
            location: location.to_string(),
            checksum,
            client,
        })
    }

    /// Build the method URL for a request mode: strip any DAP extension
    /// already on the path, append `.dap` or `.dmr.xml`, and pin the
    /// `dap4.checksum` query field to the negotiated mode.
    pub fn method_url(&self, mode: RequestMode) -> String {
        let (path, query) = match self.location.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (self.location.as_str(), None),
        };
        let mut path = path.to_string();
        for ext in [".dmr.xml", ".dmr", ".dap", ".raw"] {
            if let Some(stripped) = path.strip_suffix(ext) {
                path = stripped.to_string();
                break;
            }
        }
        path.push_str(match mode {
            RequestMode::Dap => ".dap",
            RequestMode::Dmr => ".dmr.xml",
        });

        let mut fields: Vec<String> = query
            .into_iter()
            .flat_map(|q| q.split('&'))
            .filter(|f| !f.is_empty() && !f.starts_with(&format!("{CHECKSUM_QUERY_KEY}=")))
            .map(str::to_string)
            .collect();
        fields.push(format!(
            "{CHECKSUM_QUERY_KEY}={}",
            self.checksum.as_query_value()
        ));
        format!("{path}?{}", fields.join("&"))
    }
}

impl Transport for HttpTransport {
    fn fetch(&mut self, mode: RequestMode) -> DecodeResult<Vec<u8>> {
        let url = self.method_url(mode);
        tracing::debug!(%url, "requesting DAP4 response");
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| DecodeError::Transport(format!("request to {url} failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(DecodeError::Transport(format!(
                "server returned {status} for {url}"
            )));
        }
        let body = response
            .bytes()
            .map_err(|e| DecodeError::Transport(format!("reading body from {url}: {e}")))?;
        Ok(body.to_vec())
    }
}
