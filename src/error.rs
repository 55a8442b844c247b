//! Error types for dump operations.

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur while discovering, fetching, indexing or decoding a dump.
#[derive(Error, Debug)]
pub enum DumpError {
    /// I/O error during file operations.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// HTTP request error during download.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// The remote listing could not be reached or parsed.
    #[error("catalog unavailable: {0}")]
    CatalogUnavailable(String),

    /// Only partial dumps exist and partial acceptance is disabled.
    #[error("no complete dump published for {0}")]
    NoCompleteDump(String),

    /// A shard could not be downloaded.
    #[error("fetch failed for {url}: {reason}")]
    FetchFailed { url: String, reason: String },

    /// The provider answered with an error status.
    #[error("HTTP {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    /// A downloaded file does not match its published digest.
    #[error("checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    /// The provider did not publish a digest for this file.
    #[error("no checksum published for {0}")]
    ChecksumUnavailable(String),

    /// The page id is absent from the index (deleted upstream, or never existed).
    #[error("page {0} is not indexed")]
    PageNotIndexed(u64),

    /// A compressed stream could not be decoded.
    #[error("decode error in stream at offset {offset}: {reason}")]
    DecodeError { offset: u64, reason: String },

    /// An index file violates its line format or ordering.
    #[error("corrupt index, line {line}: {reason}")]
    IndexCorrupt { line: usize, reason: String },

    /// The run was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// An attempt or the run exceeded its time limit.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl DumpError {
    /// Warning-level conditions degrade the run but never fail a shard.
    pub fn is_warning(&self) -> bool {
        matches!(self, DumpError::ChecksumUnavailable(_))
    }

    /// Whether the fetcher should retry the transfer in place.
    pub fn is_transient(&self) -> bool {
        match self {
            DumpError::Io(_)
            | DumpError::Http(_)
            | DumpError::FetchFailed { .. }
            | DumpError::Timeout(_) => true,
            // Client errors will not go away by asking again, except for
            // request timeouts and rate limiting.
            DumpError::HttpStatus { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            DumpError::Json(_)
            | DumpError::ChecksumMismatch { .. }
            | DumpError::CatalogUnavailable(_)
            | DumpError::NoCompleteDump(_)
            | DumpError::ChecksumUnavailable(_)
            | DumpError::PageNotIndexed(_)
            | DumpError::DecodeError { .. }
            | DumpError::IndexCorrupt { .. }
            | DumpError::Cancelled => false,
        }
    }

    /// Whether the whole shard may be fetched again in a later round.
    ///
    /// A mismatch means the bytes already received are bad, so the fetcher
    /// discards them and the coordinator re-dispatches the shard.
    pub fn is_refetchable(&self) -> bool {
        matches!(self, DumpError::ChecksumMismatch { .. })
    }

    /// Recovers an owned error from one shared between joined callers.
    ///
    /// Transport errors that cannot be cloned are rebuilt with the same
    /// message and retry class.
    pub fn from_shared(shared: Arc<DumpError>) -> DumpError {
        let shared = match Arc::try_unwrap(shared) {
            Ok(owned) => return owned,
            Err(shared) => shared,
        };
        match shared.as_ref() {
            DumpError::Io(e) => DumpError::Io(io::Error::new(e.kind(), e.to_string())),
            DumpError::Http(e) => DumpError::FetchFailed {
                url: e.url().map(|u| u.to_string()).unwrap_or_default(),
                reason: e.to_string(),
            },
            DumpError::Json(e) => {
                DumpError::Io(io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
            }
            DumpError::CatalogUnavailable(s) => DumpError::CatalogUnavailable(s.clone()),
            DumpError::NoCompleteDump(s) => DumpError::NoCompleteDump(s.clone()),
            DumpError::FetchFailed { url, reason } => DumpError::FetchFailed {
                url: url.clone(),
                reason: reason.clone(),
            },
            DumpError::HttpStatus { url, status } => DumpError::HttpStatus {
                url: url.clone(),
                status: *status,
            },
            DumpError::ChecksumMismatch {
                file,
                expected,
                actual,
            } => DumpError::ChecksumMismatch {
                file: file.clone(),
                expected: expected.clone(),
                actual: actual.clone(),
            },
            DumpError::ChecksumUnavailable(s) => DumpError::ChecksumUnavailable(s.clone()),
            DumpError::PageNotIndexed(id) => DumpError::PageNotIndexed(*id),
            DumpError::DecodeError { offset, reason } => DumpError::DecodeError {
                offset: *offset,
                reason: reason.clone(),
            },
            DumpError::IndexCorrupt { line, reason } => DumpError::IndexCorrupt {
                line: *line,
                reason: reason.clone(),
            },
            DumpError::Cancelled => DumpError::Cancelled,
            DumpError::Timeout(limit) => DumpError::Timeout(*limit),
        }
    }
}
