//! Access to the dump provider over the network.
//!
//! Everything that talks to the provider goes through the [`Remote`] trait so
//! the catalog and fetcher can run against [`HttpRemote`] in production and
//! against [`MemoryRemote`] offline.

use crate::config::FetchConfig;
use crate::error::DumpError;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Mutex;

/// A streaming response body.
pub struct RemoteBody {
    /// True when the server honoured the requested start offset.
    pub resumed: bool,
    /// Length of this body (not of the whole file), if announced.
    pub content_length: Option<u64>,
    pub stream: BoxStream<'static, Result<Bytes, DumpError>>,
}

/// Capability to read listings and download files from a provider.
#[async_trait]
pub trait Remote: Send + Sync {
    /// Fetches a small text document (listing page, status JSON, checksum file).
    async fn get_text(&self, url: &str) -> Result<String, DumpError>;

    /// Opens a file for streaming, starting at `offset` when the server allows it.
    async fn open(&self, url: &str, offset: u64) -> Result<RemoteBody, DumpError>;
}

/// [`Remote`] backed by a shared reqwest client.
pub struct HttpRemote {
    client: reqwest::Client,
}

impl HttpRemote {
    pub fn new(config: &FetchConfig) -> Result<Self, DumpError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Remote for HttpRemote {
    async fn get_text(&self, url: &str) -> Result<String, DumpError> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.text().await?)
    }

    async fn open(&self, url: &str, offset: u64) -> Result<RemoteBody, DumpError> {
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={}-", offset));
        }
        let response = request.send().await?;

        let status = response.status();
        if status == reqwest::StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
            // The partial file already holds every byte.
            return Ok(RemoteBody {
                resumed: true,
                content_length: Some(0),
                stream: stream::empty().boxed(),
            });
        }
        if !status.is_success() {
            return Err(DumpError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let resumed = offset > 0 && status == reqwest::StatusCode::PARTIAL_CONTENT;
        Ok(RemoteBody {
            resumed,
            content_length: response.content_length(),
            stream: response
                .bytes_stream()
                .map(|piece| piece.map_err(DumpError::from))
                .boxed(),
        })
    }
}

const MEMORY_CHUNK: usize = 64 * 1024;

#[derive(Default)]
struct MemoryState {
    files: HashMap<String, Bytes>,
    requests: HashMap<String, usize>,
    corrupt: HashMap<String, usize>,
    failures: HashMap<String, usize>,
}

/// In-memory [`Remote`] serving registered files.
///
/// Counts requests per URL and can be scripted to corrupt or fail the next
/// transfers of a URL, which makes retry and verification behaviour
/// observable without a network.
#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<MemoryState>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: impl Into<String>, body: impl Into<Bytes>) {
        self.lock().files.insert(url.into(), body.into());
    }

    /// Flips a byte in each of the next `times` transfers of `url`.
    pub fn corrupt_next(&self, url: &str, times: usize) {
        self.lock().corrupt.insert(url.to_string(), times);
    }

    /// Fails the next `times` requests for `url` with a transport error.
    pub fn fail_next(&self, url: &str, times: usize) {
        self.lock().failures.insert(url.to_string(), times);
    }

    /// Number of requests (text or file) seen for `url`.
    pub fn requests(&self, url: &str) -> usize {
        self.lock().requests.get(url).copied().unwrap_or(0)
    }

    pub fn total_requests(&self) -> usize {
        self.lock().requests.values().sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A panicking test thread must not wedge the others.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take(&self, url: &str) -> Result<(Bytes, bool), DumpError> {
        let mut state = self.lock();
        *state.requests.entry(url.to_string()).or_default() += 1;

        if let Some(remaining) = state.failures.get_mut(url) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(DumpError::FetchFailed {
                    url: url.to_string(),
                    reason: "connection reset".to_string(),
                });
            }
        }

        let body = state
            .files
            .get(url)
            .cloned()
            .ok_or_else(|| DumpError::HttpStatus {
                url: url.to_string(),
                status: 404,
            })?;

        let corrupt = match state.corrupt.get_mut(url) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };
        Ok((body, corrupt))
    }
}

#[async_trait]
impl Remote for MemoryRemote {
    async fn get_text(&self, url: &str) -> Result<String, DumpError> {
        let (body, _) = self.take(url)?;
        String::from_utf8(body.to_vec()).map_err(|e| DumpError::FetchFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }

    async fn open(&self, url: &str, offset: u64) -> Result<RemoteBody, DumpError> {
        let (body, corrupt) = self.take(url)?;
        let start = (offset as usize).min(body.len());
        let mut slice = body.slice(start..).to_vec();
        if corrupt {
            if let Some(byte) = slice.last_mut() {
                *byte ^= 0xff;
            }
        }

        let chunks: Vec<Result<Bytes, DumpError>> = slice
            .chunks(MEMORY_CHUNK)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(RemoteBody {
            resumed: offset > 0,
            content_length: Some(slice.len() as u64),
            stream: stream::iter(chunks).boxed(),
        })
    }
}
