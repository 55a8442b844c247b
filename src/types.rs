//! Data structures shared across the dump pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Identifier of one shard within a dump version (e.g. `"3-p151574p311329"`).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ShardId(String);

impl ShardId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Inclusive page-ID range a shard nominally covers.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageRange {
    pub first: u64,
    pub last: u64,
}

impl PageRange {
    /// Range used for a consolidated single-file dump.
    pub const ALL: PageRange = PageRange {
        first: 0,
        last: u64::MAX,
    };

    pub fn new(first: u64, last: u64) -> Self {
        Self { first, last }
    }

    pub fn contains(&self, page_id: u64) -> bool {
        self.first <= page_id && page_id <= self.last
    }
}

/// Publication state of a dump version upstream.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DumpStatus {
    Complete,
    Partial,
}

/// Digest families published by dump providers.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Md5,
    Sha1,
    Sha256,
}

/// A provider-published digest, lowercase hex.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub algorithm: ChecksumAlgorithm,
    pub hex: String,
}

impl Checksum {
    pub fn md5(hex: impl Into<String>) -> Self {
        Self {
            algorithm: ChecksumAlgorithm::Md5,
            hex: hex.into().to_ascii_lowercase(),
        }
    }

    pub fn sha1(hex: impl Into<String>) -> Self {
        Self {
            algorithm: ChecksumAlgorithm::Sha1,
            hex: hex.into().to_ascii_lowercase(),
        }
    }
}

/// One compressed shard and its byte-offset index, as published upstream.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ShardDescriptor {
    pub id: ShardId,
    pub pages: PageRange,
    /// URL of the compressed multistream data file.
    pub url: String,
    /// URL of the `offset:page_id:title` index for the data file.
    pub index_url: String,
    pub checksum: Option<Checksum>,
    pub index_checksum: Option<Checksum>,
    /// Compressed size in bytes, when the provider publishes it.
    pub size: Option<u64>,
    /// Committed local copy, absent until fetched.
    #[serde(default)]
    pub local_path: Option<PathBuf>,
}

/// One published snapshot of a corpus.
///
/// Resolved once per run by the catalog and held by the caller; the crate
/// keeps no process-wide notion of the "current" version.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DumpVersion {
    /// Corpus name, e.g. `enwiki`.
    pub corpus: String,
    /// Date stamp, `YYYYMMDD`.
    pub id: String,
    pub status: DumpStatus,
    /// Shards in ascending page-range order.
    pub shards: Vec<ShardDescriptor>,
}

impl DumpVersion {
    pub fn new(
        corpus: impl Into<String>,
        id: impl Into<String>,
        status: DumpStatus,
        mut shards: Vec<ShardDescriptor>,
    ) -> Self {
        shards.sort_by_key(|s| (s.pages.first, s.pages.last));
        Self {
            corpus: corpus.into(),
            id: id.into(),
            status,
            shards,
        }
    }

    /// Directory name of this version in the local cache, e.g. `enwiki-20201020`.
    pub fn key(&self) -> String {
        format!("{}-{}", self.corpus, self.id)
    }

    pub fn is_complete(&self) -> bool {
        self.status == DumpStatus::Complete
    }

    pub fn shard(&self, id: &ShardId) -> Option<&ShardDescriptor> {
        self.shards.iter().find(|s| &s.id == id)
    }

    /// The shard whose nominal page range contains `page_id`.
    pub fn shard_for_page(&self, page_id: u64) -> Option<&ShardDescriptor> {
        self.shards.iter().find(|s| s.pages.contains(page_id))
    }
}

/// One line of a multistream index.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    /// Start of the compressed stream holding the page.
    pub byte_offset: u64,
    pub page_id: u64,
    pub page_title: String,
}

/// Raw decompressed bytes of one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageBlob {
    pub page_id: u64,
    pub bytes: Vec<u8>,
}

/// A page as handed to consumers: id, title and raw `<page>` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub page_id: u64,
    pub title: String,
    pub bytes: Vec<u8>,
}
