//! WikiSync - Acquire Wikipedia-style multistream dumps and read pages at random
//!
//! This library discovers published dump versions, downloads their shards with
//! checksum verification and resumable transfers, and serves individual pages
//! by decoding only the compressed stream that holds them.
//!
//! # Features
//!
//! - **Version Discovery**: Find the latest complete dump from the provider listing
//! - **Resumable Downloads**: Interrupted transfers continue where they stopped
//! - **Checksum Verification**: MD5/SHA-1/SHA-256 against published digests
//! - **Random Access**: Byte-offset indices map page ids to single bzip2 streams
//! - **Recompression Cache**: Decoded streams re-encoded with lz4 for fast re-reads
//! - **Ordered Delivery**: Pages reach consumers in manifest order while later
//!   shards download and decode in the background
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use wikisync::{HttpRemote, Pipeline, PipelineConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PipelineConfig::default();
//! let remote = Arc::new(HttpRemote::new(&config.fetch)?);
//! let pipeline = Pipeline::new(config, remote)?;
//!
//! let version = pipeline.catalog().latest("simplewiki").await?;
//! if let Some(page) = pipeline.page(&version, 1).await? {
//!     println!("{}: {} bytes", page.title, page.bytes.len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod catalog;
pub mod config;
pub mod decompress;
pub mod error;
pub mod fetch;
pub mod index;
pub mod pipeline;
pub mod recompress;
pub mod remote;
pub mod singleflight;
pub mod store;
pub mod types;
pub mod verify;

pub use catalog::{Catalog, ListingParser, MirrorListing, WikimediaListing};
pub use config::{CatalogConfig, FetchConfig, PipelineConfig, Provider};
pub use decompress::{decompress_range, decompress_whole, DecodedStream};
pub use error::DumpError;
pub use fetch::{Fetched, ShardFetcher, WorkerLimits};
pub use index::{StreamIndex, StreamLocation};
pub use pipeline::{PageConsumer, PageEvent, Pipeline, RunSummary, ShardReport, ShardStatus};
pub use recompress::{CacheEntryMeta, CachedShard, RecompressionCache};
pub use remote::{HttpRemote, MemoryRemote, Remote};
pub use store::ShardStore;
pub use types::{
    Checksum, ChecksumAlgorithm, DumpStatus, DumpVersion, Page, PageBlob, PageRange,
    ShardDescriptor, ShardId, StreamRecord,
};
pub use verify::{compute_file_digest, verify};
