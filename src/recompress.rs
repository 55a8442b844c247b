//! Recompression cache with LRU eviction.
//!
//! Multistream bzip2 is compact but slow to decode. The first full decode of
//! a shard re-encodes each stream as an lz4 block into `{shard}.cache`, with
//! a JSON side record mapping every source stream offset to its block. Later
//! reads of that shard decode lz4 instead of bzip2.
//!
//! ```text
//! get(version, shard)
//!         ↓
//!   {shard}.cache.json present? ──NO──→ miss (caller decodes bzip2,
//!         │                                 streams into a CacheWriter)
//!        YES
//!         ↓
//!   touch LRU, return CachedShard ──→ read_stream(offset) seeks one block
//! ```
//!
//! The total size of all entries is bounded by a byte budget; committing a
//! new entry evicts least recently used ones until it fits.

use crate::decompress::DecodedStream;
use crate::error::DumpError;
use crate::store::{temp_sibling, write_atomic, ShardStore};
use crate::types::{Checksum, ShardId};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Codec tag recorded in every cache entry.
pub const CODEC_LZ4: &str = "lz4";

type EntryKey = (String, ShardId);

/// Position of one recompressed stream inside a `.cache` file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CachedStream {
    /// Offset of the stream in the original compressed shard.
    pub source_offset: u64,
    pub offset: u64,
    pub len: u64,
    pub raw_len: u64,
}

/// Metadata record stored next to each `.cache` file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CacheEntryMeta {
    pub version: String,
    pub shard: ShardId,
    pub codec: String,
    /// Digest of the verified source shard this entry was derived from.
    pub source_checksum: Option<Checksum>,
    /// Size of the `.cache` file.
    pub byte_size: u64,
    /// Total decoded size of all streams.
    pub raw_size: u64,
    /// Ascending by `source_offset`.
    pub streams: Vec<CachedStream>,
}

/// Streams recompressed blocks into a temporary file until committed.
///
/// Dropping a writer that was never committed deletes its temporary file.
pub struct CacheWriter {
    file: BufWriter<File>,
    tmp_path: PathBuf,
    meta: CacheEntryMeta,
    committed: bool,
}

impl CacheWriter {
    /// Appends one decoded stream. Streams must arrive in ascending offset order.
    pub fn append(&mut self, source_offset: u64, raw: &[u8]) -> Result<(), DumpError> {
        if let Some(last) = self.meta.streams.last() {
            if source_offset <= last.source_offset {
                return Err(DumpError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!(
                        "cache streams out of order: {} after {}",
                        source_offset, last.source_offset
                    ),
                )));
            }
        }

        let block = lz4_flex::compress_prepend_size(raw);
        self.file.write_all(&block)?;
        self.meta.streams.push(CachedStream {
            source_offset,
            offset: self.meta.byte_size,
            len: block.len() as u64,
            raw_len: raw.len() as u64,
        });
        self.meta.byte_size += block.len() as u64;
        self.meta.raw_size += raw.len() as u64;
        Ok(())
    }

    pub fn stream_count(&self) -> usize {
        self.meta.streams.len()
    }

    /// Throws away everything written so far.
    pub fn abandon(self) {}
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.tmp_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to delete {}: {}", self.tmp_path.display(), e);
            }
        }
    }
}

/// A committed cache entry.
#[derive(Debug, Clone)]
pub struct CachedShard {
    path: PathBuf,
    meta: CacheEntryMeta,
}

impl CachedShard {
    pub fn meta(&self) -> &CacheEntryMeta {
        &self.meta
    }

    /// Decodes the stream that started at `source_offset` in the original shard.
    pub fn read_stream(&self, source_offset: u64) -> Result<Option<Vec<u8>>, DumpError> {
        let entry = match self
            .meta
            .streams
            .binary_search_by_key(&source_offset, |s| s.source_offset)
        {
            Ok(i) => &self.meta.streams[i],
            Err(_) => return Ok(None),
        };
        let mut file = File::open(&self.path)?;
        read_block(&mut file, entry).map(Some)
    }

    /// Decodes every cached stream in ascending offset order.
    pub fn streams(&self) -> Result<CachedStreams<'_>, DumpError> {
        Ok(CachedStreams {
            file: File::open(&self.path)?,
            entries: self.meta.streams.iter(),
        })
    }
}

/// Iterator returned by [`CachedShard::streams`].
pub struct CachedStreams<'a> {
    file: File,
    entries: std::slice::Iter<'a, CachedStream>,
}

impl Iterator for CachedStreams<'_> {
    type Item = Result<DecodedStream, DumpError>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.entries.next()?;
        Some(read_block(&mut self.file, entry).map(|bytes| DecodedStream {
            offset: entry.source_offset,
            stream: None,
            bytes,
        }))
    }
}

fn read_block(file: &mut File, entry: &CachedStream) -> Result<Vec<u8>, DumpError> {
    let decode_error = |reason: String| DumpError::DecodeError {
        offset: entry.source_offset,
        reason,
    };
    file.seek(SeekFrom::Start(entry.offset))?;
    let mut block = vec![0u8; entry.len as usize];
    file.read_exact(&mut block)?;
    let raw = lz4_flex::decompress_size_prepended(&block).map_err(|e| decode_error(e.to_string()))?;
    if raw.len() as u64 != entry.raw_len {
        return Err(decode_error(format!(
            "cached stream decoded to {} bytes, expected {}",
            raw.len(),
            entry.raw_len
        )));
    }
    Ok(raw)
}

struct CacheState {
    lru: LruCache<EntryKey, u64>,
    current_size: u64,
}

/// Disk-backed cache of recompressed shards, keyed by (version, shard).
pub struct RecompressionCache {
    store: ShardStore,
    max_size_bytes: u64,
    state: Mutex<CacheState>,
}

impl RecompressionCache {
    /// Opens the cache, registering entries already on disk.
    pub fn open(store: ShardStore, max_size_bytes: u64) -> Result<Self, DumpError> {
        std::fs::create_dir_all(store.root())?;

        let mut lru = LruCache::unbounded();
        let mut current_size = 0;
        for version_dir in std::fs::read_dir(store.root())? {
            let version_dir = version_dir?;
            if !version_dir.file_type()?.is_dir() {
                continue;
            }
            for file in std::fs::read_dir(version_dir.path())? {
                let path = file?.path();
                let is_meta = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.ends_with(".cache.json"))
                    .unwrap_or(false);
                if !is_meta {
                    continue;
                }
                match std::fs::read(&path)
                    .map_err(DumpError::from)
                    .and_then(|b| serde_json::from_slice::<CacheEntryMeta>(&b).map_err(DumpError::from))
                {
                    Ok(meta) => {
                        current_size += meta.byte_size;
                        lru.put((meta.version, meta.shard), meta.byte_size);
                    }
                    Err(e) => warn!("Ignoring unreadable cache record {}: {}", path.display(), e),
                }
            }
        }

        if !lru.is_empty() {
            info!(
                "Recompression cache holds {} entries, {} bytes",
                lru.len(),
                current_size
            );
        }

        Ok(Self {
            store,
            max_size_bytes,
            state: Mutex::new(CacheState { lru, current_size }),
        })
    }

    /// Starts a new entry for `(version, shard)`.
    pub fn writer(
        &self,
        version: &str,
        shard: &ShardId,
        source_checksum: Option<Checksum>,
    ) -> Result<CacheWriter, DumpError> {
        let path = self.store.cache_path(version, shard);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = temp_sibling(&path);
        let file = BufWriter::with_capacity(4 * 1024 * 1024, File::create(&tmp_path)?);
        Ok(CacheWriter {
            file,
            tmp_path,
            meta: CacheEntryMeta {
                version: version.to_string(),
                shard: shard.clone(),
                codec: CODEC_LZ4.to_string(),
                source_checksum,
                byte_size: 0,
                raw_size: 0,
                streams: Vec::new(),
            },
            committed: false,
        })
    }

    /// Publishes a finished entry, evicting LRU entries to stay within budget.
    ///
    /// Returns `None` when the entry alone exceeds the budget; it is then
    /// discarded rather than letting the cache grow unbounded.
    pub async fn commit(&self, mut writer: CacheWriter) -> Result<Option<CacheEntryMeta>, DumpError> {
        writer.file.flush()?;
        writer.file.get_ref().sync_all()?;
        let meta = writer.meta.clone();

        if meta.byte_size > self.max_size_bytes {
            warn!(
                shard = %meta.shard,
                size = meta.byte_size,
                max_size = self.max_size_bytes,
                "Cannot cache: entry larger than cache budget"
            );
            return Ok(None);
        }

        let key = (meta.version.clone(), meta.shard.clone());
        let mut state = self.state.lock().await;
        if let Some(old) = state.lru.pop(&key) {
            state.current_size = state.current_size.saturating_sub(old);
        }
        self.evict_if_needed(&mut state, meta.byte_size);

        let path = self.store.cache_path(&meta.version, &meta.shard);
        std::fs::rename(&writer.tmp_path, &path)?;
        writer.committed = true;
        write_atomic(
            &self.store.cache_meta_path(&meta.version, &meta.shard),
            &serde_json::to_vec(&meta)?,
        )?;

        state.current_size += meta.byte_size;
        state.lru.put(key, meta.byte_size);
        debug!(
            shard = %meta.shard,
            size = meta.byte_size,
            raw_size = meta.raw_size,
            "Cached recompressed shard"
        );
        Ok(Some(meta))
    }

    /// Recompresses and stores already decoded streams.
    pub async fn put(
        &self,
        version: &str,
        shard: &ShardId,
        streams: &[DecodedStream],
        source_checksum: Option<Checksum>,
    ) -> Result<Option<CacheEntryMeta>, DumpError> {
        let mut writer = self.writer(version, shard, source_checksum)?;
        for stream in streams {
            writer.append(stream.offset, &stream.bytes)?;
        }
        self.commit(writer).await
    }

    /// Looks up an entry, marking it most recently used.
    pub async fn get(&self, version: &str, shard: &ShardId) -> Result<Option<CachedShard>, DumpError> {
        let meta_path = self.store.cache_meta_path(version, shard);
        let path = self.store.cache_path(version, shard);

        let mut state = self.state.lock().await;
        let meta: CacheEntryMeta = match tokio::fs::read(&meta_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if meta.codec != CODEC_LZ4 || !path.exists() {
            return Ok(None);
        }

        let key = (version.to_string(), shard.clone());
        if state.lru.get(&key).is_none() {
            state.current_size += meta.byte_size;
            state.lru.put(key, meta.byte_size);
        }
        debug!(shard = %shard, size = meta.byte_size, "Cache hit");
        Ok(Some(CachedShard { path, meta }))
    }

    /// Evicts the entries of `corpus` that belong to any version other than
    /// `version_key`. Other corpora are left alone.
    pub async fn retain_version(&self, corpus: &str, version_key: &str) -> usize {
        let prefix = format!("{}-", corpus);
        let mut state = self.state.lock().await;
        let stale: Vec<EntryKey> = state
            .lru
            .iter()
            .filter(|((v, _), _)| v != version_key && v.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            if let Some(size) = state.lru.pop(key) {
                state.current_size = state.current_size.saturating_sub(size);
                self.remove_files(key);
            }
        }
        if !stale.is_empty() {
            info!(
                "Evicted {} cache entries superseded by {}",
                stale.len(),
                version_key
            );
        }
        stale.len()
    }

    /// Total size of all entries in bytes.
    pub async fn size_bytes(&self) -> u64 {
        self.state.lock().await.current_size
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.lru.len()
    }

    fn evict_if_needed(&self, state: &mut CacheState, needed: u64) {
        while state.current_size + needed > self.max_size_bytes {
            match state.lru.pop_lru() {
                Some((key, size)) => {
                    self.remove_files(&key);
                    state.current_size = state.current_size.saturating_sub(size);
                    debug!(version = %key.0, shard = %key.1, size, "Evicted from cache");
                }
                None => break,
            }
        }
    }

    fn remove_files(&self, (version, shard): &EntryKey) {
        for path in [
            self.store.cache_meta_path(version, shard),
            self.store.cache_path(version, shard),
        ] {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to delete cache file {}: {}", path.display(), e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(offset: u64, fill: u8, len: usize) -> DecodedStream {
        DecodedStream {
            offset,
            stream: None,
            bytes: (0..len).map(|i| fill.wrapping_add((i % 7) as u8)).collect(),
        }
    }

    #[tokio::test]
    async fn test_put_and_read_streams() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RecompressionCache::open(ShardStore::new(dir.path()), 1 << 20).unwrap();
        let shard = ShardId::new("1");
        assert!(cache.get("enwiki-1", &shard).await.unwrap().is_none());

        let streams = vec![stream(100, 1, 500), stream(300, 2, 800)];
        let meta = cache
            .put("enwiki-1", &shard, &streams, Some(Checksum::md5("aa")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meta.codec, CODEC_LZ4);
        assert_eq!(meta.raw_size, 1300);

        let cached = cache.get("enwiki-1", &shard).await.unwrap().unwrap();
        assert_eq!(cached.read_stream(300).unwrap().unwrap(), streams[1].bytes);
        assert!(cached.read_stream(200).unwrap().is_none());
        let all: Vec<Vec<u8>> = cached
            .streams()
            .unwrap()
            .map(|s| s.unwrap().bytes)
            .collect();
        assert_eq!(all, vec![streams[0].bytes.clone(), streams[1].bytes.clone()]);
    }

    #[tokio::test]
    async fn test_lru_eviction_respects_budget() {
        let probe_dir = tempfile::tempdir().unwrap();
        let probe = RecompressionCache::open(ShardStore::new(probe_dir.path()), u64::MAX).unwrap();
        let one = probe
            .put("v", &ShardId::new("probe"), &[stream(0, 9, 4096)], None)
            .await
            .unwrap()
            .unwrap()
            .byte_size;

        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::new(dir.path());

        // Room for two entries of this size, not three.
        let cache = RecompressionCache::open(store, one * 2 + one / 2).unwrap();
        for name in ["a", "b"] {
            cache
                .put("v", &ShardId::new(name), &[stream(0, 9, 4096)], None)
                .await
                .unwrap();
        }
        // Touch "a" so "b" becomes least recently used.
        assert!(cache.get("v", &ShardId::new("a")).await.unwrap().is_some());
        cache
            .put("v", &ShardId::new("c"), &[stream(0, 9, 4096)], None)
            .await
            .unwrap();

        assert!(cache.get("v", &ShardId::new("b")).await.unwrap().is_none());
        assert!(cache.get("v", &ShardId::new("a")).await.unwrap().is_some());
        assert!(cache.get("v", &ShardId::new("c")).await.unwrap().is_some());
        assert!(cache.size_bytes().await <= one * 2 + one / 2);
    }

    #[tokio::test]
    async fn test_oversize_entry_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RecompressionCache::open(ShardStore::new(dir.path()), 8).unwrap();
        let result = cache
            .put("v", &ShardId::new("big"), &[stream(0, 1, 4096)], None)
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_reopen_and_retain_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::new(dir.path());
        {
            let cache = RecompressionCache::open(store.clone(), 1 << 20).unwrap();
            cache
                .put("enwiki-20201001", &ShardId::new("1"), &[stream(0, 1, 64)], None)
                .await
                .unwrap();
            cache
                .put("enwiki-20201020", &ShardId::new("1"), &[stream(0, 2, 64)], None)
                .await
                .unwrap();
            cache
                .put("frwiki-20200901", &ShardId::new("1"), &[stream(0, 3, 64)], None)
                .await
                .unwrap();
        }

        let cache = RecompressionCache::open(store.clone(), 1 << 20).unwrap();
        assert_eq!(cache.len().await, 3);
        assert_eq!(cache.retain_version("enwiki", "enwiki-20201020").await, 1);
        assert_eq!(cache.len().await, 2);
        assert!(cache
            .get("enwiki-20201001", &ShardId::new("1"))
            .await
            .unwrap()
            .is_none());
        assert!(!store.cache_path("enwiki-20201001", &ShardId::new("1")).exists());
        assert!(cache
            .get("enwiki-20201020", &ShardId::new("1"))
            .await
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_writer_rejects_out_of_order_streams() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RecompressionCache::open(ShardStore::new(dir.path()), 1 << 20).unwrap();
        let mut writer = cache.writer("v", &ShardId::new("1"), None).unwrap();
        writer.append(500, b"abc").unwrap();
        assert!(writer.append(100, b"def").is_err());
        assert_eq!(writer.stream_count(), 1);
        writer.abandon();
    }

    fn leftover_temp_files(dir: &std::path::Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "tmp"))
            .collect()
    }

    #[tokio::test]
    async fn test_dropped_writer_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::new(dir.path());
        let cache = RecompressionCache::open(store.clone(), 1 << 20).unwrap();
        let version_dir = store.version_dir("v");

        {
            let mut writer = cache.writer("v", &ShardId::new("1"), None).unwrap();
            writer.append(0, b"half a shard").unwrap();
            assert_eq!(leftover_temp_files(&version_dir).len(), 1);
        }
        assert!(leftover_temp_files(&version_dir).is_empty());
        assert!(cache.get("v", &ShardId::new("1")).await.unwrap().is_none());

        // A committed entry keeps its file.
        let mut writer = cache.writer("v", &ShardId::new("2"), None).unwrap();
        writer.append(0, b"whole shard").unwrap();
        cache.commit(writer).await.unwrap().unwrap();
        assert!(leftover_temp_files(&version_dir).is_empty());
        assert!(store.cache_path("v", &ShardId::new("2")).exists());
    }
}
