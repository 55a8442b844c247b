//! Local cache layout.
//!
//! ```text
//! {cache_dir}/{corpus}-{version}/manifest.json
//! {cache_dir}/{corpus}-{version}/{shard}.raw         verified compressed shard
//! {cache_dir}/{corpus}-{version}/{shard}.index       its stream index
//! {cache_dir}/{corpus}-{version}/{shard}.cache       recompressed streams
//! {cache_dir}/{corpus}-{version}/{shard}.cache.json  cache entry metadata
//! ```
//!
//! Every file is committed by writing a temporary sibling and renaming it,
//! so readers never observe a partially written file.

use crate::error::DumpError;
use crate::types::{DumpVersion, ShardId};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

const MANIFEST_FILE: &str = "manifest.json";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Paths of everything wikisync keeps on disk.
#[derive(Debug, Clone)]
pub struct ShardStore {
    root: PathBuf,
}

impl ShardStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn version_dir(&self, version_key: &str) -> PathBuf {
        self.root.join(version_key)
    }

    pub fn raw_path(&self, version_key: &str, shard: &ShardId) -> PathBuf {
        self.version_dir(version_key).join(format!("{}.raw", shard))
    }

    pub fn index_path(&self, version_key: &str, shard: &ShardId) -> PathBuf {
        self.version_dir(version_key).join(format!("{}.index", shard))
    }

    pub fn cache_path(&self, version_key: &str, shard: &ShardId) -> PathBuf {
        self.version_dir(version_key).join(format!("{}.cache", shard))
    }

    pub fn cache_meta_path(&self, version_key: &str, shard: &ShardId) -> PathBuf {
        self.version_dir(version_key)
            .join(format!("{}.cache.json", shard))
    }

    /// Resumable download target for a committed path.
    pub fn partial_path(committed: &Path) -> PathBuf {
        let mut name = committed.as_os_str().to_os_string();
        name.push(".part");
        PathBuf::from(name)
    }

    /// Persists the version's manifest so it can be reloaded offline.
    pub fn save_manifest(&self, version: &DumpVersion) -> Result<(), DumpError> {
        let dir = self.version_dir(&version.key());
        std::fs::create_dir_all(&dir)?;
        let json = serde_json::to_vec_pretty(version)?;
        let path = dir.join(MANIFEST_FILE);
        write_atomic(&path, &json)?;
        info!("Persisted manifest to {}", path.display());
        Ok(())
    }

    pub fn load_manifest(&self, version_key: &str) -> Result<Option<DumpVersion>, DumpError> {
        let path = self.version_dir(version_key).join(MANIFEST_FILE);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// All versions with a persisted manifest, newest first.
    pub fn local_versions(&self) -> Result<Vec<DumpVersion>, DumpError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let key = entry.file_name().to_string_lossy().to_string();
            match self.load_manifest(&key) {
                Ok(Some(version)) => versions.push(version),
                Ok(None) => {}
                Err(e) => warn!("Ignoring unreadable manifest in {}: {}", key, e),
            }
        }
        versions.sort_by(|a, b| b.id.cmp(&a.id).then_with(|| a.corpus.cmp(&b.corpus)));
        Ok(versions)
    }
}

/// A fresh temporary path next to `path`, unique within this process.
pub(crate) fn temp_sibling(path: &Path) -> PathBuf {
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{}.{}.tmp", std::process::id(), n));
    PathBuf::from(name)
}

/// Writes `bytes` to `path` via a temporary sibling and an atomic rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = temp_sibling(path);
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path).inspect_err(|_| {
        let _ = std::fs::remove_file(&tmp);
    })
}
