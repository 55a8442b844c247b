//! Pipeline configuration.

use crate::error::DumpError;
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which listing format the dump provider serves.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// dumps.wikimedia.org: HTML index plus `dumpstatus.json` per version.
    #[default]
    Wikimedia,
    /// Plain mirrors: autoindex pages plus an `md5sums.txt` per version.
    Mirror,
}

/// Where and how to discover dump versions.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CatalogConfig {
    /// Provider root (e.g., `<https://dumps.wikimedia.org>`)
    pub base_url: String,
    pub provider: Provider,
    /// Fall back to a partial dump when no complete one exists (default: false).
    pub accept_partial: bool,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            base_url: "https://dumps.wikimedia.org".to_string(),
            provider: Provider::Wikimedia,
            accept_partial: false,
        }
    }
}

/// Retry and timeout policy for shard transfers.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct FetchConfig {
    /// Total attempts per file, including the first (default: 5).
    pub max_attempts: usize,
    /// First backoff delay; doubles per attempt, with jitter.
    #[serde(deserialize_with = "humantime_duration")]
    pub base_backoff: Duration,
    /// Upper bound on a single backoff delay.
    #[serde(deserialize_with = "humantime_duration")]
    pub max_backoff: Duration,
    /// Limit for one transfer attempt, distinct from the run timeout.
    #[serde(deserialize_with = "humantime_duration")]
    pub attempt_timeout: Duration,
    /// Re-hash committed shards before trusting them (default: false).
    ///
    /// Committed files were verified before their atomic rename, so this is
    /// only useful when something outside wikisync may have touched the cache.
    pub reverify_cached: bool,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(600),
            reverify_cached: false,
            user_agent: concat!("wikisync/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Configuration for a pipeline run.
///
/// # Example
///
/// ```
/// use wikisync::PipelineConfig;
///
/// let config = PipelineConfig {
///     cache_dir: ".wikisync".into(),
///     fetch_workers: 8,
///     ..PipelineConfig::default()
/// };
/// assert!(config.recompress);
/// ```
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct PipelineConfig {
    /// Root of the local shard and recompression cache.
    pub cache_dir: PathBuf,
    /// Maximum concurrent network transfers (default: 4).
    ///
    /// Transfers are bandwidth-bound, so this is independent of core count.
    pub fetch_workers: usize,
    /// Maximum concurrent CPU-bound jobs: checksums, index parsing, decoding.
    pub decode_workers: usize,
    /// Pages buffered per shard while earlier shards are being delivered.
    pub queue_depth: usize,
    /// Re-encode decoded shards into the fast-access cache (default: true).
    pub recompress: bool,
    /// Byte budget of the recompression cache, enforced by LRU eviction.
    pub cache_budget_bytes: u64,
    /// Whole-run limit; exceeding it cancels all in-flight work.
    #[serde(deserialize_with = "humantime_duration_opt")]
    pub run_timeout: Option<Duration>,
    pub fetch: FetchConfig,
    pub catalog: CatalogConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(".wikisync"),
            fetch_workers: 4,
            decode_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            queue_depth: 256,
            recompress: true,
            cache_budget_bytes: 8 * 1024 * 1024 * 1024,
            run_timeout: None,
            fetch: FetchConfig::default(),
            catalog: CatalogConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Loads a JSON config file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, DumpError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

fn humantime_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    humantime::parse_duration(&s).map_err(serde::de::Error::custom)
}

fn humantime_duration_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(s) => humantime::parse_duration(&s)
            .map(Some)
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}
