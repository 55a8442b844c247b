//! Shard acquisition: resumable download, verification and atomic commit.

use crate::config::FetchConfig;
use crate::error::DumpError;
use crate::remote::Remote;
use crate::singleflight::Singleflight;
use crate::store::ShardStore;
use crate::types::{Checksum, ShardDescriptor, ShardId};
use crate::verify::{ensure_verified, verify};
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Semaphore;
use tokio_retry2::strategy::{jitter, ExponentialBackoff};
use tokio_retry2::{Retry, RetryError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Separate concurrency budgets for network transfers and CPU-bound work.
#[derive(Debug, Clone)]
pub struct WorkerLimits {
    pub network: Arc<Semaphore>,
    pub cpu: Arc<Semaphore>,
}

impl WorkerLimits {
    pub fn new(fetch_workers: usize, decode_workers: usize) -> Self {
        Self {
            network: Arc::new(Semaphore::new(fetch_workers.max(1))),
            cpu: Arc::new(Semaphore::new(decode_workers.max(1))),
        }
    }
}

/// A shard committed to the local cache.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub shard_id: ShardId,
    pub raw_path: PathBuf,
    pub index_path: PathBuf,
    /// Attempts beyond the first, summed over data and index file.
    pub retries: usize,
}

/// Downloads shards into a [`ShardStore`].
///
/// Concurrent requests for the same shard share one transfer. A shard whose
/// committed file already exists is served without touching the network.
pub struct ShardFetcher {
    remote: Arc<dyn Remote>,
    store: ShardStore,
    config: FetchConfig,
    limits: WorkerLimits,
    inflight: Singleflight<(String, ShardId), Fetched, DumpError>,
}

impl ShardFetcher {
    pub fn new(
        remote: Arc<dyn Remote>,
        store: ShardStore,
        config: FetchConfig,
        limits: WorkerLimits,
    ) -> Self {
        Self {
            remote,
            store,
            config,
            limits,
            inflight: Singleflight::new(),
        }
    }

    pub fn store(&self) -> &ShardStore {
        &self.store
    }

    /// Ensures the shard and its index are present and verified locally.
    pub async fn fetch(
        &self,
        version_key: &str,
        shard: &ShardDescriptor,
        cancel: &CancellationToken,
    ) -> Result<Fetched, DumpError> {
        let key = (version_key.to_string(), shard.id.clone());
        loop {
            match self
                .inflight
                .run(key.clone(), || self.fetch_shard(version_key, shard, cancel))
                .await
            {
                Ok(fetched) => return Ok(fetched),
                // Joined a transfer whose owner was cancelled; ours was not.
                Err(e) if matches!(*e, DumpError::Cancelled) && !cancel.is_cancelled() => continue,
                Err(e) => return Err(DumpError::from_shared(e)),
            }
        }
    }

    async fn fetch_shard(
        &self,
        version_key: &str,
        shard: &ShardDescriptor,
        cancel: &CancellationToken,
    ) -> Result<Fetched, DumpError> {
        tokio::fs::create_dir_all(self.store.version_dir(version_key)).await?;

        let index_path = self.store.index_path(version_key, &shard.id);
        let index_retries = self
            .fetch_file(&shard.index_url, &index_path, shard.index_checksum.as_ref(), cancel)
            .await?;

        let raw_path = self.store.raw_path(version_key, &shard.id);
        let raw_retries = self
            .fetch_file(&shard.url, &raw_path, shard.checksum.as_ref(), cancel)
            .await?;

        Ok(Fetched {
            shard_id: shard.id.clone(),
            raw_path,
            index_path,
            retries: index_retries + raw_retries,
        })
    }

    /// Fetches one file to `committed`, returning how many retries it took.
    async fn fetch_file(
        &self,
        url: &str,
        committed: &Path,
        expected: Option<&Checksum>,
        cancel: &CancellationToken,
    ) -> Result<usize, DumpError> {
        if self.is_committed(committed, expected).await? {
            debug!("Using committed {}", committed.display());
            return Ok(0);
        }

        let part = ShardStore::partial_path(committed);
        let attempts = AtomicUsize::new(0);
        let retry_strategy = self.backoff();

        let transfer = Retry::spawn(retry_strategy, || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let part = part.clone();

            async move {
                match self.attempt(url, &part, committed, expected).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.is_transient() && attempt < self.config.max_attempts => {
                        warn!(
                            "Attempt {}/{} for {} failed: {}",
                            attempt, self.config.max_attempts, url, e
                        );
                        RetryError::to_transient(e)
                    }
                    Err(e) => RetryError::to_permanent(e),
                }
            }
        });

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = tokio::fs::remove_file(&part).await;
                Err(DumpError::Cancelled)
            }
            result = transfer => result,
        };
        let retries = attempts.load(Ordering::SeqCst).saturating_sub(1);
        result.map(|()| retries)
    }

    async fn is_committed(
        &self,
        committed: &Path,
        expected: Option<&Checksum>,
    ) -> Result<bool, DumpError> {
        if !tokio::fs::try_exists(committed).await? {
            return Ok(false);
        }
        if !self.config.reverify_cached || expected.is_none() {
            return Ok(true);
        }

        let _permit = self.cpu_permit().await?;
        match verify(committed, expected).await {
            Ok(true) => Ok(true),
            Ok(false) => {
                warn!("Committed {} no longer verifies; refetching", committed.display());
                tokio::fs::remove_file(committed).await?;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// One transfer under a network permit, then verification under a CPU
    /// permit, then the commit rename.
    async fn attempt(
        &self,
        url: &str,
        part: &Path,
        committed: &Path,
        expected: Option<&Checksum>,
    ) -> Result<(), DumpError> {
        {
            let _permit = self
                .limits
                .network
                .acquire()
                .await
                .map_err(|_| DumpError::Cancelled)?;
            let limit = self.config.attempt_timeout;
            tokio::time::timeout(limit, self.transfer(url, part))
                .await
                .map_err(|_| DumpError::Timeout(limit))??;
        }

        {
            let _permit = self.cpu_permit().await?;
            if let Err(e) = ensure_verified(part, expected).await {
                // Corrupt bytes must not seed a resumed transfer.
                let _ = tokio::fs::remove_file(part).await;
                return Err(e);
            }
        }

        tokio::fs::rename(part, committed).await?;
        info!("✅ Committed {}", committed.display());
        Ok(())
    }

    /// Streams `url` into `part`, appending when a previous attempt left bytes.
    async fn transfer(&self, url: &str, part: &Path) -> Result<(), DumpError> {
        let offset = match tokio::fs::metadata(part).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        let body = self.remote.open(url, offset).await?;
        let append = offset > 0 && body.resumed;
        if offset > 0 {
            if append {
                info!("⏩ Resuming {} at byte {}", url, offset);
            } else {
                debug!("Server ignored range request for {}; restarting", url);
            }
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(part)
            .await?;
        let mut file = BufWriter::new(file);

        let mut written = 0u64;
        let mut stream = body.stream;
        while let Some(piece) = stream.next().await {
            let chunk = piece?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        if let Some(expected) = body.content_length {
            if written != expected {
                return Err(DumpError::FetchFailed {
                    url: url.to_string(),
                    reason: format!("short body: expected {} bytes, got {}", expected, written),
                });
            }
        } else {
            warn!(
                "Content-Length header was not present for {}. Cannot verify file size.",
                url
            );
        }
        Ok(())
    }

    async fn cpu_permit(&self) -> Result<tokio::sync::SemaphorePermit<'_>, DumpError> {
        self.limits
            .cpu
            .acquire()
            .await
            .map_err(|_| DumpError::Cancelled)
    }

    /// Exponential backoff starting at `base_backoff`, capped and jittered.
    fn backoff(&self) -> impl Iterator<Item = Duration> {
        let base_ms = self.config.base_backoff.as_millis() as u64;
        ExponentialBackoff::from_millis(2)
            .factor((base_ms / 2).max(1))
            .max_delay(self.config.max_backoff)
            .map(jitter)
            .take(self.config.max_attempts.saturating_sub(1))
    }
}
