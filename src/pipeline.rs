//! Pipeline coordination: fetch, verify, index and decode every shard of a
//! dump version, delivering pages in manifest order.
//!
//! ```text
//!            ┌─ shard 1 task: fetch ─→ index ─→ decode ─→ [queue] ─┐
//! manifest ──┼─ shard 2 task: fetch ─→ index ─→ decode ─→ [queue] ─┼─→ coordinator ─→ consumer
//!            └─ shard 3 task: fetch ─→ index ─→ decode ─→ [queue] ─┘   (manifest order)
//! ```
//!
//! Every shard runs as its own task. Transfers hold a permit from the network
//! pool, while checksums, index parsing and stream decoding hold a permit
//! from the CPU pool; no task waits on one pool while holding the other's
//! permit. Each task pushes pages into a bounded queue, so shards further
//! down the manifest make progress while earlier ones are delivered, and
//! stall once their queue is full.
//!
//! A shard whose download fails verification is set aside and dispatched
//! again once the current round has been delivered, up to
//! `fetch.max_attempts` rounds.

use crate::catalog::Catalog;
use crate::config::PipelineConfig;
use crate::decompress::{decompress_stream, page_blobs};
use crate::error::DumpError;
use crate::fetch::{ShardFetcher, WorkerLimits};
use crate::index::StreamIndex;
use crate::recompress::{CachedShard, RecompressionCache};
use crate::remote::Remote;
use crate::singleflight::{KeyedLocks, Singleflight};
use crate::store::ShardStore;
use crate::types::{DumpVersion, Page, ShardDescriptor, ShardId};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Receives the pages of a run, grouped by shard in manifest order.
#[async_trait]
pub trait PageConsumer: Send {
    /// Handles one page. Returning an error aborts the whole run.
    async fn page(&mut self, shard: &ShardId, page: Page) -> Result<(), DumpError>;

    /// Called in place of a shard's pages when it could not be processed.
    async fn shard_failed(&mut self, _shard: &ShardId, _error: &DumpError) -> Result<(), DumpError> {
        Ok(())
    }

    /// Called after the last page of a shard.
    async fn shard_done(&mut self, _report: &ShardReport) -> Result<(), DumpError> {
        Ok(())
    }
}

/// Items produced by [`Pipeline::spawn_pages`].
#[derive(Debug, Clone)]
pub enum PageEvent {
    Page { shard: ShardId, page: Page },
    ShardFailed { shard: ShardId, reason: String },
    ShardDone(ShardReport),
}

#[async_trait]
impl PageConsumer for mpsc::Sender<PageEvent> {
    async fn page(&mut self, shard: &ShardId, page: Page) -> Result<(), DumpError> {
        self.send(PageEvent::Page {
            shard: shard.clone(),
            page,
        })
        .await
        .map_err(|_| DumpError::Cancelled)
    }

    async fn shard_failed(&mut self, shard: &ShardId, error: &DumpError) -> Result<(), DumpError> {
        self.send(PageEvent::ShardFailed {
            shard: shard.clone(),
            reason: error.to_string(),
        })
        .await
        .map_err(|_| DumpError::Cancelled)
    }

    async fn shard_done(&mut self, report: &ShardReport) -> Result<(), DumpError> {
        self.send(PageEvent::ShardDone(report.clone()))
            .await
            .map_err(|_| DumpError::Cancelled)
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ShardStatus {
    Succeeded,
    Failed { reason: String },
}

/// Outcome of one shard within a run.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ShardReport {
    pub shard_id: ShardId,
    #[serde(flatten)]
    pub status: ShardStatus,
    /// Transfer retries plus re-dispatches after failed verification.
    pub retries: usize,
    pub pages: u64,
    /// Pages came from the recompression cache instead of the bzip2 shard.
    pub cache_hit: bool,
    /// Streams that could not be decoded; their pages are missing.
    pub decode_errors: usize,
}

impl ShardReport {
    pub fn is_success(&self) -> bool {
        self.status == ShardStatus::Succeeded
    }

    /// Human-readable outcome, e.g. `succeeded after 2 retries`.
    pub fn describe(&self) -> String {
        match (&self.status, self.retries) {
            (ShardStatus::Succeeded, 0) => "succeeded".to_string(),
            (ShardStatus::Succeeded, 1) => "succeeded after 1 retry".to_string(),
            (ShardStatus::Succeeded, n) => format!("succeeded after {} retries", n),
            (ShardStatus::Failed { reason }, _) => format!("failed: {}", reason),
        }
    }
}

/// Per-run summary, in delivery order.
#[derive(Serialize, Debug, Clone)]
pub struct RunSummary {
    pub version: String,
    pub shards: Vec<ShardReport>,
    #[serde(serialize_with = "serialize_elapsed")]
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn report(&self, shard: &ShardId) -> Option<&ShardReport> {
        self.shards.iter().find(|r| &r.shard_id == shard)
    }

    pub fn succeeded(&self) -> Vec<&ShardId> {
        self.shards
            .iter()
            .filter(|r| r.is_success())
            .map(|r| &r.shard_id)
            .collect()
    }

    /// Failed shard ids with their reasons; feed the ids back into
    /// [`Pipeline::run_shards`] to retry just those.
    pub fn failed(&self) -> Vec<(&ShardId, &str)> {
        self.shards
            .iter()
            .filter_map(|r| match &r.status {
                ShardStatus::Failed { reason } => Some((&r.shard_id, reason.as_str())),
                ShardStatus::Succeeded => None,
            })
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.shards.iter().all(ShardReport::is_success)
    }

    pub fn pages(&self) -> u64 {
        self.shards.iter().map(|r| r.pages).sum()
    }
}

fn serialize_elapsed<S: serde::Serializer>(elapsed: &Duration, s: S) -> Result<S::Ok, S::Error> {
    let whole_seconds = Duration::from_secs(elapsed.as_secs());
    s.serialize_str(&humantime::format_duration(whole_seconds).to_string())
}

/// A shard that is committed locally with its index parsed.
struct PreparedShard {
    raw_path: PathBuf,
    index: Arc<StreamIndex>,
    retries: usize,
}

/// What a shard task reports after its last page.
#[derive(Debug)]
struct ShardStats {
    raw_path: PathBuf,
    retries: usize,
    cache_hit: bool,
    decode_errors: usize,
    first_decode_error: Option<String>,
}

enum ShardMessage {
    Page(Page),
    Done(ShardStats),
    Failed(DumpError),
}

struct Inner {
    config: PipelineConfig,
    remote: Arc<dyn Remote>,
    store: ShardStore,
    limits: WorkerLimits,
    fetcher: ShardFetcher,
    cache: Option<RecompressionCache>,
    prepared: Singleflight<(String, ShardId), Arc<PreparedShard>, DumpError>,
    decoding: KeyedLocks<(String, ShardId)>,
}

/// Drives dump versions from remote shards to consumers.
///
/// Cheap to clone; clones share worker pools, caches and in-flight work.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, remote: Arc<dyn Remote>) -> Result<Self, DumpError> {
        let store = ShardStore::new(&config.cache_dir);
        std::fs::create_dir_all(store.root())?;

        let limits = WorkerLimits::new(config.fetch_workers, config.decode_workers);
        let fetcher = ShardFetcher::new(
            Arc::clone(&remote),
            store.clone(),
            config.fetch.clone(),
            limits.clone(),
        );
        let cache = if config.recompress {
            Some(RecompressionCache::open(store.clone(), config.cache_budget_bytes)?)
        } else {
            None
        };

        info!(
            "🚀 Pipeline ready: cache {}, {} fetch workers, {} decode workers",
            store.root().display(),
            config.fetch_workers,
            config.decode_workers
        );
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                remote,
                store,
                limits,
                fetcher,
                cache,
                prepared: Singleflight::new(),
                decoding: KeyedLocks::new(),
            }),
        })
    }

    /// A catalog over the same remote and provider settings.
    pub fn catalog(&self) -> Catalog {
        Catalog::new(self.inner.config.catalog.clone(), Arc::clone(&self.inner.remote))
    }

    pub fn store(&self) -> &ShardStore {
        &self.inner.store
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Processes every shard of `version`.
    pub async fn run<C: PageConsumer>(
        &self,
        version: &DumpVersion,
        consumer: &mut C,
    ) -> Result<RunSummary, DumpError> {
        self.run_shards(version, &[], consumer).await
    }

    /// Processes only the listed shards, or all of them when `only` is empty.
    pub async fn run_shards<C: PageConsumer>(
        &self,
        version: &DumpVersion,
        only: &[ShardId],
        consumer: &mut C,
    ) -> Result<RunSummary, DumpError> {
        self.run_cancellable(version, only, consumer, CancellationToken::new())
            .await
    }

    /// Like [`run_shards`](Self::run_shards), stopping when `cancel` fires or
    /// the configured run timeout elapses.
    ///
    /// Cancellation reaches every in-flight transfer and decode; partial
    /// downloads are discarded, never committed.
    pub async fn run_cancellable<C: PageConsumer>(
        &self,
        version: &DumpVersion,
        only: &[ShardId],
        consumer: &mut C,
        cancel: CancellationToken,
    ) -> Result<RunSummary, DumpError> {
        // Shard tasks observe a child token so that leaving this function
        // early stops them without cancelling the caller's token.
        let run_cancel = cancel.child_token();
        let _guard = run_cancel.clone().drop_guard();

        let run = self.drive(version, only, consumer, &run_cancel);
        match self.inner.config.run_timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result,
                Err(_) => {
                    error!("⏱️  Run for {} exceeded {:?}", version.key(), limit);
                    Err(DumpError::Timeout(limit))
                }
            },
            None => run.await,
        }
    }

    async fn drive<C: PageConsumer>(
        &self,
        version: &DumpVersion,
        only: &[ShardId],
        consumer: &mut C,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, DumpError> {
        let started = Instant::now();
        let key = version.key();
        let inner = &self.inner;

        let mut selected: Vec<ShardDescriptor> = Vec::new();
        for shard in &version.shards {
            if only.is_empty() || only.contains(&shard.id) {
                selected.push(shard.clone());
            }
        }
        for id in only {
            if version.shard(id).is_none() {
                warn!("Shard {} is not part of {}; ignoring it", id, key);
            }
        }

        let previous = inner.store.load_manifest(&key).unwrap_or_else(|e| {
            warn!("Ignoring unreadable manifest for {}: {}", key, e);
            None
        });
        inner.store.save_manifest(version)?;
        if let Some(cache) = &inner.cache {
            cache.retain_version(&version.corpus, &key).await;
        }

        info!(
            "📦 Processing {} of {} shard(s) of {}",
            selected.len(),
            version.shards.len(),
            key
        );

        let max_rounds = inner.config.fetch.max_attempts.max(1);
        let mut rounds: HashMap<ShardId, usize> = HashMap::new();
        let mut reports = Vec::with_capacity(selected.len());
        let mut local_paths = HashMap::new();
        let mut pending = selected;

        while !pending.is_empty() {
            let workers: Vec<_> = pending
                .iter()
                .map(|shard| {
                    let (tx, rx) = mpsc::channel(inner.config.queue_depth.max(1));
                    let handle = tokio::spawn(Arc::clone(inner).shard_task(
                        key.clone(),
                        shard.clone(),
                        tx,
                        cancel.clone(),
                    ));
                    (shard.clone(), rx, handle)
                })
                .collect();

            let mut deferred = Vec::new();
            for (shard, mut rx, handle) in workers {
                let (outcome, pages) = match deliver(&shard.id, &mut rx, consumer).await {
                    Ok(delivered) => delivered,
                    Err(e) => {
                        cancel.cancel();
                        return Err(e);
                    }
                };
                if let Err(e) = handle.await {
                    error!(shard = %shard.id, "Shard task failed: {}", e);
                }

                let redispatches = rounds.get(&shard.id).copied().unwrap_or(0);
                let report = match outcome {
                    Ok(stats) => {
                        local_paths.insert(shard.id.clone(), stats.raw_path.clone());
                        let status = match stats.first_decode_error {
                            None => ShardStatus::Succeeded,
                            Some(reason) => ShardStatus::Failed {
                                reason: format!(
                                    "{} stream(s) failed to decode, first: {}",
                                    stats.decode_errors, reason
                                ),
                            },
                        };
                        ShardReport {
                            shard_id: shard.id.clone(),
                            status,
                            retries: redispatches + stats.retries,
                            pages,
                            cache_hit: stats.cache_hit,
                            decode_errors: stats.decode_errors,
                        }
                    }
                    Err(e) if e.is_refetchable() && redispatches + 1 < max_rounds && !cancel.is_cancelled() => {
                        warn!(
                            shard = %shard.id,
                            attempt = redispatches + 1,
                            "Shard will be fetched again: {}",
                            e
                        );
                        rounds.insert(shard.id.clone(), redispatches + 1);
                        deferred.push(shard);
                        continue;
                    }
                    Err(e) => {
                        if cancel.is_cancelled() {
                            return Err(DumpError::Cancelled);
                        }
                        error!(shard = %shard.id, "❌ Shard failed: {}", e);
                        if let Err(consumer_error) = consumer.shard_failed(&shard.id, &e).await {
                            cancel.cancel();
                            return Err(consumer_error);
                        }
                        ShardReport {
                            shard_id: shard.id.clone(),
                            status: ShardStatus::Failed {
                                reason: e.to_string(),
                            },
                            retries: redispatches,
                            pages,
                            cache_hit: false,
                            decode_errors: 0,
                        }
                    }
                };

                info!(shard = %shard.id, pages = report.pages, "Shard {}", report.describe());
                if let Err(e) = consumer.shard_done(&report).await {
                    cancel.cancel();
                    return Err(e);
                }
                reports.push(report);
            }
            pending = deferred;
        }

        let mut committed = version.clone();
        for shard in &mut committed.shards {
            shard.local_path = local_paths.remove(&shard.id).or_else(|| {
                previous
                    .as_ref()
                    .and_then(|v| v.shard(&shard.id))
                    .and_then(|s| s.local_path.clone())
            });
        }
        inner.store.save_manifest(&committed)?;

        let summary = RunSummary {
            version: key,
            shards: reports,
            elapsed: started.elapsed(),
        };
        if summary.is_success() {
            info!(
                "✅ {} pages from {} shard(s) of {}",
                summary.pages(),
                summary.shards.len(),
                summary.version
            );
        } else {
            warn!(
                "{} of {} shard(s) of {} failed",
                summary.failed().len(),
                summary.shards.len(),
                summary.version
            );
        }
        Ok(summary)
    }

    /// Runs in the background, delivering events through a bounded channel.
    ///
    /// Dropping the receiver cancels the run.
    pub fn spawn_pages(
        &self,
        version: DumpVersion,
        only: Vec<ShardId>,
    ) -> (mpsc::Receiver<PageEvent>, JoinHandle<Result<RunSummary, DumpError>>) {
        let (mut tx, rx) = mpsc::channel(self.inner.config.queue_depth.max(1));
        let pipeline = self.clone();
        let handle = tokio::spawn(async move { pipeline.run_shards(&version, &only, &mut tx).await });
        (rx, handle)
    }

    /// Looks up a single page, decoding only the stream that holds it.
    ///
    /// The owning shard is fetched and indexed first if needed. A page that
    /// is not indexed (deleted upstream, or outside every shard) is `Ok(None)`.
    pub async fn page(&self, version: &DumpVersion, page_id: u64) -> Result<Option<Page>, DumpError> {
        let shard = match version.shard_for_page(page_id) {
            Some(shard) => shard,
            None => return Ok(None),
        };
        let key = version.key();
        let inner = &self.inner;
        let prepared = inner
            .prepare(&key, shard, &CancellationToken::new())
            .await?;

        let location = match prepared.index.lookup(page_id) {
            Ok(location) => location,
            Err(DumpError::PageNotIndexed(_)) => {
                debug!("Page {} is not indexed in shard {}", page_id, shard.id);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let cached = inner.cached_entry(&key, shard).await?;
        let bytes = {
            let _permit = inner.cpu_permit().await?;
            let index = Arc::clone(&prepared.index);
            let raw_path = prepared.raw_path.clone();
            let stream = location.stream;
            let offset = location.range.start;
            blocking(move || {
                if let Some(cached) = cached {
                    if let Some(bytes) = cached.read_stream(offset)? {
                        return Ok(bytes);
                    }
                }
                decompress_stream(&raw_path, &index, stream)
            })
            .await?
        };

        let stream = &prepared.index.streams()[location.stream];
        Ok(page_blobs(stream, &bytes)
            .into_iter()
            .find(|blob| blob.page_id == page_id)
            .map(|blob| Page {
                page_id,
                title: prepared.index.title(page_id).unwrap_or_default().to_string(),
                bytes: blob.bytes,
            }))
    }
}

/// Forwards one shard's queue to the consumer until the shard finishes.
///
/// Returns the shard's outcome and the number of pages delivered; an error
/// from the consumer is returned as the outer error.
async fn deliver<C: PageConsumer>(
    shard: &ShardId,
    rx: &mut mpsc::Receiver<ShardMessage>,
    consumer: &mut C,
) -> Result<(Result<ShardStats, DumpError>, u64), DumpError> {
    let mut pages = 0u64;
    while let Some(message) = rx.recv().await {
        match message {
            ShardMessage::Page(page) => {
                consumer.page(shard, page).await?;
                pages += 1;
            }
            ShardMessage::Done(stats) => return Ok((Ok(stats), pages)),
            ShardMessage::Failed(e) => return Ok((Err(e), pages)),
        }
    }
    Ok((
        Err(DumpError::Io(std::io::Error::other(format!(
            "worker for shard {} stopped without reporting",
            shard
        )))),
        pages,
    ))
}

impl Inner {
    async fn shard_task(
        self: Arc<Self>,
        version_key: String,
        shard: ShardDescriptor,
        tx: mpsc::Sender<ShardMessage>,
        cancel: CancellationToken,
    ) {
        let message = match self.produce(&version_key, &shard, &tx, &cancel).await {
            Ok(stats) => ShardMessage::Done(stats),
            Err(e) => ShardMessage::Failed(e),
        };
        // A closed queue means the coordinator has already given up.
        let _ = tx.send(message).await;
    }

    /// Prepares a shard and pushes its pages into `tx`.
    async fn produce(
        &self,
        version_key: &str,
        shard: &ShardDescriptor,
        tx: &mpsc::Sender<ShardMessage>,
        cancel: &CancellationToken,
    ) -> Result<ShardStats, DumpError> {
        let prepared = self.prepare(version_key, shard, cancel).await?;
        let index = &prepared.index;

        // One full decode per shard at a time. A caller that waited here
        // finds the entry the previous holder committed.
        let _decoding = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DumpError::Cancelled),
            guard = self.decoding.lock((version_key.to_string(), shard.id.clone())) => guard,
        };

        let mut stats = ShardStats {
            raw_path: prepared.raw_path.clone(),
            retries: prepared.retries,
            cache_hit: false,
            decode_errors: 0,
            first_decode_error: None,
        };

        if let Some(cached) = self.cached_entry(version_key, shard).await? {
            debug!(shard = %shard.id, "Delivering from recompression cache");
            stats.cache_hit = true;
            for entry in cached.meta().streams.clone() {
                if cancel.is_cancelled() {
                    return Err(DumpError::Cancelled);
                }
                let Some(position) = index.stream_containing(entry.source_offset) else {
                    continue;
                };
                let bytes = {
                    let _permit = self.cpu_permit().await?;
                    let cached = cached.clone();
                    blocking(move || cached.read_stream(entry.source_offset)).await
                };
                match bytes {
                    Ok(Some(bytes)) => send_pages(index, position, &bytes, tx).await?,
                    Ok(None) => {}
                    Err(e) => record_decode_error(&mut stats, &shard.id, e),
                }
            }
            return Ok(stats);
        }

        let mut writer = match &self.cache {
            Some(cache) => Some(cache.writer(version_key, &shard.id, shard.checksum.clone())?),
            None => None,
        };

        // Streams decode in ascending offset order; the header span holds
        // no pages and is skipped.
        for position in 0..index.streams().len() {
            if cancel.is_cancelled() {
                if let Some(writer) = writer.take() {
                    writer.abandon();
                }
                return Err(DumpError::Cancelled);
            }

            let (decoded, returned) = {
                let _permit = self.cpu_permit().await?;
                let index = Arc::clone(index);
                let raw_path = prepared.raw_path.clone();
                let mut writer = writer.take();
                blocking(move || {
                    let decoded = decompress_stream(&raw_path, &index, position);
                    let append_error = match (&decoded, writer.as_mut()) {
                        (Ok(bytes), Some(w)) => w.append(index.streams()[position].offset, bytes).err(),
                        _ => None,
                    };
                    if let Some(e) = append_error {
                        warn!("Dropping cache entry for {}: {}", index.shard_id(), e);
                        if let Some(w) = writer.take() {
                            w.abandon();
                        }
                    }
                    Ok((decoded, writer))
                })
                .await?
            };
            writer = returned;

            match decoded {
                Ok(bytes) => send_pages(index, position, &bytes, tx).await?,
                Err(e) => {
                    record_decode_error(&mut stats, &shard.id, e);
                    if let Some(writer) = writer.take() {
                        writer.abandon();
                    }
                }
            }
        }

        if let (Some(cache), Some(writer)) = (&self.cache, writer) {
            if writer.stream_count() > 0 {
                cache.commit(writer).await?;
            } else {
                writer.abandon();
            }
        }
        Ok(stats)
    }

    /// Fetches, verifies and indexes a shard once, however many callers ask.
    async fn prepare(
        &self,
        version_key: &str,
        shard: &ShardDescriptor,
        cancel: &CancellationToken,
    ) -> Result<Arc<PreparedShard>, DumpError> {
        let key = (version_key.to_string(), shard.id.clone());
        loop {
            let result = self
                .prepared
                .run(key.clone(), || async {
                    let fetched = self.fetcher.fetch(version_key, shard, cancel).await?;

                    let _permit = self.cpu_permit().await?;
                    let shard_id = shard.id.clone();
                    let index_path = fetched.index_path.clone();
                    let shard_len = tokio::fs::metadata(&fetched.raw_path).await?.len();
                    let index =
                        blocking(move || StreamIndex::parse_file(shard_id, &index_path, shard_len)).await?;
                    debug!(
                        shard = %shard.id,
                        pages = index.page_count(),
                        streams = index.streams().len(),
                        "Parsed stream index"
                    );

                    Ok(Arc::new(PreparedShard {
                        raw_path: fetched.raw_path,
                        index: Arc::new(index),
                        retries: fetched.retries,
                    }))
                })
                .await;
            match result {
                Ok(prepared) => return Ok(prepared),
                Err(e) if matches!(*e, DumpError::Cancelled) && !cancel.is_cancelled() => continue,
                Err(e) => return Err(DumpError::from_shared(e)),
            }
        }
    }

    /// The cache entry for a shard, if it was derived from the same source bytes.
    async fn cached_entry(
        &self,
        version_key: &str,
        shard: &ShardDescriptor,
    ) -> Result<Option<CachedShard>, DumpError> {
        let Some(cache) = &self.cache else {
            return Ok(None);
        };
        match cache.get(version_key, &shard.id).await? {
            Some(cached) if cached.meta().source_checksum == shard.checksum => Ok(Some(cached)),
            Some(_) => {
                debug!(shard = %shard.id, "Ignoring cache entry built from other source bytes");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn cpu_permit(&self) -> Result<tokio::sync::SemaphorePermit<'_>, DumpError> {
        self.limits
            .cpu
            .acquire()
            .await
            .map_err(|_| DumpError::Cancelled)
    }
}

async fn send_pages(
    index: &StreamIndex,
    position: usize,
    bytes: &[u8],
    tx: &mpsc::Sender<ShardMessage>,
) -> Result<(), DumpError> {
    let stream = &index.streams()[position];
    for blob in page_blobs(stream, bytes) {
        let page = Page {
            page_id: blob.page_id,
            title: index.title(blob.page_id).unwrap_or_default().to_string(),
            bytes: blob.bytes,
        };
        tx.send(ShardMessage::Page(page))
            .await
            .map_err(|_| DumpError::Cancelled)?;
    }
    Ok(())
}

fn record_decode_error(stats: &mut ShardStats, shard: &ShardId, error: DumpError) {
    warn!(shard = %shard, "Skipping undecodable stream: {}", error);
    stats.decode_errors += 1;
    if stats.first_decode_error.is_none() {
        stats.first_decode_error = Some(error.to_string());
    }
}

/// Runs CPU-bound work off the async runtime.
async fn blocking<T, F>(work: F) -> Result<T, DumpError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, DumpError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| DumpError::Io(std::io::Error::other(format!("Task join error: {}", e))))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{sample_pages, MultistreamBuilder};
    use crate::remote::MemoryRemote;
    use crate::types::{Checksum, DumpStatus, PageRange};
    use md5::{Digest, Md5};

    struct Collect {
        pages: Vec<(ShardId, u64)>,
        failed: Vec<ShardId>,
    }

    impl Collect {
        fn new() -> Self {
            Self {
                pages: Vec::new(),
                failed: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl PageConsumer for Collect {
        async fn page(&mut self, shard: &ShardId, page: Page) -> Result<(), DumpError> {
            self.pages.push((shard.clone(), page.page_id));
            Ok(())
        }

        async fn shard_failed(&mut self, shard: &ShardId, _error: &DumpError) -> Result<(), DumpError> {
            self.failed.push(shard.clone());
            Ok(())
        }
    }

    fn publish(remote: &MemoryRemote, name: &str, first: u64, last: u64) -> ShardDescriptor {
        let built = MultistreamBuilder::new("Wikipedia")
            .unwrap()
            .pages(&sample_pages(first, last), 10)
            .unwrap()
            .finish()
            .unwrap();
        let url = format!("http://dumps.test/{}.xml.bz2", name);
        let index_url = format!("http://dumps.test/{}-index.txt", name);
        remote.insert(url.clone(), built.data.clone());
        remote.insert(index_url.clone(), built.index.clone());
        ShardDescriptor {
            id: ShardId::new(name),
            pages: PageRange::new(first, last),
            url,
            index_url,
            checksum: Some(Checksum::md5(format!("{:x}", Md5::digest(&built.data)))),
            index_checksum: None,
            size: Some(built.data.len() as u64),
            local_path: None,
        }
    }

    fn pipeline(remote: Arc<MemoryRemote>, dir: &std::path::Path) -> Pipeline {
        let mut config = PipelineConfig {
            cache_dir: dir.to_path_buf(),
            fetch_workers: 2,
            decode_workers: 2,
            queue_depth: 4,
            ..PipelineConfig::default()
        };
        config.fetch.base_backoff = Duration::from_millis(1);
        config.fetch.max_backoff = Duration::from_millis(2);
        Pipeline::new(config, remote).unwrap()
    }

    #[tokio::test]
    async fn test_run_delivers_pages_in_manifest_order() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let shards = vec![
            publish(&remote, "2-p31p60", 31, 60),
            publish(&remote, "1-p1p30", 1, 30),
        ];
        let version = DumpVersion::new("testwiki", "20240101", DumpStatus::Complete, shards);
        let pipeline = pipeline(Arc::clone(&remote), dir.path());

        let mut collect = Collect::new();
        let summary = pipeline.run(&version, &mut collect).await.unwrap();
        assert!(summary.is_success());
        let ids: Vec<u64> = collect.pages.iter().map(|(_, id)| *id).collect();
        assert_eq!(ids, (1..=60).collect::<Vec<_>>());
        assert_eq!(summary.pages(), 60);

        let manifest = pipeline
            .store()
            .load_manifest("testwiki-20240101")
            .unwrap()
            .unwrap();
        assert!(manifest.shards.iter().all(|s| s.local_path.is_some()));
    }

    #[tokio::test]
    async fn test_page_lookup_and_miss() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let shards = vec![publish(&remote, "1-p1p30", 1, 30)];
        let version = DumpVersion::new("testwiki", "20240101", DumpStatus::Complete, shards);
        let pipeline = pipeline(Arc::clone(&remote), dir.path());

        let page = pipeline.page(&version, 17).await.unwrap().unwrap();
        assert_eq!(page.title, "Page 17");
        assert!(String::from_utf8(page.bytes).unwrap().contains("<id>17</id>"));
        assert!(pipeline.page(&version, 31).await.unwrap().is_none());
        assert!(pipeline.page(&version, 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_shard_reported_and_siblings_delivered() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let mut broken = publish(&remote, "2-p31p60", 31, 60);
        broken.url = "http://dumps.test/gone.xml.bz2".to_string();
        let shards = vec![publish(&remote, "1-p1p30", 1, 30), broken];
        let version = DumpVersion::new("testwiki", "20240101", DumpStatus::Complete, shards);

        let mut config = PipelineConfig {
            cache_dir: dir.path().to_path_buf(),
            ..PipelineConfig::default()
        };
        config.fetch.max_attempts = 2;
        config.fetch.base_backoff = Duration::from_millis(1);
        let pipeline = Pipeline::new(config, Arc::clone(&remote) as Arc<dyn Remote>).unwrap();

        let mut collect = Collect::new();
        let summary = pipeline.run(&version, &mut collect).await.unwrap();
        assert_eq!(collect.pages.len(), 30);
        assert_eq!(collect.failed, vec![ShardId::new("2-p31p60")]);
        let failed = summary.failed();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0.as_str(), "2-p31p60");
        // A missing file is not worth asking for again.
        assert_eq!(remote.requests("http://dumps.test/gone.xml.bz2"), 1);
    }

    #[tokio::test]
    async fn test_concurrent_runs_decode_each_shard_once() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let shards = vec![publish(&remote, "1-p1p200", 1, 200)];
        let version = DumpVersion::new("testwiki", "20240101", DumpStatus::Complete, shards);
        let first = pipeline(Arc::clone(&remote), dir.path());
        let second = first.clone();

        let mut a = Collect::new();
        let mut b = Collect::new();
        let (ra, rb) = tokio::join!(first.run(&version, &mut a), second.run(&version, &mut b));
        let (ra, rb) = (ra.unwrap(), rb.unwrap());

        assert_eq!(a.pages.len(), 200);
        assert_eq!(b.pages.len(), 200);
        let decoded = [&ra, &rb]
            .iter()
            .filter(|summary| !summary.shards[0].cache_hit)
            .count();
        assert_eq!(decoded, 1);
        assert_eq!(remote.requests("http://dumps.test/1-p1p200.xml.bz2"), 1);
    }

    #[tokio::test]
    async fn test_spawn_pages_streams_events() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let shards = vec![publish(&remote, "1-p1p30", 1, 30)];
        let version = DumpVersion::new("testwiki", "20240101", DumpStatus::Complete, shards);
        let pipeline = pipeline(Arc::clone(&remote), dir.path());

        let (mut rx, handle) = pipeline.spawn_pages(version, Vec::new());
        let mut pages = 0;
        let mut done = 0;
        while let Some(event) = rx.recv().await {
            match event {
                PageEvent::Page { .. } => pages += 1,
                PageEvent::ShardDone(report) => {
                    assert!(report.is_success());
                    done += 1;
                }
                PageEvent::ShardFailed { .. } => panic!("unexpected failure"),
            }
        }
        assert_eq!((pages, done), (30, 1));
        assert!(handle.await.unwrap().unwrap().is_success());
    }

    #[tokio::test]
    async fn test_cancelled_run() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let shards = vec![publish(&remote, "1-p1p30", 1, 30)];
        let version = DumpVersion::new("testwiki", "20240101", DumpStatus::Complete, shards);
        let pipeline = pipeline(Arc::clone(&remote), dir.path());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut collect = Collect::new();
        let err = pipeline
            .run_cancellable(&version, &[], &mut collect, cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DumpError::Cancelled));
        assert!(collect.pages.is_empty());
        assert!(!pipeline
            .store()
            .raw_path("testwiki-20240101", &ShardId::new("1-p1p30"))
            .exists());
    }

    #[test]
    fn test_report_wording() {
        let mut report = ShardReport {
            shard_id: ShardId::new("2"),
            status: ShardStatus::Succeeded,
            retries: 2,
            pages: 100,
            cache_hit: false,
            decode_errors: 0,
        };
        assert_eq!(report.describe(), "succeeded after 2 retries");
        report.retries = 0;
        assert_eq!(report.describe(), "succeeded");
        report.status = ShardStatus::Failed {
            reason: "boom".into(),
        };
        assert_eq!(report.describe(), "failed: boom");
    }
}
