use async_trait::async_trait;
use md5::{Digest, Md5};
use std::sync::Arc;
use std::time::Duration;
use wikisync::builder::{sample_pages, MultistreamBuilder, SourcePage};
use wikisync::{
    Checksum, DumpError, DumpStatus, DumpVersion, MemoryRemote, Page, PageConsumer, PageRange,
    Pipeline, PipelineConfig, ShardDescriptor, ShardId, ShardReport,
};

const BASE: &str = "http://dumps.test";

#[derive(Default)]
struct Recorder {
    pages: Vec<(ShardId, u64)>,
    failed: Vec<ShardId>,
    done: Vec<ShardReport>,
}

#[async_trait]
impl PageConsumer for Recorder {
    async fn page(&mut self, shard: &ShardId, page: Page) -> Result<(), DumpError> {
        self.pages.push((shard.clone(), page.page_id));
        Ok(())
    }

    async fn shard_failed(&mut self, shard: &ShardId, _error: &DumpError) -> Result<(), DumpError> {
        self.failed.push(shard.clone());
        Ok(())
    }

    async fn shard_done(&mut self, report: &ShardReport) -> Result<(), DumpError> {
        self.done.push(report.clone());
        Ok(())
    }
}

impl Recorder {
    fn page_ids(&self) -> Vec<u64> {
        self.pages.iter().map(|(_, id)| *id).collect()
    }
}

fn data_url(part: u32, first: u64, last: u64) -> String {
    format!(
        "{}/testwiki/20240101/testwiki-20240101-pages-articles-multistream{}.xml-p{}p{}.bz2",
        BASE, part, first, last
    )
}

fn index_url(part: u32, first: u64, last: u64) -> String {
    format!(
        "{}/testwiki/20240101/testwiki-20240101-pages-articles-multistream-index{}.txt-p{}p{}.bz2",
        BASE, part, first, last
    )
}

/// Publishes a shard holding `pages` and returns its descriptor.
fn publish_pages(remote: &MemoryRemote, part: u32, first: u64, last: u64, pages: &[SourcePage]) -> ShardDescriptor {
    let built = MultistreamBuilder::new("TestWiki")
        .unwrap()
        .pages(pages, 10)
        .unwrap()
        .finish()
        .unwrap();
    let url = data_url(part, first, last);
    let index = index_url(part, first, last);
    remote.insert(url.clone(), built.data.clone());
    remote.insert(index.clone(), built.index.clone());

    ShardDescriptor {
        id: ShardId::new(format!("{}-p{}p{}", part, first, last)),
        pages: PageRange::new(first, last),
        url,
        index_url: index,
        checksum: Some(Checksum::md5(format!("{:x}", Md5::digest(&built.data)))),
        index_checksum: Some(Checksum::md5(format!("{:x}", Md5::digest(built.index.as_bytes())))),
        size: Some(built.data.len() as u64),
        local_path: None,
    }
}

fn publish(remote: &MemoryRemote, part: u32, first: u64, last: u64) -> ShardDescriptor {
    publish_pages(remote, part, first, last, &sample_pages(first, last))
}

/// Three shards covering pages 1–100, 101–200 and 201–300.
fn three_shards(remote: &MemoryRemote) -> DumpVersion {
    let shards = vec![
        publish(remote, 1, 1, 100),
        publish(remote, 2, 101, 200),
        publish(remote, 3, 201, 300),
    ];
    DumpVersion::new("testwiki", "20240101", DumpStatus::Complete, shards)
}

fn config(dir: &std::path::Path) -> PipelineConfig {
    let mut config = PipelineConfig {
        cache_dir: dir.to_path_buf(),
        fetch_workers: 2,
        decode_workers: 2,
        queue_depth: 16,
        ..PipelineConfig::default()
    };
    config.fetch.base_backoff = Duration::from_millis(1);
    config.fetch.max_backoff = Duration::from_millis(5);
    config
}

fn pipeline(remote: &Arc<MemoryRemote>, dir: &std::path::Path) -> Pipeline {
    Pipeline::new(config(dir), Arc::clone(remote) as Arc<dyn wikisync::Remote>).unwrap()
}

#[tokio::test]
async fn test_corrupt_shard_delivered_after_its_siblings() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    let version = three_shards(&remote);
    remote.corrupt_next(&data_url(2, 101, 200), 2);

    let mut recorder = Recorder::default();
    let summary = pipeline(&remote, dir.path())
        .run(&version, &mut recorder)
        .await
        .unwrap();

    let expected: Vec<u64> = (1..=100).chain(201..=300).chain(101..=200).collect();
    assert_eq!(recorder.page_ids(), expected);
    assert!(recorder.failed.is_empty());

    assert!(summary.is_success());
    let second = summary.report(&ShardId::new("2-p101p200")).unwrap();
    assert_eq!(second.describe(), "succeeded after 2 retries");
    assert_eq!(second.pages, 100);
    assert_eq!(remote.requests(&data_url(2, 101, 200)), 3);
    assert_eq!(
        summary.report(&ShardId::new("1-p1p100")).unwrap().describe(),
        "succeeded"
    );
}

#[tokio::test]
async fn test_rerun_of_cached_version_is_local_only() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    let version = three_shards(&remote);

    let mut first = Recorder::default();
    let summary = pipeline(&remote, dir.path())
        .run(&version, &mut first)
        .await
        .unwrap();
    assert!(summary.shards.iter().all(|r| !r.cache_hit));
    let requests = remote.total_requests();

    // A fresh pipeline over the same cache directory.
    let mut second = Recorder::default();
    let summary = pipeline(&remote, dir.path())
        .run(&version, &mut second)
        .await
        .unwrap();

    assert_eq!(remote.total_requests(), requests);
    assert!(summary.shards.iter().all(|r| r.cache_hit));
    assert_eq!(second.page_ids(), first.page_ids());
}

#[tokio::test]
async fn test_simultaneous_requests_fetch_once() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    let version = three_shards(&remote);
    let pipeline = pipeline(&remote, dir.path());

    let (a, b) = tokio::join!(pipeline.page(&version, 150), pipeline.page(&version, 151));
    assert_eq!(a.unwrap().unwrap().title, "Page 150");
    assert_eq!(b.unwrap().unwrap().title, "Page 151");
    assert_eq!(remote.requests(&data_url(2, 101, 200)), 1);
    assert_eq!(remote.requests(&index_url(2, 101, 200)), 1);
    assert_eq!(remote.requests(&data_url(1, 1, 100)), 0);
}

#[tokio::test]
async fn test_corrupted_shard_never_committed_and_rerun_by_id() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    let version = three_shards(&remote);
    let bad_url = data_url(3, 201, 300);
    remote.corrupt_next(&bad_url, 100);

    let mut config = config(dir.path());
    config.fetch.max_attempts = 3;
    let pipeline = Pipeline::new(config, Arc::clone(&remote) as Arc<dyn wikisync::Remote>).unwrap();

    let mut recorder = Recorder::default();
    let summary = pipeline.run(&version, &mut recorder).await.unwrap();
    assert_eq!(recorder.page_ids(), (1..=200).collect::<Vec<_>>());
    assert_eq!(recorder.failed, vec![ShardId::new("3-p201p300")]);

    let failed = summary.failed();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].1.contains("checksum mismatch"));
    assert_eq!(remote.requests(&bad_url), 3);

    let raw = pipeline
        .store()
        .raw_path("testwiki-20240101", &ShardId::new("3-p201p300"));
    assert!(!raw.exists());

    // Once the provider serves good bytes, re-running just the failed shard
    // leaves the others untouched.
    remote.corrupt_next(&bad_url, 0);
    let first_shard_requests = remote.requests(&data_url(1, 1, 100));
    let only: Vec<ShardId> = failed.iter().map(|(id, _)| (*id).clone()).collect();
    let mut retry = Recorder::default();
    let summary = pipeline.run_shards(&version, &only, &mut retry).await.unwrap();

    assert!(summary.is_success());
    assert_eq!(summary.shards.len(), 1);
    assert_eq!(retry.page_ids(), (201..=300).collect::<Vec<_>>());
    assert_eq!(remote.requests(&data_url(1, 1, 100)), first_shard_requests);
    assert!(raw.exists());
}

#[tokio::test]
async fn test_deleted_page_is_a_miss() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    let pages: Vec<SourcePage> = sample_pages(1, 100)
        .into_iter()
        .filter(|p| p.id != 42)
        .collect();
    let shard = publish_pages(&remote, 1, 1, 100, &pages);
    let version = DumpVersion::new("testwiki", "20240101", DumpStatus::Complete, vec![shard]);
    let pipeline = pipeline(&remote, dir.path());

    assert!(pipeline.page(&version, 42).await.unwrap().is_none());
    let neighbour = pipeline.page(&version, 43).await.unwrap().unwrap();
    assert_eq!(neighbour.title, "Page 43");
    assert!(pipeline.page(&version, 41).await.unwrap().is_some());
}

#[tokio::test]
async fn test_undecodable_stream_isolated_within_shard() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(MemoryRemote::new());

    let built = MultistreamBuilder::new("TestWiki")
        .unwrap()
        .pages(&sample_pages(1, 30), 10)
        .unwrap()
        .finish()
        .unwrap();
    // Damage the middle stream (pages 11-20) and publish the damaged bytes
    // with a matching digest, as a provider with a bad encoder would.
    let second_offset: usize = built
        .index
        .lines()
        .nth(10)
        .and_then(|l| l.split(':').next())
        .unwrap()
        .parse()
        .unwrap();
    let mut data = built.data.clone();
    for byte in &mut data[second_offset + 10..second_offset + 30] {
        *byte ^= 0x5a;
    }
    let url = data_url(1, 1, 30);
    let index = index_url(1, 1, 30);
    remote.insert(url.clone(), data.clone());
    remote.insert(index.clone(), built.index.clone());
    let shard = ShardDescriptor {
        id: ShardId::new("1-p1p30"),
        pages: PageRange::new(1, 30),
        url,
        index_url: index,
        checksum: Some(Checksum::md5(format!("{:x}", Md5::digest(&data)))),
        index_checksum: None,
        size: None,
        local_path: None,
    };
    let version = DumpVersion::new("testwiki", "20240101", DumpStatus::Complete, vec![shard]);

    let mut recorder = Recorder::default();
    let summary = pipeline(&remote, dir.path())
        .run(&version, &mut recorder)
        .await
        .unwrap();

    let expected: Vec<u64> = (1..=10).chain(21..=30).collect();
    assert_eq!(recorder.page_ids(), expected);
    let report = &summary.shards[0];
    assert_eq!(report.decode_errors, 1);
    assert!(!report.is_success());
}

#[tokio::test]
async fn test_latest_complete_version_from_listing() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    let shards = [publish(&remote, 1, 1, 100), publish(&remote, 2, 101, 200)];

    remote.insert(
        format!("{}/testwiki/", BASE),
        r#"<html><body><pre><a href="../">../</a>
<a href="20240101/">20240101/</a>
<a href="20240201/">20240201/</a>
</pre></body></html>"#,
    );
    remote.insert(
        format!("{}/testwiki/20240201/dumpstatus.json", BASE),
        r#"{"jobs": {"articlesmultistreamdump": {"status": "in-progress", "files": {}}}}"#,
    );

    let mut files = serde_json::Map::new();
    let file_name = |url: &str| url.rsplit('/').next().unwrap().to_string();
    for shard in &shards {
        files.insert(
            file_name(&shard.url),
            serde_json::json!({
                "url": shard.url.trim_start_matches(BASE),
                "size": shard.size,
                "md5": shard.checksum.as_ref().unwrap().hex,
            }),
        );
        files.insert(
            file_name(&shard.index_url),
            serde_json::json!({
                "url": shard.index_url.trim_start_matches(BASE),
                "md5": shard.index_checksum.as_ref().unwrap().hex,
            }),
        );
    }
    let status = serde_json::json!({
        "jobs": { "articlesmultistreamdump": { "status": "done", "files": files } }
    });
    remote.insert(
        format!("{}/testwiki/20240101/dumpstatus.json", BASE),
        status.to_string(),
    );

    let mut config = config(dir.path());
    config.catalog.base_url = BASE.to_string();
    let pipeline = Pipeline::new(config, Arc::clone(&remote) as Arc<dyn wikisync::Remote>).unwrap();

    let version = pipeline.catalog().latest("testwiki").await.unwrap();
    assert_eq!(version.id, "20240101");
    assert_eq!(version.shards, shards.to_vec());

    let mut recorder = Recorder::default();
    let summary = pipeline.run(&version, &mut recorder).await.unwrap();
    assert!(summary.is_success());
    assert_eq!(recorder.page_ids(), (1..=200).collect::<Vec<_>>());
    assert_eq!(recorder.done.len(), 2);

    let local = wikisync::Catalog::load_local(pipeline.store(), "testwiki", "20240101")
        .unwrap()
        .unwrap();
    assert!(local.shards.iter().all(|s| s.local_path.is_some()));
}
