//! Dump discovery: which versions exist, which is latest, and what shards a
//! version is made of.
//!
//! Providers lay out their listings differently, so the format-specific work
//! sits behind [`ListingParser`]. [`Catalog`] only fetches documents and
//! applies the selection policy.

use crate::config::{CatalogConfig, Provider};
use crate::error::DumpError;
use crate::remote::Remote;
use crate::store::ShardStore;
use crate::types::{Checksum, DumpStatus, DumpVersion, PageRange, ShardDescriptor, ShardId};
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use scraper::{Html, Selector};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

/// Format-specific parsing of a provider's listings.
pub trait ListingParser: Send + Sync {
    /// Page listing the corpora the provider publishes.
    fn corpora_url(&self, base_url: &str) -> String;

    fn parse_corpora(&self, body: &str) -> Result<Vec<String>, DumpError>;

    /// Page listing the versions of one corpus.
    fn versions_url(&self, base_url: &str, corpus: &str) -> String {
        format!("{}/{}/", base_url.trim_end_matches('/'), corpus)
    }

    /// Version ids found in the listing, newest first.
    fn parse_versions(&self, body: &str) -> Result<Vec<String>, DumpError> {
        let mut versions: Vec<String> = links(body)?
            .into_iter()
            .map(|href| href.trim_end_matches('/').to_string())
            .filter(|v| is_version_id(v))
            .collect();
        versions.sort_unstable_by(|a, b| b.cmp(a));
        versions.dedup();
        Ok(versions)
    }

    /// Document describing one version's files and status.
    fn manifest_url(&self, base_url: &str, corpus: &str, version: &str) -> String;

    fn parse_manifest(
        &self,
        base_url: &str,
        corpus: &str,
        version: &str,
        body: &str,
    ) -> Result<DumpVersion, DumpError>;
}

/// dumps.wikimedia.org: `backup-index.html`, per-corpus directory index and
/// a `dumpstatus.json` per version.
#[derive(Debug, Default, Clone)]
pub struct WikimediaListing;

#[derive(Deserialize)]
struct DumpStatusDoc {
    #[serde(default)]
    jobs: HashMap<String, JobStatus>,
}

#[derive(Deserialize)]
struct JobStatus {
    #[serde(default)]
    status: String,
    #[serde(default)]
    files: BTreeMap<String, FileStatus>,
}

#[derive(Deserialize, Default)]
struct FileStatus {
    url: Option<String>,
    size: Option<u64>,
    md5: Option<String>,
    sha1: Option<String>,
}

const MULTISTREAM_JOBS: [&str; 2] = ["articlesmultistreamdump", "articlesmultistreamdumprecombine"];

impl ListingParser for WikimediaListing {
    fn corpora_url(&self, base_url: &str) -> String {
        format!("{}/backup-index.html", base_url.trim_end_matches('/'))
    }

    fn parse_corpora(&self, body: &str) -> Result<Vec<String>, DumpError> {
        // During a dump run the list items carry extra progress text, but
        // the first link of each item is always the corpus name.
        let document = Html::parse_document(body);
        let items = selector("li")?;
        let anchor = selector("a")?;
        let corpora: Vec<String> = document
            .select(&items)
            .filter_map(|li| li.select(&anchor).next())
            .map(|a| a.text().collect::<String>().trim().to_string())
            .filter(|name| !name.is_empty())
            .collect();
        if corpora.is_empty() {
            return Err(DumpError::CatalogUnavailable(
                "no corpora found in backup index".to_string(),
            ));
        }
        Ok(corpora)
    }

    fn manifest_url(&self, base_url: &str, corpus: &str, version: &str) -> String {
        format!(
            "{}/{}/{}/dumpstatus.json",
            base_url.trim_end_matches('/'),
            corpus,
            version
        )
    }

    fn parse_manifest(
        &self,
        base_url: &str,
        corpus: &str,
        version: &str,
        body: &str,
    ) -> Result<DumpVersion, DumpError> {
        let doc: DumpStatusDoc = serde_json::from_str(body).map_err(|e| {
            DumpError::CatalogUnavailable(format!(
                "invalid dumpstatus.json for {}-{}: {}",
                corpus, version, e
            ))
        })?;

        let jobs: Vec<&JobStatus> = MULTISTREAM_JOBS
            .iter()
            .filter_map(|name| doc.jobs.get(*name))
            .collect();

        // Urls of files whose job has finished. A version is complete when
        // every file its manifest uses is among them, so an unfinished or
        // skipped recombine job only matters if the consolidated pair is used.
        let mut finished = HashSet::new();
        let mut files = Vec::new();
        for job in &jobs {
            for (name, file) in &job.files {
                let url = match &file.url {
                    Some(url) if url.starts_with("http") => url.clone(),
                    Some(url) => format!("{}{}", base_url.trim_end_matches('/'), url),
                    None => format!(
                        "{}/{}/{}/{}",
                        base_url.trim_end_matches('/'),
                        corpus,
                        version,
                        name
                    ),
                };
                let checksum = file
                    .sha1
                    .as_deref()
                    .map(Checksum::sha1)
                    .or_else(|| file.md5.as_deref().map(Checksum::md5));
                if job.status == "done" {
                    finished.insert(url.clone());
                }
                files.push(ListedFile {
                    name: name.clone(),
                    url,
                    size: file.size,
                    checksum,
                });
            }
        }

        let (shards, consistent) = assemble_shards(corpus, version, files);
        let done = shards
            .iter()
            .all(|s| finished.contains(&s.url) && finished.contains(&s.index_url));
        let status = if done && consistent && !shards.is_empty() {
            DumpStatus::Complete
        } else {
            DumpStatus::Partial
        };
        Ok(DumpVersion::new(corpus, version, status, shards))
    }
}

/// Plain mirrors: autoindex directory pages and a `{corpus}-{version}-md5sums.txt`.
#[derive(Debug, Default, Clone)]
pub struct MirrorListing;

impl ListingParser for MirrorListing {
    fn corpora_url(&self, base_url: &str) -> String {
        format!("{}/", base_url.trim_end_matches('/'))
    }

    fn parse_corpora(&self, body: &str) -> Result<Vec<String>, DumpError> {
        let corpora: Vec<String> = links(body)?
            .into_iter()
            .filter(|href| href.ends_with('/') && !href.starts_with('.') && !href.starts_with('/'))
            .map(|href| href.trim_end_matches('/').to_string())
            .filter(|name| !name.is_empty() && !name.contains('?'))
            .collect();
        if corpora.is_empty() {
            return Err(DumpError::CatalogUnavailable(
                "no corpora found in mirror index".to_string(),
            ));
        }
        Ok(corpora)
    }

    fn manifest_url(&self, base_url: &str, corpus: &str, version: &str) -> String {
        format!(
            "{}/{}/{}/{}-{}-md5sums.txt",
            base_url.trim_end_matches('/'),
            corpus,
            version,
            corpus,
            version
        )
    }

    fn parse_manifest(
        &self,
        base_url: &str,
        corpus: &str,
        version: &str,
        body: &str,
    ) -> Result<DumpVersion, DumpError> {
        let mut files = Vec::new();
        for (n, line) in body.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (digest, name) = line
                .split_once(char::is_whitespace)
                .map(|(d, n)| (d, n.trim().trim_start_matches('*')))
                .ok_or_else(|| {
                    DumpError::CatalogUnavailable(format!(
                        "malformed checksum line {} for {}-{}: {:?}",
                        n + 1,
                        corpus,
                        version,
                        line
                    ))
                })?;
            if digest.len() != 32 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(DumpError::CatalogUnavailable(format!(
                    "malformed md5 on line {} for {}-{}",
                    n + 1,
                    corpus,
                    version
                )));
            }
            files.push(ListedFile {
                name: name.to_string(),
                url: format!(
                    "{}/{}/{}/{}",
                    base_url.trim_end_matches('/'),
                    corpus,
                    version,
                    name
                ),
                size: None,
                checksum: Some(Checksum::md5(digest)),
            });
        }

        let (shards, consistent) = assemble_shards(corpus, version, files);
        let status = if consistent && !shards.is_empty() {
            DumpStatus::Complete
        } else {
            DumpStatus::Partial
        };
        Ok(DumpVersion::new(corpus, version, status, shards))
    }
}

/// A file named in a provider listing.
struct ListedFile {
    name: String,
    url: String,
    size: Option<u64>,
    checksum: Option<Checksum>,
}

/// What a dump file name says about its contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DumpFile {
    Shard { part: u32, pages: PageRange },
    ShardIndex { part: u32, pages: PageRange },
    Consolidated,
    ConsolidatedIndex,
}

/// Classifies `{corpus}-{version}-pages-articles-multistream…` file names.
pub(crate) fn classify(corpus: &str, version: &str, name: &str) -> Option<DumpFile> {
    let rest = name.strip_prefix(&format!("{}-{}-pages-articles-multistream", corpus, version))?;
    match rest {
        ".xml.bz2" => return Some(DumpFile::Consolidated),
        "-index.txt.bz2" => return Some(DumpFile::ConsolidatedIndex),
        _ => {}
    }
    if let Some(rest) = rest.strip_prefix("-index") {
        let (part, pages) = parse_part(rest, "txt")?;
        Some(DumpFile::ShardIndex { part, pages })
    } else {
        let (part, pages) = parse_part(rest, "xml")?;
        Some(DumpFile::Shard { part, pages })
    }
}

/// Parses `{N}.{ext}-p{first}p{last}.bz2`.
fn parse_part(rest: &str, ext: &str) -> Option<(u32, PageRange)> {
    let (part, rest) = rest.split_once('.')?;
    let range = rest
        .strip_prefix(ext)?
        .strip_prefix("-p")?
        .strip_suffix(".bz2")?;
    let (first, last) = range.split_once('p')?;
    let pages = PageRange::new(first.parse().ok()?, last.parse().ok()?);
    (pages.first <= pages.last).then_some((part.parse().ok()?, pages))
}

/// Pairs data files with their index files.
///
/// The per-range shard set is preferred over the consolidated file, since it
/// allows concurrent fetching and early processing. Returns the shards and
/// whether every data file found its index.
fn assemble_shards(corpus: &str, version: &str, files: Vec<ListedFile>) -> (Vec<ShardDescriptor>, bool) {
    let mut data = Vec::new();
    let mut indices: HashMap<(u32, u64, u64), ListedFile> = HashMap::new();
    let mut consolidated = None;
    let mut consolidated_index = None;

    for file in files {
        match classify(corpus, version, &file.name) {
            Some(DumpFile::Shard { part, pages }) => data.push((part, pages, file)),
            Some(DumpFile::ShardIndex { part, pages }) => {
                indices.insert((part, pages.first, pages.last), file);
            }
            Some(DumpFile::Consolidated) => consolidated = Some(file),
            Some(DumpFile::ConsolidatedIndex) => consolidated_index = Some(file),
            None => {}
        }
    }

    let mut consistent = true;
    let mut shards = Vec::new();
    for (part, pages, file) in data {
        match indices.remove(&(part, pages.first, pages.last)) {
            Some(index) => shards.push(ShardDescriptor {
                id: ShardId::new(format!("{}-p{}p{}", part, pages.first, pages.last)),
                pages,
                url: file.url,
                index_url: index.url,
                checksum: file.checksum,
                index_checksum: index.checksum,
                size: file.size,
                local_path: None,
            }),
            None => {
                warn!("No index published for {}; skipping it", file.name);
                consistent = false;
            }
        }
    }

    if shards.is_empty() {
        if let (Some(file), Some(index)) = (consolidated, consolidated_index) {
            shards.push(ShardDescriptor {
                id: ShardId::new("all"),
                pages: PageRange::ALL,
                url: file.url,
                index_url: index.url,
                checksum: file.checksum,
                index_checksum: index.checksum,
                size: file.size,
                local_path: None,
            });
        }
    }
    (shards, consistent)
}

fn is_version_id(s: &str) -> bool {
    s.len() == 8 && s.bytes().all(|b| b.is_ascii_digit())
}

fn selector(css: &str) -> Result<Selector, DumpError> {
    Selector::parse(css)
        .map_err(|e| DumpError::CatalogUnavailable(format!("bad selector {}: {:?}", css, e)))
}

fn links(body: &str) -> Result<Vec<String>, DumpError> {
    let document = Html::parse_document(body);
    let anchors = selector("a[href]")?;
    Ok(document
        .select(&anchors)
        .filter_map(|a| a.value().attr("href"))
        .map(str::to_string)
        .collect())
}

/// Lists corpora and dump versions and resolves manifests.
pub struct Catalog {
    remote: Arc<dyn Remote>,
    parser: Box<dyn ListingParser>,
    config: CatalogConfig,
}

impl Catalog {
    /// A catalog using the listing format named by `config.provider`.
    pub fn new(config: CatalogConfig, remote: Arc<dyn Remote>) -> Self {
        let parser: Box<dyn ListingParser> = match config.provider {
            Provider::Wikimedia => Box::new(WikimediaListing),
            Provider::Mirror => Box::new(MirrorListing),
        };
        Self::with_parser(config, remote, parser)
    }

    pub fn with_parser(
        config: CatalogConfig,
        remote: Arc<dyn Remote>,
        parser: Box<dyn ListingParser>,
    ) -> Self {
        Self {
            remote,
            parser,
            config,
        }
    }

    async fn fetch_listing(&self, url: &str) -> Result<String, DumpError> {
        info!("Retrieving listing from {}", url);
        self.remote
            .get_text(url)
            .await
            .map_err(|e| DumpError::CatalogUnavailable(format!("{}: {}", url, e)))
    }

    /// Corpora the provider publishes (e.g. `enwiki`, `frwiki`).
    pub async fn list_corpora(&self) -> Result<Vec<String>, DumpError> {
        let url = self.parser.corpora_url(&self.config.base_url);
        let body = self.fetch_listing(&url).await?;
        self.parser.parse_corpora(&body)
    }

    /// Versions of `corpus`, newest first.
    ///
    /// The listing is fetched up front; each version's manifest is fetched
    /// only when the stream is polled for it. A network failure ends nothing
    /// but its own item, and the stream cannot be resumed past one without
    /// listing again.
    pub async fn list_versions<'a>(
        &'a self,
        corpus: &'a str,
    ) -> Result<BoxStream<'a, Result<DumpVersion, DumpError>>, DumpError> {
        let url = self.parser.versions_url(&self.config.base_url, corpus);
        let body = self.fetch_listing(&url).await?;
        let ids = self.parser.parse_versions(&body)?;
        if ids.is_empty() {
            return Err(DumpError::CatalogUnavailable(format!(
                "no dump versions listed at {}",
                url
            )));
        }
        Ok(stream::iter(ids)
            .then(move |id| async move { self.version(corpus, &id).await })
            .boxed())
    }

    /// Resolves one version's status and shard manifest.
    pub async fn version(&self, corpus: &str, version: &str) -> Result<DumpVersion, DumpError> {
        let url = self
            .parser
            .manifest_url(&self.config.base_url, corpus, version);
        let body = self.fetch_listing(&url).await?;
        self.parser
            .parse_manifest(&self.config.base_url, corpus, version, &body)
    }

    /// The newest complete version, or the newest partial one when
    /// `accept_partial` is set and nothing complete exists.
    pub async fn latest(&self, corpus: &str) -> Result<DumpVersion, DumpError> {
        let mut versions = self.list_versions(corpus).await?;
        let mut newest_partial = None;
        let mut last_error = None;

        while let Some(version) = versions.next().await {
            match version {
                Ok(version) if version.is_complete() => {
                    info!("Latest complete dump of {} is {}", corpus, version.id);
                    return Ok(version);
                }
                Ok(version) => {
                    info!("Skipping partial dump {}", version.key());
                    if newest_partial.is_none() && !version.shards.is_empty() {
                        newest_partial = Some(version);
                    }
                }
                Err(e) => {
                    warn!("Could not resolve a version of {}: {}", corpus, e);
                    last_error = Some(e);
                }
            }
        }

        match newest_partial {
            Some(version) if self.config.accept_partial => {
                warn!("No complete dump of {}; using partial {}", corpus, version.id);
                Ok(version)
            }
            Some(_) => Err(DumpError::NoCompleteDump(corpus.to_string())),
            None => Err(last_error.unwrap_or_else(|| DumpError::NoCompleteDump(corpus.to_string()))),
        }
    }

    /// Shards of a resolved version, in ascending page-range order.
    pub fn manifest<'v>(&self, version: &'v DumpVersion) -> &'v [ShardDescriptor] {
        &version.shards
    }

    /// Versions already present in the local cache, newest first.
    pub fn local_versions(store: &ShardStore, corpus: &str) -> Result<Vec<DumpVersion>, DumpError> {
        Ok(store
            .local_versions()?
            .into_iter()
            .filter(|v| v.corpus == corpus)
            .collect())
    }

    /// Reloads a version's manifest from the local cache without network access.
    pub fn load_local(store: &ShardStore, corpus: &str, version: &str) -> Result<Option<DumpVersion>, DumpError> {
        store.load_manifest(&format!("{}-{}", corpus, version))
    }
}
