use anyhow::{bail, Context};
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{info, warn};
use wikisync::{
    Catalog, DumpError, DumpVersion, HttpRemote, Page, PageConsumer, Pipeline, PipelineConfig,
    Provider, ShardId, ShardReport,
};

#[derive(Parser, Debug)]
#[command(name = "wikisync")]
#[command(about = "Download multistream corpus dumps and read pages from them", long_about = None)]
#[command(version)]
struct Args {
    /// JSON config file; flags below override its fields
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Local shard and cache directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Dump provider root URL
    #[arg(long)]
    base_url: Option<String>,

    /// Listing format served by the provider
    #[arg(long, value_enum)]
    provider: Option<ProviderArg>,

    /// Concurrent downloads
    #[arg(long)]
    fetch_workers: Option<usize>,

    /// Concurrent decode/checksum jobs
    #[arg(long)]
    decode_workers: Option<usize>,

    /// Use the newest partial dump when no complete one exists
    #[arg(long)]
    accept_partial: bool,

    /// Skip building the lz4 recompression cache
    #[arg(long)]
    no_recompress: bool,

    /// Abort the run after this long (e.g. "2h", "90m")
    #[arg(long, value_parser = humantime::parse_duration)]
    run_timeout: Option<Duration>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ProviderArg {
    Wikimedia,
    Mirror,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the corpora the provider publishes
    Corpora,

    /// List dump versions of a corpus, newest first
    Versions {
        corpus: String,
        /// Only versions already in the local cache
        #[arg(long)]
        local: bool,
    },

    /// Show the shard manifest of a version
    Manifest {
        corpus: String,
        /// Version id (YYYYMMDD); defaults to the latest complete dump
        #[arg(long)]
        version: Option<String>,
    },

    /// Fetch, verify and decode shards, writing their pages
    Run {
        corpus: String,
        #[arg(long)]
        version: Option<String>,
        /// Only these shard ids (comma-separated), e.g. a previous run's failures
        #[arg(long, value_delimiter = ',')]
        shards: Vec<String>,
        /// Write raw page XML here
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Print one page by id
    Page {
        corpus: String,
        id: u64,
        #[arg(long)]
        version: Option<String>,
    },
}

/// Writes pages to an optional file and tracks progress over shards.
struct PageWriter {
    out: Option<BufWriter<tokio::fs::File>>,
    pb: ProgressBar,
}

#[async_trait]
impl PageConsumer for PageWriter {
    async fn page(&mut self, _shard: &ShardId, page: Page) -> Result<(), DumpError> {
        if let Some(out) = self.out.as_mut() {
            out.write_all(&page.bytes).await?;
        }
        Ok(())
    }

    async fn shard_failed(&mut self, shard: &ShardId, error: &DumpError) -> Result<(), DumpError> {
        self.pb.set_message(format!("| ❌ {}: {}", shard, error));
        Ok(())
    }

    async fn shard_done(&mut self, report: &ShardReport) -> Result<(), DumpError> {
        self.pb
            .set_message(format!("| {} {}", report.shard_id, report.describe()));
        self.pb.inc(1);
        Ok(())
    }
}

fn load_config(args: &Args) -> anyhow::Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_json_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(dir) = &args.cache_dir {
        config.cache_dir = dir.clone();
    }
    if let Some(url) = &args.base_url {
        config.catalog.base_url = url.clone();
    }
    if let Some(provider) = args.provider {
        config.catalog.provider = match provider {
            ProviderArg::Wikimedia => Provider::Wikimedia,
            ProviderArg::Mirror => Provider::Mirror,
        };
    }
    if let Some(n) = args.fetch_workers {
        config.fetch_workers = n;
    }
    if let Some(n) = args.decode_workers {
        config.decode_workers = n;
    }
    if args.accept_partial {
        config.catalog.accept_partial = true;
    }
    if args.no_recompress {
        config.recompress = false;
    }
    if args.run_timeout.is_some() {
        config.run_timeout = args.run_timeout;
    }
    Ok(config)
}

/// Resolves the requested version, preferring the local manifest, and
/// falling back to the newest local version when the catalog is unreachable.
async fn resolve_version(
    pipeline: &Pipeline,
    corpus: &str,
    version: Option<&str>,
) -> anyhow::Result<DumpVersion> {
    let store = pipeline.store();
    if let Some(id) = version {
        if let Some(local) = Catalog::load_local(store, corpus, id)? {
            return Ok(local);
        }
        return Ok(pipeline.catalog().version(corpus, id).await?);
    }

    match pipeline.catalog().latest(corpus).await {
        Ok(version) => Ok(version),
        Err(DumpError::CatalogUnavailable(reason)) => {
            let local = Catalog::local_versions(store, corpus)?;
            match local.into_iter().next() {
                Some(version) => {
                    warn!("Catalog unavailable ({}); using local {}", reason, version.key());
                    Ok(version)
                }
                None => bail!("catalog unavailable and no local versions of {}: {}", corpus, reason),
            }
        }
        Err(e) => Err(e.into()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("wikisync={}", log_level))),
        )
        .init();

    let config = load_config(&args)?;
    let remote = Arc::new(HttpRemote::new(&config.fetch)?);
    let pipeline = Pipeline::new(config, remote)?;

    match args.command {
        Command::Corpora => {
            for corpus in pipeline.catalog().list_corpora().await? {
                println!("{}", corpus);
            }
        }
        Command::Versions { corpus, local } => {
            if local {
                for version in Catalog::local_versions(pipeline.store(), &corpus)? {
                    println!("{}\t{:?}\t{} shards", version.id, version.status, version.shards.len());
                }
            } else {
                use futures_util::StreamExt;
                let catalog = pipeline.catalog();
                let mut versions = catalog.list_versions(&corpus).await?;
                while let Some(version) = versions.next().await {
                    match version {
                        Ok(v) => println!("{}\t{:?}\t{} shards", v.id, v.status, v.shards.len()),
                        Err(e) => warn!("{}", e),
                    }
                }
            }
        }
        Command::Manifest { corpus, version } => {
            let version = resolve_version(&pipeline, &corpus, version.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&version)?);
        }
        Command::Run {
            corpus,
            version,
            shards,
            out,
        } => {
            let version = resolve_version(&pipeline, &corpus, version.as_deref()).await?;
            let only: Vec<ShardId> = shards.iter().map(|s| ShardId::new(s.as_str())).collect();

            info!("🚀 WikiSync - {} ({:?})", version.key(), version.status);
            let total = if only.is_empty() {
                version.shards.len()
            } else {
                only.len()
            };
            let pb = ProgressBar::new(total as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} shards {msg} | {elapsed_precise} elapsed")?
                    .progress_chars("█▓▒░ "),
            );

            let out = match out {
                Some(path) => Some(BufWriter::new(tokio::fs::File::create(&path).await?)),
                None => None,
            };
            let mut writer = PageWriter { out, pb };
            let summary = pipeline.run_shards(&version, &only, &mut writer).await?;
            if let Some(out) = writer.out.as_mut() {
                out.flush().await?;
            }
            writer.pb.finish_with_message("done");

            println!("{}", serde_json::to_string_pretty(&summary)?);
            if !summary.is_success() {
                let failed: Vec<&str> = summary.failed().into_iter().map(|(id, _)| id.as_str()).collect();
                eprintln!("❌ Failed shards: {}", failed.join(","));
                std::process::exit(1);
            }
            info!("✅ All shards processed successfully!");
        }
        Command::Page {
            corpus,
            id,
            version,
        } => {
            let version = resolve_version(&pipeline, &corpus, version.as_deref()).await?;
            match pipeline.page(&version, id).await? {
                Some(page) => {
                    info!("{} ({})", page.title, page.page_id);
                    let mut stdout = tokio::io::stdout();
                    stdout.write_all(&page.bytes).await?;
                    stdout.flush().await?;
                }
                None => {
                    eprintln!("Page {} is not in {}", id, version.key());
                    std::process::exit(2);
                }
            }
        }
    }
    Ok(())
}
