//! # mediavfs indexd
//!
//! Runs the background indexer over a set of roots until interrupted.
//!
//! Configuration is resolved by `mediavfs-config`; command line roots and
//! policy override whatever the configuration names.

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser as ClapParser;
use mediavfs_config::{ConfigSource, IndexerConfig, load_from_env, load_from_file, policy_of};
use mediavfs_core::{
    crawler::Crawler,
    parser::{EnricherRegistry, Extractor, NullThumbnailer, Parser, ThumbnailCache, Thumbnailer},
    scheduler::{Policy, Scheduler},
    store::{MemoryStore, StoreWriter},
    watch::{NotifyBackend, WatchBackend, WatchEvent},
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "info,mediavfs_core=info";
const THUMBNAIL_QUEUE_DEPTH: usize = 256;

/// CLI entry point
#[derive(ClapParser, Debug)]
#[command(name = "mediavfs-indexd")]
#[command(about = "Crawl media roots, keep their metadata indexed and follow live changes")]
struct Cli {
    /// Configuration file (TOML or JSON). Overrides MEDIAVFS_CONFIG_PATH.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Throttling policy: greedy, aggressive, balanced or polite
    #[arg(long, env = "MEDIAVFS_POLICY")]
    policy: Option<String>,

    /// Roots to crawl; replaces the configured roots when given
    roots: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (mut config, source) = match &cli.config {
        Some(path) => (load_from_file(path)?, ConfigSource::File(path.clone())),
        None => load_from_env().context("failed to load indexer configuration")?,
    };
    if !cli.roots.is_empty() {
        config.roots = cli.roots.clone();
    }
    if let Some(policy) = &cli.policy {
        config.policy = policy.clone();
    }

    init_tracing(&config);
    info!(?source, roots = config.roots.len(), "configuration loaded");

    if config.roots.is_empty() {
        anyhow::bail!("no roots to crawl; pass them as arguments or set `roots` in the config");
    }

    let policy = policy_of(&config);
    run(config, policy).await
}

fn init_tracing(config: &IndexerConfig) {
    let fallback = config
        .log_filter
        .clone()
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| fallback.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(config: IndexerConfig, policy: Policy) -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let writer = StoreWriter::new(store.clone());

    let parser = Parser::new(writer, extractor(), thumbnailer(&config))
        .with_enrichers(EnricherRegistry::with_defaults());
    let scheduler = Scheduler::system(config.scheduler.clone());

    let (backend, events) = match NotifyBackend::new(config.crawler.watch_channel_capacity) {
        Ok((backend, events)) => (Some(Arc::new(backend) as Arc<dyn WatchBackend>), Some(events)),
        Err(err) => {
            warn!(error = %err, "live change notifications unavailable; falling back to periodic crawls");
            (None, None)
        }
    };

    let crawler = Crawler::new(parser, scheduler, backend, config.crawler.clone(), policy);

    for root in &config.roots {
        if let Err(err) = crawler.append(root).await {
            error!(path = %root.display(), error = %err, "root skipped");
        }
    }
    if crawler.roots().is_empty() {
        crawler.stop();
        anyhow::bail!("none of the configured roots could be read");
    }

    if let Some(events) = events {
        tokio::spawn(pump_events(crawler.clone(), events));
    }

    let idle = {
        let crawler = crawler.clone();
        let store = store.clone();
        tokio::spawn(async move {
            crawler.wait_idle().await;
            if !crawler.is_stopped() {
                info!(items = store.rows().len(), "initial crawl finished");
            }
        })
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");
    crawler.stop();
    idle.abort();
    Ok(())
}

async fn pump_events(crawler: Crawler, mut events: mpsc::Receiver<WatchEvent>) {
    while let Some(event) = events.recv().await {
        if crawler.is_stopped() {
            break;
        }
        crawler.notify(event).await;
    }
    debug!("watch event stream closed");
}

#[cfg(feature = "ffmpeg")]
fn extractor() -> Arc<dyn Extractor> {
    Arc::new(mediavfs_core::parser::FfmpegExtractor::new())
}

#[cfg(not(feature = "ffmpeg"))]
fn extractor() -> Arc<dyn Extractor> {
    Arc::new(mediavfs_core::parser::ExtensionExtractor::new())
}

/// Thumbnail generation belongs to an external encoder. Requests are
/// logged and dropped here.
fn thumbnailer(config: &IndexerConfig) -> Arc<dyn Thumbnailer> {
    let Some(dir) = &config.thumbnail_dir else {
        return Arc::new(NullThumbnailer);
    };
    let (cache, mut requests) = ThumbnailCache::new(dir, THUMBNAIL_QUEUE_DEPTH);
    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            debug!(?request, "thumbnail requested");
        }
    });
    Arc::new(cache)
}
