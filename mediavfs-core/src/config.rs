use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration for an indexer process.
///
/// All fields carry defaults so a partial TOML/JSON document is enough to
/// bring the daemon up.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Filesystem roots crawled on startup.
    pub roots: Vec<PathBuf>,
    /// Throttling policy name; unknown names fall back to `balanced`.
    pub policy: String,
    /// Crawler knobs (debounce windows, listing cache, restart pass).
    pub crawler: CrawlerConfig,
    /// Load sampling cadence and tracked processes.
    pub scheduler: SchedulerConfig,
    /// Directory for generated thumbnails. Thumbnailing is disabled when unset.
    pub thumbnail_dir: Option<PathBuf>,
    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    pub log_filter: Option<String>,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            policy: "balanced".to_string(),
            crawler: CrawlerConfig::default(),
            scheduler: SchedulerConfig::default(),
            thumbnail_dir: None,
            log_filter: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Quiet period a growing file must see before its MODIFY is handled.
    pub growth_debounce_ms: u64,
    /// How long a merged directory listing is reused.
    pub listing_cache_ms: u64,
    /// Settle delay before a polling-only root is crawled again.
    pub restart_settle_ms: u64,
    /// Pacing multiplier applied while a restart pass drains.
    pub restart_multiplier: f64,
    /// File whose presence stops recursive descent into a directory.
    pub no_crawl_marker: String,
    /// Conventional directory cover files, matched case-insensitively.
    pub cover_names: Vec<String>,
    /// Shadow tree holding sidecar metadata. `<overlay_root>/<absolute dir>`
    /// is merged into the listing of `<absolute dir>`.
    pub overlay_root: Option<PathBuf>,
    /// Bounded channel depth between the watch backend and the crawler.
    pub watch_channel_capacity: usize,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            growth_debounce_ms: 2_000,
            listing_cache_ms: 3_000,
            restart_settle_ms: 10_000,
            restart_multiplier: 5.0,
            no_crawl_marker: ".nomedia".to_string(),
            cover_names: default_cover_names(),
            overlay_root: None,
            watch_channel_capacity: 1024,
        }
    }
}

impl CrawlerConfig {
    pub fn growth_debounce(&self) -> Duration {
        Duration::from_millis(self.growth_debounce_ms)
    }

    pub fn listing_ttl(&self) -> Duration {
        Duration::from_millis(self.listing_cache_ms)
    }

    pub fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }

    /// True when `name` is one of the conventional cover filenames.
    pub fn is_cover_name(&self, name: &str) -> bool {
        self.cover_names
            .iter()
            .any(|cover| cover.eq_ignore_ascii_case(name))
    }
}

fn default_cover_names() -> Vec<String> {
    [
        "cover.jpg",
        "cover.png",
        "folder.jpg",
        "folder.png",
        "front.jpg",
        "albumart.jpg",
    ]
    .iter()
    .map(|name| name.to_string())
    .collect()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Sampling period while demand exists. `None` disables the timer and
    /// samples are taken only through `Scheduler::sample`.
    pub sample_interval_ms: Option<u64>,
    /// Timer disarms after this long without a `next`/`check` call.
    pub idle_disarm_ms: u64,
    /// Tracked process list is rediscovered by name at this cadence.
    pub process_refresh_ms: u64,
    /// Process names whose CPU time counts towards `tracked_pct`.
    pub tracked_processes: Vec<String>,
    /// Count this process as part of the tracked group.
    pub track_self: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: Some(1_000),
            idle_disarm_ms: 20_000,
            process_refresh_ms: 10_000,
            tracked_processes: Vec::new(),
            track_self: true,
        }
    }
}

impl SchedulerConfig {
    /// Manual sampling only; used by tests and embedders driving their own clock.
    pub fn manual() -> Self {
        Self {
            sample_interval_ms: None,
            ..Self::default()
        }
    }

    pub fn sample_interval(&self) -> Option<Duration> {
        self.sample_interval_ms
            .map(|ms| Duration::from_millis(ms.max(1)))
    }

    pub fn idle_disarm(&self) -> Duration {
        Duration::from_millis(self.idle_disarm_ms)
    }

    pub fn process_refresh(&self) -> Duration {
        Duration::from_millis(self.process_refresh_ms)
    }
}
