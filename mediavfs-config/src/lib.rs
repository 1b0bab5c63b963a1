//! Loads [`IndexerConfig`] for the mediavfs indexer.
//!
//! Evaluation order:
//! 1) `$MEDIAVFS_CONFIG_PATH` (TOML or JSON file),
//! 2) `$MEDIAVFS_CONFIG_JSON` (inline JSON),
//! 3) the first default file found (`mediavfs.toml`, `mediavfs.json`,
//!    `config/mediavfs.toml`, `config/mediavfs.json`),
//! 4) built-in defaults.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, anyhow};
use tracing::{debug, warn};

pub use mediavfs_core::config::{CrawlerConfig, IndexerConfig, SchedulerConfig};
use mediavfs_core::scheduler::Policy;

pub const CONFIG_PATH_ENV: &str = "MEDIAVFS_CONFIG_PATH";
pub const CONFIG_JSON_ENV: &str = "MEDIAVFS_CONFIG_JSON";

const DEFAULT_FILES: &[&str] = &[
    "mediavfs.toml",
    "mediavfs.json",
    "config/mediavfs.toml",
    "config/mediavfs.json",
];

/// Source that produced the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

/// Resolve the configuration from the process environment and the current
/// directory.
pub fn load_from_env() -> anyhow::Result<(IndexerConfig, ConfigSource)> {
    let path = env::var(CONFIG_PATH_ENV).ok();
    let inline = env::var(CONFIG_JSON_ENV).ok();
    let cwd = env::current_dir().context("failed to resolve working directory")?;
    load_from_sources(path.as_deref(), inline.as_deref(), &cwd)
}

/// Same order as [`load_from_env`] with explicit inputs. Default files are
/// looked up relative to `search_dir`.
pub fn load_from_sources(
    path: Option<&str>,
    inline_json: Option<&str>,
    search_dir: &Path,
) -> anyhow::Result<(IndexerConfig, ConfigSource)> {
    if let Some(path_str) = path
        && !path_str.trim().is_empty()
    {
        let path = PathBuf::from(path_str.trim());
        let config = load_from_file(&path)?;
        return Ok((config, ConfigSource::EnvPath(path)));
    }

    if let Some(raw) = inline_json
        && !raw.trim().is_empty()
    {
        let config = parse_json(raw).with_context(|| format!("failed to parse {CONFIG_JSON_ENV}"))?;
        return Ok((config, ConfigSource::EnvInline));
    }

    if let Some(path) = find_default_file(search_dir) {
        let config = load_from_file(&path)?;
        return Ok((config, ConfigSource::File(path)));
    }

    Ok((IndexerConfig::default(), ConfigSource::Default))
}

pub fn load_from_file(path: &Path) -> anyhow::Result<IndexerConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read indexer config from {}", path.display()))?;

    let config = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => {
            parse_json(&contents).with_context(|| format!("invalid indexer config {}", path.display()))?
        }
        Some("toml") | Some("tml") => toml::from_str(&contents)
            .map_err(|err| anyhow!("invalid indexer config {}: {}", path.display(), err))?,
        _ => parse_from_str(&contents, &path.display().to_string())?,
    };
    debug!(path = %path.display(), "indexer config loaded");
    Ok(config)
}

/// Try TOML first, then JSON.
pub fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<IndexerConfig> {
    toml::from_str(contents).or_else(|toml_err| {
        serde_json::from_str(contents).map_err(|json_err| {
            anyhow!(
                "failed to parse indexer config {}: toml error: {}; json error: {}",
                origin,
                toml_err,
                json_err
            )
        })
    })
}

pub fn parse_json(raw: &str) -> anyhow::Result<IndexerConfig> {
    serde_json::from_str(raw).map_err(|err| anyhow!("invalid indexer config json: {err}"))
}

fn find_default_file(search_dir: &Path) -> Option<PathBuf> {
    DEFAULT_FILES
        .iter()
        .map(|candidate| search_dir.join(candidate))
        .find(|path| path.exists())
}

/// Throttling policy named by the configuration. Unknown names fall back to
/// [`Policy::Balanced`] with a warning.
pub fn policy_of(config: &IndexerConfig) -> Policy {
    let policy = Policy::from_name(&config.policy);
    if !policy.as_str().eq_ignore_ascii_case(config.policy.trim()) {
        warn!(requested = %config.policy, using = %policy, "unknown policy name");
    }
    policy
}
