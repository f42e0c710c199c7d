use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crawldex_core::security::{Container, Securable};

pub const DEFAULT_CONFIG_PATH: &str = "./config/crawldex.toml";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub crawler: CrawlerConfig,
    #[serde(default)]
    pub roots: Vec<RootConfig>,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub containers: Vec<ContainerConfig>,
    #[serde(default)]
    pub securables: Vec<Securable>,
    #[serde(default)]
    pub identifiers: Vec<IdentifierConfig>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    Sqlite,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_index_kind")]
    pub kind: IndexKind,
    /// Defaults to `index.sqlite` next to the crawl state database.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_commit_max_docs")]
    pub commit_max_docs: usize,
    #[serde(default = "default_commit_idle_ms")]
    pub commit_idle_ms: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            kind: default_index_kind(),
            path: None,
            commit_max_docs: default_commit_max_docs(),
            commit_idle_ms: default_commit_idle_ms(),
        }
    }
}

fn default_index_kind() -> IndexKind {
    IndexKind::Sqlite
}
fn default_commit_max_docs() -> usize {
    10_000
}
fn default_commit_idle_ms() -> u64 {
    2_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_preprocess_workers")]
    pub preprocess_workers: usize,
    /// 0 picks `max(1, cpus / 4)`.
    #[serde(default)]
    pub index_workers: usize,
    #[serde(default = "default_index_queue_capacity")]
    pub index_queue_capacity: usize,
    #[serde(default = "default_preprocess_retries")]
    pub preprocess_retries: u32,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            preprocess_workers: default_preprocess_workers(),
            index_workers: 0,
            index_queue_capacity: default_index_queue_capacity(),
            preprocess_retries: default_preprocess_retries(),
            max_file_bytes: default_max_file_bytes(),
            poll_timeout_ms: default_poll_timeout_ms(),
        }
    }
}

impl PipelineConfig {
    pub fn effective_index_workers(&self) -> usize {
        if self.index_workers > 0 {
            return self.index_workers;
        }
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        (cpus / 4).max(1)
    }
}

fn default_preprocess_workers() -> usize {
    1
}
fn default_index_queue_capacity() -> usize {
    64
}
fn default_preprocess_retries() -> u32 {
    3
}
fn default_max_file_bytes() -> u64 {
    50 * 1024 * 1024
}
fn default_poll_timeout_ms() -> u64 {
    2_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct CrawlerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_recrawl_interval_hours")]
    pub recrawl_interval_hours: f64,
    #[serde(default = "default_grace_minutes")]
    pub grace_minutes: i64,
    #[serde(default = "default_directories_per_sec")]
    pub directories_per_sec: f64,
    #[serde(default = "default_bytes_per_sec")]
    pub bytes_per_sec: f64,
    #[serde(default = "default_files_per_sec")]
    pub files_per_sec: f64,
    /// Indexed by name and URL only; content is never parsed.
    #[serde(default = "default_name_only_extensions")]
    pub name_only_extensions: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    /// A directory containing a file with this name is not crawled.
    #[serde(default = "default_no_crawl_marker")]
    pub no_crawl_marker: String,
    #[serde(default = "default_retry_failed_hours")]
    pub retry_failed_hours: f64,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: default_batch_size(),
            poll_interval_secs: default_poll_interval_secs(),
            recrawl_interval_hours: default_recrawl_interval_hours(),
            grace_minutes: default_grace_minutes(),
            directories_per_sec: default_directories_per_sec(),
            bytes_per_sec: default_bytes_per_sec(),
            files_per_sec: default_files_per_sec(),
            name_only_extensions: default_name_only_extensions(),
            exclude_globs: Vec::new(),
            no_crawl_marker: default_no_crawl_marker(),
            retry_failed_hours: default_retry_failed_hours(),
        }
    }
}

impl CrawlerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn is_name_only(&self, file_name: &str) -> bool {
        let Some((_, ext)) = file_name.rsplit_once('.') else {
            return false;
        };
        self.name_only_extensions
            .iter()
            .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(ext))
    }
}

fn default_true() -> bool {
    true
}
fn default_batch_size() -> usize {
    25
}
fn default_poll_interval_secs() -> u64 {
    30
}
fn default_recrawl_interval_hours() -> f64 {
    24.0
}
fn default_grace_minutes() -> i64 {
    30
}
fn default_directories_per_sec() -> f64 {
    20.0
}
fn default_bytes_per_sec() -> f64 {
    20.0 * 1024.0 * 1024.0
}
fn default_files_per_sec() -> f64 {
    50.0
}
fn default_name_only_extensions() -> Vec<String> {
    [
        "jpg", "jpeg", "png", "gif", "bmp", "tif", "tiff", "zip", "gz", "tgz", "tar", "7z",
        "mp3", "mp4", "mov", "avi", "wav", "fcs", "raw",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_no_crawl_marker() -> String {
    ".nocrawl".to_string()
}
fn default_retry_failed_hours() -> f64 {
    24.0
}

/// A top-level folder backed by a container.
#[derive(Debug, Deserialize, Clone)]
pub struct RootConfig {
    pub name: String,
    pub path: PathBuf,
    pub container: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default = "default_category_boost")]
    pub category_boost: f32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            default_limit: default_limit(),
            category_boost: default_category_boost(),
        }
    }
}

fn default_base_url() -> String {
    "/files".to_string()
}
fn default_limit() -> usize {
    20
}
fn default_category_boost() -> f32 {
    5.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContainerConfig {
    #[serde(flatten)]
    pub container: Container,
    #[serde(default)]
    pub readers: Vec<String>,
}

/// Maps query strings that look like a known identifier to a category
/// that gets boosted.
#[derive(Debug, Deserialize, Clone)]
pub struct IdentifierConfig {
    pub pattern: String,
    pub category: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    /// `tracing-subscriber` filter directive; `RUST_LOG` wins when set.
    #[serde(default)]
    pub filter: Option<String>,
}

impl Config {
    pub fn index_path(&self) -> PathBuf {
        match &self.index.path {
            Some(p) => p.clone(),
            None => self
                .db
                .path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("index.sqlite"),
        }
    }

    pub fn commit_idle(&self) -> Duration {
        Duration::from_millis(self.index.commit_idle_ms)
    }

    pub fn root(&self, name: &str) -> Option<&RootConfig> {
        self.roots.iter().find(|r| r.name == name)
    }

    pub fn from_toml_str(content: &str) -> Result<Config> {
        let config: Config =
            toml::from_str(content).with_context(|| "Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.pipeline.preprocess_workers == 0 {
            anyhow::bail!("pipeline.preprocess_workers must be > 0");
        }
        if self.pipeline.index_queue_capacity == 0 {
            anyhow::bail!("pipeline.index_queue_capacity must be > 0");
        }
        if self.crawler.batch_size == 0 {
            anyhow::bail!("crawler.batch_size must be > 0");
        }
        if self.index.commit_max_docs == 0 {
            anyhow::bail!("index.commit_max_docs must be > 0");
        }
        if !(self.crawler.recrawl_interval_hours.is_finite()
            && self.crawler.recrawl_interval_hours > 0.0)
        {
            anyhow::bail!("crawler.recrawl_interval_hours must be > 0");
        }
        for (name, rate) in [
            ("directories_per_sec", self.crawler.directories_per_sec),
            ("bytes_per_sec", self.crawler.bytes_per_sec),
            ("files_per_sec", self.crawler.files_per_sec),
        ] {
            if !(rate.is_finite() && rate > 0.0) {
                anyhow::bail!("crawler.{} must be a finite number > 0", name);
            }
        }
        if self.search.default_limit == 0 {
            anyhow::bail!("search.default_limit must be >= 1");
        }

        let mut seen = HashSet::new();
        for root in &self.roots {
            if root.name.is_empty() || root.name.contains('/') {
                anyhow::bail!("roots: invalid name '{}'", root.name);
            }
            if !seen.insert(root.name.as_str()) {
                anyhow::bail!("roots: duplicate name '{}'", root.name);
            }
        }

        for glob in &self.crawler.exclude_globs {
            globset::Glob::new(glob)
                .with_context(|| format!("crawler.exclude_globs: invalid glob '{}'", glob))?;
        }
        for id in &self.identifiers {
            regex::Regex::new(&id.pattern)
                .with_context(|| format!("identifiers: invalid pattern '{}'", id.pattern))?;
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    Config::from_toml_str(&content)
}
