//! The resource tree the crawler walks and the pipeline reads.
//!
//! The tree is reached only through [`ResourceProvider`] and [`Resource`],
//! so a host application can plug in its own. [`FileTree`] is the built-in
//! provider: `/` lists the configured `[[roots]]`, and `/<root>/a/b` maps to
//! `<root.path>/a/b` on disk.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;

use crawldex_core::models::{category, truncate_millis};
use crawldex_core::path::ResourcePath;

use crate::config::{Config, RootConfig};
use crate::crawl_state::CrawlStateStore;
use crate::extract::ExtractError;

// ═══════════════════════════════════════════════════════════════════════
// Contract
// ═══════════════════════════════════════════════════════════════════════

/// What a resource is, as far as crawling is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceKind {
    File,
    Collection,
    /// A collection backed by a container; crawling it also enumerates the
    /// container's own documents.
    ContainerRoot { container: String },
}

impl ResourceKind {
    pub fn is_collection(&self) -> bool {
        !matches!(self, ResourceKind::File)
    }
}

/// Display and search metadata of a resource.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceProperties {
    pub display_title: Option<String>,
    pub search_title: Option<String>,
    pub categories: Vec<String>,
    pub navtrail: Option<String>,
    pub securable_resource_id: Option<String>,
}

#[async_trait]
pub trait Resource: Send + Sync {
    fn path(&self) -> &ResourcePath;

    fn kind(&self) -> &ResourceKind;

    fn exists(&self) -> bool;

    fn is_collection(&self) -> bool {
        self.kind().is_collection()
    }

    /// False for resources excluded from indexing by configuration.
    fn should_index(&self) -> bool;

    fn document_id(&self) -> String;

    /// `None` only for the virtual root.
    fn container_id(&self) -> Option<String>;

    fn url(&self) -> String;

    fn last_modified(&self) -> Option<DateTime<Utc>>;

    fn size(&self) -> Option<u64>;

    fn properties(&self) -> ResourceProperties;

    async fn list(&self) -> Result<Vec<Arc<dyn Resource>>>;

    /// Reads the content, refusing anything above `max_bytes`.
    async fn read_content(&self, max_bytes: u64) -> Result<Vec<u8>>;

    /// Persists the outcome of an index attempt.
    async fn set_last_indexed(
        &self,
        indexed: DateTime<Utc>,
        modified: Option<DateTime<Utc>>,
    ) -> Result<()>;
}

#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Looks up a resource by its path string.
    async fn resolve(&self, id: &str) -> Result<Option<Arc<dyn Resource>>>;

    /// Document id a resource at `path` is indexed under, whether or not it
    /// still exists.
    fn document_id(&self, path: &ResourcePath) -> String;
}

// ═══════════════════════════════════════════════════════════════════════
// Filesystem provider
// ═══════════════════════════════════════════════════════════════════════

struct TreeInner {
    roots: Vec<RootConfig>,
    base_url: String,
    exclude: GlobSet,
    state: Arc<CrawlStateStore>,
}

/// [`ResourceProvider`] over the configured filesystem roots.
#[derive(Clone)]
pub struct FileTree {
    inner: Arc<TreeInner>,
}

pub const DOC_ID_PREFIX: &str = "file:";

impl FileTree {
    pub fn new(config: &Config, state: Arc<CrawlStateStore>) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(TreeInner {
                roots: config.roots.clone(),
                base_url: config.search.base_url.trim_end_matches('/').to_string(),
                exclude: build_globset(&config.crawler.exclude_globs)?,
                state,
            }),
        })
    }

    /// Path of a configured root.
    pub fn root_path(name: &str) -> ResourcePath {
        ResourcePath::root().child(name)
    }

    async fn build(&self, path: ResourcePath) -> Result<Option<FsResource>> {
        let inner = &self.inner;
        let Some(root_name) = path.segments().first() else {
            return Ok(Some(FsResource {
                tree: self.clone(),
                path,
                kind: ResourceKind::Collection,
                disk: None,
                container: None,
                stat: Some(Stat {
                    modified: None,
                    len: 0,
                }),
            }));
        };
        let Some(root) = inner.roots.iter().find(|r| &r.name == root_name) else {
            return Ok(None);
        };

        let mut disk = root.path.clone();
        for seg in &path.segments()[1..] {
            disk.push(seg);
        }
        let stat = match tokio::fs::metadata(&disk).await {
            Ok(meta) => Some((meta.is_dir(), Stat::from_metadata(&meta))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to stat {}", disk.display()))
            }
        };
        let kind = match &stat {
            _ if path.depth() == 1 => ResourceKind::ContainerRoot {
                container: root.container.clone(),
            },
            Some((true, _)) => ResourceKind::Collection,
            _ => ResourceKind::File,
        };
        Ok(Some(FsResource {
            tree: self.clone(),
            path,
            kind,
            disk: Some(disk),
            container: Some(root.container.clone()),
            stat: stat.map(|(_, s)| s),
        }))
    }
}

#[async_trait]
impl ResourceProvider for FileTree {
    async fn resolve(&self, id: &str) -> Result<Option<Arc<dyn Resource>>> {
        let path = ResourcePath::parse(id)?;
        Ok(self
            .build(path)
            .await?
            .map(|r| Arc::new(r) as Arc<dyn Resource>))
    }

    fn document_id(&self, path: &ResourcePath) -> String {
        format!("{}{}", DOC_ID_PREFIX, path)
    }
}

#[derive(Debug, Clone, Copy)]
struct Stat {
    modified: Option<DateTime<Utc>>,
    len: u64,
}

impl Stat {
    fn from_metadata(meta: &std::fs::Metadata) -> Self {
        Self {
            modified: meta
                .modified()
                .ok()
                .map(|t| truncate_millis(DateTime::<Utc>::from(t))),
            len: meta.len(),
        }
    }
}

struct FsResource {
    tree: FileTree,
    path: ResourcePath,
    kind: ResourceKind,
    /// `None` for the virtual root.
    disk: Option<PathBuf>,
    container: Option<String>,
    /// `None` when nothing exists on disk.
    stat: Option<Stat>,
}

impl FsResource {
    fn relative(&self) -> String {
        self.path.segments().iter().skip(1).cloned().collect::<Vec<_>>().join("/")
    }
}

#[async_trait]
impl Resource for FsResource {
    fn path(&self) -> &ResourcePath {
        &self.path
    }

    fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    fn exists(&self) -> bool {
        self.stat.is_some()
    }

    fn should_index(&self) -> bool {
        let rel = self.relative();
        rel.is_empty() || !self.tree.inner.exclude.is_match(&rel)
    }

    fn document_id(&self) -> String {
        self.tree.document_id(&self.path)
    }

    fn container_id(&self) -> Option<String> {
        self.container.clone()
    }

    fn url(&self) -> String {
        let mut url = self.tree.inner.base_url.clone();
        for seg in self.path.segments() {
            url.push('/');
            url.push_str(&urlencoding::encode(seg));
        }
        if url.is_empty() {
            url.push('/');
        }
        url
    }

    fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.stat.and_then(|s| s.modified)
    }

    fn size(&self) -> Option<u64> {
        self.stat.map(|s| s.len)
    }

    fn properties(&self) -> ResourceProperties {
        let name = self.path.name().map(str::to_string);
        let navtrail = self.path.parent().filter(|p| !p.is_root()).map(|p| {
            p.segments().join(" / ")
        });
        // The display title comes from the content when it has one.
        ResourceProperties {
            display_title: None,
            search_title: name,
            categories: vec![category::FILE.to_string()],
            navtrail,
            securable_resource_id: None,
        }
    }

    async fn list(&self) -> Result<Vec<Arc<dyn Resource>>> {
        if !self.is_collection() {
            return Ok(Vec::new());
        }
        let mut names: Vec<String> = match &self.disk {
            None => self.tree.inner.roots.iter().map(|r| r.name.clone()).collect(),
            Some(dir) => {
                let mut names = Vec::new();
                let mut entries = tokio::fs::read_dir(dir)
                    .await
                    .with_context(|| format!("Failed to list {}", dir.display()))?;
                while let Some(entry) = entries.next_entry().await? {
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
                names
            }
        };
        names.sort();

        let mut children: Vec<Arc<dyn Resource>> = Vec::with_capacity(names.len());
        for name in names {
            if let Some(child) = self.tree.build(self.path.child(&name)).await? {
                if child.exists() {
                    children.push(Arc::new(child));
                }
            }
        }
        Ok(children)
    }

    async fn read_content(&self, max_bytes: u64) -> Result<Vec<u8>> {
        let Some(disk) = self.disk.as_deref().filter(|_| !self.is_collection()) else {
            anyhow::bail!("{} has no content", self.path);
        };
        if let Some(len) = self.size().filter(|len| *len > max_bytes) {
            return Err(ExtractError::TooLarge {
                size: len,
                limit: max_bytes,
            }
            .into());
        }
        read_bounded(disk, max_bytes).await
    }

    async fn set_last_indexed(
        &self,
        indexed: DateTime<Utc>,
        modified: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if self.is_collection() {
            return Ok(());
        }
        self.tree
            .inner
            .state
            .update_file_state(&self.path, Some(indexed), modified)
            .await
    }
}

async fn read_bounded(path: &Path, max_bytes: u64) -> Result<Vec<u8>> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(ExtractError::Io)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut buf = Vec::new();
    file.take(max_bytes + 1)
        .read_to_end(&mut buf)
        .await
        .map_err(ExtractError::Io)?;
    if buf.len() as u64 > max_bytes {
        return Err(ExtractError::TooLarge {
            size: buf.len() as u64,
            limit: max_bytes,
        }
        .into());
    }
    Ok(buf)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
