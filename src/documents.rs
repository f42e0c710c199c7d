//! Document providers: container-level documents that do not live in the
//! resource tree.
//!
//! The crawler walks files. Everything else a container wants searchable
//! (its landing page, metadata records, and so on) comes from a
//! [`DocumentProvider`]. Providers are asked to enumerate a container when
//! its root directory is crawled, when a container or project is indexed
//! explicitly, and they are told when the whole index was cleared so they
//! can drop any bookkeeping of their own.
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │           DocumentProviders              │
//! │  ┌────────────────┐  ┌────────────────┐  │
//! │  │ContainerPages  │  │ host-supplied  │  │
//! │  └────────────────┘  └────────────────┘  │
//! └──────────────┬───────────────────────────┘
//!                ▼
//!     one runnable per provider on the task
//! ```

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock};

use crawldex_core::models::{category, Priority};
use crawldex_core::path::ResourcePath;
use crawldex_core::security::ContainerDirectory;

use crate::pipeline::{IndexTask, Work};
use crate::resource::{Resource, ResourceKind, ResourceProperties};

// ═══════════════════════════════════════════════════════════════════════
// Contract
// ═══════════════════════════════════════════════════════════════════════

/// Pushes a container's own documents into an [`IndexTask`].
///
/// `enumerate_documents` runs on the pipeline's run queue as part of the
/// task it is given, so items it adds are accounted to that task and the
/// task cannot complete before enumeration returns.
#[async_trait]
pub trait DocumentProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Adds the documents of `container` changed since `since` (all of
    /// them when `None`) to `task`.
    async fn enumerate_documents(
        &self,
        task: Arc<IndexTask>,
        container: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Called after the index was cleared.
    async fn index_deleted(&self) -> Result<()> {
        Ok(())
    }
}

/// Registered document providers.
#[derive(Default)]
pub struct DocumentProviders {
    providers: RwLock<Vec<Arc<dyn DocumentProvider>>>,
}

impl DocumentProviders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, provider: Arc<dyn DocumentProvider>) {
        tracing::debug!(provider = provider.name(), "document provider registered");
        self.providers.write().unwrap().push(provider);
    }

    pub fn len(&self) -> usize {
        self.providers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<dyn DocumentProvider>> {
        self.providers.read().unwrap().clone()
    }

    /// Adds one runnable per provider to `task`. Returns how many were
    /// accepted; a closed task accepts none.
    pub fn enumerate(
        &self,
        task: &Arc<IndexTask>,
        container: &str,
        since: Option<DateTime<Utc>>,
    ) -> usize {
        let mut added = 0;
        for provider in self.snapshot() {
            let description = format!("enumerate {} for {}", provider.name(), container);
            let target = task.clone();
            let container = container.to_string();
            let work = Work::run(description, move || async move {
                provider.enumerate_documents(target, &container, since).await
            });
            if task.add_runnable(work, Priority::Background) {
                added += 1;
            }
        }
        added
    }

    /// Tells every provider the index was cleared. Failures are logged.
    pub async fn notify_index_deleted(&self) {
        for provider in self.snapshot() {
            if let Err(e) = provider.index_deleted().await {
                tracing::warn!(
                    provider = provider.name(),
                    error = %format!("{e:#}"),
                    "document provider failed to handle index deletion"
                );
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Built-in provider: container pages
// ═══════════════════════════════════════════════════════════════════════

pub const CONTAINER_DOC_PREFIX: &str = "container:";

/// Indexes one navigation document per container so that searching for a
/// container's name finds the container itself.
pub struct ContainerPages {
    directory: Arc<dyn ContainerDirectory>,
    base_url: String,
}

impl ContainerPages {
    pub fn new(directory: Arc<dyn ContainerDirectory>, base_url: &str) -> Self {
        Self {
            directory,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl DocumentProvider for ContainerPages {
    fn name(&self) -> &str {
        "container-pages"
    }

    async fn enumerate_documents(
        &self,
        task: Arc<IndexTask>,
        container: &str,
        _since: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let Some(found) = self.directory.container(container) else {
            tracing::debug!(container, "no such container; nothing to enumerate");
            return Ok(());
        };
        let navtrail = found
            .parent
            .as_deref()
            .and_then(|p| self.directory.container(p))
            .map(|p| p.name);
        let page = ContainerPage {
            path: ResourcePath::root().child(&format!("@{}", found.id)),
            kind: ResourceKind::File,
            url: format!(
                "{}/containers/{}",
                self.base_url,
                urlencoding::encode(&found.id)
            ),
            container: found.id,
            title: found.name,
            navtrail,
        };
        task.add_work(Work::add_name_only(Arc::new(page)), Priority::Background);
        Ok(())
    }
}

/// A virtual, content-less resource standing for a container.
struct ContainerPage {
    path: ResourcePath,
    kind: ResourceKind,
    container: String,
    title: String,
    url: String,
    navtrail: Option<String>,
}

#[async_trait]
impl Resource for ContainerPage {
    fn path(&self) -> &ResourcePath {
        &self.path
    }

    fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    fn exists(&self) -> bool {
        true
    }

    fn should_index(&self) -> bool {
        true
    }

    fn document_id(&self) -> String {
        format!("{}{}", CONTAINER_DOC_PREFIX, self.container)
    }

    fn container_id(&self) -> Option<String> {
        Some(self.container.clone())
    }

    fn url(&self) -> String {
        self.url.clone()
    }

    fn last_modified(&self) -> Option<DateTime<Utc>> {
        None
    }

    fn size(&self) -> Option<u64> {
        Some(0)
    }

    fn properties(&self) -> ResourceProperties {
        ResourceProperties {
            display_title: Some(self.title.clone()),
            search_title: Some(self.title.clone()),
            categories: vec![category::NAVIGATION.to_string()],
            navtrail: self.navtrail.clone(),
            securable_resource_id: None,
        }
    }

    async fn list(&self) -> Result<Vec<Arc<dyn Resource>>> {
        Ok(Vec::new())
    }

    async fn read_content(&self, _max_bytes: u64) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    // Container pages keep no crawl state.
    async fn set_last_indexed(
        &self,
        _indexed: DateTime<Utc>,
        _modified: Option<DateTime<Utc>>,
    ) -> Result<()> {
        Ok(())
    }
}
