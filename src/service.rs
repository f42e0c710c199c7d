//! The search service: the one object a host application holds.
//!
//! [`SearchService`] wires the crawl state store, resource provider,
//! pipeline, crawler, index and query engine together and exposes every
//! outbound operation. It is built once at startup and passed around as an
//! `Arc`; nothing in the crate keeps global state.
//!
//! ```rust,no_run
//! # async fn demo(config: crawldex::config::Config) -> anyhow::Result<()> {
//! use crawldex::service::SearchService;
//!
//! let service = SearchService::builder(config).build().await?;
//! service.start().await?;
//! service.wait_for_idle().await;
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crawldex_core::index::IndexResult;
use crawldex_core::models::{sentinel, Priority, SearchResult};
use crawldex_core::path::ResourcePath;
use crawldex_core::security::{
    Container, ContainerDirectory, SecurityPolicy, StaticDirectory,
};

use crate::config::Config;
use crate::crawl_state::CrawlStateStore;
use crate::crawler::{CrawlReport, Crawler};
use crate::diagnostics::{DiagnosticsSink, TracingDiagnostics};
use crate::documents::{ContainerPages, DocumentProvider, DocumentProviders};
use crate::extract::ParserChain;
use crate::index_handle::IndexHandle;
use crate::pipeline::{CoupledTransaction, IndexTask, Pipeline, PipelineSettings, Work};
use crate::resource::{FileTree, ResourceProvider};
use crate::search::{SearchEngine, SearchError, SearchRequest};
use crate::stats::IndexerStats;
use crate::{db, migrate};

/// Builds the config-backed container directory.
///
/// Roots whose container is not declared under `[[containers]]` get an
/// open top-level container of the same id, readable by everyone.
pub fn static_directory(config: &Config) -> StaticDirectory {
    let directory = StaticDirectory::new();
    for entry in &config.containers {
        directory.add_container(entry.container.clone(), &entry.readers);
    }
    for root in &config.roots {
        if directory.container(&root.container).is_none() {
            tracing::debug!(container = %root.container, root = %root.name, "declaring open container for root");
            directory.add_container(
                Container {
                    id: root.container.clone(),
                    name: root.name.clone(),
                    parent: None,
                    searchable: true,
                    workbook: false,
                },
                &["*".to_string()],
            );
        }
    }
    for securable in &config.securables {
        directory.add_securable(securable.clone());
    }
    directory
}

/// Optional replacements for the built-in collaborators.
pub struct SearchServiceBuilder {
    config: Config,
    directory: Option<Arc<dyn ContainerDirectory>>,
    policy: Option<Arc<dyn SecurityPolicy>>,
    provider: Option<Arc<dyn ResourceProvider>>,
    parsers: Option<ParserChain>,
    diagnostics: Option<Arc<dyn DiagnosticsSink>>,
    documents: Vec<Arc<dyn DocumentProvider>>,
}

impl SearchServiceBuilder {
    /// Container tree and access policy, typically the same object.
    pub fn security(
        mut self,
        directory: Arc<dyn ContainerDirectory>,
        policy: Arc<dyn SecurityPolicy>,
    ) -> Self {
        self.directory = Some(directory);
        self.policy = Some(policy);
        self
    }

    pub fn provider(mut self, provider: Arc<dyn ResourceProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn parsers(mut self, parsers: ParserChain) -> Self {
        self.parsers = Some(parsers);
        self
    }

    pub fn diagnostics(mut self, diagnostics: Arc<dyn DiagnosticsSink>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    pub fn document_provider(mut self, provider: Arc<dyn DocumentProvider>) -> Self {
        self.documents.push(provider);
        self
    }

    /// Opens the state database and the index. A broken index does not
    /// fail the build; it leaves the service degraded with a recorded
    /// configuration error.
    pub async fn build(self) -> Result<Arc<SearchService>> {
        let config = Arc::new(self.config);
        let pool = db::connect(&config.db.path).await?;
        migrate::run_migrations(&pool)
            .await
            .context("Failed to prepare crawl state database")?;

        let state = Arc::new(CrawlStateStore::new(
            pool,
            chrono::Duration::minutes(config.crawler.grace_minutes),
        ));
        let provider: Arc<dyn ResourceProvider> = match self.provider {
            Some(p) => p,
            None => Arc::new(FileTree::new(&config, state.clone())?),
        };
        let (directory, policy) = match (self.directory, self.policy) {
            (Some(d), Some(p)) => (d, p),
            _ => {
                let built = Arc::new(static_directory(&config));
                (
                    built.clone() as Arc<dyn ContainerDirectory>,
                    built as Arc<dyn SecurityPolicy>,
                )
            }
        };
        let diagnostics = self
            .diagnostics
            .unwrap_or_else(|| Arc::new(TracingDiagnostics));

        let index = Arc::new(IndexHandle::open(&config).await);
        let pipeline = Pipeline::new(
            PipelineSettings::from_config(&config),
            provider.clone(),
            index.clone(),
            Arc::new(self.parsers.unwrap_or_default()),
            diagnostics,
        );

        let documents = Arc::new(DocumentProviders::new());
        documents.register(Arc::new(ContainerPages::new(
            directory.clone(),
            &config.search.base_url,
        )));
        for provider in self.documents {
            documents.register(provider);
        }

        let crawler = Arc::new(Crawler::new(
            config.crawler.clone(),
            state.clone(),
            provider.clone(),
            pipeline.clone(),
            documents.clone(),
        ));
        let engine = SearchEngine::new(
            index.clone(),
            directory.clone(),
            policy,
            &config.search,
            &config.identifiers,
        )?;

        Ok(Arc::new(SearchService {
            config,
            state,
            provider,
            directory,
            index,
            pipeline,
            crawler,
            documents,
            engine,
            crawler_cancel: CancellationToken::new(),
            crawler_handle: Mutex::new(None),
        }))
    }
}

pub struct SearchService {
    config: Arc<Config>,
    state: Arc<CrawlStateStore>,
    provider: Arc<dyn ResourceProvider>,
    directory: Arc<dyn ContainerDirectory>,
    index: Arc<IndexHandle>,
    pipeline: Arc<Pipeline>,
    crawler: Arc<Crawler>,
    documents: Arc<DocumentProviders>,
    engine: SearchEngine,
    crawler_cancel: CancellationToken,
    crawler_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SearchService {
    pub fn builder(config: Config) -> SearchServiceBuilder {
        SearchServiceBuilder {
            config,
            directory: None,
            policy: None,
            provider: None,
            parsers: None,
            diagnostics: None,
            documents: Vec::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn crawler(&self) -> &Arc<Crawler> {
        &self.crawler
    }

    pub fn crawl_state(&self) -> &Arc<CrawlStateStore> {
        &self.state
    }

    pub fn provider(&self) -> &Arc<dyn ResourceProvider> {
        &self.provider
    }

    pub fn documents(&self) -> &Arc<DocumentProviders> {
        &self.documents
    }

    // ── lifecycle ───────────────────────────────────────────────────────

    /// Starts the pipeline, registers the configured roots and, unless
    /// disabled, the background crawler.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.pipeline.start();
        self.resync_empty_index().await?;
        self.ensure_roots().await?;
        if self.config.crawler.enabled {
            let mut handle = self.crawler_handle.lock().unwrap();
            if handle.is_none() {
                let crawler = self.crawler.clone();
                *handle = Some(tokio::spawn(crawler.run(self.crawler_cancel.clone())));
            }
        }
        Ok(())
    }

    /// Makes sure every configured root has a crawl schedule. A root seen
    /// for the first time gets a full crawl.
    pub async fn ensure_roots(&self) -> Result<usize> {
        let mut added = 0;
        for root in &self.config.roots {
            let path = FileTree::root_path(&root.name);
            if self
                .state
                .insert_path_if_absent(&path, sentinel::force_crawl())
                .await?
            {
                tracing::info!(root = %root.name, path = %root.path.display(), "new root scheduled for a full crawl");
                added += 1;
            }
        }
        Ok(added)
    }

    /// Resets the crawl ledger when the index is empty but the ledger
    /// remembers indexed files, e.g. a memory index after a restart or a
    /// deleted index file. Returns whether a re-crawl was scheduled.
    pub async fn resync_empty_index(&self) -> Result<bool> {
        if self.index.is_degraded() || self.index.num_docs().await? > 0 {
            return Ok(false);
        }
        let remembered = self.state.indexed_files().await?;
        if remembered == 0 {
            return Ok(false);
        }
        self.state
            .update_prefix(&ResourcePath::root(), sentinel::force_crawl(), true)
            .await?;
        self.documents.notify_index_deleted().await;
        tracing::info!(files = remembered, "index is empty; full re-crawl scheduled");
        self.crawler.wake();
        Ok(true)
    }

    /// Stops the crawler, then drains and commits the pipeline.
    pub async fn shutdown(&self) {
        self.crawler_cancel.cancel();
        let handle = self.crawler_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "crawler task ended abnormally");
            }
        }
        self.pipeline.shutdown().await;
        if let Err(e) = self.index.close().await {
            tracing::warn!(error = %e, "failed to close index");
        }
    }

    // ── tasks and submissions ───────────────────────────────────────────

    pub fn create_task(&self, description: impl Into<String>) -> Arc<IndexTask> {
        self.pipeline.create_task(description)
    }

    /// Opens a database transaction whose index submissions are held until
    /// it commits.
    pub async fn begin(&self) -> Result<CoupledTransaction> {
        let tx = self.state.pool().begin().await?;
        Ok(CoupledTransaction::new(tx, self.pipeline.clone()))
    }

    pub fn delete_resource(&self, doc_id: &str) {
        self.pipeline
            .submit(Work::delete(doc_id), Priority::Background);
    }

    /// Deletes every document whose id starts with `prefix`.
    pub fn delete_resources_for_prefix(&self, prefix: &str) {
        self.pipeline.submit(
            Work::DeletePrefix {
                prefix: prefix.to_string(),
            },
            Priority::Background,
        );
    }

    pub fn delete_indexed_container(&self, container: &str) {
        self.pipeline.submit(
            Work::DeleteContainer {
                container: container.to_string(),
            },
            Priority::Background,
        );
    }

    /// Asks the document providers for the documents of `container`
    /// changed since `since`. Without a `task` a new one is created and
    /// marked ready; a caller-supplied task stays open for the caller.
    pub fn index_container(
        &self,
        task: Option<Arc<IndexTask>>,
        container: &str,
        since: Option<DateTime<Utc>>,
    ) -> Arc<IndexTask> {
        let owned = task.is_none();
        let task = task.unwrap_or_else(|| self.create_task(format!("index container {container}")));
        self.documents.enumerate(&task, container, since);
        if owned {
            task.set_ready();
        }
        task
    }

    /// [`index_container`](Self::index_container) for `container` and
    /// every container below it.
    pub fn index_project(&self, task: Option<Arc<IndexTask>>, container: &str) -> Arc<IndexTask> {
        let owned = task.is_none();
        let task = task.unwrap_or_else(|| self.create_task(format!("index project {container}")));
        for c in self.directory.subtree(container) {
            self.documents.enumerate(&task, &c.id, None);
        }
        if owned {
            task.set_ready();
        }
        task
    }

    /// Schedules a full crawl of everything under `path`. With `force`,
    /// every file is resubmitted regardless of its modification time.
    pub async fn start_full_crawl(&self, path: &ResourcePath, force: bool) -> Result<u64> {
        let touched = self
            .state
            .update_prefix(path, sentinel::force_crawl(), force)
            .await?;
        tracing::info!(path = %path, force, directories = touched, "full crawl scheduled");
        self.crawler.wake();
        Ok(touched)
    }

    /// Runs crawl passes in the foreground until nothing is due. The rate
    /// limits are charged but never waited on.
    pub async fn crawl_now(&self) -> Result<CrawlReport> {
        self.crawler.crawl_until_quiet(Utc::now(), false).await
    }

    // ── search ──────────────────────────────────────────────────────────

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResult, SearchError> {
        self.engine.search(request).await
    }

    pub fn engine(&self) -> &SearchEngine {
        &self.engine
    }

    // ── administration ──────────────────────────────────────────────────

    pub async fn commit(&self) -> IndexResult<()> {
        self.pipeline.commit().await
    }

    /// Drops every document and forgets what was indexed, so the crawler
    /// rebuilds the index from scratch.
    pub async fn clear(&self) -> Result<()> {
        self.index.clear().await?;
        self.state
            .update_prefix(&ResourcePath::root(), sentinel::force_crawl(), true)
            .await?;
        self.documents.notify_index_deleted().await;
        tracing::info!("index cleared; full re-crawl scheduled");
        self.crawler.wake();
        Ok(())
    }

    pub fn is_busy(&self) -> bool {
        self.pipeline.is_busy()
    }

    pub async fn wait_for_idle(&self) {
        self.pipeline.wait_for_idle().await
    }

    pub fn configuration_error(&self) -> Option<String> {
        self.index.configuration_error()
    }

    /// Re-opens the configured index, e.g. after an administrator repaired
    /// the index file. Clears the configuration error on success.
    pub async fn reinitialize_index(&self) -> Result<()> {
        self.index.reinitialize().await?;
        self.resync_empty_index().await?;
        // Failed markers left by the outage get retried right away.
        let cleared = self.state.clear_failed_markers(Utc::now()).await?;
        if cleared > 0 {
            tracing::info!(files = cleared, "failed files rescheduled after reinitialization");
            self.crawler.wake();
        }
        Ok(())
    }

    pub async fn indexer_stats(&self) -> IndexerStats {
        let counters = self.pipeline.counters();
        let counts = match self.state.counts(Utc::now()).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "failed to count crawl directories");
                Default::default()
            }
        };
        IndexerStats {
            queues: self.pipeline.queue_depths(),
            documents_indexed: counters.indexed(),
            documents_failed: counters.failed(),
            documents_deleted: counters.deleted(),
            uncommitted: self.pipeline.uncommitted(),
            commits: counters.commits(),
            last_commit: counters.last_commit(),
            active_tasks: self.pipeline.tasks().len(),
            index_documents: self.index.num_docs().await.ok(),
            directories_known: counts.known,
            directories_due: counts.due,
            crawler_running: self.crawler.is_running(),
            configuration_error: self.configuration_error(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crawldex_core::security::Identity;

    fn config(dir: &std::path::Path, extra: &str) -> Config {
        config_kind(dir, "memory", extra)
    }

    fn config_kind(dir: &std::path::Path, kind: &str, extra: &str) -> Config {
        let files = dir.join("files");
        std::fs::create_dir_all(&files).unwrap();
        Config::from_toml_str(&format!(
            r#"
            [db]
            path = "{db}"

            [index]
            kind = "{kind}"

            [crawler]
            enabled = false

            [[roots]]
            name = "lab"
            path = "{files}"
            container = "lab"
            {extra}
            "#,
            db = dir.join("state.sqlite").display(),
            files = files.display(),
        ))
        .unwrap()
    }

    #[test]
    fn roots_get_open_containers_unless_declared() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cfg = config(tmp.path(), "");
        let dir = static_directory(&cfg);
        let lab = dir.container("lab").unwrap();
        assert_eq!(lab.name, "lab");
        assert!(dir.can_read(&Identity::guest(), "lab"));

        let cfg = config(
            tmp.path(),
            r#"
            [[containers]]
            id = "lab"
            name = "Cell Lab"
            readers = ["alice"]
            "#,
        );
        let dir = static_directory(&cfg);
        assert_eq!(dir.container("lab").unwrap().name, "Cell Lab");
        assert!(!dir.can_read(&Identity::guest(), "lab"));
    }

    #[tokio::test]
    async fn crawl_then_search_then_clear() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cfg = config(tmp.path(), "");
        std::fs::write(tmp.path().join("files/notes.txt"), "mitochondria notes").unwrap();

        let service = SearchService::builder(cfg).build().await.unwrap();
        service.start().await.unwrap();
        let report = service.crawl_now().await.unwrap();
        assert_eq!(report.submitted, 1);

        let request = SearchRequest::new("mitochondria", Identity::guest(), "lab");
        assert_eq!(service.search(&request).await.unwrap().total_hits, 1);

        let stats = service.indexer_stats().await;
        assert_eq!(stats.documents_indexed, 2, "file plus container page");
        assert!(stats.commits >= 1);
        assert!(stats.configuration_error.is_none());

        service.clear().await.unwrap();
        assert_eq!(service.search(&request).await.unwrap().total_hits, 0);
        let again = service.crawl_now().await.unwrap();
        assert_eq!(again.submitted, 1);
        assert_eq!(service.search(&request).await.unwrap().total_hits, 1);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn container_page_is_searchable() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cfg = config(
            tmp.path(),
            r#"
            [[containers]]
            id = "lab"
            name = "Organoid Core"
            readers = ["*"]
            "#,
        );
        let service = SearchService::builder(cfg).build().await.unwrap();
        service.start().await.unwrap();
        let task = service.index_container(None, "lab", None);
        assert!(task.wait_timeout(std::time::Duration::from_secs(5)).await);
        service.wait_for_idle().await;

        let request = SearchRequest::new("organoid", Identity::guest(), "lab");
        let result = service.search(&request).await.unwrap();
        assert_eq!(result.total_hits, 1);
        assert_eq!(result.hits[0].doc_id, "container:lab");
        service.shutdown().await;
    }

    #[tokio::test]
    async fn deletes_by_prefix_and_container() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cfg = config(tmp.path(), "");
        std::fs::create_dir_all(tmp.path().join("files/a")).unwrap();
        std::fs::write(tmp.path().join("files/a/one.txt"), "kinase").unwrap();
        std::fs::write(tmp.path().join("files/two.txt"), "kinase").unwrap();

        let service = SearchService::builder(cfg).build().await.unwrap();
        service.start().await.unwrap();
        service.crawl_now().await.unwrap();
        let request = SearchRequest::new("kinase", Identity::guest(), "lab");
        assert_eq!(service.search(&request).await.unwrap().total_hits, 2);

        service.delete_resources_for_prefix("file:/lab/a/");
        service.wait_for_idle().await;
        assert_eq!(service.search(&request).await.unwrap().total_hits, 1);

        service.delete_indexed_container("lab");
        service.wait_for_idle().await;
        assert_eq!(service.search(&request).await.unwrap().total_hits, 0);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn begin_defers_until_commit() {
        let tmp = tempfile::TempDir::new().unwrap();
        let service = SearchService::builder(config(tmp.path(), ""))
            .build()
            .await
            .unwrap();
        let mut ctx = service.begin().await.unwrap();
        ctx.defer(Work::delete("file:/lab/x.txt"), Priority::Background, None);
        assert!(!service.is_busy());
        ctx.commit().await.unwrap();
        assert!(service.is_busy());
    }

    #[tokio::test]
    async fn lost_index_file_is_refilled_on_restart() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("files")).unwrap();
        std::fs::write(tmp.path().join("files/notes.txt"), "ribosome notes").unwrap();
        let request = SearchRequest::new("ribosome", Identity::guest(), "lab");

        let service = SearchService::builder(config_kind(tmp.path(), "sqlite", ""))
            .build()
            .await
            .unwrap();
        service.start().await.unwrap();
        service.crawl_now().await.unwrap();
        assert_eq!(service.search(&request).await.unwrap().total_hits, 1);
        service.shutdown().await;
        drop(service);

        for name in ["index.sqlite", "index.sqlite-wal", "index.sqlite-shm"] {
            let _ = std::fs::remove_file(tmp.path().join(name));
        }

        let service = SearchService::builder(config_kind(tmp.path(), "sqlite", ""))
            .build()
            .await
            .unwrap();
        service.start().await.unwrap();
        let report = service.crawl_now().await.unwrap();
        assert_eq!(report.submitted, 1);
        assert_eq!(service.search(&request).await.unwrap().total_hits, 1);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn memory_index_is_refilled_after_restart() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("files")).unwrap();
        std::fs::write(tmp.path().join("files/notes.txt"), "ribosome notes").unwrap();

        let service = SearchService::builder(config(tmp.path(), "")).build().await.unwrap();
        service.start().await.unwrap();
        service.crawl_now().await.unwrap();
        service.shutdown().await;
        drop(service);

        let service = SearchService::builder(config(tmp.path(), "")).build().await.unwrap();
        service.start().await.unwrap();
        assert_eq!(service.crawl_now().await.unwrap().submitted, 1);
        let request = SearchRequest::new("ribosome", Identity::guest(), "lab");
        assert_eq!(service.search(&request).await.unwrap().total_hits, 1);
        // Nothing to resync once the index holds documents again.
        assert!(!service.resync_empty_index().await.unwrap());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn reinitialized_index_is_refilled() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("files")).unwrap();
        std::fs::write(tmp.path().join("files/notes.txt"), "ribosome notes").unwrap();
        let service = SearchService::builder(config(tmp.path(), "")).build().await.unwrap();
        service.start().await.unwrap();
        service.crawl_now().await.unwrap();

        service.reinitialize_index().await.unwrap();
        let request = SearchRequest::new("ribosome", Identity::guest(), "lab");
        assert_eq!(service.search(&request).await.unwrap().total_hits, 0);
        assert_eq!(service.crawl_now().await.unwrap().submitted, 1);
        assert_eq!(service.search(&request).await.unwrap().total_hits, 1);
        service.shutdown().await;
    }
}
