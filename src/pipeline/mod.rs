//! The indexing pipeline.
//!
//! Three stages run as tokio tasks:
//!
//! | Stage | Input | Consumers |
//! |-------|-------|-----------|
//! | run | [`PriorityQueue`] of jobs and deletes | 1 |
//! | preprocess | [`PriorityQueue`] of adds | `preprocess_workers` |
//! | index | bounded `async_channel` of built documents | `index_workers` |
//!
//! A separate committer task commits after `commit_idle` without index
//! activity. Workers also commit when more than `commit_max_docs` documents
//! are uncommitted, and when the last pending item finishes (end of burst).
//!
//! Every item reaches exactly one terminal state and reports it to its
//! [`IndexTask`] through its [`Completion`](item::Completion). A failed add
//! stamps the resource with the failed sentinel so the crawler leaves it
//! alone until the markers are cleared. A successful add is stamped only
//! once the commit holding it succeeds; writes lost with a failed commit
//! are stamped failed instead.

pub mod deferred;
pub mod item;
pub mod queue;
pub mod task;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crawldex_core::hits;
use crawldex_core::index::IndexResult;
use crawldex_core::models::{sentinel, IndexOperation, IndexedDocument, Priority, StoredFields};

use crate::config::Config;
use crate::db;
use crate::diagnostics::DiagnosticsSink;
use crate::extract::{ExtractError, ParserChain};
use crate::index_handle::IndexHandle;
use crate::resource::{Resource, ResourceProvider};
use crate::stats::{IndexerCounters, QueueDepths};

pub use deferred::CoupledTransaction;
pub use item::{Completion, Item, Job, Work};
pub use queue::{Pop, PriorityQueue};
pub use task::{IndexTask, ItemSink, TaskProgress, TaskRegistry};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub preprocess_workers: usize,
    pub index_workers: usize,
    pub index_queue_capacity: usize,
    pub preprocess_retries: u32,
    pub max_file_bytes: u64,
    pub poll_timeout: Duration,
    pub commit_max_docs: usize,
    pub commit_idle: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            preprocess_workers: config.pipeline.preprocess_workers,
            index_workers: config.pipeline.effective_index_workers(),
            index_queue_capacity: config.pipeline.index_queue_capacity,
            preprocess_retries: config.pipeline.preprocess_retries.max(1),
            max_file_bytes: config.pipeline.max_file_bytes,
            poll_timeout: Duration::from_millis(config.pipeline.poll_timeout_ms),
            commit_max_docs: config.index.commit_max_docs,
            commit_idle: config.commit_idle(),
        }
    }
}

/// A document ready for the index stage.
struct Prepared {
    id: String,
    doc: IndexedDocument,
    resource: Arc<dyn Resource>,
    modified: Option<DateTime<Utc>>,
    completion: Completion,
}

/// An index write waiting for its commit before the resource is stamped.
struct Unstamped {
    id: String,
    resource: Arc<dyn Resource>,
    modified: Option<DateTime<Utc>>,
}

pub struct Pipeline {
    settings: PipelineSettings,
    provider: Arc<dyn ResourceProvider>,
    index: Arc<IndexHandle>,
    parsers: Arc<ParserChain>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    run_queue: PriorityQueue<Item>,
    preprocess_queue: PriorityQueue<Item>,
    index_tx: async_channel::Sender<Prepared>,
    index_rx: async_channel::Receiver<Prepared>,
    tasks: TaskRegistry,
    counters: IndexerCounters,
    /// Items submitted and not yet in a terminal state.
    pending: Mutex<usize>,
    idle: Notify,
    uncommitted: AtomicUsize,
    unstamped: Mutex<Vec<Unstamped>>,
    last_index_event: Mutex<Instant>,
    commit_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    pub fn new(
        settings: PipelineSettings,
        provider: Arc<dyn ResourceProvider>,
        index: Arc<IndexHandle>,
        parsers: Arc<ParserChain>,
        diagnostics: Arc<dyn DiagnosticsSink>,
    ) -> Arc<Self> {
        let (index_tx, index_rx) = async_channel::bounded(settings.index_queue_capacity.max(1));
        Arc::new(Self {
            settings,
            provider,
            index,
            parsers,
            diagnostics,
            run_queue: PriorityQueue::default(),
            preprocess_queue: PriorityQueue::default(),
            index_tx,
            index_rx,
            tasks: TaskRegistry::default(),
            counters: IndexerCounters::default(),
            pending: Mutex::new(0),
            idle: Notify::new(),
            uncommitted: AtomicUsize::new(0),
            unstamped: Mutex::new(Vec::new()),
            last_index_event: Mutex::new(Instant::now()),
            commit_lock: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Spawns the stage workers and the committer.
    pub fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().unwrap();
        if !workers.is_empty() {
            return;
        }
        workers.push(tokio::spawn(self.clone().run_loop()));
        for n in 0..self.settings.preprocess_workers {
            workers.push(tokio::spawn(self.clone().preprocess_loop(n)));
        }
        for n in 0..self.settings.index_workers {
            workers.push(tokio::spawn(self.clone().index_loop(n)));
        }
        workers.push(tokio::spawn(self.clone().commit_loop()));
        tracing::info!(
            preprocess_workers = self.settings.preprocess_workers,
            index_workers = self.settings.index_workers,
            "indexing pipeline started"
        );
    }

    /// Stops every worker at its next wait, then commits what was indexed.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in workers {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "pipeline worker ended abnormally");
            }
        }
        self.commit_if_dirty("shutdown").await;
        tracing::info!("indexing pipeline stopped");
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn create_task(self: &Arc<Self>, description: impl Into<String>) -> Arc<IndexTask> {
        let sink: Weak<dyn ItemSink> = Arc::downgrade(self) as Weak<dyn ItemSink>;
        let task = IndexTask::new(description, sink);
        self.tasks.register(task.clone());
        task
    }

    /// Submits work that no task tracks.
    pub fn submit(&self, work: Work, priority: Priority) {
        self.enqueue(Item::new(work, priority, None));
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    pub fn counters(&self) -> &IndexerCounters {
        &self.counters
    }

    pub fn index(&self) -> &Arc<IndexHandle> {
        &self.index
    }

    pub fn uncommitted(&self) -> usize {
        self.uncommitted.load(Ordering::SeqCst)
    }

    pub fn queue_depths(&self) -> QueueDepths {
        QueueDepths {
            run: self.run_queue.len(),
            preprocess: self.preprocess_queue.len(),
            index: self.index_rx.len(),
            pending: *self.pending.lock().unwrap(),
        }
    }

    pub fn is_busy(&self) -> bool {
        *self.pending.lock().unwrap() > 0
    }

    /// Returns once nothing is pending, including the end-of-burst commit.
    pub async fn wait_for_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_busy() {
                return;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.settings.poll_timeout) => {}
                _ = self.cancel.cancelled() => return,
            }
        }
    }

    /// Commits now, whether or not anything is uncommitted.
    pub async fn commit(&self) -> IndexResult<()> {
        let _guard = self.commit_lock.lock().await;
        self.commit_locked("requested").await
    }

    async fn commit_if_dirty(&self, reason: &'static str) {
        let _guard = self.commit_lock.lock().await;
        if self.uncommitted() == 0 {
            return;
        }
        if let Err(e) = self.commit_locked(reason).await {
            tracing::error!(reason, error = %e, "index commit failed");
        }
    }

    /// Caller holds `commit_lock`.
    async fn commit_locked(&self, reason: &'static str) -> IndexResult<()> {
        let docs = self.uncommitted.swap(0, Ordering::SeqCst);
        let stamps = std::mem::take(&mut *self.unstamped.lock().unwrap());
        match self.index.commit().await {
            Ok(()) => {
                self.counters.record_commit(Utc::now());
                tracing::debug!(reason, docs, "index committed");
                // A fatal error elsewhere may have swapped the instance
                // these writes went to.
                let kept = !self.index.is_degraded();
                self.stamp(stamps, kept).await;
                Ok(())
            }
            Err(e) => {
                if e.is_fatal() {
                    self.stamp(stamps, false).await;
                } else {
                    self.uncommitted.fetch_add(docs, Ordering::SeqCst);
                    self.unstamped.lock().unwrap().extend(stamps);
                }
                Err(e)
            }
        }
    }

    /// Records committed writes as indexed, lost ones as failed.
    async fn stamp(&self, stamps: Vec<Unstamped>, committed: bool) {
        if stamps.is_empty() {
            return;
        }
        let indexed = if committed {
            Utc::now()
        } else {
            tracing::warn!(docs = stamps.len(), "uncommitted index writes lost; marked failed");
            sentinel::failed()
        };
        for Unstamped {
            id,
            resource,
            modified,
        } in stamps
        {
            if let Err(e) = resource.set_last_indexed(indexed, modified).await {
                tracing::warn!(resource = %id, error = %format!("{e:#}"), "failed to record indexed state");
            }
        }
    }

    /// Counts one index write; returns the uncommitted total.
    fn mark_dirty(&self) -> usize {
        *self.last_index_event.lock().unwrap() = Instant::now();
        self.uncommitted.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Retires one pending item. The last one out commits before retiring,
    /// so idle waiters see committed results.
    async fn finish_item(&self) {
        let commit_first = {
            let mut pending = self.pending.lock().unwrap();
            if *pending == 1 && self.uncommitted() > 0 {
                true
            } else {
                *pending = pending.saturating_sub(1);
                false
            }
        };
        if commit_first {
            self.commit_if_dirty("drain").await;
            let mut pending = self.pending.lock().unwrap();
            *pending = pending.saturating_sub(1);
        }
        if !self.is_busy() {
            self.idle.notify_waiters();
        }
    }

    // ── run stage ───────────────────────────────────────────────────────

    async fn run_loop(self: Arc<Self>) {
        loop {
            match self.run_queue.pop(&self.cancel, self.settings.poll_timeout).await {
                Pop::Cancelled => break,
                Pop::Timeout => continue,
                Pop::Item(item) => {
                    self.run_item(item).await;
                    self.finish_item().await;
                }
            }
        }
    }

    async fn run_item(&self, item: Item) {
        let (work, completion) = item.into_parts();
        match work {
            Work::Run { description, job } => match tokio::spawn(job()).await {
                Ok(Ok(())) => completion.succeeded(),
                Ok(Err(e)) => {
                    tracing::warn!(job = %description, error = %format!("{e:#}"), "background job failed");
                    completion.failed();
                }
                Err(e) => {
                    tracing::error!(job = %description, error = %e, "background job panicked");
                    self.diagnostics.report("job", &description, &e.to_string());
                    completion.failed();
                }
            },
            Work::Index {
                op: IndexOperation::Delete,
                id,
                ..
            } => match self.index.delete(&id).await {
                Ok(()) => {
                    self.counters.record_deleted();
                    self.mark_dirty();
                    tracing::debug!(doc_id = %id, "document deleted");
                    completion.succeeded();
                }
                Err(e) => {
                    tracing::warn!(doc_id = %id, error = %e, "delete failed");
                    self.counters.record_failed();
                    completion.failed();
                }
            },
            Work::DeletePrefix { prefix } => match self.index.delete_prefix(&prefix).await {
                Ok(removed) => {
                    for _ in 0..removed {
                        self.counters.record_deleted();
                        self.mark_dirty();
                    }
                    tracing::debug!(prefix = %prefix, removed, "documents deleted");
                    completion.succeeded();
                }
                Err(e) => {
                    tracing::warn!(prefix = %prefix, error = %e, "prefix delete failed");
                    completion.failed();
                }
            },
            Work::DeleteContainer { container } => {
                match self.index.delete_container(&container).await {
                    Ok(()) => {
                        self.mark_dirty();
                        tracing::debug!(container = %container, "container documents deleted");
                        completion.succeeded();
                    }
                    Err(e) => {
                        tracing::warn!(container = %container, error = %e, "container delete failed");
                        completion.failed();
                    }
                }
            }
            Work::Index { op, id, .. } => {
                tracing::warn!(?op, id = %id, "add reached the run queue; dropped");
                completion.failed();
            }
        }
    }

    // ── preprocess stage ────────────────────────────────────────────────

    async fn preprocess_loop(self: Arc<Self>, worker: usize) {
        tracing::debug!(worker, "preprocess worker started");
        loop {
            match self
                .preprocess_queue
                .pop(&self.cancel, self.settings.poll_timeout)
                .await
            {
                Pop::Cancelled => break,
                Pop::Timeout => continue,
                Pop::Item(item) => {
                    if !self.preprocess(item).await {
                        self.finish_item().await;
                    }
                }
            }
        }
    }

    /// Builds the document for one add. Returns true when it was handed to
    /// the index stage, which then owns the pending slot.
    async fn preprocess(&self, item: Item) -> bool {
        let (work, completion) = item.into_parts();
        let Work::Index { op, id, resource } = work else {
            tracing::warn!("job reached the preprocess queue; dropped");
            completion.failed();
            return false;
        };

        let resource = match resource {
            Some(r) => Some(r),
            None => self.resolve(&id).await,
        };
        let Some(resource) = resource.filter(|r| r.exists() && !r.is_collection()) else {
            tracing::debug!(resource = %id, "resource is gone or not a document");
            self.counters.record_failed();
            completion.failed();
            return false;
        };
        if !resource.should_index() {
            tracing::debug!(resource = %id, "resource excluded from indexing");
            completion.succeeded();
            return false;
        }

        let modified = resource.last_modified();
        let mut attempt = 0;
        let built = loop {
            attempt += 1;
            match self.build_document(op, resource.as_ref()).await {
                Err(e)
                    if attempt < self.settings.preprocess_retries && db::is_transient_any(&e) =>
                {
                    tracing::debug!(resource = %id, attempt, "storage busy; retrying preprocess");
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                }
                other => break other,
            }
        };

        match built {
            Ok(doc) => {
                let prepared = Prepared {
                    id,
                    doc,
                    resource,
                    modified,
                    completion,
                };
                tokio::select! {
                    sent = self.index_tx.send(prepared) => sent.is_ok(),
                    _ = self.cancel.cancelled() => false,
                }
            }
            Err(e) => {
                self.fail(&id, Some(resource.as_ref()), e, completion).await;
                false
            }
        }
    }

    async fn resolve(&self, id: &str) -> Option<Arc<dyn Resource>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.provider.resolve(id).await {
                Ok(found) => return found,
                Err(e) if attempt < self.settings.preprocess_retries && db::is_transient_any(&e) => {
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                }
                Err(e) => {
                    tracing::warn!(resource = %id, error = %format!("{e:#}"), "failed to resolve resource");
                    return None;
                }
            }
        }
    }

    async fn build_document(
        &self,
        op: IndexOperation,
        resource: &dyn Resource,
    ) -> anyhow::Result<IndexedDocument> {
        let name = resource.path().name().unwrap_or_default().to_string();
        let (parsed_title, body) = if op == IndexOperation::AddNameOnly {
            (None, String::new())
        } else {
            let bytes = resource.read_content(self.settings.max_file_bytes).await?;
            let parsers = self.parsers.clone();
            let file_name = name.clone();
            let parsed = tokio::task::spawn_blocking(move || parsers.parse(&file_name, &bytes))
                .await
                .context("parser task failed")??;
            (parsed.title, parsed.body)
        };
        Ok(make_document(resource, &name, parsed_title, body))
    }

    async fn fail(
        &self,
        id: &str,
        resource: Option<&dyn Resource>,
        err: anyhow::Error,
        completion: Completion,
    ) {
        match err.downcast_ref::<ExtractError>() {
            Some(extract) if !extract.is_expected() => {
                tracing::error!(resource = %id, error = %extract, "unexpected failure extracting content");
                self.diagnostics.report("extract", id, &extract.to_string());
            }
            Some(extract) => {
                tracing::warn!(resource = %id, reason = %extract, "could not index resource");
            }
            None => {
                tracing::warn!(resource = %id, reason = %format!("{err:#}"), "could not index resource");
            }
        }
        if let Some(resource) = resource {
            if let Err(e) = resource
                .set_last_indexed(sentinel::failed(), resource.last_modified())
                .await
            {
                tracing::warn!(resource = %id, error = %format!("{e:#}"), "failed to record index failure");
            }
        }
        self.counters.record_failed();
        completion.failed();
    }

    // ── index stage ─────────────────────────────────────────────────────

    async fn index_loop(self: Arc<Self>, worker: usize) {
        tracing::debug!(worker, "index worker started");
        loop {
            let prepared = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = self.index_rx.recv() => match received {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            self.index_prepared(prepared).await;
            self.finish_item().await;
        }
    }

    async fn index_prepared(&self, prepared: Prepared) {
        let Prepared {
            id,
            doc,
            resource,
            modified,
            completion,
        } = prepared;

        // Degraded mode would swallow the write; fail it so it is retried
        // once the index is back.
        let result = if self.index.is_degraded() {
            Err(anyhow::anyhow!("index is unavailable"))
        } else {
            self.index.add(doc).await.map_err(anyhow::Error::from)
        };
        if let Err(e) = result {
            self.fail(&id, Some(resource.as_ref()), e, completion).await;
            return;
        }

        self.counters.record_indexed();
        tracing::debug!(resource = %id, "indexed");
        // Queued before counting, so a commit that takes the count also
        // takes the stamp.
        self.unstamped.lock().unwrap().push(Unstamped {
            id,
            resource,
            modified,
        });
        let uncommitted = self.mark_dirty();
        completion.succeeded();

        if uncommitted > self.settings.commit_max_docs {
            self.commit_if_dirty("volume").await;
        }
    }

    // ── committer ───────────────────────────────────────────────────────

    async fn commit_loop(self: Arc<Self>) {
        let period = (self.settings.commit_idle / 4).max(Duration::from_millis(25));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.uncommitted() == 0 || !self.run_queue.is_empty() {
                continue;
            }
            let quiet_for = self.last_index_event.lock().unwrap().elapsed();
            if quiet_for >= self.settings.commit_idle {
                self.commit_if_dirty("idle").await;
            }
        }
    }
}

impl ItemSink for Pipeline {
    fn enqueue(&self, item: Item) {
        *self.pending.lock().unwrap() += 1;
        if item.work.runs_on_run_queue() {
            self.run_queue.push(item.priority, item);
        } else {
            self.preprocess_queue.push(item.priority, item);
        }
    }

    fn task_finished(&self, id: Uuid) {
        self.tasks.remove(id);
    }
}

/// Shapes the searchable and stored fields of a resource.
fn make_document(
    resource: &dyn Resource,
    name: &str,
    parsed_title: Option<String>,
    body: String,
) -> IndexedDocument {
    let props = resource.properties();
    let parsed_title = parsed_title.filter(|t| !t.trim().is_empty());
    let search_title = props.search_title.unwrap_or_else(|| name.to_string());
    let title = match &parsed_title {
        Some(t) if !t.eq_ignore_ascii_case(&search_title) => format!("{} {}", t, search_title),
        _ => search_title,
    };
    let summary = hits::summarize(parsed_title.as_deref().unwrap_or(&title), &body);
    IndexedDocument {
        stored: StoredFields {
            uid: resource.document_id(),
            container: resource.container_id().unwrap_or_default(),
            resource_id: props.securable_resource_id,
            url: resource.url(),
            display_title: props
                .display_title
                .or(parsed_title)
                .or_else(|| Some(name.to_string())),
            title: title.clone(),
            summary,
            navtrail: props.navtrail,
        },
        title,
        body,
        categories: props.categories,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::CollectingDiagnostics;
    use crate::resource::{ResourceKind, ResourceProperties};
    use async_trait::async_trait;
    use crawldex_core::index::memory::InMemoryIndex;
    use crawldex_core::index::{AcceptAll, IndexError, SearchIndex, Searcher};
    use crawldex_core::path::ResourcePath;
    use crawldex_core::query::Query;
    use std::collections::HashMap;

    /// In-memory resource whose content and outcome stamps tests control.
    struct FakeResource {
        path: ResourcePath,
        kind: ResourceKind,
        content: Option<Vec<u8>>,
        stamps: Arc<Mutex<Vec<(String, DateTime<Utc>)>>>,
    }

    #[async_trait]
    impl Resource for FakeResource {
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
            format!("fake:{}", self.path)
        }
        fn container_id(&self) -> Option<String> {
            Some("c".into())
        }
        fn url(&self) -> String {
            format!("/files{}", self.path)
        }
        fn last_modified(&self) -> Option<DateTime<Utc>> {
            None
        }
        fn size(&self) -> Option<u64> {
            self.content.as_ref().map(|c| c.len() as u64)
        }
        fn properties(&self) -> ResourceProperties {
            ResourceProperties {
                categories: vec!["file".into()],
                ..Default::default()
            }
        }
        async fn list(&self) -> anyhow::Result<Vec<Arc<dyn Resource>>> {
            Ok(Vec::new())
        }
        async fn read_content(&self, _max_bytes: u64) -> anyhow::Result<Vec<u8>> {
            match &self.content {
                Some(c) => Ok(c.clone()),
                None => Err(ExtractError::Io(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "denied",
                ))
                .into()),
            }
        }
        async fn set_last_indexed(
            &self,
            indexed: DateTime<Utc>,
            _modified: Option<DateTime<Utc>>,
        ) -> anyhow::Result<()> {
            self.stamps.lock().unwrap().push((self.path.to_string(), indexed));
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeProvider {
        files: Mutex<HashMap<String, Option<Vec<u8>>>>,
        stamps: Arc<Mutex<Vec<(String, DateTime<Utc>)>>>,
    }

    impl FakeProvider {
        fn put(&self, path: &str, content: Option<&str>) {
            self.files
                .lock()
                .unwrap()
                .insert(path.to_string(), content.map(|c| c.as_bytes().to_vec()));
        }
    }

    #[async_trait]
    impl ResourceProvider for FakeProvider {
        async fn resolve(&self, id: &str) -> anyhow::Result<Option<Arc<dyn Resource>>> {
            let files = self.files.lock().unwrap();
            Ok(files.get(id).map(|content| {
                Arc::new(FakeResource {
                    path: ResourcePath::parse(id).unwrap(),
                    kind: ResourceKind::File,
                    content: content.clone(),
                    stamps: self.stamps.clone(),
                }) as Arc<dyn Resource>
            }))
        }

        fn document_id(&self, path: &ResourcePath) -> String {
            format!("fake:{}", path)
        }
    }

    async fn pipeline(
        commit_max_docs: usize,
        commit_idle: Duration,
    ) -> (tempfile::TempDir, Arc<FakeProvider>, Arc<Pipeline>) {
        pipeline_with(commit_max_docs, commit_idle, None).await
    }

    async fn pipeline_with(
        commit_max_docs: usize,
        commit_idle: Duration,
        index: Option<Arc<dyn SearchIndex>>,
    ) -> (tempfile::TempDir, Arc<FakeProvider>, Arc<Pipeline>) {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config::from_toml_str(&format!(
            "[db]\npath = {:?}\n[index]\nkind = \"memory\"\n",
            tmp.path().join("state.sqlite")
        ))
        .unwrap();
        let provider = Arc::new(FakeProvider::default());
        let settings = PipelineSettings {
            commit_max_docs,
            commit_idle,
            poll_timeout: Duration::from_millis(50),
            index_workers: 2,
            ..PipelineSettings::from_config(&config)
        };
        let index = match index {
            Some(index) => Arc::new(IndexHandle::with_index(index)),
            None => Arc::new(IndexHandle::open(&config).await),
        };
        let p = Pipeline::new(
            settings,
            provider.clone(),
            index,
            Arc::new(ParserChain::default()),
            Arc::new(CollectingDiagnostics::default()),
        );
        p.start();
        (tmp, provider, p)
    }

    async fn hits(p: &Pipeline, q: &str) -> usize {
        p.index()
            .search(&Query::parse(q).unwrap(), &AcceptAll, 100)
            .await
            .unwrap()
            .total_hits
    }

    #[tokio::test]
    async fn indexes_resources_and_completes_task() {
        let (_tmp, provider, p) = pipeline(10_000, Duration::from_secs(60)).await;
        provider.put("/lab/a.txt", Some("gene atlas"));
        provider.put("/lab/b.txt", Some("cohort map"));

        let task = p.create_task("two files");
        task.add_resource("/lab/a.txt", Priority::Background);
        task.add_resource("/lab/b.txt", Priority::Background);
        task.set_ready();
        assert!(task.wait_timeout(Duration::from_secs(5)).await);
        p.wait_for_idle().await;

        assert_eq!(task.indexed_count(), 2);
        assert_eq!(hits(&p, "gene").await, 1);
        assert_eq!(p.counters().indexed(), 2);
        assert!(p.tasks().is_empty());
        p.shutdown().await;
    }

    #[tokio::test]
    async fn failures_are_stamped_and_counted() {
        let (_tmp, provider, p) = pipeline(10_000, Duration::from_secs(60)).await;
        provider.put("/lab/ok.txt", Some("fine"));
        provider.put("/lab/locked.txt", None);

        let task = p.create_task("mixed");
        task.add_resource("/lab/ok.txt", Priority::Background);
        task.add_resource("/lab/locked.txt", Priority::Background);
        task.add_resource("/lab/missing.txt", Priority::Background);
        task.set_ready();
        assert!(task.wait_timeout(Duration::from_secs(5)).await);

        assert_eq!(task.estimated_count(), 3);
        assert_eq!(task.indexed_count(), 1);
        assert_eq!(task.failed_count(), 2);
        let stamps = provider.stamps.lock().unwrap().clone();
        assert!(stamps
            .iter()
            .any(|(path, ts)| path == "/lab/locked.txt" && sentinel::is_failed(ts)));
        p.shutdown().await;
    }

    #[tokio::test]
    async fn deletes_run_on_the_run_queue() {
        let (_tmp, provider, p) = pipeline(10_000, Duration::from_secs(60)).await;
        provider.put("/lab/a.txt", Some("gene"));
        let task = p.create_task("add");
        task.add_resource("/lab/a.txt", Priority::Background);
        task.set_ready();
        task.wait().await;
        p.wait_for_idle().await;
        assert_eq!(hits(&p, "gene").await, 1);

        p.submit(Work::delete("fake:/lab/a.txt"), Priority::Background);
        p.wait_for_idle().await;
        assert_eq!(hits(&p, "gene").await, 0);
        assert_eq!(p.counters().deleted(), 1);
        p.shutdown().await;
    }

    #[tokio::test]
    async fn runnables_can_add_to_their_task() {
        let (_tmp, provider, p) = pipeline(10_000, Duration::from_secs(60)).await;
        provider.put("/lab/late.txt", Some("late"));
        let task = p.create_task("job");
        let inner = task.clone();
        task.add_runnable(
            Work::run("enumerate", move || async move {
                inner.add_resource("/lab/late.txt", Priority::Background);
                Ok(())
            }),
            Priority::Background,
        );
        task.set_ready();
        assert!(task.wait_timeout(Duration::from_secs(5)).await);
        assert_eq!(task.estimated_count(), 2);
        assert_eq!(task.indexed_count(), 2);
        p.shutdown().await;
    }

    #[tokio::test]
    async fn volume_commits_happen_mid_burst() {
        let (_tmp, provider, p) = pipeline(5, Duration::from_secs(60)).await;
        let task = p.create_task("burst");
        for i in 0..12 {
            let path = format!("/lab/{i}.txt");
            provider.put(&path, Some("gene"));
            task.add_resource(path, Priority::Bulk);
        }
        task.set_ready();
        task.wait().await;
        p.wait_for_idle().await;
        assert!(p.counters().commits() >= 2);
        assert_eq!(hits(&p, "gene").await, 12);
        p.shutdown().await;
    }

    #[tokio::test]
    async fn single_document_commits_exactly_once() {
        let (_tmp, provider, p) = pipeline(10_000, Duration::from_millis(200)).await;
        provider.put("/lab/a.txt", Some("gene"));
        p.create_task("one").add_resource("/lab/a.txt", Priority::Background);
        p.wait_for_idle().await;
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(p.counters().commits(), 1);
        assert_eq!(p.uncommitted(), 0);
        p.shutdown().await;
    }

    #[tokio::test]
    async fn extracted_title_is_displayed() {
        let (_tmp, provider, p) = pipeline(10_000, Duration::from_secs(60)).await;
        provider.put(
            "/lab/index.html",
            Some("<html><head><title>Cryostat schedule</title></head><body>book it</body></html>"),
        );
        provider.put("/lab/notes.txt", Some("book the cryostat"));
        let task = p.create_task("titles");
        task.add_resource("/lab/index.html", Priority::Background);
        task.add_resource("/lab/notes.txt", Priority::Background);
        task.set_ready();
        task.wait().await;
        p.wait_for_idle().await;

        let top = p
            .index()
            .search(&Query::parse("book").unwrap(), &AcceptAll, 10)
            .await
            .unwrap();
        let mut titles: Vec<_> = top
            .docs
            .iter()
            .map(|d| d.stored.display_title.clone().unwrap_or_default())
            .collect();
        titles.sort();
        assert_eq!(titles, vec!["Cryostat schedule", "notes.txt"]);
        p.shutdown().await;
    }

    /// Accepts writes but loses them on commit.
    struct LosesCommits(InMemoryIndex);

    #[async_trait]
    impl SearchIndex for LosesCommits {
        async fn add(&self, doc: IndexedDocument) -> IndexResult<()> {
            self.0.add(doc).await
        }
        async fn delete(&self, uid: &str) -> IndexResult<()> {
            self.0.delete(uid).await
        }
        async fn delete_by_query(&self, query: &Query) -> IndexResult<usize> {
            self.0.delete_by_query(query).await
        }
        async fn delete_container(&self, container: &str) -> IndexResult<()> {
            self.0.delete_container(container).await
        }
        async fn delete_prefix(&self, uid_prefix: &str) -> IndexResult<usize> {
            self.0.delete_prefix(uid_prefix).await
        }
        async fn commit(&self) -> IndexResult<()> {
            Err(IndexError::Fatal("disk full".into()))
        }
        async fn clear(&self) -> IndexResult<()> {
            self.0.clear().await
        }
        async fn close(&self) -> IndexResult<()> {
            self.0.close().await
        }
        async fn searcher(&self) -> IndexResult<Arc<dyn Searcher>> {
            self.0.searcher().await
        }
    }

    #[tokio::test]
    async fn writes_lost_with_a_failed_commit_are_marked_failed() {
        let (_tmp, provider, p) = pipeline_with(
            10_000,
            Duration::from_secs(60),
            Some(Arc::new(LosesCommits(InMemoryIndex::new()))),
        )
        .await;
        provider.put("/lab/a.txt", Some("gene"));
        let task = p.create_task("one");
        task.add_resource("/lab/a.txt", Priority::Background);
        task.set_ready();
        task.wait().await;
        p.wait_for_idle().await;

        let stamps = provider.stamps.lock().unwrap().clone();
        assert_eq!(stamps.len(), 1, "{stamps:?}");
        assert_eq!(stamps[0].0, "/lab/a.txt");
        assert!(sentinel::is_failed(&stamps[0].1));
        assert!(p.index().is_degraded());
        p.shutdown().await;
    }

    #[tokio::test]
    async fn indexed_stamp_follows_the_commit() {
        let (_tmp, provider, p) = pipeline(10_000, Duration::from_secs(60)).await;
        provider.put("/lab/a.txt", Some("gene"));
        let task = p.create_task("one");
        task.add_resource("/lab/a.txt", Priority::Background);
        task.set_ready();
        task.wait().await;
        p.wait_for_idle().await;

        let stamps = provider.stamps.lock().unwrap().clone();
        assert_eq!(stamps.len(), 1);
        assert!(!sentinel::is_failed(&stamps[0].1));
        assert_eq!(p.counters().commits(), 1);
        p.shutdown().await;
    }
}
