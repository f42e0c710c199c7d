//! Directory crawler.
//!
//! One long-running task claims due directories from the crawl state store,
//! diffs each live listing against the stored file states and feeds the
//! differences to the indexing pipeline:
//!
//! ```text
//!   idle ──▶ listing ──▶ diffing ──▶ submitting ──▶ rescheduling ──▶ idle
//!    ▲                                                                │
//!    └──────────── wait_for_idle / wake / poll interval ◀─────────────┘
//! ```
//!
//! A directory scheduled at or before the force sentinel gets a full pass:
//! its subdirectories are queued for an immediate recursive crawl and a
//! container root enumerates all of its documents. Any other pass only
//! registers new subdirectories and enumerates recent container documents.
//!
//! The crawler never runs ahead of the indexer: before claiming a batch it
//! waits for the pipeline to go idle.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crawldex_core::models::{sentinel, Priority};
use crawldex_core::path::ResourcePath;

use crate::config::CrawlerConfig;
use crate::crawl_state::{self, CrawlStateStore, DueCollection, FileState};
use crate::documents::DocumentProviders;
use crate::pipeline::{CoupledTransaction, IndexTask, Pipeline, Work};
use crate::rate_limit::CrawlLimits;
use crate::resource::{Resource, ResourceKind, ResourceProvider};

/// Version-control metadata directories.
const VCS_DIRS: [&str; 5] = [".git", ".svn", ".hg", "CVS", "_darcs"];

/// Files that mark a directory as the private storage of an embedded
/// database.
const DATABASE_MARKERS: [&str; 3] = ["service.properties", "PG_VERSION", "ibdata1"];

/// Outcome of one or more crawl passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CrawlReport {
    pub directories: usize,
    pub submitted: usize,
    pub deleted: usize,
    /// Directories dropped because they vanished or are skipped.
    pub dropped: usize,
}

impl CrawlReport {
    fn absorb(&mut self, other: CrawlReport) {
        self.directories += other.directories;
        self.submitted += other.submitted;
        self.deleted += other.deleted;
        self.dropped += other.dropped;
    }
}

pub struct Crawler {
    config: CrawlerConfig,
    state: Arc<CrawlStateStore>,
    provider: Arc<dyn ResourceProvider>,
    pipeline: Arc<Pipeline>,
    documents: Arc<DocumentProviders>,
    limits: CrawlLimits,
    wake: Notify,
    running: AtomicBool,
}

impl Crawler {
    pub fn new(
        config: CrawlerConfig,
        state: Arc<CrawlStateStore>,
        provider: Arc<dyn ResourceProvider>,
        pipeline: Arc<Pipeline>,
        documents: Arc<DocumentProviders>,
    ) -> Self {
        let limits = CrawlLimits::from_config(&config);
        Self {
            config,
            state,
            provider,
            pipeline,
            documents,
            limits,
            wake: Notify::new(),
            running: AtomicBool::new(false),
        }
    }

    /// Cuts the current idle wait short. A wake with nobody waiting is
    /// remembered for the next wait.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Crawl loop; returns once `cancel` fires. A directory already being
    /// crawled is finished first.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            batch_size = self.config.batch_size,
            poll_secs = self.config.poll_interval_secs,
            "crawler started"
        );
        let retry_every =
            std::time::Duration::from_secs_f64(self.config.retry_failed_hours.max(0.0) * 3600.0);
        let mut last_maintenance = Instant::now();

        while !cancel.is_cancelled() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.pipeline.wait_for_idle() => {}
            }

            if last_maintenance.elapsed() >= retry_every {
                last_maintenance = Instant::now();
                match self.state.clear_failed_markers(Utc::now()).await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(files = n, "cleared failed markers for retry"),
                    Err(e) => tracing::warn!(error = %format!("{e:#}"), "failed to clear failed markers"),
                }
            }

            match self.crawl_due(Utc::now(), true).await {
                Ok(report) if report.directories > 0 => continue,
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %format!("{e:#}"), "crawl pass failed"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }

        self.running.store(false, Ordering::SeqCst);
        tracing::info!("crawler stopped");
    }

    /// Claims one batch of directories due at `now` and crawls them.
    /// A failing directory is logged and left claimed, so it comes back
    /// after the grace window.
    pub async fn crawl_due(&self, now: DateTime<Utc>, blocking: bool) -> Result<CrawlReport> {
        let batch = self.state.due_batch(self.config.batch_size, now).await?;
        let mut report = CrawlReport::default();
        for due in batch {
            match self.crawl_one(&due, now, blocking).await {
                Ok(one) => report.absorb(one),
                Err(e) => {
                    tracing::warn!(path = %due.path, error = %format!("{e:#}"), "failed to crawl directory")
                }
            }
        }
        if report.directories > 0 {
            tracing::info!(
                directories = report.directories,
                submitted = report.submitted,
                deleted = report.deleted,
                dropped = report.dropped,
                "crawl batch finished"
            );
        }
        Ok(report)
    }

    /// Crawls batches until nothing is due at `now`, waiting for the
    /// pipeline to drain after each one. `blocking` is passed through to
    /// the rate limiters.
    pub async fn crawl_until_quiet(
        &self,
        now: DateTime<Utc>,
        blocking: bool,
    ) -> Result<CrawlReport> {
        let mut total = CrawlReport::default();
        loop {
            let report = self.crawl_due(now, blocking).await?;
            self.pipeline.wait_for_idle().await;
            if report.directories == 0 {
                return Ok(total);
            }
            total.absorb(report);
        }
    }

    async fn crawl_one(
        &self,
        due: &DueCollection,
        now: DateTime<Utc>,
        blocking: bool,
    ) -> Result<CrawlReport> {
        self.limits.directories.acquire(1.0, blocking).await;
        let path = &due.path;
        let mut report = CrawlReport {
            directories: 1,
            ..Default::default()
        };

        let resource = self.provider.resolve(&path.to_string()).await?;
        let listed = match resource.filter(|r| r.exists() && r.is_collection() && r.should_index()) {
            Some(dir) if path.name().map_or(true, |n| !is_skipped_dir_name(n)) => {
                let children = dir.list().await?;
                match skip_for_contents(&children, &self.config.no_crawl_marker) {
                    Some(reason) => Err(reason),
                    None => Ok((dir, children)),
                }
            }
            _ => Err("missing, not a directory, or excluded"),
        };
        let (dir, children) = match listed {
            Ok(listed) => listed,
            Err(reason) => {
                tracing::debug!(path = %path, reason, "dropping directory from the crawl");
                self.drop_directory(path).await?;
                report.dropped = 1;
                return Ok(report);
            }
        };

        let full = due.is_full_crawl();
        let task = self.pipeline.create_task(format!("crawl {path}"));
        let result = self
            .diff_and_submit(&task, dir.as_ref(), children, full, now, blocking)
            .await;
        task.set_ready();
        let (submitted, deleted) = result?;
        report.submitted = submitted;
        report.deleted = deleted;

        let next = now + self.recrawl_interval(dir.kind());
        self.state.update_path(path, Some(now), next, true).await?;
        tracing::debug!(
            path = %path,
            full,
            submitted,
            deleted,
            next_crawl = %next,
            "directory crawled"
        );
        Ok(report)
    }

    /// Forgets a directory and removes everything indexed beneath it.
    async fn drop_directory(&self, path: &ResourcePath) -> Result<()> {
        self.state.delete_path(path).await?;
        if !path.is_root() {
            let prefix = format!("{}/", self.provider.document_id(path));
            self.pipeline
                .submit(Work::DeletePrefix { prefix }, Priority::Background);
        }
        Ok(())
    }

    /// Returns (files submitted, files deleted).
    async fn diff_and_submit(
        &self,
        task: &Arc<IndexTask>,
        dir: &dyn Resource,
        children: Vec<Arc<dyn Resource>>,
        full: bool,
        now: DateTime<Utc>,
        blocking: bool,
    ) -> Result<(usize, usize)> {
        let path = dir.path();

        if let ResourceKind::ContainerRoot { container } = dir.kind() {
            let since = if full {
                None
            } else {
                Some(now - self.recrawl_base())
            };
            self.documents.enumerate(task, container, since);
        }

        let mut stored = self.state.file_states(path).await?;
        let mut submitted = 0;
        for child in children {
            let Some(name) = child.path().name().map(str::to_string) else {
                continue;
            };
            if child.is_collection() {
                if !is_skipped_dir_name(&name) {
                    self.schedule_subdirectory(child.path(), full, now).await?;
                }
                continue;
            }
            // Skipped files keep their stored entry and are deleted below.
            if is_hidden(&name) || !child.should_index() {
                continue;
            }
            let prior = stored.remove(&name);
            if !needs_index(prior.as_ref(), child.last_modified()) {
                continue;
            }
            self.limits.files.acquire(1.0, blocking).await;
            if let Some(size) = child.size() {
                self.limits.bytes.acquire(size as f64, blocking).await;
            }
            let work = if self.config.is_name_only(&name) {
                Work::add_name_only(child)
            } else {
                Work::add(child)
            };
            if task.add_work(work, Priority::Background) {
                submitted += 1;
            }
        }

        let deleted = self.delete_vanished(task, path, stored).await?;
        Ok((submitted, deleted))
    }

    async fn schedule_subdirectory(
        &self,
        child: &ResourcePath,
        full: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        // Deeper paths sort later, which keeps the walk roughly breadth first.
        let depth = Duration::seconds(child.depth() as i64);
        if full {
            let next = sentinel::force_crawl() - Duration::hours(1) + depth;
            self.state.update_path(child, None, next, true).await?;
        } else {
            self.state.insert_path_if_absent(child, now + depth).await?;
        }
        Ok(())
    }

    /// Deletes the documents and file states of names no longer listed.
    /// The index deletes are enqueued only once the state rows are gone.
    async fn delete_vanished(
        &self,
        task: &Arc<IndexTask>,
        dir: &ResourcePath,
        vanished: HashMap<String, FileState>,
    ) -> Result<usize> {
        if vanished.is_empty() {
            return Ok(0);
        }
        let mut names: Vec<String> = vanished.into_keys().collect();
        names.sort();

        let tx = self.state.pool().begin().await?;
        let mut ctx = CoupledTransaction::new(tx, self.pipeline.clone());
        crawl_state::delete_file_states_in(ctx.tx(), dir, &names).await?;
        for name in &names {
            let doc_id = self.provider.document_id(&dir.child(name));
            tracing::debug!(doc_id = %doc_id, "resource vanished");
            ctx.defer(Work::delete(doc_id), Priority::Background, Some(task));
        }
        Ok(ctx.commit().await?)
    }

    fn recrawl_base(&self) -> Duration {
        Duration::milliseconds((self.config.recrawl_interval_hours * 3_600_000.0) as i64)
    }

    /// Base interval, halved for container roots, times a random factor
    /// in [0.5, 1.5).
    fn recrawl_interval(&self, kind: &ResourceKind) -> Duration {
        let mut ms = self.config.recrawl_interval_hours * 3_600_000.0;
        if matches!(kind, ResourceKind::ContainerRoot { .. }) {
            ms /= 2.0;
        }
        let factor: f64 = rand::thread_rng().gen_range(0.5..1.5);
        Duration::milliseconds((ms * factor) as i64)
    }
}

/// Whether a file with `prior` stored state and live modification time
/// `live` has to be (re)submitted.
///
/// A failed file is retried only once it changes; clearing the failed
/// markers resets it to never indexed.
pub fn needs_index(prior: Option<&FileState>, live: Option<DateTime<Utc>>) -> bool {
    let Some(prior) = prior else {
        return true;
    };
    if prior.is_failed() {
        return prior.modified != live;
    }
    let Some(last_indexed) = prior.last_indexed else {
        return true;
    };
    match live {
        Some(live) => prior.modified != Some(live) || live > last_indexed,
        None => prior.modified.is_some(),
    }
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

fn is_skipped_dir_name(name: &str) -> bool {
    is_hidden(name) || VCS_DIRS.contains(&name)
}

/// Reason to skip a directory given its children.
fn skip_for_contents(children: &[Arc<dyn Resource>], marker: &str) -> Option<&'static str> {
    let names = || children.iter().filter_map(|c| c.path().name());
    if !marker.is_empty() && names().any(|n| n == marker) {
        return Some("no-crawl marker present");
    }
    if names().any(|n| DATABASE_MARKERS.contains(&n)) {
        return Some("embedded database directory");
    }
    None
}
