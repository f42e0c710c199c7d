//! Indexer statistics.
//!
//! [`IndexerCounters`] are bumped by the pipeline as items finish;
//! [`IndexerStats`] is the snapshot handed out by `SearchService::indexer_stats`,
//! `crawldex stats` and `GET /admin/stats`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crawldex_core::models::from_millis;

/// Running totals since startup.
#[derive(Default)]
pub struct IndexerCounters {
    indexed: AtomicU64,
    failed: AtomicU64,
    deleted: AtomicU64,
    commits: AtomicU64,
    /// Epoch millis of the last commit, 0 before the first.
    last_commit_ms: AtomicI64,
}

impl IndexerCounters {
    pub fn record_indexed(&self) {
        self.indexed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deleted(&self) {
        self.deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self, at: DateTime<Utc>) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.last_commit_ms.store(at.timestamp_millis(), Ordering::Relaxed);
    }

    pub fn indexed(&self) -> u64 {
        self.indexed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn deleted(&self) -> u64 {
        self.deleted.load(Ordering::Relaxed)
    }

    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    pub fn last_commit(&self) -> Option<DateTime<Utc>> {
        match self.last_commit_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(from_millis(ms)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueDepths {
    pub run: usize,
    pub preprocess: usize,
    pub index: usize,
    /// Submitted items not yet in a terminal state.
    pub pending: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexerStats {
    pub queues: QueueDepths,
    pub documents_indexed: u64,
    pub documents_failed: u64,
    pub documents_deleted: u64,
    pub uncommitted: usize,
    pub commits: u64,
    pub last_commit: Option<DateTime<Utc>>,
    pub active_tasks: usize,
    pub index_documents: Option<usize>,
    pub directories_known: i64,
    pub directories_due: i64,
    pub crawler_running: bool,
    pub configuration_error: Option<String>,
}

impl IndexerStats {
    /// Multi-line summary for the CLI.
    pub fn to_human(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "crawldex: indexer stats");
        let _ = writeln!(out, "=======================");
        let _ = writeln!(out);
        match self.index_documents {
            Some(n) => {
                let _ = writeln!(out, "  Index documents:  {}", n);
            }
            None => {
                let _ = writeln!(out, "  Index documents:  unavailable");
            }
        }
        let _ = writeln!(out, "  Indexed:          {}", self.documents_indexed);
        let _ = writeln!(out, "  Failed:           {}", self.documents_failed);
        let _ = writeln!(out, "  Deleted:          {}", self.documents_deleted);
        let _ = writeln!(out, "  Uncommitted:      {}", self.uncommitted);
        let _ = writeln!(
            out,
            "  Commits:          {} (last: {})",
            self.commits,
            self.last_commit
                .map(format_relative)
                .unwrap_or_else(|| "never".to_string())
        );
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "  Queues:           run {}  preprocess {}  index {}  pending {}",
            self.queues.run, self.queues.preprocess, self.queues.index, self.queues.pending
        );
        let _ = writeln!(out, "  Active tasks:     {}", self.active_tasks);
        let _ = writeln!(
            out,
            "  Directories:      {} known, {} due{}",
            self.directories_known,
            self.directories_due,
            if self.crawler_running { "" } else { " (crawler stopped)" }
        );
        if let Some(err) = &self.configuration_error {
            let _ = writeln!(out);
            let _ = writeln!(out, "  Configuration error: {}", err);
        }
        out
    }
}

/// Relative time string such as "3 hours ago".
fn format_relative(ts: DateTime<Utc>) -> String {
    let delta = (Utc::now() - ts).num_seconds();
    if delta < 0 {
        return ts.format("%Y-%m-%d %H:%M").to_string();
    }
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        ts.format("%Y-%m-%d %H:%M").to_string()
    }
}
