//! Data types shared by the crawler, pipeline, index backends and query
//! engine.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinel timestamps stored in the crawl state tables.
///
/// They are real instants far in the past so they order correctly against
/// live timestamps in SQL comparisons.
pub mod sentinel {
    use super::*;

    /// `nextCrawl` at or before this instant marks a forced full crawl.
    pub const FORCE_CRAWL_MS: i64 = -70_848_000_000; // 1967-10-04T00:00:00Z
    /// `lastIndexed` equal to this instant marks a failed index attempt.
    pub const FAILED_MS: i64 = -91_152_000_000; // 1967-02-11T00:00:00Z

    pub fn force_crawl() -> DateTime<Utc> {
        from_millis(FORCE_CRAWL_MS)
    }

    pub fn failed() -> DateTime<Utc> {
        from_millis(FAILED_MS)
    }

    pub fn is_failed(ts: &DateTime<Utc>) -> bool {
        ts.timestamp_millis() == FAILED_MS
    }
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Truncates to millisecond precision, the resolution the crawl state keeps.
pub fn truncate_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    from_millis(ts.timestamp_millis())
}

/// Queue priority. Higher priorities are dequeued first; there is no FIFO
/// guarantee within a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Commit,
    Crawl,
    Background,
    Bulk,
}

impl Priority {
    pub fn rank(self) -> u8 {
        match self {
            Priority::Commit => 3,
            Priority::Crawl => 2,
            Priority::Background => 1,
            Priority::Bulk => 0,
        }
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

/// What the pipeline should do with a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexOperation {
    /// Parse the content and index it.
    Add,
    /// Index a stand-in carrying only the name and URL.
    AddNameOnly,
    Delete,
}

/// Identity of a queued item: submissions with equal keys coalesce inside
/// one deferred batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemKey {
    pub op: IndexOperation,
    pub resource_id: String,
}

impl ItemKey {
    pub fn new(op: IndexOperation, resource_id: impl Into<String>) -> Self {
        Self {
            op,
            resource_id: resource_id.into(),
        }
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.op, self.resource_id)
    }
}

/// Well-known category tags.
pub mod category {
    pub const FILE: &str = "file";
    pub const NAVIGATION: &str = "navigation";
    pub const SUBJECT: &str = "subject";
}

/// Fields kept with a document for display but not searched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredFields {
    pub uid: String,
    pub container: String,
    /// Securable resource finer-grained than the container, if any.
    pub resource_id: Option<String>,
    pub url: String,
    pub display_title: Option<String>,
    /// The searchable title, kept for display fallback.
    pub title: String,
    pub summary: String,
    pub navtrail: Option<String>,
}

/// The queryable representation of one resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexedDocument {
    pub title: String,
    pub body: String,
    pub categories: Vec<String>,
    pub stored: StoredFields,
}

impl IndexedDocument {
    pub fn uid(&self) -> &str {
        &self.stored.uid
    }

    pub fn container(&self) -> &str {
        &self.stored.container
    }
}

/// One ranked search hit as returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub container: String,
    pub doc_id: String,
    pub summary: String,
    pub url: String,
    pub display_title: String,
    pub navtrail: Option<String>,
    pub score: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchResult {
    pub total_hits: usize,
    pub hits: Vec<SearchHit>,
}
