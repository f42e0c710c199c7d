//! The pluggable index contract.
//!
//! A [`SearchIndex`] is the writer side: adds, deletes and commits are
//! serialized by the implementation, and nothing written becomes visible
//! until [`commit`](SearchIndex::commit). Readers call
//! [`searcher`](SearchIndex::searcher) to get a point-in-time view; the view
//! is an `Arc`, so releasing it is dropping it, which also happens on every
//! early-return and error path. Implementations hand out the same cached
//! searcher until the next commit.
//!
//! | Backend | Module |
//! |---------|--------|
//! | In-memory, copy-on-write snapshots | [`memory`] |
//! | Discards everything (degraded mode) | [`noop`] |
//! | SQLite FTS5 on disk | `crawldex::index_sqlite` |

pub mod memory;
pub mod noop;

use async_trait::async_trait;
use std::sync::Arc;

use crate::models::{IndexedDocument, StoredFields};
use crate::query::Query;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("index is closed")]
    Closed,
    /// The index instance is unusable and must be replaced.
    #[error("fatal index failure: {0}")]
    Fatal(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl IndexError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, IndexError::Fatal(_) | IndexError::Closed)
    }
}

pub type IndexResult<T> = Result<T, IndexError>;

/// Decides, per candidate hit, whether the caller may see it. Rejected
/// documents are neither returned nor counted.
pub trait HitFilter: Send + Sync {
    fn accept(&self, stored: &StoredFields) -> bool;
}

/// Accepts everything; for administrative queries.
pub struct AcceptAll;

impl HitFilter for AcceptAll {
    fn accept(&self, _stored: &StoredFields) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredDoc {
    pub stored: StoredFields,
    pub score: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopDocs {
    /// Accepted matches, before truncation.
    pub total_hits: usize,
    pub docs: Vec<ScoredDoc>,
}

impl TopDocs {
    /// Filters, ranks (score descending, uid ascending) and keeps the best
    /// `limit` candidates.
    pub fn collect(
        candidates: impl IntoIterator<Item = ScoredDoc>,
        filter: &dyn HitFilter,
        limit: usize,
    ) -> TopDocs {
        let mut docs: Vec<ScoredDoc> = candidates
            .into_iter()
            .filter(|d| filter.accept(&d.stored))
            .collect();
        let total_hits = docs.len();
        docs.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.stored.uid.cmp(&b.stored.uid))
        });
        docs.truncate(limit);
        TopDocs { total_hits, docs }
    }
}

/// A consistent, read-only view of the index as of one commit.
#[async_trait]
pub trait Searcher: Send + Sync {
    async fn search(
        &self,
        query: &Query,
        filter: &dyn HitFilter,
        limit: usize,
    ) -> IndexResult<TopDocs>;

    async fn num_docs(&self) -> IndexResult<usize>;

    /// Commit generation this view reflects.
    fn generation(&self) -> u64;
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Replaces any live document with the same uid.
    async fn add(&self, doc: IndexedDocument) -> IndexResult<()>;

    async fn delete(&self, uid: &str) -> IndexResult<()>;

    /// Returns the number of documents removed.
    async fn delete_by_query(&self, query: &Query) -> IndexResult<usize>;

    async fn delete_container(&self, container: &str) -> IndexResult<()>;

    /// Deletes every document whose uid starts with `uid_prefix`.
    async fn delete_prefix(&self, uid_prefix: &str) -> IndexResult<usize>;

    async fn commit(&self) -> IndexResult<()>;

    /// Drops every document, committed immediately.
    async fn clear(&self) -> IndexResult<()>;

    async fn close(&self) -> IndexResult<()>;

    async fn searcher(&self) -> IndexResult<Arc<dyn Searcher>>;

    /// True for the degraded-mode stand-in.
    fn is_noop(&self) -> bool {
        false
    }
}
