//! Stand-in index used after the real one failed to open or died.
//!
//! Every write succeeds and is discarded; every search is empty.

use std::sync::Arc;

use async_trait::async_trait;

use super::{HitFilter, IndexResult, SearchIndex, Searcher, TopDocs};
use crate::models::IndexedDocument;
use crate::query::Query;

pub struct NoopIndex;

struct EmptySearcher;

#[async_trait]
impl Searcher for EmptySearcher {
    async fn search(
        &self,
        _query: &Query,
        _filter: &dyn HitFilter,
        _limit: usize,
    ) -> IndexResult<TopDocs> {
        Ok(TopDocs::default())
    }

    async fn num_docs(&self) -> IndexResult<usize> {
        Ok(0)
    }

    fn generation(&self) -> u64 {
        0
    }
}

#[async_trait]
impl SearchIndex for NoopIndex {
    async fn add(&self, _doc: IndexedDocument) -> IndexResult<()> {
        Ok(())
    }

    async fn delete(&self, _uid: &str) -> IndexResult<()> {
        Ok(())
    }

    async fn delete_by_query(&self, _query: &Query) -> IndexResult<usize> {
        Ok(0)
    }

    async fn delete_container(&self, _container: &str) -> IndexResult<()> {
        Ok(())
    }

    async fn delete_prefix(&self, _uid_prefix: &str) -> IndexResult<usize> {
        Ok(0)
    }

    async fn commit(&self) -> IndexResult<()> {
        Ok(())
    }

    async fn clear(&self) -> IndexResult<()> {
        Ok(())
    }

    async fn close(&self) -> IndexResult<()> {
        Ok(())
    }

    async fn searcher(&self) -> IndexResult<Arc<dyn Searcher>> {
        Ok(Arc::new(EmptySearcher))
    }

    fn is_noop(&self) -> bool {
        true
    }
}
