//! Holder for the live index instance.
//!
//! Opening failures and fatal runtime errors do not take the service down:
//! the handle swaps in a [`NoopIndex`], records the reason as the
//! configuration error, and keeps serving empty results until
//! [`IndexHandle::reinitialize`] succeeds.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crawldex_core::index::memory::InMemoryIndex;
use crawldex_core::index::noop::NoopIndex;
use crawldex_core::index::{HitFilter, IndexError, IndexResult, SearchIndex, TopDocs};
use crawldex_core::models::IndexedDocument;
use crawldex_core::query::Query;

use crate::config::{Config, IndexKind};
use crate::index_sqlite::SqliteIndex;

pub struct IndexHandle {
    kind: IndexKind,
    path: PathBuf,
    current: RwLock<Arc<dyn SearchIndex>>,
    /// Bumped on every swap so a stale failure cannot replace a fresh index.
    epoch: AtomicU64,
    config_error: RwLock<Option<String>>,
}

async fn open_index(kind: IndexKind, path: &Path) -> anyhow::Result<Arc<dyn SearchIndex>> {
    Ok(match kind {
        IndexKind::Memory => Arc::new(InMemoryIndex::new()),
        IndexKind::Sqlite => Arc::new(SqliteIndex::open(path).await?),
    })
}

impl IndexHandle {
    pub async fn open(config: &Config) -> Self {
        let kind = config.index.kind;
        let path = config.index_path();
        let (index, error): (Arc<dyn SearchIndex>, _) = match open_index(kind, &path).await {
            Ok(index) => (index, None),
            Err(e) => {
                tracing::error!(error = %format!("{e:#}"), path = %path.display(), "failed to open index; searches will be empty");
                (Arc::new(NoopIndex), Some(format!("{e:#}")))
            }
        };
        Self {
            kind,
            path,
            current: RwLock::new(index),
            epoch: AtomicU64::new(0),
            config_error: RwLock::new(error),
        }
    }

    /// Wraps an instance the caller already opened.
    #[cfg(test)]
    pub(crate) fn with_index(index: Arc<dyn SearchIndex>) -> Self {
        Self {
            kind: IndexKind::Memory,
            path: PathBuf::new(),
            current: RwLock::new(index),
            epoch: AtomicU64::new(0),
            config_error: RwLock::new(None),
        }
    }

    pub fn current(&self) -> Arc<dyn SearchIndex> {
        self.current.read().unwrap().clone()
    }

    fn snapshot(&self) -> (u64, Arc<dyn SearchIndex>) {
        let guard = self.current.read().unwrap();
        (self.epoch.load(Ordering::SeqCst), guard.clone())
    }

    pub fn configuration_error(&self) -> Option<String> {
        self.config_error.read().unwrap().clone()
    }

    pub fn is_degraded(&self) -> bool {
        self.current().is_noop()
    }

    fn swap(&self, index: Arc<dyn SearchIndex>) -> Arc<dyn SearchIndex> {
        let mut guard = self.current.write().unwrap();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        std::mem::replace(&mut *guard, index)
    }

    /// Records a fatal failure of the instance seen at `epoch`.
    fn degrade(&self, epoch: u64, err: &IndexError) {
        {
            let mut guard = self.current.write().unwrap();
            if self.epoch.load(Ordering::SeqCst) != epoch || guard.is_noop() {
                return;
            }
            self.epoch.fetch_add(1, Ordering::SeqCst);
            *guard = Arc::new(NoopIndex);
        }
        tracing::error!(error = %err, "index failed; switched to degraded mode");
        *self.config_error.write().unwrap() = Some(err.to_string());
    }

    fn checked<T>(&self, epoch: u64, result: IndexResult<T>) -> IndexResult<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                self.degrade(epoch, e);
            }
        }
        result
    }

    /// Closes the current instance and opens a fresh one. Clears the
    /// configuration error on success.
    pub async fn reinitialize(&self) -> anyhow::Result<()> {
        match open_index(self.kind, &self.path).await {
            Ok(index) => {
                let old = self.swap(index);
                if let Err(e) = old.close().await {
                    tracing::debug!(error = %e, "closing replaced index");
                }
                *self.config_error.write().unwrap() = None;
                tracing::info!(path = %self.path.display(), "index reinitialized");
                Ok(())
            }
            Err(e) => {
                *self.config_error.write().unwrap() = Some(format!("{e:#}"));
                Err(e)
            }
        }
    }

    pub async fn add(&self, doc: IndexedDocument) -> IndexResult<()> {
        let (epoch, index) = self.snapshot();
        let res = index.add(doc).await;
        self.checked(epoch, res)
    }

    pub async fn delete(&self, uid: &str) -> IndexResult<()> {
        let (epoch, index) = self.snapshot();
        let res = index.delete(uid).await;
        self.checked(epoch, res)
    }

    pub async fn delete_by_query(&self, query: &Query) -> IndexResult<usize> {
        let (epoch, index) = self.snapshot();
        let res = index.delete_by_query(query).await;
        self.checked(epoch, res)
    }

    pub async fn delete_container(&self, container: &str) -> IndexResult<()> {
        let (epoch, index) = self.snapshot();
        let res = index.delete_container(container).await;
        self.checked(epoch, res)
    }

    pub async fn delete_prefix(&self, uid_prefix: &str) -> IndexResult<usize> {
        let (epoch, index) = self.snapshot();
        let res = index.delete_prefix(uid_prefix).await;
        self.checked(epoch, res)
    }

    pub async fn commit(&self) -> IndexResult<()> {
        let (epoch, index) = self.snapshot();
        let res = index.commit().await;
        self.checked(epoch, res)
    }

    pub async fn clear(&self) -> IndexResult<()> {
        let (epoch, index) = self.snapshot();
        let res = index.clear().await;
        self.checked(epoch, res)
    }

    pub async fn close(&self) -> IndexResult<()> {
        self.current().close().await
    }

    pub async fn search(
        &self,
        query: &Query,
        filter: &dyn HitFilter,
        limit: usize,
    ) -> IndexResult<TopDocs> {
        let (epoch, index) = self.snapshot();
        let res = match index.searcher().await {
            Ok(searcher) => searcher.search(query, filter, limit).await,
            Err(e) => Err(e),
        };
        self.checked(epoch, res)
    }

    pub async fn num_docs(&self) -> IndexResult<usize> {
        let (epoch, index) = self.snapshot();
        let res = match index.searcher().await {
            Ok(searcher) => searcher.num_docs().await,
            Err(e) => Err(e),
        };
        self.checked(epoch, res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crawldex_core::index::AcceptAll;
    use crawldex_core::models::StoredFields;

    fn config(kind: &str, dir: &std::path::Path) -> Config {
        Config::from_toml_str(&format!(
            r#"
            [db]
            path = "{}/state.sqlite"

            [index]
            kind = "{kind}"
            "#,
            dir.display()
        ))
        .unwrap()
    }

    fn doc(uid: &str) -> IndexedDocument {
        IndexedDocument {
            title: "gene".into(),
            stored: StoredFields {
                uid: uid.into(),
                container: "c".into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn memory_index_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let handle = IndexHandle::open(&config("memory", tmp.path())).await;
        assert!(handle.configuration_error().is_none());
        handle.add(doc("1")).await.unwrap();
        handle.commit().await.unwrap();
        let top = handle
            .search(&Query::parse("gene").unwrap(), &AcceptAll, 10)
            .await
            .unwrap();
        assert_eq!(top.total_hits, 1);
    }

    #[tokio::test]
    async fn unopenable_index_degrades_and_recovers() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cfg = config("sqlite", tmp.path());
        std::fs::write(cfg.index_path(), b"garbage that is certainly not sqlite, padded out").unwrap();

        let handle = IndexHandle::open(&cfg).await;
        assert!(handle.is_degraded());
        assert!(handle.configuration_error().is_some());
        handle.add(doc("1")).await.unwrap();
        assert_eq!(handle.num_docs().await.unwrap(), 0);

        std::fs::remove_file(cfg.index_path()).unwrap();
        handle.reinitialize().await.unwrap();
        assert!(!handle.is_degraded());
        assert!(handle.configuration_error().is_none());
    }

    #[tokio::test]
    async fn fatal_error_swaps_in_noop() {
        let tmp = tempfile::TempDir::new().unwrap();
        let handle = IndexHandle::open(&config("memory", tmp.path())).await;
        // A closed instance reports every write as fatal.
        handle.current().close().await.unwrap();
        assert!(handle.add(doc("1")).await.is_err());
        assert!(handle.is_degraded());
        assert!(handle.configuration_error().is_some());
        assert!(handle.add(doc("2")).await.is_ok());
    }
}
