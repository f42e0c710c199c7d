//! In-memory [`SearchIndex`] for tests and small deployments.
//!
//! Writes go to a working segment behind a mutex. `commit` publishes a
//! shallow copy of it as a new immutable snapshot; searchers hold an `Arc`
//! to the snapshot they were created from, so readers never block the
//! writer. Search is a brute-force scan scored with [`Query::score`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;

use super::{HitFilter, IndexError, IndexResult, ScoredDoc, SearchIndex, Searcher, TopDocs};
use crate::models::{IndexedDocument, StoredFields};
use crate::query::{idf, DocFields, Field, Query, TermStats};

struct MemDoc {
    stored: StoredFields,
    fields: DocFields,
}

#[derive(Clone, Default)]
struct Segment {
    docs: HashMap<String, Arc<MemDoc>>,
    doc_freq: HashMap<(Field, String), u32>,
}

const FIELDS: [Field; 3] = [Field::Title, Field::Body, Field::Categories];

impl Segment {
    fn insert(&mut self, doc: IndexedDocument) {
        let uid = doc.stored.uid.clone();
        self.remove(&uid);
        let fields = DocFields::new(&doc.title, &doc.body, &doc.categories);
        for field in FIELDS {
            for token in fields.field(field).tokens() {
                *self.doc_freq.entry((field, token.to_string())).or_default() += 1;
            }
        }
        self.docs.insert(
            uid,
            Arc::new(MemDoc {
                stored: doc.stored,
                fields,
            }),
        );
    }

    fn remove(&mut self, uid: &str) -> bool {
        let Some(old) = self.docs.remove(uid) else {
            return false;
        };
        for field in FIELDS {
            for token in old.fields.field(field).tokens() {
                let key = (field, token.to_string());
                if let Some(n) = self.doc_freq.get_mut(&key) {
                    *n -= 1;
                    if *n == 0 {
                        self.doc_freq.remove(&key);
                    }
                }
            }
        }
        true
    }

    fn remove_where(&mut self, pred: impl Fn(&MemDoc) -> bool) -> usize {
        let doomed: Vec<String> = self
            .docs
            .iter()
            .filter(|(_, d)| pred(d))
            .map(|(uid, _)| uid.clone())
            .collect();
        for uid in &doomed {
            self.remove(uid);
        }
        doomed.len()
    }
}

impl TermStats for Segment {
    fn idf(&self, field: Field, token: &str) -> f32 {
        let df = self
            .doc_freq
            .get(&(field, token.to_string()))
            .copied()
            .unwrap_or(0);
        idf(self.docs.len(), df)
    }
}

struct MemSearcher {
    segment: Arc<Segment>,
    generation: u64,
}

#[async_trait]
impl Searcher for MemSearcher {
    async fn search(
        &self,
        query: &Query,
        filter: &dyn HitFilter,
        limit: usize,
    ) -> IndexResult<TopDocs> {
        let segment = self.segment.as_ref();
        let candidates = segment.docs.values().filter_map(|doc| {
            query.score(&doc.fields, segment).map(|score| ScoredDoc {
                stored: doc.stored.clone(),
                score,
            })
        });
        Ok(TopDocs::collect(candidates, filter, limit))
    }

    async fn num_docs(&self) -> IndexResult<usize> {
        Ok(self.segment.docs.len())
    }

    fn generation(&self) -> u64 {
        self.generation
    }
}

/// In-memory index; see the module docs.
pub struct InMemoryIndex {
    /// `None` once closed.
    working: Mutex<Option<Segment>>,
    published: RwLock<Arc<MemSearcher>>,
    generation: AtomicU64,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self {
            working: Mutex::new(Some(Segment::default())),
            published: RwLock::new(Arc::new(MemSearcher {
                segment: Arc::new(Segment::default()),
                generation: 0,
            })),
            generation: AtomicU64::new(0),
        }
    }

    fn with_working<T>(&self, f: impl FnOnce(&mut Segment) -> T) -> IndexResult<T> {
        let mut guard = self.working.lock().unwrap();
        let segment = guard.as_mut().ok_or(IndexError::Closed)?;
        Ok(f(segment))
    }

    fn publish(&self, segment: Segment) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.published.write().unwrap() = Arc::new(MemSearcher {
            segment: Arc::new(segment),
            generation,
        });
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SearchIndex for InMemoryIndex {
    async fn add(&self, doc: IndexedDocument) -> IndexResult<()> {
        self.with_working(|seg| seg.insert(doc))
    }

    async fn delete(&self, uid: &str) -> IndexResult<()> {
        self.with_working(|seg| {
            seg.remove(uid);
        })
    }

    async fn delete_by_query(&self, query: &Query) -> IndexResult<usize> {
        self.with_working(|seg| seg.remove_where(|d| query.matches(&d.fields)))
    }

    async fn delete_container(&self, container: &str) -> IndexResult<()> {
        self.with_working(|seg| {
            seg.remove_where(|d| d.stored.container == container);
        })
    }

    async fn delete_prefix(&self, uid_prefix: &str) -> IndexResult<usize> {
        self.with_working(|seg| seg.remove_where(|d| d.stored.uid.starts_with(uid_prefix)))
    }

    async fn commit(&self) -> IndexResult<()> {
        let snapshot = self.with_working(|seg| seg.clone())?;
        self.publish(snapshot);
        Ok(())
    }

    async fn clear(&self) -> IndexResult<()> {
        self.with_working(|seg| *seg = Segment::default())?;
        self.publish(Segment::default());
        Ok(())
    }

    async fn close(&self) -> IndexResult<()> {
        self.working.lock().unwrap().take();
        Ok(())
    }

    async fn searcher(&self) -> IndexResult<Arc<dyn Searcher>> {
        let searcher: Arc<MemSearcher> = self.published.read().unwrap().clone();
        Ok(searcher)
    }
}
