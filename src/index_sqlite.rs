//! On-disk index on SQLite FTS5.
//!
//! Documents live in the `docs_fts` virtual table; `doc_ids` maps each uid
//! (and its container) to the FTS rowid so replace and delete are cheap.
//! The writer keeps one transaction open between commits, so readers on
//! other pool connections only ever see committed state (WAL).
//!
//! A query is translated into an FTS5 `MATCH` expression that selects a
//! superset of the matching documents; the exact match decision and the
//! score come from [`Query::score`], the same scorer the in-memory index
//! uses, fed with document frequencies from an `fts5vocab` table.

use anyhow::Context;
use async_trait::async_trait;
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, MutexGuard};

use crawldex_core::index::{
    HitFilter, IndexError, IndexResult, ScoredDoc, SearchIndex, Searcher, TopDocs,
};
use crawldex_core::models::{IndexedDocument, StoredFields};
use crawldex_core::query::{DocFields, Field, FrequencyTable, Occur, Query};

use crate::db;

type Tx = Transaction<'static, Sqlite>;

/// Separates category values in the `categories` column.
const CATEGORY_SEP: char = '\n';

pub async fn create_schema(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS doc_ids (
            uid TEXT PRIMARY KEY,
            fts_rowid INTEGER NOT NULL,
            container TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_doc_ids_container ON doc_ids(container)")
        .execute(pool)
        .await?;

    // FTS5 CREATE is not idempotent, so check first.
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='docs_fts'",
    )
    .fetch_one(pool)
    .await?;
    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE docs_fts USING fts5(
                title,
                body,
                categories,
                stored UNINDEXED,
                tokenize = 'unicode61 remove_diacritics 2'
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    let vocab_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='docs_vocab'",
    )
    .fetch_one(pool)
    .await?;
    if !vocab_exists {
        sqlx::query("CREATE VIRTUAL TABLE docs_vocab USING fts5vocab(docs_fts, 'col')")
            .execute(pool)
            .await?;
    }
    Ok(())
}

/// Errors after which this index instance cannot be trusted.
fn is_fatal(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|c| c.parse::<i32>().ok())
            // NOMEM, IOERR, CORRUPT, FULL, CANTOPEN, NOTADB
            .is_some_and(|code| matches!(code & 0xff, 7 | 10 | 11 | 13 | 14 | 26)),
        _ => false,
    }
}

pub struct SqliteIndex {
    pool: SqlitePool,
    writer: Mutex<Option<Tx>>,
    closed: AtomicBool,
    generation: AtomicU64,
    cached: RwLock<Option<Arc<SqliteSearcher>>>,
}

impl SqliteIndex {
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        let pool = db::connect(path).await?;
        let check: String = sqlx::query_scalar("PRAGMA quick_check")
            .fetch_one(&pool)
            .await
            .with_context(|| format!("Failed to check index: {}", path.display()))?;
        if check != "ok" {
            pool.close().await;
            anyhow::bail!("index at {} is corrupt: {}", path.display(), check);
        }
        create_schema(&pool)
            .await
            .with_context(|| format!("Failed to create index schema: {}", path.display()))?;
        Ok(Self {
            pool,
            writer: Mutex::new(None),
            closed: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            cached: RwLock::new(None),
        })
    }

    /// Locks the writer and makes sure a transaction is open.
    async fn writer(&self) -> IndexResult<MutexGuard<'_, Option<Tx>>> {
        let mut guard = self.writer.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(IndexError::Closed);
        }
        if guard.is_none() {
            match self.pool.begin().await {
                Ok(tx) => *guard = Some(tx),
                Err(e) => return Err(self.failed(&mut guard, e).await),
            }
        }
        Ok(guard)
    }

    /// Converts a storage error. Fatal ones roll back, force-close the pool
    /// to release the file, and poison this instance.
    async fn failed(&self, guard: &mut MutexGuard<'_, Option<Tx>>, err: sqlx::Error) -> IndexError {
        if !is_fatal(&err) {
            return IndexError::Backend(err.into());
        }
        tracing::error!(error = %err, "index storage failed; closing index");
        guard.take();
        self.closed.store(true, Ordering::SeqCst);
        self.pool.close().await;
        IndexError::Fatal(err.to_string())
    }

    async fn run<T>(
        &self,
        guard: &mut MutexGuard<'_, Option<Tx>>,
        result: Result<T, sqlx::Error>,
    ) -> IndexResult<T> {
        match result {
            Ok(v) => Ok(v),
            Err(e) => Err(self.failed(guard, e).await),
        }
    }

    fn published(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.cached.write().unwrap() = None;
    }
}

async fn delete_uid(tx: &mut Tx, uid: &str) -> sqlx::Result<u64> {
    sqlx::query("DELETE FROM docs_fts WHERE rowid IN (SELECT fts_rowid FROM doc_ids WHERE uid = ?)")
        .bind(uid)
        .execute(&mut **tx)
        .await?;
    let res = sqlx::query("DELETE FROM doc_ids WHERE uid = ?")
        .bind(uid)
        .execute(&mut **tx)
        .await?;
    Ok(res.rows_affected())
}

async fn insert_doc(tx: &mut Tx, doc: &IndexedDocument, stored: &str) -> sqlx::Result<()> {
    delete_uid(tx, doc.uid()).await?;
    let rowid = sqlx::query(
        "INSERT INTO docs_fts (title, body, categories, stored) VALUES (?, ?, ?, ?)",
    )
    .bind(&doc.title)
    .bind(&doc.body)
    .bind(doc.categories.join(&CATEGORY_SEP.to_string()))
    .bind(stored)
    .execute(&mut **tx)
    .await?
    .last_insert_rowid();
    sqlx::query("INSERT INTO doc_ids (uid, fts_rowid, container) VALUES (?, ?, ?)")
        .bind(doc.uid())
        .bind(rowid)
        .bind(doc.container())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn delete_container(tx: &mut Tx, container: &str) -> sqlx::Result<()> {
    sqlx::query(
        "DELETE FROM docs_fts WHERE rowid IN (SELECT fts_rowid FROM doc_ids WHERE container = ?)",
    )
    .bind(container)
    .execute(&mut **tx)
    .await?;
    sqlx::query("DELETE FROM doc_ids WHERE container = ?")
        .bind(container)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn delete_prefix(tx: &mut Tx, prefix: &str) -> sqlx::Result<usize> {
    let len = prefix.chars().count() as i64;
    sqlx::query(
        "DELETE FROM docs_fts WHERE rowid IN \
         (SELECT fts_rowid FROM doc_ids WHERE substr(uid, 1, ?) = ?)",
    )
    .bind(len)
    .bind(prefix)
    .execute(&mut **tx)
    .await?;
    let res = sqlx::query("DELETE FROM doc_ids WHERE substr(uid, 1, ?) = ?")
        .bind(len)
        .bind(prefix)
        .execute(&mut **tx)
        .await?;
    Ok(res.rows_affected() as usize)
}

async fn delete_matching(tx: &mut Tx, query: &Query) -> sqlx::Result<usize> {
    let rows: Vec<(String, String, String, String)> = match fts_expression(query) {
        Some(expr) => {
            sqlx::query_as("SELECT title, body, categories, stored FROM docs_fts WHERE docs_fts MATCH ?")
                .bind(expr)
                .fetch_all(&mut **tx)
                .await?
        }
        None => {
            sqlx::query_as("SELECT title, body, categories, stored FROM docs_fts")
                .fetch_all(&mut **tx)
                .await?
        }
    };
    let mut removed = 0;
    for (title, body, categories, stored) in rows {
        let fields = doc_fields(&title, &body, &categories);
        if !query.matches(&fields) {
            continue;
        }
        let Ok(stored) = serde_json::from_str::<StoredFields>(&stored) else {
            continue;
        };
        removed += delete_uid(tx, &stored.uid).await? as usize;
    }
    Ok(removed)
}

async fn clear_all(tx: &mut Tx) -> sqlx::Result<()> {
    sqlx::query("DELETE FROM docs_fts").execute(&mut **tx).await?;
    sqlx::query("DELETE FROM doc_ids").execute(&mut **tx).await?;
    Ok(())
}

fn doc_fields(title: &str, body: &str, categories: &str) -> DocFields {
    let categories: Vec<String> = categories
        .split(CATEGORY_SEP)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect();
    DocFields::new(title, body, &categories)
}

#[async_trait]
impl SearchIndex for SqliteIndex {
    async fn add(&self, doc: IndexedDocument) -> IndexResult<()> {
        let stored = serde_json::to_string(&doc.stored).map_err(anyhow::Error::from)?;
        let mut guard = self.writer().await?;
        let Some(tx) = guard.as_mut() else {
            return Err(IndexError::Closed);
        };
        let res = insert_doc(tx, &doc, &stored).await;
        self.run(&mut guard, res).await
    }

    async fn delete(&self, uid: &str) -> IndexResult<()> {
        let mut guard = self.writer().await?;
        let Some(tx) = guard.as_mut() else {
            return Err(IndexError::Closed);
        };
        let res = delete_uid(tx, uid).await.map(|_| ());
        self.run(&mut guard, res).await
    }

    async fn delete_by_query(&self, query: &Query) -> IndexResult<usize> {
        let mut guard = self.writer().await?;
        let Some(tx) = guard.as_mut() else {
            return Err(IndexError::Closed);
        };
        let res = delete_matching(tx, query).await;
        self.run(&mut guard, res).await
    }

    async fn delete_container(&self, container: &str) -> IndexResult<()> {
        let mut guard = self.writer().await?;
        let Some(tx) = guard.as_mut() else {
            return Err(IndexError::Closed);
        };
        let res = delete_container(tx, container).await;
        self.run(&mut guard, res).await
    }

    async fn delete_prefix(&self, uid_prefix: &str) -> IndexResult<usize> {
        let mut guard = self.writer().await?;
        let Some(tx) = guard.as_mut() else {
            return Err(IndexError::Closed);
        };
        let res = delete_prefix(tx, uid_prefix).await;
        self.run(&mut guard, res).await
    }

    async fn commit(&self) -> IndexResult<()> {
        let mut guard = self.writer.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(IndexError::Closed);
        }
        let Some(tx) = guard.take() else {
            return Ok(());
        };
        let res = tx.commit().await;
        self.run(&mut guard, res).await?;
        self.published();
        Ok(())
    }

    async fn clear(&self) -> IndexResult<()> {
        let mut guard = self.writer().await?;
        let Some(tx) = guard.as_mut() else {
            return Err(IndexError::Closed);
        };
        let res = clear_all(tx).await;
        self.run(&mut guard, res).await?;
        if let Some(tx) = guard.take() {
            let res = tx.commit().await;
            self.run(&mut guard, res).await?;
        }
        self.published();
        Ok(())
    }

    async fn close(&self) -> IndexResult<()> {
        let mut guard = self.writer.lock().await;
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(tx) = guard.take() {
            if let Err(e) = tx.commit().await {
                tracing::warn!(error = %e, "failed to commit pending index writes on close");
            }
        }
        self.pool.close().await;
        Ok(())
    }

    async fn searcher(&self) -> IndexResult<Arc<dyn Searcher>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(IndexError::Closed);
        }
        let generation = self.generation.load(Ordering::SeqCst);
        if let Some(s) = self.cached.read().unwrap().as_ref() {
            if s.generation == generation {
                return Ok(s.clone());
            }
        }
        let searcher = Arc::new(SqliteSearcher {
            pool: self.pool.clone(),
            generation,
        });
        *self.cached.write().unwrap() = Some(searcher.clone());
        Ok(searcher)
    }
}

pub struct SqliteSearcher {
    pool: SqlitePool,
    generation: u64,
}

impl SqliteSearcher {
    async fn frequencies(&self, query: &Query) -> sqlx::Result<FrequencyTable> {
        let num_docs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM doc_ids")
            .fetch_one(&self.pool)
            .await?;
        let mut table = FrequencyTable {
            num_docs: num_docs as usize,
            ..Default::default()
        };
        for (field, token) in query.terms() {
            let df: Option<i64> =
                sqlx::query_scalar("SELECT doc FROM docs_vocab WHERE term = ? AND col = ?")
                    .bind(&token)
                    .bind(field.column())
                    .fetch_optional(&self.pool)
                    .await?;
            table.doc_freq.insert((field, token), df.unwrap_or(0) as u32);
        }
        Ok(table)
    }
}

fn backend(err: sqlx::Error) -> IndexError {
    IndexError::Backend(err.into())
}

#[async_trait]
impl Searcher for SqliteSearcher {
    async fn search(
        &self,
        query: &Query,
        filter: &dyn HitFilter,
        limit: usize,
    ) -> IndexResult<TopDocs> {
        let rows: Vec<(String, String, String, String)> = match fts_expression(query) {
            Some(expr) => sqlx::query_as(
                "SELECT title, body, categories, stored FROM docs_fts WHERE docs_fts MATCH ?",
            )
            .bind(expr)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?,
            None => sqlx::query_as("SELECT title, body, categories, stored FROM docs_fts")
                .fetch_all(&self.pool)
                .await
                .map_err(backend)?,
        };
        let stats = self.frequencies(query).await.map_err(backend)?;

        let candidates = rows.into_iter().filter_map(|(title, body, categories, stored)| {
            let score = query.score(&doc_fields(&title, &body, &categories), &stats)?;
            match serde_json::from_str::<StoredFields>(&stored) {
                Ok(stored) => Some(ScoredDoc { stored, score }),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping index row with unreadable stored fields");
                    None
                }
            }
        });
        Ok(TopDocs::collect(candidates, filter, limit))
    }

    async fn num_docs(&self) -> IndexResult<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM doc_ids")
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        Ok(n as usize)
    }

    fn generation(&self) -> u64 {
        self.generation
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Query translation
// ═══════════════════════════════════════════════════════════════════════

fn columns(field: &Option<Field>) -> &'static str {
    match field {
        Some(f) => f.column(),
        None => "{title body}",
    }
}

fn quote(text: &str) -> String {
    format!("\"{}\"", text.replace('"', "\"\""))
}

/// FTS5 expression selecting a superset of the documents `query` matches,
/// or `None` when no restriction can be expressed and every document is a
/// candidate. Prohibited clauses are left to the exact evaluation.
pub fn fts_expression(query: &Query) -> Option<String> {
    match query {
        Query::Term { field, token } => Some(format!("{} : {}", columns(field), quote(token))),
        Query::Prefix { field, prefix } => {
            Some(format!("{} : {} *", columns(field), quote(prefix)))
        }
        Query::Phrase { field, tokens } => {
            Some(format!("{} : {}", columns(field), quote(&tokens.join(" "))))
        }
        Query::Boost { query, .. } => fts_expression(query),
        Query::Bool { clauses } => {
            let musts: Vec<String> = clauses
                .iter()
                .filter(|c| c.occur == Occur::Must)
                .filter_map(|c| fts_expression(&c.query))
                .collect();
            if !musts.is_empty() {
                return Some(group(&musts, " AND "));
            }
            if clauses.iter().any(|c| c.occur == Occur::Must) {
                return None;
            }
            let shoulds: Option<Vec<String>> = clauses
                .iter()
                .filter(|c| c.occur == Occur::Should)
                .map(|c| fts_expression(&c.query))
                .collect();
            match shoulds {
                Some(parts) if !parts.is_empty() => Some(group(&parts, " OR ")),
                _ => None,
            }
        }
    }
}

fn group(parts: &[String], op: &str) -> String {
    if parts.len() == 1 {
        return parts[0].clone();
    }
    format!("({})", parts.join(op))
}
