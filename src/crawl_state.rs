//! Durable crawl scheduling state.
//!
//! Directory rows drive crawl eligibility through `next_crawl`; file rows
//! remember what was last indexed so unchanged files are skipped. Claiming a
//! batch of due directories is a single `UPDATE ... RETURNING`, which is the
//! only mutual exclusion between crawl passes.
//!
//! Every public operation retries lock contention through [`db::retry`].

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::collections::HashMap;

use crawldex_core::models::{from_millis, sentinel};
use crawldex_core::path::ResourcePath;

use crate::db;

/// Stored state of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileState {
    pub last_indexed: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
}

impl FileState {
    pub fn is_failed(&self) -> bool {
        self.last_indexed.as_ref().is_some_and(sentinel::is_failed)
    }
}

/// A directory claimed by [`CrawlStateStore::due_batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueCollection {
    pub path: ResourcePath,
    pub next_crawl: DateTime<Utc>,
}

impl DueCollection {
    /// Scheduled at or before the force sentinel: a full recursive pass.
    pub fn is_full_crawl(&self) -> bool {
        self.next_crawl <= sentinel::force_crawl()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrawlCounts {
    pub known: i64,
    pub due: i64,
}

fn ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn ms_opt(ts: Option<DateTime<Utc>>) -> Option<i64> {
    ts.map(ms)
}

fn key_len(key: &str) -> i64 {
    key.chars().count() as i64
}

pub struct CrawlStateStore {
    pool: SqlitePool,
    grace: Duration,
}

impl CrawlStateStore {
    pub fn new(pool: SqlitePool, grace: Duration) -> Self {
        Self { pool, grace }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Returns the row id of `path`, creating it and any missing ancestors
    /// with `next_crawl`.
    async fn ensure_path(&self, path: &ResourcePath, next_crawl: DateTime<Utc>) -> sqlx::Result<i64> {
        let mut tx = self.pool.begin().await?;
        let id = ensure_path_in(&mut tx, path, next_crawl).await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Inserts `path` unless a row exists. Returns whether it was inserted.
    pub async fn insert_path_if_absent(
        &self,
        path: &ResourcePath,
        next_crawl: DateTime<Utc>,
    ) -> Result<bool> {
        let inserted = db::retry("insert_path_if_absent", || async {
            let mut tx = self.pool.begin().await?;
            let exists: Option<i64> =
                sqlx::query_scalar("SELECT id FROM crawl_collections WHERE path = ?")
                    .bind(path.to_collection_key())
                    .fetch_optional(&mut *tx)
                    .await?;
            if exists.is_some() {
                return Ok(false);
            }
            ensure_path_in(&mut tx, path, next_crawl).await?;
            tx.commit().await?;
            Ok(true)
        })
        .await?;
        Ok(inserted)
    }

    /// Stamps a crawl result. With `create`, a missing row is created first.
    pub async fn update_path(
        &self,
        path: &ResourcePath,
        last_crawled: Option<DateTime<Utc>>,
        next_crawl: DateTime<Utc>,
        create: bool,
    ) -> Result<bool> {
        let key = path.to_collection_key();
        let updated = db::retry("update_path", || async {
            let res = sqlx::query(
                "UPDATE crawl_collections SET last_crawled = ?, next_crawl = ? WHERE path = ?",
            )
            .bind(ms_opt(last_crawled))
            .bind(ms(next_crawl))
            .bind(&key)
            .execute(&self.pool)
            .await?;
            if res.rows_affected() > 0 || !create {
                return Ok(res.rows_affected() > 0);
            }
            self.ensure_path(path, next_crawl).await?;
            let res = sqlx::query(
                "UPDATE crawl_collections SET last_crawled = ?, next_crawl = ? WHERE path = ?",
            )
            .bind(ms_opt(last_crawled))
            .bind(ms(next_crawl))
            .bind(&key)
            .execute(&self.pool)
            .await?;
            Ok(res.rows_affected() > 0)
        })
        .await?;
        Ok(updated)
    }

    /// Reschedules every directory under `path` (inclusive) and releases
    /// any claim on them. With `force_reindex`, every file below loses its
    /// `last_indexed` so the next pass resubmits it.
    pub async fn update_prefix(
        &self,
        path: &ResourcePath,
        next_crawl: DateTime<Utc>,
        force_reindex: bool,
    ) -> Result<u64> {
        let key = path.to_collection_key();
        let touched = db::retry("update_prefix", || async {
            let mut tx = self.pool.begin().await?;
            ensure_path_in(&mut tx, path, next_crawl).await?;
            let res = sqlx::query(
                "UPDATE crawl_collections SET next_crawl = ?, last_crawled = NULL \
                 WHERE substr(path, 1, ?) = ?",
            )
            .bind(ms(next_crawl))
            .bind(key_len(&key))
            .bind(&key)
            .execute(&mut *tx)
            .await?;
            if force_reindex {
                sqlx::query(
                    "UPDATE crawl_resources SET last_indexed = NULL WHERE parent IN \
                     (SELECT id FROM crawl_collections WHERE substr(path, 1, ?) = ?)",
                )
                .bind(key_len(&key))
                .bind(&key)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            Ok(res.rows_affected())
        })
        .await?;
        Ok(touched)
    }

    /// Forgets `path`, everything below it and all their file rows.
    pub async fn delete_path(&self, path: &ResourcePath) -> Result<()> {
        let key = path.to_collection_key();
        db::retry("delete_path", || async {
            let mut tx = self.pool.begin().await?;
            sqlx::query(
                "DELETE FROM crawl_resources WHERE parent IN \
                 (SELECT id FROM crawl_collections WHERE substr(path, 1, ?) = ?)",
            )
            .bind(key_len(&key))
            .bind(&key)
            .execute(&mut *tx)
            .await?;
            sqlx::query("DELETE FROM crawl_collections WHERE substr(path, 1, ?) = ?")
                .bind(key_len(&key))
                .bind(&key)
                .execute(&mut *tx)
                .await?;
            tx.commit().await
        })
        .await?;
        Ok(())
    }

    /// Claims up to `limit` due directories, oldest schedule first.
    ///
    /// Due means `next_crawl < now` and not claimed within the grace
    /// window. Claimed rows get `last_crawled = now` in the same statement.
    pub async fn due_batch(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<DueCollection>> {
        let cutoff = now - self.grace;
        let rows: Vec<(String, i64)> = db::retry("due_batch", || async {
            sqlx::query_as(
                "UPDATE crawl_collections SET last_crawled = ?1 \
                 WHERE id IN (SELECT id FROM crawl_collections \
                     WHERE next_crawl < ?1 AND (last_crawled IS NULL OR last_crawled < ?2) \
                     ORDER BY next_crawl LIMIT ?3) \
                 RETURNING path, next_crawl",
            )
            .bind(ms(now))
            .bind(ms(cutoff))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
        })
        .await?;

        let mut batch = Vec::with_capacity(rows.len());
        for (key, next) in rows {
            match ResourcePath::parse(&key) {
                Ok(path) => batch.push(DueCollection {
                    path,
                    next_crawl: from_millis(next),
                }),
                Err(e) => tracing::warn!(path = %key, error = %e, "skipping malformed crawl path"),
            }
        }
        batch.sort_by_key(|d| d.next_crawl);
        Ok(batch)
    }

    /// File states of the immediate children of `dir`, by file name.
    pub async fn file_states(&self, dir: &ResourcePath) -> Result<HashMap<String, FileState>> {
        let key = dir.to_collection_key();
        let rows: Vec<(String, Option<i64>, Option<i64>)> = db::retry("file_states", || async {
            sqlx::query_as(
                "SELECT r.name, r.last_indexed, r.modified FROM crawl_resources r \
                 JOIN crawl_collections c ON r.parent = c.id WHERE c.path = ?",
            )
            .bind(&key)
            .fetch_all(&self.pool)
            .await
        })
        .await?;
        Ok(rows
            .into_iter()
            .map(|(name, last_indexed, modified)| {
                (
                    name,
                    FileState {
                        last_indexed: last_indexed.map(from_millis),
                        modified: modified.map(from_millis),
                    },
                )
            })
            .collect())
    }

    pub async fn file_state(&self, file: &ResourcePath) -> Result<Option<FileState>> {
        let (Some(dir), Some(name)) = (file.parent(), file.name()) else {
            return Ok(None);
        };
        Ok(self.file_states(&dir).await?.remove(name))
    }

    /// Upserts the state of `file`.
    pub async fn update_file_state(
        &self,
        file: &ResourcePath,
        last_indexed: Option<DateTime<Utc>>,
        modified: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let (Some(dir), Some(name)) = (file.parent(), file.name()) else {
            anyhow::bail!("not a file path: {}", file);
        };
        db::retry("update_file_state", || async {
            let parent = self.ensure_path(&dir, Utc::now()).await?;
            sqlx::query(
                "INSERT INTO crawl_resources (parent, name, last_indexed, modified) \
                 VALUES (?, ?, ?, ?) \
                 ON CONFLICT(parent, name) DO UPDATE SET \
                 last_indexed = excluded.last_indexed, modified = excluded.modified",
            )
            .bind(parent)
            .bind(name)
            .bind(ms_opt(last_indexed))
            .bind(ms_opt(modified))
            .execute(&self.pool)
            .await
        })
        .await?;
        Ok(())
    }

    /// Resets every failed file to never-indexed and makes its directory due
    /// now, so the retry happens on the next crawl pass. Returns the number
    /// of files reset.
    pub async fn clear_failed_markers(&self, now: DateTime<Utc>) -> Result<u64> {
        let failed = sentinel::FAILED_MS;
        let cleared = db::retry("clear_failed_markers", || async {
            let mut tx = self.pool.begin().await?;
            sqlx::query(
                "UPDATE crawl_collections SET next_crawl = ?, last_crawled = NULL WHERE id IN \
                 (SELECT parent FROM crawl_resources WHERE last_indexed = ?)",
            )
            .bind(ms(now))
            .bind(failed)
            .execute(&mut *tx)
            .await?;
            let res = sqlx::query(
                "UPDATE crawl_resources SET last_indexed = NULL WHERE last_indexed = ?",
            )
            .bind(failed)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(res.rows_affected())
        })
        .await?;
        Ok(cleared)
    }

    /// Files recorded as successfully indexed.
    pub async fn indexed_files(&self) -> Result<i64> {
        let (n,): (i64,) = db::retry("indexed_files", || async {
            sqlx::query_as(
                "SELECT COUNT(*) FROM crawl_resources \
                 WHERE last_indexed IS NOT NULL AND last_indexed <> ?",
            )
            .bind(sentinel::FAILED_MS)
            .fetch_one(&self.pool)
            .await
        })
        .await?;
        Ok(n)
    }

    pub async fn counts(&self, now: DateTime<Utc>) -> Result<CrawlCounts> {
        let (known, due): (i64, Option<i64>) = db::retry("counts", || async {
            sqlx::query_as(
                "SELECT COUNT(*), SUM(CASE WHEN next_crawl < ? THEN 1 ELSE 0 END) \
                 FROM crawl_collections",
            )
            .bind(ms(now))
            .fetch_one(&self.pool)
            .await
        })
        .await?;
        Ok(CrawlCounts {
            known,
            due: due.unwrap_or(0),
        })
    }
}

/// Deletes the file rows `names` under `dir` inside a caller's transaction.
pub async fn delete_file_states_in(
    tx: &mut Transaction<'static, Sqlite>,
    dir: &ResourcePath,
    names: &[String],
) -> sqlx::Result<()> {
    let parent: Option<i64> = sqlx::query_scalar("SELECT id FROM crawl_collections WHERE path = ?")
        .bind(dir.to_collection_key())
        .fetch_optional(&mut **tx)
        .await?;
    let Some(parent) = parent else {
        return Ok(());
    };
    for name in names {
        sqlx::query("DELETE FROM crawl_resources WHERE parent = ? AND name = ?")
            .bind(parent)
            .bind(name)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

async fn ensure_path_in(
    tx: &mut Transaction<'_, Sqlite>,
    path: &ResourcePath,
    next_crawl: DateTime<Utc>,
) -> sqlx::Result<i64> {
    let mut parent: Option<i64> = None;
    let mut chain = path.ancestors();
    chain.push(path.clone());
    for p in chain {
        let key = p.to_collection_key();
        sqlx::query(
            "INSERT INTO crawl_collections (parent, path, next_crawl) VALUES (?, ?, ?) \
             ON CONFLICT(path) DO NOTHING",
        )
        .bind(parent)
        .bind(&key)
        .bind(ms(next_crawl))
        .execute(&mut **tx)
        .await?;
        let id: i64 = sqlx::query_scalar("SELECT id FROM crawl_collections WHERE path = ?")
            .bind(&key)
            .fetch_one(&mut **tx)
            .await?;
        parent = Some(id);
    }
    // The chain always contains `path` itself.
    Ok(parent.unwrap_or_default())
}
