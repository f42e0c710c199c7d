use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Creates the crawl state schema. Idempotent.
///
/// `crawl_collections` has one row per known directory, keyed by its
/// collection key (path with trailing slash) and linked to its parent row.
/// `crawl_resources` has one row per file, keyed by (parent, name).
/// Timestamps are epoch milliseconds; NULL means never.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS crawl_collections (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            parent INTEGER REFERENCES crawl_collections(id) ON DELETE CASCADE,
            path TEXT NOT NULL UNIQUE,
            last_crawled INTEGER,
            next_crawl INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS crawl_resources (
            parent INTEGER NOT NULL REFERENCES crawl_collections(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            last_indexed INTEGER,
            modified INTEGER,
            PRIMARY KEY (parent, name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_crawl_collections_next ON crawl_collections(next_crawl)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_crawl_resources_last_indexed ON crawl_resources(last_indexed)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// `crawldex init`: creates the crawl state database and its schema.
pub async fn init(config: &Config) -> Result<()> {
    let pool = db::connect(&config.db.path).await?;
    run_migrations(&pool).await?;
    pool.close().await;
    Ok(())
}
