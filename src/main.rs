//! # crawldex CLI
//!
//! ## Usage
//!
//! ```bash
//! crawldex --config ./config/crawldex.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `crawldex init` | Create the crawl state database and run migrations |
//! | `crawldex crawl` | Crawl everything that is due, in the foreground |
//! | `crawldex search "<query>"` | Search as a given user |
//! | `crawldex stats` | Print indexer statistics |
//! | `crawldex clear` | Drop the index and schedule a full re-crawl |
//! | `crawldex serve` | Run the HTTP server with the background crawler |
//!
//! ## Examples
//!
//! ```bash
//! crawldex crawl --root lab --force --wait
//! crawldex search "PT-101 assay" --root lab --user alice --group cores
//! crawldex search "plate" --root lab --category file --strict
//! ```

use anyhow::{bail, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crawldex::config::{self, Config, DEFAULT_CONFIG_PATH};
use crawldex::resource::FileTree;
use crawldex::search::{print_result, SearchError, SearchRequest};
use crawldex::service::SearchService;
use crawldex::{db, logging, migrate, server};
use crawldex_core::path::ResourcePath;
use crawldex_core::security::Identity;

/// crawldex: a crawling, permission-aware full-text search service.
#[derive(Parser)]
#[command(name = "crawldex", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the crawl state database. Idempotent.
    Init,

    /// Crawl the directories that are due, in the foreground.
    Crawl {
        /// Configured root name, or a resource path such as `/lab/plates`,
        /// to schedule a full crawl of first.
        #[arg(long)]
        root: Option<String>,

        /// Resubmit every file under `--root` (or everything) regardless of
        /// modification time.
        #[arg(long)]
        force: bool,

        /// Keep crawling until nothing is due instead of a single pass.
        #[arg(long)]
        wait: bool,
    },

    /// Search the index.
    Search {
        query: String,

        /// Container to search from.
        #[arg(long)]
        root: String,

        /// Also search the containers below `root`.
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        recursive: bool,

        /// Searching user; guest when omitted.
        #[arg(long)]
        user: Option<String>,

        /// Group of the searching user. Repeatable.
        #[arg(long = "group")]
        groups: Vec<String>,

        /// Category to prefer. Repeatable.
        #[arg(long = "category")]
        categories: Vec<String>,

        /// Only return hits in the given categories.
        #[arg(long)]
        strict: bool,

        #[arg(long, default_value_t = 0)]
        offset: usize,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Print indexer statistics.
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Drop every indexed document and schedule a full re-crawl.
    Clear,

    /// Run the HTTP server and the background crawler.
    Serve,
}

/// One-shot commands drive the crawler themselves.
async fn open_foreground(mut cfg: Config) -> Result<std::sync::Arc<SearchService>> {
    cfg.crawler.enabled = false;
    let service = SearchService::builder(cfg).build().await?;
    service.start().await?;
    Ok(service)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging);

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg.db.path).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Crawl { root, force, wait } => {
            let path = match root.as_deref() {
                Some(p) if p.starts_with('/') => ResourcePath::parse(p)?,
                Some(name) if cfg.root(name).is_none() => bail!("unknown root: {}", name),
                Some(name) => FileTree::root_path(name),
                None => ResourcePath::root(),
            };
            let service = open_foreground(cfg).await?;
            if root.is_some() || force {
                service.start_full_crawl(&path, force).await?;
            }
            let report = if wait {
                service.crawl_now().await?
            } else {
                let report = service.crawler().crawl_due(Utc::now(), false).await?;
                service.wait_for_idle().await;
                report
            };
            service.commit().await?;
            println!("Crawled directories: {}", report.directories);
            println!("Submitted files: {}", report.submitted);
            println!("Deleted files: {}", report.deleted);
            println!("Dropped directories: {}", report.dropped);
            println!("ok");
            service.shutdown().await;
        }
        Commands::Search {
            query,
            root,
            recursive,
            user,
            groups,
            categories,
            strict,
            offset,
            limit,
        } => {
            let limit = limit.unwrap_or(cfg.search.default_limit);
            let service = SearchService::builder(cfg).build().await?;
            let identity = match user {
                Some(name) => Identity { name, groups },
                None => Identity::guest(),
            };
            let mut request = SearchRequest::new(query, identity, root);
            request.recursive = recursive;
            request.categories = categories;
            request.strict_categories = strict;
            request.offset = offset;
            request.limit = limit;
            match service.search(&request).await {
                Ok(result) => print_result(&result, offset),
                Err(SearchError::InvalidQuery(msg)) => bail!("{}", msg),
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Stats { json } => {
            let service = SearchService::builder(cfg).build().await?;
            let stats = service.indexer_stats().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                print!("{}", stats.to_human());
            }
        }
        Commands::Clear => {
            let service = open_foreground(cfg).await?;
            service.clear().await?;
            service.shutdown().await;
            println!("Index cleared. Run `crawldex crawl` to rebuild it.");
        }
        Commands::Serve => {
            let service = SearchService::builder(cfg).build().await?;
            service.start().await?;
            server::run_server(service).await?;
        }
    }

    Ok(())
}
