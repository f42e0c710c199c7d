//! # crawldex
//!
//! A crawling, permission-aware full-text search service.
//!
//! crawldex walks configured directory trees on a schedule, pushes new and
//! changed files through an extraction pipeline into a full-text index,
//! and answers queries scoped to the containers a user may read.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────┐   ┌────────────────────────┐   ┌─────────┐
//! │  Crawler  │──▶│ Crawl state  │   │        Pipeline        │──▶│  Index  │
//! │ (due dirs)│   │  (SQLite)    │   │ run ▸ preprocess ▸ idx │   │         │
//! └─────┬─────┘   └──────────────┘   └───────────▲────────────┘   └────┬────┘
//!       └────────── IndexTask / Work ────────────┘                     │
//!                                                                      ▼
//!                               ┌──────────┐  SecurityFilter   ┌──────────────┐
//!                               │ CLI/HTTP │◀──────────────────│ SearchEngine │
//!                               └──────────┘                   └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | SQLite pool and transient-error retry |
//! | [`migrate`] | Crawl state schema |
//! | [`crawl_state`] | Directory schedule and per-file index state |
//! | [`resource`] | Resource tree abstraction and the filesystem provider |
//! | [`crawler`] | Due-directory loop, diffing and scheduling |
//! | [`pipeline`] | Queues, workers, tasks and commit policy |
//! | [`extract`] | Text extraction |
//! | [`documents`] | Container-level document providers |
//! | [`index_handle`] / [`index_sqlite`] | Index backend selection and the persistent backend |
//! | [`search`] | Query construction and security-filtered search |
//! | [`service`] | The application context tying everything together |
//! | [`server`] | HTTP API |
//!
//! Index-independent types (document model, query grammar, scoring, the
//! index contract, security filtering) live in the `crawldex-core` crate.

pub mod config;
pub mod crawl_state;
pub mod crawler;
pub mod db;
pub mod diagnostics;
pub mod documents;
pub mod extract;
pub mod index_handle;
pub mod index_sqlite;
pub mod logging;
pub mod migrate;
pub mod pipeline;
pub mod rate_limit;
pub mod resource;
pub mod search;
pub mod server;
pub mod service;
pub mod stats;
