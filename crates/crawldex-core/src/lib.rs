//! # crawldex core
//!
//! Storage-agnostic logic shared by the crawler, the indexing pipeline and
//! the query engine: the document model, resource paths, text analysis, the
//! boolean/field query grammar, the pluggable index contract and container
//! security filtering.
//!
//! This crate contains no tokio, sqlx or filesystem I/O. The `crawldex`
//! crate supplies the on-disk index, crawl state persistence and the
//! background workers.

pub mod analysis;
pub mod hits;
pub mod index;
pub mod models;
pub mod path;
pub mod query;
pub mod security;
