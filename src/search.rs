//! Search query engine.
//!
//! Turns a user query string into a ranked, security-filtered page of hits:
//!
//! 1. Identifier-looking queries boost their category when the caller did
//!    not ask for categories and can read a matching document of it.
//! 2. The string is parsed against title (×2) and body (×1). Parse errors
//!    become [`SearchError::InvalidQuery`] with a user-safe message.
//! 3. Requested categories are ANDed in (strict) or ORed in as a boost.
//! 4. The readable containers under the search root form the
//!    [`SecurityFilter`]; nothing outside it is scored or counted.
//! 5. `offset + limit` hits are collected and the page is cut from them.

use regex::Regex;
use serde::Serialize;
use std::sync::Arc;

use crawldex_core::index::IndexError;
use crawldex_core::models::{SearchHit, SearchResult};
use crawldex_core::query::{Clause, Field, Query};
use crawldex_core::security::{
    search_containers, ContainerDirectory, Identity, SecurityFilter, SecurityPolicy,
};

use crate::config::{IdentifierConfig, SearchConfig};
use crate::index_handle::IndexHandle;

/// One search call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchRequest {
    pub query: String,
    pub categories: Vec<String>,
    /// Restrict to `categories` instead of boosting them.
    pub strict_categories: bool,
    pub identity: Identity,
    /// Container the search is rooted at.
    pub root: String,
    /// Container the caller is looking at, if any.
    pub current: Option<String>,
    pub recursive: bool,
    pub offset: usize,
    pub limit: usize,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, identity: Identity, root: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            categories: Vec::new(),
            strict_categories: false,
            identity,
            root: root.into(),
            current: None,
            recursive: true,
            offset: 0,
            limit: 20,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    /// Shown to the user as is.
    #[error("{0}")]
    InvalidQuery(String),
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Maps query strings that look like a known identifier to a category.
struct IdentifierRule {
    pattern: Regex,
    category: String,
}

pub struct SearchEngine {
    index: Arc<IndexHandle>,
    directory: Arc<dyn ContainerDirectory>,
    policy: Arc<dyn SecurityPolicy>,
    identifiers: Vec<IdentifierRule>,
    category_boost: f32,
}

impl SearchEngine {
    pub fn new(
        index: Arc<IndexHandle>,
        directory: Arc<dyn ContainerDirectory>,
        policy: Arc<dyn SecurityPolicy>,
        search: &SearchConfig,
        identifiers: &[IdentifierConfig],
    ) -> anyhow::Result<Self> {
        let identifiers = identifiers
            .iter()
            .map(|id| {
                Ok(IdentifierRule {
                    pattern: Regex::new(&anchored(&id.pattern))?,
                    category: id.category.clone(),
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self {
            index,
            directory,
            policy,
            identifiers,
            category_boost: search.category_boost,
        })
    }

    /// Category a bare query string is classified as, if any.
    pub fn classify(&self, query: &str) -> Option<&str> {
        let q = query.trim();
        self.identifiers
            .iter()
            .find(|rule| rule.pattern.is_match(q))
            .map(|rule| rule.category.as_str())
    }

    fn parse(&self, request: &SearchRequest) -> Result<Query, SearchError> {
        Query::parse(&request.query)
            .map_err(|e| SearchError::InvalidQuery(e.user_message(&request.query)))
    }

    /// The filter `request` searches under, or `None` when the identity
    /// can read nothing in scope.
    fn filter_for(&self, request: &SearchRequest) -> Option<SecurityFilter> {
        let containers = search_containers(
            self.directory.as_ref(),
            self.policy.as_ref(),
            &request.identity,
            &request.root,
            request.current.as_deref(),
            request.recursive,
        );
        if containers.is_empty() {
            return None;
        }
        Some(SecurityFilter::new(
            containers,
            request.identity.clone(),
            self.policy.clone(),
        ))
    }

    /// Category to boost for an identifier query. Only identifiers the
    /// identity can read a document for qualify.
    async fn readable_identifier(
        &self,
        request: &SearchRequest,
        parsed: &Query,
        filter: &SecurityFilter,
    ) -> Result<Option<&str>, SearchError> {
        if !request.categories.is_empty() {
            return Ok(None);
        }
        let Some(category) = self.classify(&request.query) else {
            return Ok(None);
        };
        let Some(term) = Query::term(Some(Field::Categories), category) else {
            return Ok(None);
        };
        let lookup = Query::bool(vec![Clause::must(parsed.clone()), Clause::must(term)]);
        let found = self.index.search(&lookup, filter, 1).await?.total_hits > 0;
        Ok(found.then_some(category))
    }

    /// Adds the category clauses to a parsed query.
    fn compose(&self, parsed: Query, request: &SearchRequest, identifier: Option<&str>) -> Query {
        let categories: Vec<Query> = request
            .categories
            .iter()
            .filter_map(|c| Query::term(Some(Field::Categories), c))
            .collect();

        if categories.is_empty() {
            return match identifier.and_then(|c| Query::term(Some(Field::Categories), c)) {
                Some(category) => Query::bool(vec![
                    Clause::must(parsed),
                    Clause::should(category.boosted(self.category_boost)),
                ]),
                None => parsed,
            };
        }

        let any_category = Query::bool(categories.into_iter().map(Clause::should).collect());
        let category_clause = if request.strict_categories {
            Clause::must(any_category)
        } else {
            Clause::should(any_category.boosted(self.category_boost))
        };
        Query::bool(vec![Clause::must(parsed), category_clause])
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResult, SearchError> {
        let parsed = self.parse(request)?;
        if parsed.is_empty() || request.limit == 0 {
            return Ok(SearchResult::default());
        }

        let Some(filter) = self.filter_for(request) else {
            tracing::debug!(
                identity = %request.identity.name,
                root = %request.root,
                "no readable containers; empty result"
            );
            return Ok(SearchResult::default());
        };
        let identifier = self.readable_identifier(request, &parsed, &filter).await?;
        let query = self.compose(parsed, request, identifier);

        let wanted = request.offset.saturating_add(request.limit);
        let top = self.index.search(&query, &filter, wanted).await?;
        let hits: Vec<SearchHit> = top
            .docs
            .into_iter()
            .skip(request.offset)
            .map(SearchHit::from)
            .collect();
        tracing::debug!(
            query = %request.query,
            total_hits = top.total_hits,
            returned = hits.len(),
            "search finished"
        );
        Ok(SearchResult {
            total_hits: top.total_hits,
            hits,
        })
    }
}

/// Identifier patterns must match the whole query.
fn anchored(pattern: &str) -> String {
    format!("^(?:{})$", pattern.trim_start_matches('^').trim_end_matches('$'))
}

/// Prints a result the way the CLI shows it.
pub fn print_result(result: &SearchResult, offset: usize) {
    if result.hits.is_empty() {
        println!("No results.");
        return;
    }
    for (i, hit) in result.hits.iter().enumerate() {
        println!(
            "{}. [{:.2}] {} ({})",
            offset + i + 1,
            hit.score,
            hit.display_title,
            hit.container
        );
        if let Some(nav) = &hit.navtrail {
            println!("    in: {}", nav);
        }
        println!("    url: {}", hit.url);
        if !hit.summary.is_empty() {
            println!("    {}", hit.summary);
        }
        println!();
    }
    println!(
        "Showing {}-{} of {} hits.",
        offset + 1,
        offset + result.hits.len(),
        result.total_hits
    );
}
