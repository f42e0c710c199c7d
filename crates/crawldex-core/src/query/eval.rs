//! Scoring a parsed [`Query`] against one analyzed document.
//!
//! Both index backends use this: the in-memory index for every document,
//! the SQLite index to re-score the optional clauses FTS5 cannot express.

use std::collections::HashMap;

use super::{Field, Occur, Query, DEFAULT_FIELDS};
use crate::analysis::AnalyzedField;

/// Analyzed searchable fields of one document.
#[derive(Debug, Clone, Default)]
pub struct DocFields {
    pub title: AnalyzedField,
    pub body: AnalyzedField,
    pub categories: AnalyzedField,
}

impl DocFields {
    pub fn new(title: &str, body: &str, categories: &[String]) -> Self {
        Self {
            title: AnalyzedField::new(title),
            body: AnalyzedField::new(body),
            categories: AnalyzedField::from_values(categories.iter().map(String::as_str)),
        }
    }

    pub fn field(&self, field: Field) -> &AnalyzedField {
        match field {
            Field::Title => &self.title,
            Field::Body => &self.body,
            Field::Categories => &self.categories,
        }
    }
}

/// Corpus statistics used for inverse document frequency.
pub trait TermStats {
    fn idf(&self, field: Field, token: &str) -> f32;
}

/// Every term weighs the same. Used where corpus statistics are not
/// available.
pub struct UniformStats;

impl TermStats for UniformStats {
    fn idf(&self, _field: Field, _token: &str) -> f32 {
        1.0
    }
}

/// Smoothed inverse document frequency shared by every backend.
pub fn idf(num_docs: usize, doc_freq: u32) -> f32 {
    (1.0 + num_docs as f32 / (doc_freq as f32 + 1.0)).ln() + 1.0
}

/// Document frequencies gathered up front for one query.
#[derive(Debug, Clone, Default)]
pub struct FrequencyTable {
    pub num_docs: usize,
    pub doc_freq: HashMap<(Field, String), u32>,
}

impl TermStats for FrequencyTable {
    fn idf(&self, field: Field, token: &str) -> f32 {
        let df = self
            .doc_freq
            .get(&(field, token.to_string()))
            .copied()
            .unwrap_or(0);
        idf(self.num_docs, df)
    }
}

fn tf_weight(freq: u32) -> f32 {
    (freq as f32).sqrt()
}

fn leaf_score(
    fields: &Option<Field>,
    doc: &DocFields,
    score_in: impl Fn(Field, &AnalyzedField) -> f32,
) -> Option<f32> {
    let total: f32 = match fields {
        Some(field) => score_in(*field, doc.field(*field)),
        None => DEFAULT_FIELDS
            .iter()
            .map(|(field, boost)| boost * score_in(*field, doc.field(*field)))
            .sum(),
    };
    (total > 0.0).then_some(total)
}

impl Query {
    /// Returns the document's score, or `None` when it does not match.
    pub fn score(&self, doc: &DocFields, stats: &dyn TermStats) -> Option<f32> {
        match self {
            Query::Term { field, token } => leaf_score(field, doc, |f, af| {
                tf_weight(af.term_freq(token)) * stats.idf(f, token)
            }),
            Query::Prefix { field, prefix } => {
                leaf_score(field, doc, |_, af| tf_weight(af.prefix_freq(prefix)))
            }
            Query::Phrase { field, tokens } => leaf_score(field, doc, |f, af| {
                let idf: f32 = tokens.iter().map(|t| stats.idf(f, t)).sum();
                tf_weight(af.phrase_freq(tokens)) * idf
            }),
            Query::Boost { query, boost } => query.score(doc, stats).map(|s| s * boost),
            Query::Bool { clauses } => {
                let mut score = 0.0;
                let mut has_must = false;
                let mut matched_should = 0usize;
                for clause in clauses {
                    let s = clause.query.score(doc, stats);
                    match clause.occur {
                        Occur::Must => {
                            has_must = true;
                            score += s?;
                        }
                        Occur::MustNot => {
                            if s.is_some() {
                                return None;
                            }
                        }
                        Occur::Should => {
                            if let Some(s) = s {
                                score += s;
                                matched_should += 1;
                            }
                        }
                    }
                }
                (has_must || matched_should > 0).then_some(score)
            }
        }
    }

    pub fn matches(&self, doc: &DocFields) -> bool {
        self.score(doc, &UniformStats).is_some()
    }

    /// Every (field, token) whose idf the scorer may ask for. Unfielded
    /// leaves expand to the default fields.
    pub fn terms(&self) -> Vec<(Field, String)> {
        let mut out = Vec::new();
        self.collect_terms(&mut out);
        out.sort();
        out.dedup();
        out
    }

    fn collect_terms(&self, out: &mut Vec<(Field, String)>) {
        fn push(out: &mut Vec<(Field, String)>, field: &Option<Field>, token: &str) {
            match field {
                Some(f) => out.push((*f, token.to_string())),
                None => out.extend(DEFAULT_FIELDS.iter().map(|(f, _)| (*f, token.to_string()))),
            }
        }
        match self {
            Query::Term { field, token } => push(out, field, token),
            Query::Phrase { field, tokens } => tokens.iter().for_each(|t| push(out, field, t)),
            Query::Prefix { .. } => {}
            Query::Boost { query, .. } => query.collect_terms(out),
            Query::Bool { clauses } => clauses.iter().for_each(|c| c.query.collect_terms(out)),
        }
    }
}
