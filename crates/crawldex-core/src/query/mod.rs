//! Boolean/field query grammar.
//!
//! The syntax is the familiar Lucene-style one:
//!
//! ```text
//! gene map                 any of the terms (default operator OR)
//! +gene -draft             required / prohibited
//! gene AND (map OR atlas)  conjunctions and grouping (also && || !)
//! title:"gene map"^3       field, phrase, boost
//! atla*                    prefix
//! ```
//!
//! Terms without a field search the default fields: `title` (boost 2) and
//! `body` (boost 1). Parse failures are [`QueryError`]s; callers show
//! [`QueryError::user_message`] rather than the error itself.

mod eval;
mod lexer;

pub use eval::{idf, DocFields, FrequencyTable, TermStats, UniformStats};

use lexer::{lex, Token, TokenKind};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Field {
    Title,
    Body,
    Categories,
}

impl Field {
    pub fn parse(name: &str) -> Option<Field> {
        match name.to_ascii_lowercase().as_str() {
            "title" => Some(Field::Title),
            "body" | "content" => Some(Field::Body),
            "categories" | "category" => Some(Field::Categories),
            _ => None,
        }
    }

    pub fn column(self) -> &'static str {
        match self {
            Field::Title => "title",
            Field::Body => "body",
            Field::Categories => "categories",
        }
    }
}

/// Default searchable fields with their boosts.
pub const DEFAULT_FIELDS: [(Field, f32); 2] = [(Field::Title, 2.0), (Field::Body, 1.0)];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Occur {
    Must,
    Should,
    MustNot,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Clause {
    pub occur: Occur,
    pub query: Query,
}

/// Parsed query. `field: None` means the default fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Query {
    Term {
        field: Option<Field>,
        token: String,
    },
    Prefix {
        field: Option<Field>,
        prefix: String,
    },
    Phrase {
        field: Option<Field>,
        tokens: Vec<String>,
    },
    Bool {
        clauses: Vec<Clause>,
    },
    Boost {
        query: Box<Query>,
        boost: f32,
    },
}

impl Query {
    pub fn parse(input: &str) -> Result<Query, QueryError> {
        let tokens = lex(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        parser.parse_query(None, false)
    }

    pub fn term(field: Option<Field>, text: &str) -> Option<Query> {
        analyzed(field, text, false)
    }

    pub fn bool(clauses: Vec<Clause>) -> Query {
        Query::Bool { clauses }
    }

    pub fn boosted(self, boost: f32) -> Query {
        if (boost - 1.0).abs() < f32::EPSILON {
            return self;
        }
        Query::Boost {
            query: Box::new(self),
            boost,
        }
    }

    /// True when the query can match nothing (no clauses at all).
    pub fn is_empty(&self) -> bool {
        match self {
            Query::Bool { clauses } => clauses.is_empty(),
            Query::Boost { query, .. } => query.is_empty(),
            _ => false,
        }
    }
}

impl Clause {
    pub fn must(query: Query) -> Self {
        Self {
            occur: Occur::Must,
            query,
        }
    }

    pub fn should(query: Query) -> Self {
        Self {
            occur: Occur::Should,
            query,
        }
    }

    pub fn must_not(query: Query) -> Self {
        Self {
            occur: Occur::MustNot,
            query,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueryError {
    #[error("unexpected end of query")]
    UnexpectedEof,
    #[error("unexpected '{found}' at line {line}, column {column}")]
    UnexpectedToken {
        found: String,
        line: usize,
        column: usize,
    },
    #[error("unknown field '{field}' at line {line}, column {column}")]
    UnknownField {
        field: String,
        line: usize,
        column: usize,
    },
    #[error("invalid boost '{value}' at line {line}, column {column}")]
    InvalidBoost {
        value: String,
        line: usize,
        column: usize,
    },
}

impl QueryError {
    /// A bounded message safe to show to the person who typed `query`.
    ///
    /// Single-line queries get the offending text marked in place;
    /// multi-line queries get a line and column.
    pub fn user_message(&self, query: &str) -> String {
        let (what, line, column) = match self {
            QueryError::UnexpectedEof => {
                return "Incomplete query: check for an unclosed quote or parenthesis, \
                        or a trailing AND/OR/NOT."
                    .to_string()
            }
            QueryError::UnexpectedToken {
                found,
                line,
                column,
            } => (format!("unexpected '{}'", truncate(found)), *line, *column),
            QueryError::UnknownField {
                field,
                line,
                column,
            } => (format!("unknown field '{}'", truncate(field)), *line, *column),
            QueryError::InvalidBoost {
                value,
                line,
                column,
            } => (format!("invalid boost '{}'", truncate(value)), *line, *column),
        };

        if query.trim_end().lines().count() <= 1 {
            let chars: Vec<char> = query.trim_end().chars().collect();
            let at = column.saturating_sub(1).min(chars.len());
            let before: String = chars[..at].iter().collect();
            let after: String = chars[at..].iter().collect();
            format!(
                "Can't parse query, {} at character {}: {}>>{}",
                what,
                column,
                truncate_start(&before),
                truncate(&after)
            )
        } else {
            format!(
                "Can't parse query, {} at line {}, column {}.",
                what, line, column
            )
        }
    }
}

const MESSAGE_CONTEXT_CHARS: usize = 40;

fn truncate(s: &str) -> String {
    if s.chars().count() <= MESSAGE_CONTEXT_CHARS {
        return s.to_string();
    }
    let head: String = s.chars().take(MESSAGE_CONTEXT_CHARS).collect();
    format!("{}...", head)
}

fn truncate_start(s: &str) -> String {
    let n = s.chars().count();
    if n <= MESSAGE_CONTEXT_CHARS {
        return s.to_string();
    }
    let tail: String = s.chars().skip(n - MESSAGE_CONTEXT_CHARS).collect();
    format!("...{}", tail)
}

/// Analyzes raw term text: one token becomes a term, several a phrase,
/// none drops the clause.
fn analyzed(field: Option<Field>, text: &str, prefix: bool) -> Option<Query> {
    let mut tokens = crate::analysis::tokenize(text);
    match tokens.len() {
        0 => None,
        1 if prefix => Some(Query::Prefix {
            field,
            prefix: tokens.remove(0),
        }),
        1 => Some(Query::Term {
            field,
            token: tokens.remove(0),
        }),
        _ => Some(Query::Phrase { field, tokens }),
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Conj {
    And,
    Or,
}

#[derive(Clone, Copy, PartialEq)]
enum Modifier {
    Required,
    Prohibited,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self, offset: usize) -> Option<&TokenKind> {
        self.tokens.get(self.pos + offset).map(|t| &t.kind)
    }

    fn next(&mut self) -> Result<Token, QueryError> {
        let tok = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(QueryError::UnexpectedEof)?;
        self.pos += 1;
        Ok(tok)
    }

    fn unexpected(tok: &Token) -> QueryError {
        QueryError::UnexpectedToken {
            found: tok.kind.display(),
            line: tok.line,
            column: tok.column,
        }
    }

    fn parse_query(&mut self, field: Option<Field>, nested: bool) -> Result<Query, QueryError> {
        let mut clauses: Vec<Clause> = Vec::new();
        let mut seen_clause = false;

        loop {
            let Some(tok) = self.peek() else {
                if nested {
                    return Err(QueryError::UnexpectedEof);
                }
                break;
            };
            if tok.kind == TokenKind::RParen {
                if nested {
                    break;
                }
                return Err(Self::unexpected(tok));
            }

            let mut conj = None;
            if matches!(tok.kind, TokenKind::And | TokenKind::Or) {
                if !seen_clause {
                    return Err(Self::unexpected(tok));
                }
                conj = Some(if tok.kind == TokenKind::And {
                    Conj::And
                } else {
                    Conj::Or
                });
                self.pos += 1;
            }

            let mut modifier = None;
            match self.peek_kind(0) {
                Some(TokenKind::Plus) => modifier = Some(Modifier::Required),
                Some(TokenKind::Minus) | Some(TokenKind::Not) => {
                    modifier = Some(Modifier::Prohibited)
                }
                _ => {}
            }
            if modifier.is_some() {
                self.pos += 1;
            }

            let clause = self.parse_clause(field)?;
            seen_clause = true;
            if let Some(query) = clause {
                add_clause(&mut clauses, conj, modifier, query);
            }
        }

        // A single optional clause needs no wrapping.
        if clauses.len() == 1 && clauses[0].occur != Occur::MustNot {
            return Ok(clauses.remove(0).query);
        }
        Ok(Query::Bool { clauses })
    }

    fn parse_clause(&mut self, default_field: Option<Field>) -> Result<Option<Query>, QueryError> {
        let mut field = default_field;
        if let (Some(TokenKind::Word(name)), Some(TokenKind::Colon)) =
            (self.peek_kind(0).cloned(), self.peek_kind(1).cloned())
        {
            let tok = self.next()?;
            field = Some(Field::parse(&name).ok_or_else(|| QueryError::UnknownField {
                field: name,
                line: tok.line,
                column: tok.column,
            })?);
            self.pos += 1;
        }

        let tok = self.next()?;
        let query = match &tok.kind {
            TokenKind::LParen => {
                let inner = self.parse_query(field, true)?;
                let close = self.next()?;
                if close.kind != TokenKind::RParen {
                    return Err(Self::unexpected(&close));
                }
                if inner.is_empty() {
                    None
                } else {
                    Some(inner)
                }
            }
            TokenKind::Quoted(text) => analyzed(field, text, false),
            TokenKind::Word(word) => match word.strip_suffix('*') {
                Some(stem) => analyzed(field, stem, true),
                None => analyzed(field, word, false),
            },
            _ => return Err(Self::unexpected(&tok)),
        };

        if self.peek_kind(0) == Some(&TokenKind::Caret) {
            self.pos += 1;
            let value = self.next()?;
            let boost = match &value.kind {
                TokenKind::Word(w) => w.parse::<f32>().ok().filter(|b| *b > 0.0),
                _ => return Err(Self::unexpected(&value)),
            };
            let Some(boost) = boost else {
                return Err(QueryError::InvalidBoost {
                    value: value.kind.display(),
                    line: value.line,
                    column: value.column,
                });
            };
            return Ok(query.map(|q| q.boosted(boost)));
        }

        Ok(query)
    }
}

/// Applies conjunction/modifier semantics the way the classic Lucene
/// parser does with a default OR operator.
fn add_clause(
    clauses: &mut Vec<Clause>,
    conj: Option<Conj>,
    modifier: Option<Modifier>,
    query: Query,
) {
    if conj == Some(Conj::And) {
        if let Some(last) = clauses.last_mut() {
            if last.occur == Occur::Should {
                last.occur = Occur::Must;
            }
        }
    }

    let occur = match (modifier, conj) {
        (Some(Modifier::Prohibited), _) => Occur::MustNot,
        (Some(Modifier::Required), _) | (None, Some(Conj::And)) => Occur::Must,
        (None, Some(Conj::Or)) | (None, None) => Occur::Should,
    };
    clauses.push(Clause { occur, query });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn term(field: Option<Field>, t: &str) -> Query {
        Query::Term {
            field,
            token: t.to_string(),
        }
    }

    #[test]
    fn single_term() {
        assert_eq!(Query::parse("Gene").unwrap(), term(None, "gene"));
    }

    #[test]
    fn default_operator_is_or() {
        let q = Query::parse("gene map").unwrap();
        assert_eq!(
            q,
            Query::bool(vec![
                Clause::should(term(None, "gene")),
                Clause::should(term(None, "map")),
            ])
        );
    }

    #[test]
    fn and_promotes_previous_clause() {
        let q = Query::parse("gene AND map").unwrap();
        assert_eq!(
            q,
            Query::bool(vec![
                Clause::must(term(None, "gene")),
                Clause::must(term(None, "map")),
            ])
        );
    }

    #[test]
    fn modifiers_and_fields() {
        let q = Query::parse("+title:gene -draft NOT body:old").unwrap();
        assert_eq!(
            q,
            Query::bool(vec![
                Clause::must(term(Some(Field::Title), "gene")),
                Clause::must_not(term(None, "draft")),
                Clause::must_not(term(Some(Field::Body), "old")),
            ])
        );
    }

    #[test]
    fn phrases_prefixes_and_boosts() {
        let q = Query::parse("\"gene map\"^3 atla*").unwrap();
        assert_eq!(
            q,
            Query::bool(vec![
                Clause::should(
                    Query::Phrase {
                        field: None,
                        tokens: vec!["gene".into(), "map".into()],
                    }
                    .boosted(3.0)
                ),
                Clause::should(Query::Prefix {
                    field: None,
                    prefix: "atla".into(),
                }),
            ])
        );
    }

    #[test]
    fn hyphenated_identifiers_become_phrases() {
        let q = Query::parse("PT-1001").unwrap();
        assert_eq!(
            q,
            Query::Phrase {
                field: None,
                tokens: vec!["pt".into(), "1001".into()],
            }
        );
    }

    #[test]
    fn grouping_inherits_field() {
        let q = Query::parse("title:(gene OR map)").unwrap();
        assert_eq!(
            q,
            Query::bool(vec![
                Clause::should(term(Some(Field::Title), "gene")),
                Clause::should(term(Some(Field::Title), "map")),
            ])
        );
    }

    #[test]
    fn empty_query_is_empty() {
        assert!(Query::parse("   ").unwrap().is_empty());
    }

    #[test]
    fn trailing_operator_is_incomplete() {
        assert_eq!(Query::parse("gene AND"), Err(QueryError::UnexpectedEof));
        assert_eq!(Query::parse("gene AND NOT"), Err(QueryError::UnexpectedEof));
        assert_eq!(Query::parse("\"gene map"), Err(QueryError::UnexpectedEof));
        assert_eq!(Query::parse("(gene"), Err(QueryError::UnexpectedEof));
    }

    #[test]
    fn stray_tokens_carry_position() {
        assert_eq!(
            Query::parse("gene ) map"),
            Err(QueryError::UnexpectedToken {
                found: ")".into(),
                line: 1,
                column: 6,
            })
        );
        assert_eq!(
            Query::parse("OR gene"),
            Err(QueryError::UnexpectedToken {
                found: "OR".into(),
                line: 1,
                column: 1,
            })
        );
        assert!(matches!(
            Query::parse("owner:bob"),
            Err(QueryError::UnknownField { .. })
        ));
        assert!(matches!(
            Query::parse("gene^x"),
            Err(QueryError::InvalidBoost { .. })
        ));
    }

    #[test]
    fn user_messages_are_bounded() {
        let msg = QueryError::UnexpectedEof.user_message("gene AND");
        assert!(msg.starts_with("Incomplete query"));

        let q = "gene ) map";
        let msg = Query::parse(q).unwrap_err().user_message(q);
        assert_eq!(
            msg,
            "Can't parse query, unexpected ')' at character 6: gene >>) map"
        );

        let q = "gene\nmap )";
        let msg = Query::parse(q).unwrap_err().user_message(q);
        assert_eq!(
            msg,
            "Can't parse query, unexpected ')' at line 2, column 5."
        );

        let long = format!("{} )", "x".repeat(500));
        let msg = Query::parse(&long).unwrap_err().user_message(&long);
        assert!(msg.len() < 200);
    }
}
