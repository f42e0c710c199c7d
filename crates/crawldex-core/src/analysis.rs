//! Text analysis shared by the index backends and the query parser.
//!
//! Tokens are maximal runs of alphanumeric characters, lowercased, with
//! Latin diacritics folded away. This matches SQLite FTS5's `unicode61
//! remove_diacritics 2` tokenizer closely enough that a query analyzed here
//! and evaluated by FTS5 agrees with the in-memory backend.

use std::collections::HashMap;

pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase().chars().map(fold_diacritic).collect())
        .collect()
}

/// Base letter of a lowercase Latin letter carrying a diacritic.
fn fold_diacritic(c: char) -> char {
    match c {
        'à'..='å' | 'ā' | 'ă' | 'ą' => 'a',
        'ç' | 'ć' | 'ĉ' | 'ċ' | 'č' => 'c',
        'ď' | 'đ' => 'd',
        'è'..='ë' | 'ē' | 'ĕ' | 'ė' | 'ę' | 'ě' => 'e',
        'ĝ' | 'ğ' | 'ġ' | 'ģ' => 'g',
        'ĥ' | 'ħ' => 'h',
        'ì'..='ï' | 'ĩ' | 'ī' | 'ĭ' | 'į' | 'ı' => 'i',
        'ĵ' => 'j',
        'ķ' => 'k',
        'ĺ' | 'ļ' | 'ľ' | 'ŀ' | 'ł' => 'l',
        'ñ' | 'ń' | 'ņ' | 'ň' => 'n',
        'ò'..='ö' | 'ø' | 'ō' | 'ŏ' | 'ő' => 'o',
        'ŕ' | 'ŗ' | 'ř' => 'r',
        'ś' | 'ŝ' | 'ş' | 'š' => 's',
        'ţ' | 'ť' | 'ŧ' => 't',
        'ù'..='ü' | 'ũ' | 'ū' | 'ŭ' | 'ů' | 'ű' | 'ų' => 'u',
        'ŵ' => 'w',
        'ý' | 'ÿ' | 'ŷ' => 'y',
        'ź' | 'ż' | 'ž' => 'z',
        _ => c,
    }
}

/// Token positions for one field of one document.
#[derive(Debug, Clone, Default)]
pub struct AnalyzedField {
    positions: HashMap<String, Vec<u32>>,
    len: u32,
}

impl AnalyzedField {
    pub fn new(text: &str) -> Self {
        let mut positions: HashMap<String, Vec<u32>> = HashMap::new();
        let tokens = tokenize(text);
        let len = tokens.len() as u32;
        for (pos, token) in tokens.into_iter().enumerate() {
            positions.entry(token).or_default().push(pos as u32);
        }
        Self { positions, len }
    }

    /// Builds a field from pre-split values, each value analyzed on its own
    /// and separated by a position gap so phrases never span two values.
    pub fn from_values<'a>(values: impl IntoIterator<Item = &'a str>) -> Self {
        let mut field = Self::default();
        for value in values {
            let base = field.len + 1;
            let tokens = tokenize(value);
            for (i, token) in tokens.iter().enumerate() {
                field
                    .positions
                    .entry(token.clone())
                    .or_default()
                    .push(base + i as u32);
            }
            field.len = base + tokens.len() as u32;
        }
        field
    }

    pub fn term_freq(&self, token: &str) -> u32 {
        self.positions.get(token).map(|p| p.len() as u32).unwrap_or(0)
    }

    /// Sum of frequencies of every token starting with `prefix`.
    pub fn prefix_freq(&self, prefix: &str) -> u32 {
        self.positions
            .iter()
            .filter(|(t, _)| t.starts_with(prefix))
            .map(|(_, p)| p.len() as u32)
            .sum()
    }

    /// Number of occurrences of `tokens` as a contiguous phrase.
    pub fn phrase_freq(&self, tokens: &[String]) -> u32 {
        let Some(first) = tokens.first() else {
            return 0;
        };
        let Some(starts) = self.positions.get(first) else {
            return 0;
        };
        starts
            .iter()
            .filter(|&&start| {
                tokens.iter().enumerate().skip(1).all(|(offset, token)| {
                    self.positions
                        .get(token)
                        .is_some_and(|p| p.contains(&(start + offset as u32)))
                })
            })
            .count() as u32
    }

    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.positions.keys().map(String::as_str)
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_lowercases_and_splits() {
        assert_eq!(
            tokenize("Hello, World! PT-1001"),
            vec!["hello", "world", "pt", "1001"]
        );
        assert!(tokenize("  -- ").is_empty());
    }

    #[test]
    fn diacritics_fold_to_base_letters() {
        assert_eq!(tokenize("Café Ångström naïve"), vec!["cafe", "angstrom", "naive"]);
        assert_eq!(tokenize("Łódź"), vec!["lodz"]);
        assert_eq!(tokenize("日本"), vec!["日本"]);
    }

    #[test]
    fn phrase_matching_requires_adjacency() {
        let field = AnalyzedField::new("the quick brown fox, the brown quick fox");
        let phrase = vec!["quick".to_string(), "brown".to_string()];
        assert_eq!(field.phrase_freq(&phrase), 1);
        assert_eq!(field.term_freq("fox"), 2);
        assert_eq!(field.prefix_freq("qu"), 2);
    }

    #[test]
    fn multi_value_fields_do_not_join_phrases() {
        let field = AnalyzedField::from_values(["file", "subject"]);
        let phrase = vec!["file".to_string(), "subject".to_string()];
        assert_eq!(field.phrase_freq(&phrase), 0);
        assert_eq!(field.term_freq("subject"), 1);
    }
}
