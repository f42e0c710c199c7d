//! Turning stored fields into what a search caller sees.

use crate::index::ScoredDoc;
use crate::models::{SearchHit, StoredFields};

/// Summaries longer than this are cut at a word boundary.
pub const SUMMARY_MAX_CHARS: usize = 400;

/// Query parameter appended to hit URLs for click-through tracking.
pub const DOC_ID_PARAM: &str = "_docid";

/// Builds the display summary for a document body.
///
/// Many extractors put the title on the first line of the body; when the
/// body starts with `title` that echo is removed before excerpting.
pub fn summarize(title: &str, body: &str) -> String {
    let body = body.trim_start();
    let title = title.trim();
    let body = if !title.is_empty()
        && body.len() >= title.len()
        && body.is_char_boundary(title.len())
        && body[..title.len()].eq_ignore_ascii_case(title)
    {
        body[title.len()..].trim_start()
    } else {
        body
    };
    let collapsed: String = body.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_at_word(&collapsed, SUMMARY_MAX_CHARS)
}

fn truncate_at_word(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut = text
        .char_indices()
        .nth(max_chars)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let head = &text[..cut];
    let head = match head.rfind(' ') {
        Some(space) if space > 0 => &head[..space],
        _ => head,
    };
    format!("{}...", head.trim_end())
}

/// Appends the `_docid` tracking parameter, keeping any fragment last.
pub fn click_url(url: &str, doc_id: &str) -> String {
    if url.is_empty() {
        return String::new();
    }
    let (base, fragment) = match url.find('#') {
        Some(i) => (&url[..i], &url[i..]),
        None => (url, ""),
    };
    let sep = if base.contains('?') { '&' } else { '?' };
    format!(
        "{base}{sep}{DOC_ID_PARAM}={}{fragment}",
        urlencoding::encode(doc_id)
    )
}

/// Display title, falling back to the indexed title and then the URL.
pub fn display_title(stored: &StoredFields) -> String {
    [stored.display_title.as_deref(), Some(stored.title.as_str())]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|t| !t.is_empty())
        .unwrap_or(stored.url.as_str())
        .to_string()
}

impl From<ScoredDoc> for SearchHit {
    fn from(doc: ScoredDoc) -> Self {
        let display_title = display_title(&doc.stored);
        let stored = doc.stored;
        SearchHit {
            url: click_url(&stored.url, &stored.uid),
            container: stored.container,
            doc_id: stored.uid,
            summary: stored.summary,
            display_title,
            navtrail: stored.navtrail,
            score: doc.score,
        }
    }
}
