//! Content parsers for the preprocess stage.
//!
//! A [`ParserChain`] picks the first [`DocumentParser`] whose `detect`
//! accepts the file name and header bytes, then runs it. Parser failures
//! come back as [`ExtractError`], already classified: expected failures
//! (encrypted, malformed, unsupported, too large, unreadable) are logged
//! with their reason; [`ExtractError::Internal`] is a parser bug and also
//! goes to the diagnostics sink.

use regex::Regex;
use std::collections::BTreeMap;
use std::io::Read;
use std::sync::OnceLock;

pub const MIME_TEXT: &str = "text/plain";
pub const MIME_HTML: &str = "text/html";
pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// How many leading bytes `detect` gets to see.
pub const HEADER_BYTES: usize = 1024;

const XLSX_MAX_SHEETS: usize = 100;
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Per ZIP entry, against zip bombs.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
/// OLE compound file; how Office stores password-protected OOXML.
const OLE_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("no parser for {0}")]
    Unsupported(String),
    #[error("{0} is encrypted or password protected")]
    Encrypted(String),
    #[error("malformed {media_type}: {reason}")]
    Malformed {
        media_type: &'static str,
        reason: String,
    },
    #[error("file is {size} bytes, limit is {limit}")]
    TooLarge { size: u64, limit: u64 },
    #[error("unreadable: {0}")]
    Io(#[from] std::io::Error),
    #[error("parser failure in {media_type}: {reason}")]
    Internal {
        media_type: &'static str,
        reason: String,
    },
}

impl ExtractError {
    /// Expected failures are a property of the document, not of the code.
    pub fn is_expected(&self) -> bool {
        !matches!(self, ExtractError::Internal { .. })
    }

    /// Maps a parser library's error text onto the taxonomy above.
    pub fn classify(media_type: &'static str, message: &str) -> ExtractError {
        let lower = message.to_ascii_lowercase();
        if lower.contains("encrypt") || lower.contains("password") {
            return ExtractError::Encrypted(media_type.to_string());
        }
        const MALFORMED: [&str; 9] = [
            "invalid",
            "malformed",
            "corrupt",
            "unexpected eof",
            "unexpected end",
            "not a",
            "xref",
            "missing",
            "syntax",
        ];
        if MALFORMED.iter().any(|m| lower.contains(m)) {
            return ExtractError::Malformed {
                media_type,
                reason: message.to_string(),
            };
        }
        ExtractError::Internal {
            media_type,
            reason: message.to_string(),
        }
    }
}

/// Text and metadata pulled out of one document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedDocument {
    pub media_type: &'static str,
    pub title: Option<String>,
    pub body: String,
    pub metadata: BTreeMap<String, String>,
}

pub trait DocumentParser: Send + Sync {
    fn media_type(&self) -> &'static str;

    fn detect(&self, file_name: &str, header: &[u8]) -> bool;

    fn parse(&self, bytes: &[u8]) -> Result<ParsedDocument, ExtractError>;
}

fn extension(file_name: &str) -> String {
    file_name
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Ordered parser list; the first detector to accept wins.
pub struct ParserChain {
    parsers: Vec<Box<dyn DocumentParser>>,
}

impl Default for ParserChain {
    fn default() -> Self {
        Self::new(vec![
            Box::new(PdfParser),
            Box::new(OoxmlParser::Docx),
            Box::new(OoxmlParser::Pptx),
            Box::new(OoxmlParser::Xlsx),
            Box::new(MarkupParser),
            Box::new(TextParser),
        ])
    }
}

impl ParserChain {
    pub fn new(parsers: Vec<Box<dyn DocumentParser>>) -> Self {
        Self { parsers }
    }

    pub fn detect(&self, file_name: &str, header: &[u8]) -> Option<&dyn DocumentParser> {
        let header = &header[..header.len().min(HEADER_BYTES)];
        self.parsers
            .iter()
            .find(|p| p.detect(file_name, header))
            .map(|p| p.as_ref())
    }

    /// Detects and parses. Panics inside a parser library surface as
    /// [`ExtractError::Internal`].
    pub fn parse(&self, file_name: &str, bytes: &[u8]) -> Result<ParsedDocument, ExtractError> {
        if bytes.starts_with(OLE_MAGIC) && matches!(extension(file_name).as_str(), "docx" | "pptx" | "xlsx") {
            return Err(ExtractError::Encrypted(file_name.to_string()));
        }
        let parser = self
            .detect(file_name, bytes)
            .ok_or_else(|| ExtractError::Unsupported(file_name.to_string()))?;
        let media_type = parser.media_type();
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| parser.parse(bytes))) {
            Ok(result) => result,
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "parser panicked".to_string());
                Err(ExtractError::Internal { media_type, reason })
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────────────
// Plain text and markup
// ───────────────────────────────────────────────────────────────────────

pub struct TextParser;

const TEXT_EXTENSIONS: [&str; 14] = [
    "txt", "md", "markdown", "csv", "tsv", "json", "log", "yaml", "yml", "toml", "ini", "rst",
    "tex", "fasta",
];

impl DocumentParser for TextParser {
    fn media_type(&self) -> &'static str {
        MIME_TEXT
    }

    fn detect(&self, file_name: &str, header: &[u8]) -> bool {
        if TEXT_EXTENSIONS.contains(&extension(file_name).as_str()) {
            return true;
        }
        !header.is_empty() && !header.contains(&0) && looks_like_utf8(header)
    }

    fn parse(&self, bytes: &[u8]) -> Result<ParsedDocument, ExtractError> {
        Ok(ParsedDocument {
            media_type: MIME_TEXT,
            body: String::from_utf8_lossy(bytes).into_owned(),
            ..Default::default()
        })
    }
}

/// UTF-8 check that tolerates a multi-byte sequence cut off at the end.
fn looks_like_utf8(header: &[u8]) -> bool {
    match std::str::from_utf8(header) {
        Ok(_) => true,
        Err(e) => e.error_len().is_none(),
    }
}

pub struct MarkupParser;

fn title_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap())
}

impl DocumentParser for MarkupParser {
    fn media_type(&self) -> &'static str {
        MIME_HTML
    }

    fn detect(&self, file_name: &str, header: &[u8]) -> bool {
        if matches!(extension(file_name).as_str(), "html" | "htm" | "xhtml") {
            return true;
        }
        let head = String::from_utf8_lossy(header).to_ascii_lowercase();
        head.trim_start().starts_with("<!doctype html") || head.contains("<html")
    }

    fn parse(&self, bytes: &[u8]) -> Result<ParsedDocument, ExtractError> {
        let source = String::from_utf8_lossy(bytes);
        let title = title_pattern()
            .captures(&source)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|t| !t.is_empty());
        let body = html2text::from_read(bytes, 120)
            .map_err(|e| ExtractError::classify(MIME_HTML, &e.to_string()))?;
        Ok(ParsedDocument {
            media_type: MIME_HTML,
            title,
            body,
            ..Default::default()
        })
    }
}

// ───────────────────────────────────────────────────────────────────────
// PDF
// ───────────────────────────────────────────────────────────────────────

pub struct PdfParser;

impl DocumentParser for PdfParser {
    fn media_type(&self) -> &'static str {
        MIME_PDF
    }

    fn detect(&self, file_name: &str, header: &[u8]) -> bool {
        header.starts_with(b"%PDF-") || extension(file_name) == "pdf"
    }

    fn parse(&self, bytes: &[u8]) -> Result<ParsedDocument, ExtractError> {
        if !bytes.starts_with(b"%PDF-") {
            return Err(ExtractError::Malformed {
                media_type: MIME_PDF,
                reason: "missing %PDF header".to_string(),
            });
        }
        let body = pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| ExtractError::classify(MIME_PDF, &e.to_string()))?;
        Ok(ParsedDocument {
            media_type: MIME_PDF,
            body,
            ..Default::default()
        })
    }
}

// ───────────────────────────────────────────────────────────────────────
// Office Open XML
// ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OoxmlParser {
    Docx,
    Pptx,
    Xlsx,
}

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

impl OoxmlParser {
    fn extension(self) -> &'static str {
        match self {
            OoxmlParser::Docx => "docx",
            OoxmlParser::Pptx => "pptx",
            OoxmlParser::Xlsx => "xlsx",
        }
    }

    fn malformed(self, reason: impl ToString) -> ExtractError {
        ExtractError::classify(self.media_type(), &reason.to_string())
    }

    fn entry(self, archive: &mut Archive<'_>, name: &str) -> Result<Option<Vec<u8>>, ExtractError> {
        let entry = match archive.by_name(name) {
            Ok(entry) => entry,
            Err(zip::result::ZipError::FileNotFound) => return Ok(None),
            Err(e) => return Err(self.malformed(e)),
        };
        let mut out = Vec::new();
        entry
            .take(MAX_XML_ENTRY_BYTES)
            .read_to_end(&mut out)
            .map_err(|e| self.malformed(e))?;
        if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
            return Err(ExtractError::TooLarge {
                size: out.len() as u64,
                limit: MAX_XML_ENTRY_BYTES,
            });
        }
        Ok(Some(out))
    }

    /// Entries under `prefix` named `<prefix>N.xml`, in numeric order.
    fn numbered_entries(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
        let mut names: Vec<(u32, String)> = archive
            .file_names()
            .filter_map(|n| {
                let num = n.strip_prefix(prefix)?.strip_suffix(".xml")?.parse().ok()?;
                Some((num, n.to_string()))
            })
            .collect();
        names.sort();
        names.into_iter().map(|(_, n)| n).collect()
    }

    fn body(self, archive: &mut Archive<'_>) -> Result<String, ExtractError> {
        match self {
            OoxmlParser::Docx => {
                let xml = self
                    .entry(archive, "word/document.xml")?
                    .ok_or_else(|| self.malformed("missing word/document.xml"))?;
                self.text_runs(&xml, b"p")
            }
            OoxmlParser::Pptx => {
                let mut slides = Vec::new();
                for name in Self::numbered_entries(archive, "ppt/slides/slide") {
                    if let Some(xml) = self.entry(archive, &name)? {
                        slides.push(self.text_runs(&xml, b"p")?);
                    }
                }
                Ok(slides.join("\n\n"))
            }
            OoxmlParser::Xlsx => {
                let shared = match self.entry(archive, "xl/sharedStrings.xml")? {
                    Some(xml) => self.shared_strings(&xml)?,
                    None => Vec::new(),
                };
                let mut sheets = Vec::new();
                for name in Self::numbered_entries(archive, "xl/worksheets/sheet")
                    .into_iter()
                    .take(XLSX_MAX_SHEETS)
                {
                    if let Some(xml) = self.entry(archive, &name)? {
                        sheets.push(self.sheet_cells(&xml, &shared)?);
                    }
                }
                Ok(sheets.join("\n"))
            }
        }
    }

    /// Concatenates every `<*:t>` run, breaking lines at `paragraph` ends.
    fn text_runs(self, xml: &[u8], paragraph: &[u8]) -> Result<String, ExtractError> {
        use quick_xml::events::Event;
        let mut reader = quick_xml::Reader::from_reader(xml);
        let mut buf = Vec::new();
        let mut out = String::new();
        let mut in_text = false;
        loop {
            match reader.read_event_into(&mut buf).map_err(|e| self.malformed(e))? {
                Event::Start(e) if e.local_name().as_ref() == b"t" => in_text = true,
                Event::Text(t) if in_text => {
                    out.push_str(&t.unescape().map_err(|e| self.malformed(e))?);
                }
                Event::End(e) if e.local_name().as_ref() == b"t" => in_text = false,
                Event::End(e) if e.local_name().as_ref() == paragraph => {
                    if !out.is_empty() && !out.ends_with('\n') {
                        out.push('\n');
                    }
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }
        Ok(out.trim_end().to_string())
    }

    fn shared_strings(self, xml: &[u8]) -> Result<Vec<String>, ExtractError> {
        use quick_xml::events::Event;
        let mut reader = quick_xml::Reader::from_reader(xml);
        let mut buf = Vec::new();
        let mut strings = Vec::new();
        let mut current: Option<String> = None;
        let mut in_text = false;
        loop {
            match reader.read_event_into(&mut buf).map_err(|e| self.malformed(e))? {
                Event::Start(e) => match e.local_name().as_ref() {
                    b"si" => current = Some(String::new()),
                    b"t" => in_text = true,
                    _ => {}
                },
                Event::Text(t) if in_text => {
                    if let Some(s) = current.as_mut() {
                        s.push_str(&t.unescape().map_err(|e| self.malformed(e))?);
                    }
                }
                Event::End(e) => match e.local_name().as_ref() {
                    b"t" => in_text = false,
                    b"si" => strings.extend(current.take()),
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }
        Ok(strings)
    }

    /// Shared-string and inline-string cells plus literal values.
    fn sheet_cells(self, xml: &[u8], shared: &[String]) -> Result<String, ExtractError> {
        use quick_xml::events::Event;
        let mut reader = quick_xml::Reader::from_reader(xml);
        let mut buf = Vec::new();
        let mut cells = Vec::new();
        let mut shared_ref = false;
        let mut in_value = false;
        loop {
            if cells.len() >= XLSX_MAX_CELLS_PER_SHEET {
                break;
            }
            match reader.read_event_into(&mut buf).map_err(|e| self.malformed(e))? {
                Event::Start(e) => match e.local_name().as_ref() {
                    b"c" => {
                        shared_ref = e.attributes().flatten().any(|a| {
                            a.key.local_name().as_ref() == b"t" && a.value.as_ref() == b"s"
                        });
                    }
                    b"v" | b"t" => in_value = true,
                    _ => {}
                },
                Event::Text(t) if in_value => {
                    let raw = t.unescape().map_err(|e| self.malformed(e))?;
                    let value = raw.trim();
                    if value.is_empty() {
                        // nothing
                    } else if shared_ref {
                        if let Some(s) = value.parse::<usize>().ok().and_then(|i| shared.get(i)) {
                            cells.push(s.clone());
                        }
                    } else {
                        cells.push(value.to_string());
                    }
                }
                Event::End(e) => match e.local_name().as_ref() {
                    b"v" | b"t" => in_value = false,
                    b"c" => shared_ref = false,
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }
        Ok(cells.join(" "))
    }

    /// `dc:title` and `dc:creator` from `docProps/core.xml`.
    fn core_properties(self, archive: &mut Archive<'_>) -> BTreeMap<String, String> {
        use quick_xml::events::Event;
        let mut props = BTreeMap::new();
        let Ok(Some(xml)) = self.entry(archive, "docProps/core.xml") else {
            return props;
        };
        let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
        let mut buf = Vec::new();
        let mut field: Option<String> = None;
        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(e)) => {
                    let name = e.local_name();
                    field = matches!(name.as_ref(), b"title" | b"creator")
                        .then(|| String::from_utf8_lossy(name.as_ref()).into_owned());
                }
                Ok(Event::Text(t)) => {
                    if let (Some(f), Ok(v)) = (field.as_ref(), t.unescape()) {
                        if !v.trim().is_empty() {
                            props.insert(f.clone(), v.trim().to_string());
                        }
                    }
                }
                Ok(Event::End(_)) => field = None,
                Ok(Event::Eof) | Err(_) => break,
                _ => {}
            }
            buf.clear();
        }
        props
    }
}

impl DocumentParser for OoxmlParser {
    fn media_type(&self) -> &'static str {
        match self {
            OoxmlParser::Docx => MIME_DOCX,
            OoxmlParser::Pptx => MIME_PPTX,
            OoxmlParser::Xlsx => MIME_XLSX,
        }
    }

    fn detect(&self, file_name: &str, header: &[u8]) -> bool {
        extension(file_name) == self.extension()
            && (header.is_empty() || header.starts_with(ZIP_MAGIC))
    }

    fn parse(&self, bytes: &[u8]) -> Result<ParsedDocument, ExtractError> {
        let mut archive =
            zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| self.malformed(e))?;
        let body = self.body(&mut archive)?;
        let mut metadata = self.core_properties(&mut archive);
        let title = metadata.remove("title");
        Ok(ParsedDocument {
            media_type: self.media_type(),
            title,
            body,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn zip_of(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut out = std::io::Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut out);
            let opts = zip::write::SimpleFileOptions::default();
            for (name, content) in entries {
                zip.start_file(*name, opts).unwrap();
                zip.write_all(content.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        out.into_inner()
    }

    #[test]
    fn detection_order() {
        let chain = ParserChain::default();
        assert_eq!(chain.detect("a.pdf", b"%PDF-1.7").unwrap().media_type(), MIME_PDF);
        assert_eq!(chain.detect("a.docx", ZIP_MAGIC).unwrap().media_type(), MIME_DOCX);
        assert_eq!(
            chain.detect("page", b"<!DOCTYPE html><html>").unwrap().media_type(),
            MIME_HTML
        );
        assert_eq!(chain.detect("notes", b"plain words").unwrap().media_type(), MIME_TEXT);
        assert!(chain.detect("blob", &[0, 159, 146, 150]).is_none());
    }

    #[test]
    fn unsupported_binary() {
        let err = ParserChain::default().parse("blob.bin", &[0, 1, 2, 3]).unwrap_err();
        assert!(matches!(err, ExtractError::Unsupported(_)));
        assert!(err.is_expected());
    }

    #[test]
    fn html_title_and_body() {
        let doc = ParserChain::default()
            .parse(
                "page.html",
                b"<html><head><title> Gene\n Atlas </title></head><body><p>Cohort map</p></body></html>",
            )
            .unwrap();
        assert_eq!(doc.title.as_deref(), Some("Gene Atlas"));
        assert!(doc.body.contains("Cohort map"));
    }

    #[test]
    fn docx_paragraphs_and_title() {
        let bytes = zip_of(&[
            (
                "word/document.xml",
                r#"<w:document xmlns:w="w"><w:body><w:p><w:r><w:t>Gene</w:t></w:r><w:r><w:t xml:space="preserve"> map</w:t></w:r></w:p><w:p><w:r><w:t>Second</w:t></w:r></w:p></w:body></w:document>"#,
            ),
            (
                "docProps/core.xml",
                r#"<cp:coreProperties xmlns:cp="cp" xmlns:dc="dc"><dc:title>Cohort report</dc:title><dc:creator>alice</dc:creator></cp:coreProperties>"#,
            ),
        ]);
        let doc = ParserChain::default().parse("r.docx", &bytes).unwrap();
        assert_eq!(doc.body, "Gene map\nSecond");
        assert_eq!(doc.title.as_deref(), Some("Cohort report"));
        assert_eq!(doc.metadata.get("creator").map(String::as_str), Some("alice"));
    }

    #[test]
    fn xlsx_cells() {
        let bytes = zip_of(&[
            (
                "xl/sharedStrings.xml",
                r#"<sst><si><t>subject</t></si><si><t>visit</t></si></sst>"#,
            ),
            (
                "xl/worksheets/sheet1.xml",
                r#"<worksheet><sheetData><row><c t="s"><v>0</v></c><c t="s"><v>1</v></c><c><v>42</v></c></row></sheetData></worksheet>"#,
            ),
        ]);
        let doc = ParserChain::default().parse("t.xlsx", &bytes).unwrap();
        assert_eq!(doc.body, "subject visit 42");
    }

    #[test]
    fn failures_are_classified() {
        let chain = ParserChain::default();
        let err = chain.parse("broken.docx", b"PK\x03\x04garbage").unwrap_err();
        assert!(err.is_expected(), "{err}");

        let mut ole = OLE_MAGIC.to_vec();
        ole.extend_from_slice(&[0; 16]);
        assert!(matches!(
            chain.parse("locked.xlsx", &ole),
            Err(ExtractError::Encrypted(_))
        ));

        assert!(matches!(
            ExtractError::classify(MIME_PDF, "PDF is encrypted"),
            ExtractError::Encrypted(_)
        ));
        assert!(matches!(
            ExtractError::classify(MIME_PDF, "invalid xref table"),
            ExtractError::Malformed { .. }
        ));
        assert!(!ExtractError::classify(MIME_PDF, "index out of bounds").is_expected());
    }
}
