use std::io::{Cursor, Read};

use common::error::AppError;
use quick_xml::events::Event;
use scraper::{Html, Node};
use serde::{Deserialize, Serialize};

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

/// Upper bound for the decompressed `word/document.xml` of a docx.
const MAX_DOCX_XML_BYTES: u64 = 50 * 1024 * 1024;
const MAX_HEADING_CHARS: usize = 80;
const PAGE_BREAK: char = '\u{c}';

/// One page of extracted text. Empty pages keep their slot so numbering stays stable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtractedPage {
    pub text: String,
    #[serde(default)]
    pub heading: Option<String>,
}

impl ExtractedPage {
    /// Builds a page from raw text, taking the heading from its first line.
    pub fn from_raw(raw: &str) -> Self {
        Self {
            heading: detect_heading(raw),
            text: normalize_whitespace(raw),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceKind {
    Pdf,
    Docx,
    Html,
    PlainText,
}

fn source_kind(mime_type: &str, file_name: &str) -> Option<SourceKind> {
    let mime = mime_type.to_ascii_lowercase();
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match (mime.as_str(), extension.as_str()) {
        (MIME_PDF, _) | (_, "pdf") => Some(SourceKind::Pdf),
        (MIME_DOCX, _) | (_, "docx") => Some(SourceKind::Docx),
        ("text/html", _) | (_, "html" | "htm") => Some(SourceKind::Html),
        ("text/plain" | "text/markdown" | "text/csv" | "application/json", _)
        | (_, "txt" | "md" | "markdown" | "csv" | "json") => Some(SourceKind::PlainText),
        _ => None,
    }
}

/// Extracts ordered per-page text. PDFs yield one entry per page and plain text splits on form
/// feeds; every other format is one page.
pub fn extract_pages(
    bytes: &[u8],
    mime_type: &str,
    file_name: &str,
) -> Result<Vec<ExtractedPage>, AppError> {
    let kind = source_kind(mime_type, file_name).ok_or_else(|| {
        AppError::UnsupportedFormat(format!("{file_name} ({mime_type}) cannot be indexed"))
    })?;

    match kind {
        SourceKind::Pdf => {
            let pages = pdf_extract::extract_text_from_mem_by_pages(bytes).map_err(|err| {
                AppError::UnsupportedFormat(format!("{file_name} is not a readable PDF: {err}"))
            })?;
            Ok(pages.iter().map(|page| ExtractedPage::from_raw(page)).collect())
        }
        SourceKind::Docx => Ok(vec![ExtractedPage::from_raw(&extract_docx(
            bytes, file_name,
        )?)]),
        SourceKind::Html => Ok(vec![ExtractedPage::from_raw(&html_text(&utf8(
            bytes, file_name,
        )?))]),
        SourceKind::PlainText => {
            let text = utf8(bytes, file_name)?;
            // form feeds mark page breaks in text exported from paged sources
            Ok(text.split(PAGE_BREAK).map(ExtractedPage::from_raw).collect())
        }
    }
}

fn utf8(bytes: &[u8], file_name: &str) -> Result<String, AppError> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| AppError::UnsupportedFormat(format!("{file_name} is not valid UTF-8 text")))
}

/// Collapses whitespace runs to one space and trims the ends.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// A short first line without a closing full stop is treated as the page heading.
fn detect_heading(raw: &str) -> Option<String> {
    let first = raw.lines().map(str::trim).find(|line| !line.is_empty())?;
    let candidate = normalize_whitespace(first.trim_start_matches('#'));
    let is_heading = !candidate.is_empty()
        && candidate.chars().count() <= MAX_HEADING_CHARS
        && !candidate.ends_with('.')
        && candidate.chars().any(char::is_alphabetic)
        && raw.trim() != first;
    is_heading.then_some(candidate)
}

fn extract_docx(bytes: &[u8], file_name: &str) -> Result<String, AppError> {
    let corrupt = |err: String| {
        AppError::UnsupportedFormat(format!("{file_name} is not a readable docx: {err}"))
    };

    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| corrupt(e.to_string()))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|e| corrupt(e.to_string()))?;

    let mut xml = Vec::new();
    entry
        .take(MAX_DOCX_XML_BYTES)
        .read_to_end(&mut xml)
        .map_err(|e| corrupt(e.to_string()))?;
    if xml.len() as u64 >= MAX_DOCX_XML_BYTES {
        return Err(corrupt("word/document.xml exceeds size limit".into()));
    }

    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut out = String::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Empty(e)) if matches!(e.local_name().as_ref(), b"tab" | b"br") => {
                out.push(' ');
            }
            Ok(Event::Text(text)) if in_text => {
                let unescaped = text.unescape().map_err(|e| corrupt(e.to_string()))?;
                out.push_str(&unescaped);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(corrupt(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(out)
}

/// Elements whose text never reaches the page.
const HIDDEN_TAGS: &[&str] = &["head", "script", "style", "noscript", "template"];
/// Elements that start a new line of text.
const BLOCK_TAGS: &[&str] = &[
    "p", "div", "br", "li", "tr", "td", "th", "h1", "h2", "h3", "h4", "h5", "h6", "section",
    "article", "header", "footer", "blockquote", "pre", "table", "ul", "ol",
];

/// Visible text of an HTML document with entities decoded. Comments and hidden elements are
/// dropped.
fn html_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut out = String::with_capacity(html.len());

    for node in document.root_element().descendants() {
        match node.value() {
            Node::Element(element) if BLOCK_TAGS.contains(&element.name()) => out.push('\n'),
            Node::Text(text) => {
                let hidden = node
                    .ancestors()
                    .filter_map(|ancestor| ancestor.value().as_element())
                    .any(|element| HIDDEN_TAGS.contains(&element.name()));
                if !hidden {
                    out.push_str(text);
                }
            }
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn plain_text_is_one_normalised_page() {
        let pages = extract_pages(b"  Alpha \n\n  Beta\t Gamma  ", "text/plain", "a.txt")
            .expect("extract");
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].text, "Alpha Beta Gamma");
    }

    #[test]
    fn markdown_heading_is_detected() {
        let pages = extract_pages(
            b"# Scope of Work\n\nThe contractor shall deliver.",
            "text/markdown",
            "scope.md",
        )
        .expect("extract");
        assert_eq!(pages[0].heading.as_deref(), Some("Scope of Work"));
        assert!(pages[0].text.starts_with("# Scope of Work The contractor"));
    }

    #[test]
    fn html_is_stripped() {
        let html = b"<html><head><style>p{}</style><script>var x = 1;</script></head>\
            <body><p>Alpha &amp; Beta</p><!-- hidden --></body></html>";
        let pages = extract_pages(html, "text/html", "page.html").expect("extract");
        assert_eq!(pages[0].text, "Alpha & Beta");
    }

    #[test]
    fn html_entities_are_decoded() {
        let html = b"<html><head><title>Fees</title></head><body>\
            <h1>Caf&eacute; &#8364;5</h1><p>tender&rsquo;s &#x2014; fee&nbsp;schedule</p>\
            <ul><li>1 &lt; 2</li><li>A&amp;B</li></ul></body></html>";
        let pages = extract_pages(html, "text/html", "fees.html").expect("extract");

        assert_eq!(
            pages[0].text,
            "Caf\u{e9} \u{20ac}5 tender\u{2019}s \u{2014} fee schedule 1 < 2 A&B"
        );
        assert_eq!(pages[0].heading.as_deref(), Some("Caf\u{e9} \u{20ac}5"));
    }

    #[test]
    fn inline_markup_does_not_split_words() {
        let html = b"<p>Sub<b>mission</b> deadline</p>";
        let pages = extract_pages(html, "text/html", "a.html").expect("extract");
        assert_eq!(pages[0].text, "Submission deadline");
    }

    #[test]
    fn docx_paragraphs_are_read() {
        let mut buffer = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buffer);
            writer
                .start_file("word/document.xml", zip::write::SimpleFileOptions::default())
                .expect("start");
            writer
                .write_all(
                    br#"<w:document xmlns:w="x"><w:body>
                    <w:p><w:r><w:t>Tender </w:t></w:r><w:r><w:t>Notice</w:t></w:r></w:p>
                    <w:p><w:r><w:t>Deadline is Friday.</w:t></w:r></w:p>
                    </w:body></w:document>"#,
                )
                .expect("write");
            writer.finish().expect("finish");
        }

        let pages = extract_pages(buffer.get_ref(), MIME_DOCX, "notice.docx").expect("extract");
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].text, "Tender Notice Deadline is Friday.");
        assert_eq!(pages[0].heading.as_deref(), Some("Tender Notice"));
    }

    #[test]
    fn unsupported_and_corrupt_inputs_fail() {
        assert!(matches!(
            extract_pages(b"MZ", "application/x-msdownload", "setup.exe"),
            Err(AppError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            extract_pages(b"not a pdf", MIME_PDF, "broken.pdf"),
            Err(AppError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            extract_pages(&[0xff, 0xfe, 0x00], "text/plain", "bad.txt"),
            Err(AppError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn form_feeds_split_text_into_pages() {
        let text = b"Alpha Beta\x0c\x0cGamma Delta";
        let pages = extract_pages(text, "text/plain", "two.txt").expect("extract");
        let texts: Vec<&str> = pages.iter().map(|p| p.text.as_str()).collect();
        assert_eq!(texts, vec!["Alpha Beta", "", "Gamma Delta"]);
    }

    #[test]
    fn single_line_pages_have_no_heading() {
        let page = ExtractedPage::from_raw("Just one line");
        assert!(page.heading.is_none());
    }
}
