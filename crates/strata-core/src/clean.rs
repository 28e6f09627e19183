//! Content cleaning: raw bytes + filename → clean text + content type.
//!
//! The cleaner is a pure function of its inputs. It detects the content type
//! (extension first, magic bytes second), decodes the text (BOM-aware,
//! UTF-8 when valid, Windows-1252 otherwise), and strips artifacts that would otherwise
//! leak into chunks: control characters, zero-width characters, form feeds,
//! page-number lines and line-break hyphenation from extracted documents,
//! HTML markup.
//!
//! Binary document formats (PDF, DOCX, PPTX, XLSX) are handed to a
//! pluggable [`DocumentExtractor`]; the application crate supplies one.

use std::path::Path;

use encoding_rs::{Encoding, WINDOWS_1252};

use crate::error::{EngineError, EngineResult};
use crate::models::ContentType;

/// Converts a binary document format into plain text.
pub trait DocumentExtractor: Send + Sync {
    /// Returns `true` if this extractor handles `content_type`.
    fn supports(&self, content_type: &ContentType) -> bool;

    fn extract(&self, bytes: &[u8], content_type: &ContentType) -> anyhow::Result<String>;
}

/// Output of [`ContentCleaner::clean`].
#[derive(Debug, Clone, PartialEq)]
pub struct CleanedContent {
    pub text: String,
    pub content_type: ContentType,
}

/// How many leading bytes are inspected when sniffing for binary content.
const SNIFF_BYTES: usize = 8192;

#[derive(Default)]
pub struct ContentCleaner {
    extractor: Option<Box<dyn DocumentExtractor>>,
}

impl ContentCleaner {
    pub fn new() -> Self {
        Self { extractor: None }
    }

    pub fn with_extractor(mut self, extractor: Box<dyn DocumentExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Clean `bytes` read from `filename`.
    ///
    /// Returns [`EngineError::UnsupportedContent`] for binary content that no
    /// extractor can handle, or when extraction fails.
    pub fn clean(&self, bytes: &[u8], filename: &str) -> EngineResult<CleanedContent> {
        let content_type = detect_content_type(filename, bytes).ok_or_else(|| {
            EngineError::UnsupportedContent(format!("{}: binary content", filename))
        })?;

        if content_type.is_binary_document() {
            let extractor = self
                .extractor
                .as_ref()
                .filter(|e| e.supports(&content_type))
                .ok_or_else(|| {
                    EngineError::UnsupportedContent(format!(
                        "{}: no extractor for {}",
                        filename, content_type
                    ))
                })?;
            let raw = extractor.extract(bytes, &content_type).map_err(|e| {
                EngineError::UnsupportedContent(format!("{}: {:#}", filename, e))
            })?;
            let text = normalize_text(&strip_document_artifacts(&raw));
            return Ok(CleanedContent { text, content_type });
        }

        let decoded = decode_text(bytes);
        let text = match content_type {
            ContentType::Html => normalize_text(&strip_html(&decoded)),
            _ => normalize_text(&decoded),
        };
        Ok(CleanedContent { text, content_type })
    }
}

/// Detect the content type of a file. Returns `None` for binary content
/// with no known document format.
pub fn detect_content_type(filename: &str, bytes: &[u8]) -> Option<ContentType> {
    let path = Path::new(filename);
    let base = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    if let Some(ct) = by_extension(&ext).or_else(|| by_filename(&base)) {
        if ct.is_binary_document() {
            return Some(ct);
        }
        if looks_binary(bytes) {
            return None;
        }
        return Some(ct);
    }

    if bytes.starts_with(b"%PDF-") {
        return Some(ContentType::Pdf);
    }
    if looks_binary(bytes) {
        return None;
    }
    Some(ContentType::PlainText)
}

fn by_extension(ext: &str) -> Option<ContentType> {
    let code = |lang: &str| Some(ContentType::Code(lang.to_string()));
    match ext {
        "md" | "markdown" | "mdx" => Some(ContentType::Markdown),
        "rs" => code("rust"),
        "py" | "pyi" => code("python"),
        "js" | "mjs" | "cjs" | "jsx" => code("javascript"),
        "ts" | "tsx" => code("typescript"),
        "go" => code("go"),
        "java" => code("java"),
        "kt" | "kts" => code("kotlin"),
        "c" | "h" => code("c"),
        "cc" | "cpp" | "cxx" | "hpp" | "hh" => code("cpp"),
        "cs" => code("csharp"),
        "rb" => code("ruby"),
        "php" => code("php"),
        "swift" => code("swift"),
        "scala" => code("scala"),
        "sh" | "bash" | "zsh" => code("shell"),
        "sql" => code("sql"),
        "lua" => code("lua"),
        "dart" => code("dart"),
        "ex" | "exs" => code("elixir"),
        "hs" => code("haskell"),
        "toml" | "yaml" | "yml" | "json" | "ini" | "cfg" | "conf" | "env" | "xml"
        | "properties" => Some(ContentType::Config),
        "txt" | "text" | "rst" | "log" | "csv" | "tsv" | "adoc" => Some(ContentType::PlainText),
        "html" | "htm" | "xhtml" => Some(ContentType::Html),
        "pdf" => Some(ContentType::Pdf),
        "docx" => Some(ContentType::Docx),
        "pptx" => Some(ContentType::Pptx),
        "xlsx" => Some(ContentType::Xlsx),
        _ => None,
    }
}

fn by_filename(name: &str) -> Option<ContentType> {
    match name {
        "Dockerfile" | "Containerfile" => Some(ContentType::Code("dockerfile".into())),
        "Makefile" | "makefile" | "GNUmakefile" => Some(ContentType::Code("make".into())),
        "Justfile" | "justfile" => Some(ContentType::Code("just".into())),
        ".gitignore" | ".editorconfig" | ".env" => Some(ContentType::Config),
        "README" | "LICENSE" | "CHANGELOG" => Some(ContentType::PlainText),
        _ => None,
    }
}

/// NUL bytes in the head of a file mean binary, unless the file carries a
/// UTF-16 byte-order mark.
fn looks_binary(bytes: &[u8]) -> bool {
    if bytes.starts_with(&[0xFF, 0xFE]) || bytes.starts_with(&[0xFE, 0xFF]) {
        return false;
    }
    bytes.iter().take(SNIFF_BYTES).any(|b| *b == 0)
}

/// Decode bytes into a `String`.
///
/// A UTF-8 or UTF-16 byte-order mark selects that encoding. Without one the
/// bytes are read as UTF-8 if they are valid UTF-8 (a sequence cut off at
/// the very end counts as valid and becomes U+FFFD), and as Windows-1252,
/// the superset of Latin-1 legacy editors write, otherwise.
pub fn decode_text(bytes: &[u8]) -> String {
    if let Some((encoding, bom_len)) = Encoding::for_bom(bytes) {
        let (text, _) = encoding.decode_without_bom_handling(&bytes[bom_len..]);
        return text.into_owned();
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(e) if e.error_len().is_none() => String::from_utf8_lossy(bytes).into_owned(),
        Err(_) => {
            let (text, _) = WINDOWS_1252.decode_without_bom_handling(bytes);
            text.into_owned()
        }
    }
}

/// Line-ending, control-character and blank-line normalization applied to
/// every text.
pub fn normalize_text(input: &str) -> String {
    let unified = input.replace("\r\n", "\n").replace('\r', "\n");

    let mut filtered = String::with_capacity(unified.len());
    for c in unified.chars() {
        match c {
            '\n' | '\t' => filtered.push(c),
            '\u{0C}' => filtered.push_str("\n\n"),
            '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}' | '\u{00AD}' => {}
            c if c.is_control() => {}
            c => filtered.push(c),
        }
    }

    let mut out = String::with_capacity(filtered.len());
    let mut blank_run = 0usize;
    for line in filtered.split('\n') {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }

    let trimmed = out.trim_matches('\n');
    trimmed.to_string()
}

/// Artifacts typical of text pulled out of paginated documents: page-number
/// lines and words hyphenated across a line break.
fn strip_document_artifacts(input: &str) -> String {
    let mut kept: Vec<&str> = Vec::new();
    for line in input.lines() {
        if is_page_marker(line.trim()) {
            continue;
        }
        kept.push(line);
    }
    dehyphenate(&kept.join("\n"))
}

fn is_page_marker(line: &str) -> bool {
    if line.is_empty() {
        return false;
    }
    if line.chars().all(|c| c.is_ascii_digit()) && line.len() <= 4 {
        return true;
    }
    let lower = line.to_lowercase();
    if let Some(rest) = lower.strip_prefix("page ") {
        return rest
            .split_whitespace()
            .all(|w| w == "of" || w.chars().all(|c| c.is_ascii_digit()));
    }
    false
}

/// Join `exam-\nple` into `example` when both sides are lowercase letters.
fn dehyphenate(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '-'
            && i > 0
            && chars[i - 1].is_lowercase()
            && i + 2 < chars.len()
            && chars[i + 1] == '\n'
            && chars[i + 2].is_lowercase()
        {
            i += 2;
            continue;
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

const HTML_BLOCK_TAGS: &[&str] = &[
    "p", "div", "br", "li", "ul", "ol", "tr", "table", "section", "article", "h1", "h2", "h3",
    "h4", "h5", "h6", "pre", "blockquote", "hr",
];

/// Remove markup, drop `<script>`/`<style>` bodies, turn block tags into
/// line breaks and decode the common entities.
pub fn strip_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(open) = rest.find('<') {
        out.push_str(&rest[..open]);
        let after = &rest[open..];
        let Some(close) = after.find('>') else {
            out.push_str(after);
            rest = "";
            break;
        };
        let tag = after[1..close].trim();
        let name: String = tag
            .trim_start_matches('/')
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        rest = &after[close + 1..];

        if (name == "script" || name == "style") && !tag.starts_with('/') {
            let end_tag = format!("</{}", name);
            match rest.to_ascii_lowercase().find(&end_tag) {
                Some(pos) => {
                    let tail = &rest[pos..];
                    rest = tail.find('>').map(|p| &tail[p + 1..]).unwrap_or("");
                }
                None => rest = "",
            }
            continue;
        }
        if HTML_BLOCK_TAGS.contains(&name.as_str()) {
            out.push('\n');
        }
    }
    out.push_str(rest);
    decode_entities(&out)
}

fn decode_entities(input: &str) -> String {
    input
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    struct UpperExtractor;

    impl DocumentExtractor for UpperExtractor {
        fn supports(&self, content_type: &ContentType) -> bool {
            *content_type == ContentType::Pdf
        }

        fn extract(&self, bytes: &[u8], _ct: &ContentType) -> anyhow::Result<String> {
            Ok(String::from_utf8_lossy(&bytes[5..]).to_uppercase())
        }
    }

    #[test]
    fn detects_by_extension() {
        assert_eq!(
            detect_content_type("src/lib.rs", b"fn main() {}"),
            Some(ContentType::Code("rust".into()))
        );
        assert_eq!(
            detect_content_type("a.md", b"# hi"),
            Some(ContentType::Markdown)
        );
        assert_eq!(
            detect_content_type("Cargo.toml", b"[package]"),
            Some(ContentType::Config)
        );
        assert_eq!(
            detect_content_type("docker/Dockerfile", b"FROM rust"),
            Some(ContentType::Code("dockerfile".into()))
        );
    }

    #[test]
    fn sniffs_unknown_extensions() {
        assert_eq!(
            detect_content_type("blob.bin", b"%PDF-1.7 ..."),
            Some(ContentType::Pdf)
        );
        assert_eq!(detect_content_type("image.dat", b"\x89PNG\0\0\0"), None);
        assert_eq!(
            detect_content_type("notes", b"plain words"),
            Some(ContentType::PlainText)
        );
    }

    #[test]
    fn binary_with_text_extension_is_unsupported() {
        let cleaner = ContentCleaner::new();
        let err = cleaner.clean(b"abc\0def", "file.txt").unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedContent(_)));
    }

    #[test]
    fn pdf_without_extractor_is_unsupported() {
        let cleaner = ContentCleaner::new();
        let err = cleaner.clean(b"%PDF-1.4", "doc.pdf").unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedContent(_)));
    }

    #[test]
    fn pdf_goes_through_extractor() {
        let cleaner = ContentCleaner::new().with_extractor(Box::new(UpperExtractor));
        let out = cleaner.clean(b"%PDF-hello", "doc.pdf").unwrap();
        assert_eq!(out.content_type, ContentType::Pdf);
        assert_eq!(out.text, "HELLO");
    }

    #[test]
    fn latin1_without_bom_is_decoded() {
        let out = ContentCleaner::new()
            .clean(b"caf\xE9 au lait, \x93quoted\x94", "menu.txt")
            .unwrap();
        assert_eq!(out.text, "caf\u{e9} au lait, \u{201c}quoted\u{201d}");
        assert!(!out.text.contains('\u{FFFD}'));
    }

    #[test]
    fn truncated_utf8_tail_stays_utf8() {
        // "naïve" with its final multi-byte sequence cut short.
        let out = decode_text(b"na\xC3\xAFve \xE2\x82");
        assert_eq!(out, "na\u{ef}ve \u{FFFD}");
    }

    #[test]
    fn utf8_bom_is_stripped() {
        assert_eq!(decode_text(b"\xEF\xBB\xBFcaf\xC3\xA9"), "caf\u{e9}");
    }

    #[test]
    fn utf16_bom_is_decoded() {
        let mut bytes = vec![0xFF, 0xFE];
        for u in "héllo".encode_utf16() {
            bytes.extend_from_slice(&u.to_le_bytes());
        }
        let out = ContentCleaner::new().clean(&bytes, "greeting.txt").unwrap();
        assert_eq!(out.text, "héllo");
    }

    #[test]
    fn normalize_strips_controls_and_collapses_blank_lines() {
        let raw = "one\r\ntwo\u{0}\u{200B}   \n\n\n\nthree\u{0C}four";
        assert_eq!(normalize_text(raw), "one\ntwo\n\nthree\n\nfour");
    }

    #[test]
    fn document_artifacts_are_removed() {
        let raw = "An exam-\nple sentence.\nPage 3 of 10\n12\nNext line.";
        assert_eq!(
            strip_document_artifacts(raw),
            "An example sentence.\nNext line."
        );
    }

    #[test]
    fn html_is_stripped() {
        let html = "<html><head><style>p{}</style><script>var x = 1;</script></head>\
                    <body><h1>Title</h1><p>Fish &amp; chips</p></body></html>";
        let out = ContentCleaner::new().clean(html.as_bytes(), "page.html").unwrap();
        assert_eq!(out.content_type, ContentType::Html);
        assert_eq!(out.text, "Title\n\nFish & chips");
    }
}
