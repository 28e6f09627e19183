//! Text extraction for binary document formats (PDF, DOCX, PPTX, XLSX).
//!
//! [`OfficeExtractor`] plugs into the core cleaner as its
//! [`DocumentExtractor`]. An extraction failure never aborts a sync: the
//! cleaner reports the file as unsupported and the document is skipped.

use std::io::{Cursor, Read};

use quick_xml::events::Event;
use thiserror::Error;

use strata_core::clean::DocumentExtractor;
use strata_core::models::ContentType;

/// Maximum sheets read from one workbook.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells read per sheet.
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes read from a single ZIP entry (zip-bomb guard).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("no extractor for {0}")]
    Unsupported(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
}

fn ooxml(e: impl std::fmt::Display) -> ExtractError {
    ExtractError::Ooxml(e.to_string())
}

/// Extracts PDF text and the text runs of Office Open XML packages.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfficeExtractor;

impl DocumentExtractor for OfficeExtractor {
    fn supports(&self, content_type: &ContentType) -> bool {
        content_type.is_binary_document()
    }

    fn extract(&self, bytes: &[u8], content_type: &ContentType) -> anyhow::Result<String> {
        Ok(extract_text(bytes, content_type)?)
    }
}

pub fn extract_text(bytes: &[u8], content_type: &ContentType) -> Result<String, ExtractError> {
    match content_type {
        ContentType::Pdf => extract_pdf(bytes),
        ContentType::Docx => extract_docx(bytes),
        ContentType::Pptx => extract_pptx(bytes),
        ContentType::Xlsx => extract_xlsx(bytes),
        other => Err(ExtractError::Unsupported(other.label())),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

type Archive<'a> = zip::ZipArchive<Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, ExtractError> {
    zip::ZipArchive::new(Cursor::new(bytes)).map_err(ooxml)
}

fn read_entry(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, ExtractError> {
    let entry = archive.by_name(name).map_err(|e| ooxml(format!("{name}: {e}")))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(ooxml)?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

/// Entry names `{prefix}N.xml`, sorted by `N`.
fn numbered_entries(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(str::to_string)
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

/// Concatenate the text of every `<*:t>` element. A newline is emitted at
/// the end of every `break_on` element so paragraph structure survives.
fn collect_text_runs(xml: &[u8], break_on: &[u8]) -> Result<String, ExtractError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(t)) if in_text => {
                out.push_str(&t.unescape().map_err(ooxml)?);
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                if name.as_ref() == b"t" {
                    in_text = false;
                } else if name.as_ref() == break_on && !out.ends_with('\n') && !out.is_empty() {
                    out.push('\n');
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let xml = read_entry(&mut archive, "word/document.xml")?;
    collect_text_runs(&xml, b"p")
}

fn extract_pptx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let mut slides = Vec::new();
    for name in numbered_entries(&archive, "ppt/slides/slide") {
        let xml = read_entry(&mut archive, &name)?;
        let text = collect_text_runs(&xml, b"p")?;
        if !text.is_empty() {
            slides.push(text);
        }
    }
    Ok(slides.join("\n\n"))
}

fn extract_xlsx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let shared = if archive.file_names().any(|n| n == "xl/sharedStrings.xml") {
        read_shared_strings(&read_entry(&mut archive, "xl/sharedStrings.xml")?)?
    } else {
        Vec::new()
    };
    let mut sheets = Vec::new();
    for name in numbered_entries(&archive, "xl/worksheets/sheet")
        .into_iter()
        .take(XLSX_MAX_SHEETS)
    {
        let xml = read_entry(&mut archive, &name)?;
        let text = sheet_text(&xml, &shared)?;
        if !text.is_empty() {
            sheets.push(text);
        }
    }
    Ok(sheets.join("\n\n"))
}

/// One string per `<si>` entry, rich-text runs concatenated.
fn read_shared_strings(xml: &[u8]) -> Result<Vec<String>, ExtractError> {
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_text = true,
                _ => {}
            },
            Ok(Event::Text(t)) if in_text => {
                if let Some(s) = current.as_mut() {
                    s.push_str(&t.unescape().map_err(ooxml)?);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"si" => strings.extend(current.take()),
                b"t" => in_text = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Cell values of one worksheet, tab-separated per row. Shared-string
/// cells are resolved; inline and numeric values are kept verbatim.
fn sheet_text(xml: &[u8], shared: &[String]) -> Result<String, ExtractError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut rows: Vec<String> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut shared_cell = false;
    let mut in_value = false;
    let mut cells = 0usize;
    loop {
        if cells >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    shared_cell = e.attributes().flatten().any(|a| {
                        a.key.local_name().as_ref() == b"t" && a.value.as_ref() == b"s"
                    });
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(t)) if in_value => {
                let raw = t.unescape().map_err(ooxml)?;
                let value = raw.trim();
                let resolved = if value.is_empty() {
                    None
                } else if shared_cell {
                    value
                        .parse::<usize>()
                        .ok()
                        .and_then(|i| shared.get(i))
                        .cloned()
                } else {
                    Some(value.to_string())
                };
                if let Some(v) = resolved {
                    row.push(v);
                    cells += 1;
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => shared_cell = false,
                b"row" if !row.is_empty() => rows.push(std::mem::take(&mut row).join("\t")),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml(e)),
            _ => {}
        }
        buf.clear();
    }
    if !row.is_empty() {
        rows.push(row.join("\t"));
    }
    Ok(rows.join("\n"))
}
