//! Format-specific text extraction.
//!
//! [`Extractor`] is a closed set of variants, one per supported format,
//! resolved from the file extension. Each variant carries its own input size
//! ceiling and bounded parsing strategy; anything it cannot handle comes back
//! as a typed [`ExtractError`], never as a silently partial result. Output is
//! raw text split into labelled [`Section`]s; redaction happens later at the
//! guardrail boundary.

use std::io::Read;
use std::path::Path;
use std::sync::OnceLock;

use quick_xml::events::Event;
use regex::Regex;

use crate::chunk::{chunk_sections, Section};
use crate::models::NewChunk;

const MIB: u64 = 1024 * 1024;

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * MIB;
const XLSX_MAX_SHEETS: usize = 100;
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
const PPTX_MAX_SLIDES: usize = 2_000;
const ZIP_MAX_ENTRIES: usize = 1_000;
/// Archive members at or below this size are inlined when they look like text.
const ZIP_TEXT_ENTRY_MAX_BYTES: u64 = 10_000;
const CSV_ROWS_PER_SECTION: usize = 50;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("unsupported extension: {0}")]
    Unsupported(String),

    #[error("file too large: {size} bytes exceeds {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },

    #[error("{format} extraction failed: {reason}")]
    Failed { format: &'static str, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExtractError {
    fn failed(format: &'static str, reason: impl ToString) -> Self {
        ExtractError::Failed {
            format,
            reason: reason.to_string(),
        }
    }
}

/// One variant per supported format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extractor {
    Text,
    Markup,
    Csv,
    Pdf,
    Docx,
    Pptx,
    Xlsx,
    Zip,
    Unsupported(String),
}

impl Extractor {
    pub fn for_extension(ext: &str) -> Self {
        let ext = ext.trim_start_matches('.').to_ascii_lowercase();
        match ext.as_str() {
            "txt" | "md" | "py" | "js" | "ts" | "css" | "json" | "yaml" | "yml" | "sql"
            | "log" | "ini" | "cfg" => Extractor::Text,
            "html" | "htm" | "xml" => Extractor::Markup,
            "csv" => Extractor::Csv,
            "pdf" => Extractor::Pdf,
            "docx" => Extractor::Docx,
            "pptx" => Extractor::Pptx,
            "xlsx" => Extractor::Xlsx,
            "zip" => Extractor::Zip,
            _ => Extractor::Unsupported(ext),
        }
    }

    pub fn for_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_default();
        Self::for_extension(&ext)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Extractor::Text => "text",
            Extractor::Markup => "markup",
            Extractor::Csv => "csv",
            Extractor::Pdf => "pdf",
            Extractor::Docx => "docx",
            Extractor::Pptx => "pptx",
            Extractor::Xlsx => "xlsx",
            Extractor::Zip => "zip",
            Extractor::Unsupported(_) => "unsupported",
        }
    }

    /// Inputs above this size fail fast with [`ExtractError::TooLarge`].
    pub fn max_input_bytes(&self) -> u64 {
        match self {
            Extractor::Text | Extractor::Markup | Extractor::Csv => 10 * MIB,
            Extractor::Pdf | Extractor::Docx | Extractor::Pptx | Extractor::Xlsx => 50 * MIB,
            Extractor::Zip => 100 * MIB,
            Extractor::Unsupported(_) => 0,
        }
    }

    pub fn extract(&self, bytes: &[u8]) -> Result<Vec<Section>, ExtractError> {
        match self {
            Extractor::Text => Ok(vec![Section::flat(decode_text(bytes))]),
            Extractor::Markup => Ok(vec![Section::flat(strip_markup(&decode_text(bytes)))]),
            Extractor::Csv => Ok(extract_csv(&decode_text(bytes))),
            Extractor::Pdf => extract_pdf(bytes),
            Extractor::Docx => extract_docx(bytes),
            Extractor::Pptx => extract_pptx(bytes),
            Extractor::Xlsx => extract_xlsx(bytes),
            Extractor::Zip => extract_zip(bytes),
            Extractor::Unsupported(ext) => Err(ExtractError::Unsupported(ext.clone())),
        }
    }
}

/// Extracted content of one file.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub format: &'static str,
    pub sections: Vec<Section>,
}

impl Extraction {
    /// Lazy chunk sequence; restartable by calling again.
    pub fn chunks(&self, max_chars: usize, overlap: usize) -> impl Iterator<Item = NewChunk> + '_ {
        chunk_sections(&self.sections, max_chars, overlap)
    }
}

/// Read and extract one file. `max_file_size` further caps the variant's own ceiling.
pub fn extract_file(path: &Path, max_file_size: u64) -> Result<Extraction, ExtractError> {
    let extractor = Extractor::for_path(path);
    if let Extractor::Unsupported(ext) = &extractor {
        return Err(ExtractError::Unsupported(ext.clone()));
    }

    let limit = extractor.max_input_bytes().min(max_file_size);
    let size = std::fs::metadata(path)?.len();
    if size > limit {
        return Err(ExtractError::TooLarge { size, limit });
    }

    let mut bytes = Vec::with_capacity(size as usize);
    std::fs::File::open(path)?
        .take(limit + 1)
        .read_to_end(&mut bytes)?;
    if bytes.len() as u64 > limit {
        return Err(ExtractError::TooLarge {
            size: bytes.len() as u64,
            limit,
        });
    }

    let sections = extractor.extract(&bytes)?;
    Ok(Extraction {
        format: extractor.name(),
        sections,
    })
}

// ============ Text ============

/// UTF-16 (with BOM), then UTF-8 (BOM stripped), then Latin-1.
pub fn decode_text(bytes: &[u8]) -> String {
    if let Some(rest) = bytes.strip_prefix(&[0xFF, 0xFE]) {
        return decode_utf16(rest, u16::from_le_bytes);
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        return decode_utf16(rest, u16::from_be_bytes);
    }
    let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

fn decode_utf16(bytes: &[u8], from: fn([u8; 2]) -> u16) -> String {
    let units: Vec<u16> = bytes.chunks_exact(2).map(|c| from([c[0], c[1]])).collect();
    String::from_utf16_lossy(&units)
}

// ============ HTML / XML ============

fn markup_patterns() -> &'static [Regex; 4] {
    static PATTERNS: OnceLock<[Regex; 4]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Regex::new(r"(?is)<script\b.*?</script\s*>").expect("static regex"),
            Regex::new(r"(?is)<style\b.*?</style\s*>").expect("static regex"),
            Regex::new(r"(?s)<!--.*?-->").expect("static regex"),
            Regex::new(r"(?s)<[^>]*>").expect("static regex"),
        ]
    })
}

pub fn strip_markup(input: &str) -> String {
    let [script, style, comment, tag] = markup_patterns();
    let text = script.replace_all(input, " ");
    let text = style.replace_all(&text, " ");
    let text = comment.replace_all(&text, " ");
    let text = tag.replace_all(&text, "\n");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");

    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            blank_run += 1;
            if blank_run == 1 && !out.is_empty() {
                out.push('\n');
            }
            continue;
        }
        blank_run = 0;
        if !out.is_empty() && !out.ends_with('\n') {
            out.push(' ');
        }
        out.push_str(line);
    }
    out.trim().to_string()
}

// ============ CSV ============

fn sniff_delimiter(text: &str) -> char {
    let sample: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).take(5).collect();
    let mut best = (',', 0usize);
    for delim in [',', ';', '\t', '|'] {
        let counts: Vec<usize> = sample.iter().map(|l| l.matches(delim).count()).collect();
        let min = counts.iter().copied().min().unwrap_or(0);
        if min > best.1 {
            best = (delim, min);
        }
    }
    best.0
}

fn split_csv_line(line: &str, delim: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            c if c == delim && !in_quotes => fields.push(std::mem::take(&mut field)),
            c => field.push(c),
        }
    }
    fields.push(field);
    fields.into_iter().map(|f| f.trim().to_string()).collect()
}

fn extract_csv(text: &str) -> Vec<Section> {
    let delim = sniff_delimiter(text);
    let rows: Vec<String> = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| split_csv_line(l, delim).join("\t"))
        .collect();

    rows.chunks(CSV_ROWS_PER_SECTION)
        .enumerate()
        .map(|(i, block)| {
            let first = i * CSV_ROWS_PER_SECTION + 1;
            let last = first + block.len() - 1;
            Section::labelled(format!("rows {}-{}", first, last), block.join("\n"))
        })
        .collect()
}

// ============ PDF ============

fn extract_pdf(bytes: &[u8]) -> Result<Vec<Section>, ExtractError> {
    // pdf-extract panics on some malformed inputs; treat that as a failure.
    let pages = std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem_by_pages(bytes))
        .map_err(|_| ExtractError::failed("pdf", "parser panicked on malformed input"))?
        .map_err(|e| ExtractError::failed("pdf", e))?;

    Ok(pages
        .into_iter()
        .enumerate()
        .filter(|(_, text)| !text.trim().is_empty())
        .map(|(i, text)| Section::labelled(format!("page {}", i + 1), text))
        .collect())
}

// ============ OOXML ============

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_archive<'a>(format: &'static str, bytes: &'a [u8]) -> Result<Archive<'a>, ExtractError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ExtractError::failed(format, e))
}

fn read_zip_entry_bounded(
    format: &'static str,
    archive: &mut Archive<'_>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::failed(format, format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::failed(format, e))?;
    if out.len() as u64 >= max_bytes {
        return Err(ExtractError::failed(
            format,
            format!("ZIP entry {} exceeds size limit ({} bytes)", name, max_bytes),
        ));
    }
    Ok(out)
}

/// Collects text runs (`<*:t>`) grouped by paragraph (`<*:p>`).
fn paragraphs_from_xml(format: &'static str, xml: &[u8]) -> Result<Vec<String>, ExtractError> {
    let mut paragraphs = Vec::new();
    let mut current = String::new();
    let mut in_t = false;
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"t" => in_t = true,
                b"p" => current.clear(),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => current.push('\t'),
                b"br" => current.push('\n'),
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                let text = te.unescape().map_err(|e| ExtractError::failed(format, e))?;
                current.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"p" => {
                    let p = current.trim();
                    if !p.is_empty() {
                        paragraphs.push(p.to_string());
                    }
                    current.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::failed(format, e)),
            _ => {}
        }
        buf.clear();
    }
    let tail = current.trim();
    if !tail.is_empty() {
        paragraphs.push(tail.to_string());
    }
    Ok(paragraphs)
}

fn extract_docx(bytes: &[u8]) -> Result<Vec<Section>, ExtractError> {
    let mut archive = open_archive("docx", bytes)?;
    let xml = read_zip_entry_bounded("docx", &mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;
    let paragraphs = paragraphs_from_xml("docx", &xml)?;
    Ok(vec![Section::flat(paragraphs.join("\n\n"))])
}

fn numbered_entries(archive: &Archive<'_>, prefix: &str, suffix: &str) -> Vec<(u32, String)> {
    let mut names: Vec<(u32, String)> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(suffix))
        .filter_map(|n| {
            n[prefix.len()..n.len() - suffix.len()]
                .parse::<u32>()
                .ok()
                .map(|num| (num, n.to_string()))
        })
        .collect();
    names.sort();
    names
}

fn extract_pptx(bytes: &[u8]) -> Result<Vec<Section>, ExtractError> {
    let mut archive = open_archive("pptx", bytes)?;
    let slides = numbered_entries(&archive, "ppt/slides/slide", ".xml");
    let mut sections = Vec::new();
    for (num, name) in slides.into_iter().take(PPTX_MAX_SLIDES) {
        let xml = read_zip_entry_bounded("pptx", &mut archive, &name, MAX_XML_ENTRY_BYTES)?;
        let text = paragraphs_from_xml("pptx", &xml)?.join("\n");
        if !text.trim().is_empty() {
            sections.push(Section::labelled(format!("slide {}", num), text));
        }
    }
    Ok(sections)
}

fn extract_xlsx(bytes: &[u8]) -> Result<Vec<Section>, ExtractError> {
    let mut archive = open_archive("xlsx", bytes)?;
    let shared = read_shared_strings(&mut archive)?;
    let sheets = list_sheets(&mut archive)?;

    let mut sections = Vec::new();
    for (name, entry) in sheets.into_iter().take(XLSX_MAX_SHEETS) {
        let xml = read_zip_entry_bounded("xlsx", &mut archive, &entry, MAX_XML_ENTRY_BYTES)?;
        let rows = sheet_rows(&xml, &shared)?;
        if rows.is_empty() {
            continue;
        }
        sections.push(Section::labelled(format!("sheet '{}'", name), rows.join("\n")));
    }
    Ok(sections)
}

fn read_shared_strings(archive: &mut Archive<'_>) -> Result<Vec<String>, ExtractError> {
    if archive.index_for_name("xl/sharedStrings.xml").is_none() {
        return Ok(Vec::new());
    }
    let xml = read_zip_entry_bounded("xlsx", archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES)?;
    let mut strings = Vec::new();
    let mut current = String::new();
    let mut in_t = false;
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current.clear(),
                b"t" => in_t = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                let text = te.unescape().map_err(|e| ExtractError::failed("xlsx", e))?;
                current.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"si" => strings.push(std::mem::take(&mut current)),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::failed("xlsx", e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// `(display name, zip entry)` in workbook order. Falls back to numbered
/// `sheetN.xml` entries when the workbook relationships are missing.
fn list_sheets(archive: &mut Archive<'_>) -> Result<Vec<(String, String)>, ExtractError> {
    if archive.index_for_name("xl/workbook.xml").is_none()
        || archive.index_for_name("xl/_rels/workbook.xml.rels").is_none()
    {
        return Ok(numbered_sheets(archive));
    }

    let rels_xml =
        read_zip_entry_bounded("xlsx", archive, "xl/_rels/workbook.xml.rels", MAX_XML_ENTRY_BYTES)?;
    let mut targets = std::collections::HashMap::new();
    for attrs in elements_with_attrs(&rels_xml, b"Relationship")? {
        if let (Some(id), Some(target)) = (attrs.get("Id"), attrs.get("Target")) {
            let target = target.trim_start_matches('/');
            let entry = if target.starts_with("xl/") {
                target.to_string()
            } else {
                format!("xl/{}", target)
            };
            targets.insert(id.clone(), entry);
        }
    }

    let workbook_xml = read_zip_entry_bounded("xlsx", archive, "xl/workbook.xml", MAX_XML_ENTRY_BYTES)?;
    let mut sheets = Vec::new();
    for attrs in elements_with_attrs(&workbook_xml, b"sheet")? {
        let name = attrs.get("name").cloned().unwrap_or_default();
        if let Some(entry) = attrs.get("id").and_then(|id| targets.get(id)) {
            sheets.push((name, entry.clone()));
        }
    }

    if sheets.is_empty() {
        return Ok(numbered_sheets(archive));
    }
    Ok(sheets)
}

fn numbered_sheets(archive: &Archive<'_>) -> Vec<(String, String)> {
    numbered_entries(archive, "xl/worksheets/sheet", ".xml")
        .into_iter()
        .map(|(n, entry)| (format!("Sheet{}", n), entry))
        .collect()
}

/// Attributes (keyed by local name) of every element with the given local name.
fn elements_with_attrs(
    xml: &[u8],
    local: &[u8],
) -> Result<Vec<std::collections::HashMap<String, String>>, ExtractError> {
    let mut found = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == local => {
                let mut attrs = std::collections::HashMap::new();
                for attr in e.attributes().flatten() {
                    let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).to_string();
                    let value = attr
                        .unescape_value()
                        .map_err(|e| ExtractError::failed("xlsx", e))?
                        .to_string();
                    attrs.insert(key, value);
                }
                found.push(attrs);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::failed("xlsx", e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(found)
}

/// Cell values per row, tab-joined. Shared, inline and literal values all count.
fn sheet_rows(xml: &[u8], shared: &[String]) -> Result<Vec<String>, ExtractError> {
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut cell_type = String::new();
    let mut in_value = false;
    let mut cells = 0usize;
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        if cells >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => row.clear(),
                b"c" => {
                    cell_type = e
                        .attributes()
                        .flatten()
                        .find(|a| a.key.as_ref() == b"t")
                        .map(|a| String::from_utf8_lossy(&a.value).to_string())
                        .unwrap_or_default();
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                let raw = te.unescape().map_err(|e| ExtractError::failed("xlsx", e))?;
                let raw = raw.trim();
                let value = if cell_type == "s" {
                    raw.parse::<usize>()
                        .ok()
                        .and_then(|i| shared.get(i).cloned())
                        .unwrap_or_default()
                } else {
                    raw.to_string()
                };
                if !value.is_empty() {
                    row.push(value);
                    cells += 1;
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => cell_type.clear(),
                b"row" => {
                    if !row.is_empty() {
                        rows.push(row.join("\t"));
                    }
                    row.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::failed("xlsx", e)),
            _ => {}
        }
        buf.clear();
    }
    if !row.is_empty() {
        rows.push(row.join("\t"));
    }
    Ok(rows)
}

// ============ ZIP archives ============

fn looks_textual(name: &str) -> bool {
    matches!(
        Extractor::for_path(Path::new(name)),
        Extractor::Text | Extractor::Markup | Extractor::Csv
    )
}

fn extract_zip(bytes: &[u8]) -> Result<Vec<Section>, ExtractError> {
    let mut archive = open_archive("zip", bytes)?;
    let count = archive.len().min(ZIP_MAX_ENTRIES);

    let mut listing = Vec::with_capacity(count);
    let mut small_text = Vec::new();
    for i in 0..count {
        let entry = archive.by_index(i).map_err(|e| ExtractError::failed("zip", e))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        listing.push(format!("{}\t{} bytes", name, entry.size()));
        if entry.size() <= ZIP_TEXT_ENTRY_MAX_BYTES && looks_textual(&name) {
            small_text.push(name);
        }
    }

    let mut sections = vec![Section::labelled("listing", listing.join("\n"))];
    for name in small_text {
        let raw = read_zip_entry_bounded("zip", &mut archive, &name, ZIP_TEXT_ENTRY_MAX_BYTES + 1)?;
        let text = decode_text(&raw);
        let text = match Extractor::for_path(Path::new(&name)) {
            Extractor::Markup => strip_markup(&text),
            _ => text,
        };
        if !text.trim().is_empty() {
            sections.push(Section::labelled(format!("entry {}", name), text));
        }
    }
    Ok(sections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn zip_with(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            for (name, body) in entries {
                zip.start_file(*name, zip::write::SimpleFileOptions::default())
                    .unwrap();
                zip.write_all(body.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        buf
    }

    #[test]
    fn extension_dispatch_is_closed() {
        assert_eq!(Extractor::for_extension("PDF"), Extractor::Pdf);
        assert_eq!(Extractor::for_extension(".md"), Extractor::Text);
        assert_eq!(Extractor::for_extension("htm"), Extractor::Markup);
        assert_eq!(
            Extractor::for_extension("exe"),
            Extractor::Unsupported("exe".to_string())
        );
    }

    #[test]
    fn unsupported_returns_error() {
        let err = Extractor::for_extension("bin").extract(b"foo").unwrap_err();
        assert!(matches!(err, ExtractError::Unsupported(_)));
    }

    #[test]
    fn invalid_pdf_returns_error() {
        let err = Extractor::Pdf.extract(b"not a pdf").unwrap_err();
        assert!(matches!(err, ExtractError::Failed { format: "pdf", .. }));
    }

    #[test]
    fn invalid_zip_returns_error_for_docx() {
        let err = Extractor::Docx.extract(b"not a zip").unwrap_err();
        assert!(matches!(err, ExtractError::Failed { format: "docx", .. }));
    }

    #[test]
    fn latin1_fallback_and_bom() {
        assert_eq!(decode_text(&[0x63, 0x61, 0x66, 0xE9]), "café");
        assert_eq!(decode_text(b"\xEF\xBB\xBFhello"), "hello");
    }

    #[test]
    fn markup_drops_scripts_and_tags() {
        let html = "<html><head><style>p{color:red}</style><script>var secret=1;</script></head>\
                    <body><h1>Title</h1><p>Fish &amp; chips</p></body></html>";
        let text = strip_markup(html);
        assert!(text.contains("Title"));
        assert!(text.contains("Fish & chips"));
        assert!(!text.contains("secret"));
        assert!(!text.contains("color"));
        assert!(!text.contains('<'));
    }

    #[test]
    fn csv_sniffs_semicolons_and_labels_rows() {
        let sections = extract_csv("name;amount\n\"Smith; J\";10\nDoe;20\n");
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].label.as_deref(), Some("rows 1-3"));
        assert!(sections[0].text.contains("Smith; J\t10"));
    }

    #[test]
    fn docx_paragraphs_keep_run_spacing() {
        let xml = "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body>\
                   <w:p><w:r><w:t xml:space=\"preserve\">Quarterly </w:t></w:r><w:r><w:t>budget</w:t></w:r></w:p>\
                   <w:p><w:r><w:t>Second paragraph</w:t></w:r></w:p></w:body></w:document>";
        let bytes = zip_with(&[("word/document.xml", xml)]);
        let sections = Extractor::Docx.extract(&bytes).unwrap();
        assert_eq!(sections[0].text, "Quarterly budget\n\nSecond paragraph");
    }

    #[test]
    fn pptx_slides_are_numbered() {
        let slide = |t: &str| {
            format!(
                "<p:sld xmlns:p=\"p\" xmlns:a=\"a\"><p:cSld><p:spTree><p:sp><p:txBody><a:p><a:r><a:t>{}</a:t></a:r></a:p></p:txBody></p:sp></p:spTree></p:cSld></p:sld>",
                t
            )
        };
        let s1 = slide("Intro");
        let s10 = slide("Roadmap");
        let s2 = slide("Budget");
        let bytes = zip_with(&[
            ("ppt/slides/slide1.xml", s1.as_str()),
            ("ppt/slides/slide10.xml", s10.as_str()),
            ("ppt/slides/slide2.xml", s2.as_str()),
        ]);
        let sections = Extractor::Pptx.extract(&bytes).unwrap();
        let labels: Vec<_> = sections.iter().map(|s| s.label.clone().unwrap()).collect();
        assert_eq!(labels, vec!["slide 1", "slide 2", "slide 10"]);
        assert_eq!(sections[1].text, "Budget");
    }

    #[test]
    fn xlsx_uses_workbook_sheet_names() {
        let workbook = "<workbook xmlns=\"m\" xmlns:r=\"r\"><sheets><sheet name=\"Q2\" sheetId=\"1\" r:id=\"rId1\"/></sheets></workbook>";
        let rels = "<Relationships><Relationship Id=\"rId1\" Target=\"worksheets/sheet1.xml\"/></Relationships>";
        let shared = "<sst><si><t>Revenue</t></si><si><t>Costs</t></si></sst>";
        let sheet = "<worksheet><sheetData>\
                     <row r=\"1\"><c r=\"A1\" t=\"s\"><v>0</v></c><c r=\"B1\"><v>42</v></c></row>\
                     <row r=\"2\"><c r=\"A2\" t=\"s\"><v>1</v></c><c r=\"B2\" t=\"inlineStr\"><is><t>n/a</t></is></c></row>\
                     </sheetData></worksheet>";
        let bytes = zip_with(&[
            ("xl/workbook.xml", workbook),
            ("xl/_rels/workbook.xml.rels", rels),
            ("xl/sharedStrings.xml", shared),
            ("xl/worksheets/sheet1.xml", sheet),
        ]);
        let sections = Extractor::Xlsx.extract(&bytes).unwrap();
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].label.as_deref(), Some("sheet 'Q2'"));
        assert_eq!(sections[0].text, "Revenue\t42\nCosts\tn/a");
    }

    #[test]
    fn zip_lists_entries_and_inlines_small_text() {
        let bytes = zip_with(&[("notes/readme.txt", "inner budget notes"), ("image.png", "xx")]);
        let sections = Extractor::Zip.extract(&bytes).unwrap();
        assert_eq!(sections[0].label.as_deref(), Some("listing"));
        assert!(sections[0].text.contains("image.png"));
        assert_eq!(sections[1].label.as_deref(), Some("entry notes/readme.txt"));
        assert_eq!(sections[1].text, "inner budget notes");
    }

    #[test]
    fn too_large_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.txt");
        std::fs::write(&path, "x".repeat(2048)).unwrap();
        let err = extract_file(&path, 1024).unwrap_err();
        assert!(matches!(err, ExtractError::TooLarge { size: 2048, limit: 1024 }));
    }

    #[test]
    fn text_file_round_trip_through_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "budget review\n\nsecond para").unwrap();
        let extraction = extract_file(&path, 1024).unwrap();
        let chunks: Vec<_> = extraction.chunks(1000, 100).collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].pointer, "chunk 1");
        assert!(chunks[0].content.contains("budget review"));
    }
}
