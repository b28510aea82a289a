//! Multi-format text extraction for uploaded documents.
//!
//! The caller supplies bytes plus the declared content type and filename;
//! this module resolves a [`FileKind`] and returns plain UTF-8 text. No I/O,
//! no network. Parsers for binary formats may be slow on large files, so the
//! ingestion pipeline runs [`extract_text`] on the blocking pool.

use std::io::Read;
use std::path::Path;

use crate::error::ExtractError;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Document formats the vault knows how to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Pdf,
    PlainText,
    Markdown,
    Docx,
}

impl FileKind {
    /// Resolve the kind from the declared content type, falling back to the
    /// filename extension when the content type is missing or generic.
    pub fn detect(content_type: Option<&str>, filename: Option<&str>) -> Result<Self, ExtractError> {
        let ct = content_type.unwrap_or("").trim().to_ascii_lowercase();
        if let Some(kind) = Self::from_content_type(&ct) {
            return Ok(kind);
        }

        let ext = filename
            .and_then(|f| Path::new(f).extension())
            .map(|e| e.to_string_lossy().to_ascii_lowercase());
        if let Some(kind) = ext.as_deref().and_then(Self::from_extension) {
            return Ok(kind);
        }

        let declared = match (ct.is_empty(), filename) {
            (false, _) => ct,
            (true, Some(name)) => name.to_string(),
            (true, None) => "unknown".to_string(),
        };
        Err(ExtractError::UnsupportedFormat(declared))
    }

    fn from_content_type(ct: &str) -> Option<Self> {
        if ct.contains("pdf") {
            Some(FileKind::Pdf)
        } else if ct.contains("wordprocessingml") {
            Some(FileKind::Docx)
        } else if ct.starts_with(MIME_MARKDOWN) || ct.starts_with("text/x-markdown") {
            Some(FileKind::Markdown)
        } else if ct.starts_with(MIME_TEXT) {
            Some(FileKind::PlainText)
        } else {
            None
        }
    }

    fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "pdf" => Some(FileKind::Pdf),
            "docx" => Some(FileKind::Docx),
            "md" | "markdown" => Some(FileKind::Markdown),
            "txt" | "text" => Some(FileKind::PlainText),
            _ => None,
        }
    }
}

/// Extracts plain text. Never returns an empty (or whitespace-only) string
/// on success.
pub fn extract_text(bytes: &[u8], kind: FileKind) -> Result<String, ExtractError> {
    let text = match kind {
        FileKind::Pdf => extract_pdf(bytes)?,
        FileKind::Docx => extract_docx(bytes)?,
        FileKind::PlainText | FileKind::Markdown => decode_utf8(bytes)?,
    };

    if text.trim().is_empty() {
        return Err(ExtractError::ExtractionFailed(
            "document does not contain extractable text".to_string(),
        ));
    }
    Ok(text)
}

fn decode_utf8(bytes: &[u8]) -> Result<String, ExtractError> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    String::from_utf8(bytes.to_vec()).map_err(|e| {
        ExtractError::ExtractionFailed(format!(
            "text is not valid UTF-8 (at byte {})",
            e.utf8_error().valid_up_to()
        ))
    })
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| ExtractError::ExtractionFailed(format!("PDF: {}", e)))
}

fn ooxml_error(e: impl std::fmt::Display) -> ExtractError {
    ExtractError::ExtractionFailed(format!("DOCX: {}", e))
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(ooxml_error)?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| ooxml_error("word/document.xml not found"))?;
    let mut doc_xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut doc_xml)
        .map_err(ooxml_error)?;
    if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ooxml_error("word/document.xml exceeds size limit"));
    }
    extract_paragraphs(&doc_xml)
}

/// Collects `<w:t>` runs, one output line per `<w:p>` paragraph.
fn extract_paragraphs(xml: &[u8]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(te)) if in_text => {
                let text = te.unescape().map_err(ooxml_error)?;
                out.push_str(&text);
            }
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => out.push('\t'),
                b"br" => out.push('\n'),
                _ => {}
            },
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml_error(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn docx_with_paragraphs(paragraphs: &[&str]) -> Vec<u8> {
        let body: String = paragraphs
            .iter()
            .map(|p| format!("<w:p><w:r><w:t xml:space=\"preserve\">{}</w:t></w:r></w:p>", p))
            .collect();
        let xml = format!(
            "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body>{}</w:body></w:document>",
            body
        );
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            zip.start_file("word/document.xml", zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(xml.as_bytes()).unwrap();
            zip.finish().unwrap();
        }
        buf
    }

    #[test]
    fn detects_kind_from_content_type_first() {
        assert_eq!(
            FileKind::detect(Some("application/pdf"), Some("notes.txt")).unwrap(),
            FileKind::Pdf
        );
        assert_eq!(
            FileKind::detect(Some(MIME_DOCX), None).unwrap(),
            FileKind::Docx
        );
        assert_eq!(
            FileKind::detect(Some("text/plain; charset=utf-8"), None).unwrap(),
            FileKind::PlainText
        );
        assert_eq!(
            FileKind::detect(Some("text/markdown"), None).unwrap(),
            FileKind::Markdown
        );
    }

    #[test]
    fn falls_back_to_extension_for_generic_content_type() {
        assert_eq!(
            FileKind::detect(Some("application/octet-stream"), Some("Guide.PDF")).unwrap(),
            FileKind::Pdf
        );
        assert_eq!(
            FileKind::detect(None, Some("trip.md")).unwrap(),
            FileKind::Markdown
        );
    }

    #[test]
    fn unknown_kind_is_unsupported() {
        let err = FileKind::detect(Some("image/png"), Some("photo.png")).unwrap_err();
        assert_eq!(err, ExtractError::UnsupportedFormat("image/png".into()));
        let err = FileKind::detect(None, Some("archive.tar")).unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedFormat(_)));
    }

    #[test]
    fn plain_text_strips_bom() {
        let text = extract_text(b"\xEF\xBB\xBFHello vault", FileKind::PlainText).unwrap();
        assert_eq!(text, "Hello vault");
    }

    #[test]
    fn invalid_utf8_fails_extraction() {
        let err = extract_text(&[0x66, 0x6f, 0xff, 0xfe], FileKind::PlainText).unwrap_err();
        assert!(matches!(err, ExtractError::ExtractionFailed(_)));
    }

    #[test]
    fn whitespace_only_text_fails_extraction() {
        let err = extract_text(b"  \n\t \n", FileKind::Markdown).unwrap_err();
        assert!(matches!(err, ExtractError::ExtractionFailed(_)));
    }

    #[test]
    fn invalid_pdf_fails_extraction() {
        let err = extract_text(b"not a pdf", FileKind::Pdf).unwrap_err();
        assert!(matches!(err, ExtractError::ExtractionFailed(_)));
    }

    #[test]
    fn invalid_zip_fails_docx_extraction() {
        let err = extract_text(b"not a zip", FileKind::Docx).unwrap_err();
        assert!(matches!(err, ExtractError::ExtractionFailed(_)));
    }

    #[test]
    fn docx_paragraphs_become_lines() {
        let bytes = docx_with_paragraphs(&["Day one: Alfama.", "Day two: Sintra."]);
        let text = extract_text(&bytes, FileKind::Docx).unwrap();
        assert_eq!(text, "Day one: Alfama.\nDay two: Sintra.");
    }

    #[test]
    fn docx_without_text_fails_extraction() {
        let bytes = docx_with_paragraphs(&[]);
        let err = extract_text(&bytes, FileKind::Docx).unwrap_err();
        assert!(matches!(err, ExtractError::ExtractionFailed(_)));
    }
}
