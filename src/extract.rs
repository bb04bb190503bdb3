//! Text extraction for downloaded documents.
//!
//! PDF is the primary format. DOCX and plain text are accepted too, so a
//! session can mix a PDF report with a Word memo or a README. Extraction is
//! CPU-bound and synchronous; async callers should run it on
//! `spawn_blocking`.

use std::io::Read;
use std::path::Path;

use crate::error::{PipelineError, Result};

/// Upper bound on the decompressed `word/document.xml` we are willing to read.
const MAX_DOCX_XML_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    Docx,
    PlainText,
}

/// Number of leading body bytes [`DocumentKind::detect`] inspects.
pub const MAGIC_LEN: usize = 4;

impl DocumentKind {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::PlainText => "txt",
        }
    }

    fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or("").trim();
        match essence {
            "application/pdf" => Some(Self::Pdf),
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
                Some(Self::Docx)
            }
            "text/plain" | "text/markdown" => Some(Self::PlainText),
            _ => None,
        }
    }

    fn from_path(path: &str) -> Option<Self> {
        let ext = path.rsplit('.').next()?.to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(Self::Pdf),
            "docx" => Some(Self::Docx),
            "txt" | "md" => Some(Self::PlainText),
            _ => None,
        }
    }

    fn from_magic(head: &[u8]) -> Option<Self> {
        if head.starts_with(b"%PDF") {
            Some(Self::Pdf)
        } else if head.starts_with(b"PK\x03\x04") {
            Some(Self::Docx)
        } else {
            None
        }
    }

    /// Decide the kind of a download from, in order: the first bytes of the
    /// body, its `Content-Type` header, and the URL path's extension.
    /// Unknown documents are treated as PDF.
    pub fn detect(content_type: Option<&str>, url_path: &str, head: &[u8]) -> Self {
        Self::from_magic(head)
            .or_else(|| content_type.and_then(Self::from_mime))
            .or_else(|| Self::from_path(url_path))
            .unwrap_or(Self::Pdf)
    }
}

/// Extract the plain text of the document at `path`.
///
/// `label` names the document in errors (normally its URL).
pub fn extract_text(path: &Path, kind: DocumentKind, label: &str) -> Result<String> {
    let bytes = std::fs::read(path)?;
    extract_from_bytes(&bytes, kind).map_err(|reason| PipelineError::ParseFailure {
        document: label.to_string(),
        reason,
    })
}

fn extract_from_bytes(bytes: &[u8], kind: DocumentKind) -> std::result::Result<String, String> {
    match kind {
        DocumentKind::Pdf => {
            // The PDF parser panics on some malformed inputs.
            std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes))
                .map_err(|_| "PDF: parser panicked on malformed input".to_string())?
                .map_err(|e| format!("PDF: {}", e))
        }
        DocumentKind::Docx => extract_docx(bytes),
        DocumentKind::PlainText => Ok(String::from_utf8_lossy(bytes).into_owned()),
    }
}

fn extract_docx(bytes: &[u8]) -> std::result::Result<String, String> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| format!("DOCX: {}", e))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| "DOCX: word/document.xml not found".to_string())?;

    let mut xml = Vec::new();
    entry
        .take(MAX_DOCX_XML_BYTES)
        .read_to_end(&mut xml)
        .map_err(|e| format!("DOCX: {}", e))?;
    if xml.len() as u64 >= MAX_DOCX_XML_BYTES {
        return Err("DOCX: word/document.xml exceeds size limit".to_string());
    }
    docx_paragraph_text(&xml)
}

/// Collects `<w:t>` runs, starting a new line at each `</w:p>`.
fn docx_paragraph_text(xml: &[u8]) -> std::result::Result<String, String> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut out = String::new();
    let mut in_text_run = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text_run = true,
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text_run = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Text(t)) if in_text_run => {
                let text = t.unescape().map_err(|e| format!("DOCX: {}", e))?;
                out.push_str(&text);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(format!("DOCX: {}", e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}
