//! Page-level text extraction for binary documents (PDF, PPTX).
//!
//! The [`TextExtractor`] trait is the capability seam the ingestion
//! pipeline consumes; [`DocumentExtractor`] is the built-in implementation.
//! Extraction returns one [`PageText`] per PDF page or PPTX slide so
//! downstream chunks carry page provenance. Extracted text is normalized
//! before chunking: whitespace collapsed, typographic quotes and dashes
//! folded to ASCII, common report artifacts stripped.

use std::io::Read;

use crate::error::{PipelineError, Result};
use crate::models::{ContentKind, PageText};

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb
/// protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Capability interface for turning uploaded bytes into page-tagged text.
pub trait TextExtractor: Send + Sync {
    /// Extract per-page text. Pages with no text content are omitted;
    /// page numbers reflect the source document, not the output position.
    fn extract(&self, bytes: &[u8], kind: ContentKind) -> Result<Vec<PageText>>;
}

/// Built-in extractor: `pdf-extract` for PDFs, ZIP + slide XML for PPTX.
pub struct DocumentExtractor;

impl TextExtractor for DocumentExtractor {
    fn extract(&self, bytes: &[u8], kind: ContentKind) -> Result<Vec<PageText>> {
        let pages = match kind {
            ContentKind::Pdf => extract_pdf(bytes)?,
            ContentKind::Pptx => extract_pptx(bytes)?,
        };

        Ok(pages
            .into_iter()
            .map(|p| PageText {
                page_number: p.page_number,
                text: clean_text(&p.text),
            })
            .filter(|p| !p.text.is_empty())
            .collect())
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<Vec<PageText>> {
    let pages = pdf_extract::extract_text_from_mem_by_pages(bytes)
        .map_err(|e| PipelineError::extraction(format!("PDF extraction failed: {}", e)))?;

    Ok(pages
        .into_iter()
        .enumerate()
        .map(|(i, text)| PageText {
            page_number: i as i64 + 1,
            text,
        })
        .collect())
}

fn extract_pptx(bytes: &[u8]) -> Result<Vec<PageText>> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| PipelineError::extraction(format!("PPTX archive error: {}", e)))?;

    let mut slide_names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("ppt/slides/slide") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    slide_names.sort_by_key(|name| {
        name.trim_start_matches("ppt/slides/slide")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });

    let mut pages = Vec::new();
    for (i, name) in slide_names.iter().enumerate() {
        let xml = read_zip_entry_bounded(&mut archive, name, MAX_XML_ENTRY_BYTES)?;
        let text = extract_a_t_elements(&xml)?;
        pages.push(PageText {
            page_number: i as i64 + 1,
            text,
        });
    }
    Ok(pages)
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>> {
    let entry = archive
        .by_name(name)
        .map_err(|e| PipelineError::extraction(format!("PPTX entry error: {}", e)))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| PipelineError::extraction(format!("PPTX read error: {}", e)))?;
    if out.len() as u64 >= max_bytes {
        return Err(PipelineError::extraction(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

/// Collect the text of `<a:t>` runs in a slide's XML, separated by spaces.
fn extract_a_t_elements(xml: &[u8]) -> Result<String> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    if let Ok(quick_xml::events::Event::Text(te)) = reader.read_event_into(&mut buf)
                    {
                        let run = te.unescape().unwrap_or_default();
                        if !run.is_empty() {
                            if !out.is_empty() {
                                out.push(' ');
                            }
                            out.push_str(run.as_ref());
                        }
                    }
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => {
                return Err(PipelineError::extraction(format!(
                    "PPTX slide XML error: {}",
                    e
                )))
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

/// Normalize extracted page text before chunking.
pub fn clean_text(text: &str) -> String {
    let folded: String = text
        .chars()
        .map(|c| match c {
            '\u{201c}' | '\u{201d}' => '"',
            '\u{2018}' | '\u{2019}' => '\'',
            '\u{2013}' | '\u{2014}' => '-',
            _ => c,
        })
        .collect();

    let joined = folded.split_whitespace().collect::<Vec<_>>().join(" ");
    strip_artifacts(&joined)
}

/// Remove page-footer artifacts common in report documents.
fn strip_artifacts(text: &str) -> String {
    let mut out = text.to_string();
    for phrase in ["continued on next page", "Continued on next page"] {
        out = out.replace(phrase, "");
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_pdf_returns_extraction_error() {
        let err = DocumentExtractor
            .extract(b"not a pdf", ContentKind::Pdf)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Extraction { .. }));
    }

    #[test]
    fn invalid_zip_returns_extraction_error_for_pptx() {
        let err = DocumentExtractor
            .extract(b"not a zip", ContentKind::Pptx)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Extraction { .. }));
    }

    #[test]
    fn clean_text_collapses_whitespace() {
        assert_eq!(clean_text("a  b\t\tc\n\nd"), "a b c d");
    }

    #[test]
    fn clean_text_folds_typographic_characters() {
        assert_eq!(
            clean_text("\u{201c}quoted\u{201d} \u{2013} it\u{2019}s"),
            "\"quoted\" - it's"
        );
    }

    #[test]
    fn clean_text_strips_report_artifacts() {
        assert_eq!(
            clean_text("Revenue grew. Continued on next page"),
            "Revenue grew."
        );
    }
}
