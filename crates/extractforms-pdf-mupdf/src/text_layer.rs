use std::path::{Path, PathBuf};

use mupdf::TextPageFlags;

use extractforms_core::RenderedPage;
use extractforms_core::backend::BackendError;
use extractforms_core::backend::ocr::{OcrPage, OcrPageProvider};

use crate::open_document;

/// Reads the embedded text layer of a PDF as OCR lines.
///
/// Rendered pages are only used for their page numbers; the text comes from
/// the document itself, so scanned pages without a text layer yield no lines.
#[derive(Debug, Clone)]
pub struct MupdfTextLayer {
    pdf_path: PathBuf,
}

impl MupdfTextLayer {
    pub fn new(pdf_path: impl Into<PathBuf>) -> Self {
        Self {
            pdf_path: pdf_path.into(),
        }
    }

    pub fn pdf_path(&self) -> &Path {
        &self.pdf_path
    }
}

impl OcrPageProvider for MupdfTextLayer {
    fn extract_pages(&self, pages: &[RenderedPage]) -> Result<Vec<OcrPage>, BackendError> {
        let document = open_document(&self.pdf_path)?;

        let mut out = Vec::with_capacity(pages.len());
        for rendered in pages {
            let page = document
                .load_page(rendered.page_number as i32 - 1)
                .map_err(|e| BackendError::Ocr(format!("page {}: {e}", rendered.page_number)))?;
            let text_page = page
                .to_text_page(TextPageFlags::empty())
                .map_err(|e| BackendError::Ocr(format!("page {}: {e}", rendered.page_number)))?;

            let mut lines = Vec::new();
            for block in text_page.blocks() {
                for line in block.lines() {
                    let text: String = line
                        .chars()
                        .map(|c| c.char().unwrap_or('\u{FFFD}'))
                        .collect();
                    push_line(&mut lines, &text);
                }
            }
            out.push(OcrPage {
                page_number: Some(rendered.page_number),
                lines,
            });
        }
        Ok(out)
    }
}

fn push_line(lines: &mut Vec<String>, text: &str) {
    let text = text.trim();
    if !text.is_empty() {
        lines.push(text.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_lines_are_skipped() {
        let mut lines = Vec::new();
        push_line(&mut lines, "  Name: Jane  ");
        push_line(&mut lines, "   ");
        push_line(&mut lines, "");
        assert_eq!(lines, vec!["Name: Jane".to_string()]);
    }

    #[test]
    fn unreadable_document_is_open_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.pdf");
        std::fs::write(&path, b"not a pdf at all").unwrap();

        let page = RenderedPage {
            page_number: 1,
            mime_type: "image/png".into(),
            data_base64: String::new(),
        };
        let err = MupdfTextLayer::new(&path).extract_pages(&[page]).unwrap_err();
        assert!(matches!(err, BackendError::OpenError(_)));
    }
}
