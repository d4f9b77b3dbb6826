use std::io::Cursor;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use mupdf::{Colorspace, Document, Matrix, Pixmap};

use extractforms_core::pages::selected_page_numbers;
use extractforms_core::{
    BackendError, ImageFormat, PageSelectionAnalysis, PageSelectionRequest, PageSource,
    RenderOptions, RenderedPage,
};

mod text_layer;

pub use text_layer::MupdfTextLayer;

/// MuPDF-based implementation of [`PageSource`].
///
/// This crate is the sole AGPL island. It isolates the mupdf dependency
/// (which is AGPL-3.0) so that the extraction pipeline itself does not
/// transitively depend on it.
#[derive(Debug, Default, Clone, Copy)]
pub struct MupdfPageSource;

impl MupdfPageSource {
    pub fn new() -> Self {
        Self
    }
}

pub(crate) fn open_document(path: &Path) -> Result<Document, BackendError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| BackendError::OpenError("invalid path encoding".into()))?;
    Document::open(path_str).map_err(|e| BackendError::OpenError(e.to_string()))
}

fn page_count(document: &Document) -> Result<u32, BackendError> {
    let count = document
        .page_count()
        .map_err(|e| BackendError::OpenError(e.to_string()))?;
    Ok(count.max(0) as u32)
}

/// Rasterize one 1-based page as RGB without alpha.
fn rasterize(document: &Document, page_number: u32, dpi: u32) -> Result<Pixmap, BackendError> {
    let page = document
        .load_page(page_number as i32 - 1)
        .map_err(|e| BackendError::RenderError(format!("page {page_number}: {e}")))?;
    let zoom = dpi as f32 / 72.0;
    page.to_pixmap(
        &Matrix::new_scale(zoom, zoom),
        &Colorspace::device_rgb(),
        false,
        true,
    )
    .map_err(|e| BackendError::RenderError(format!("page {page_number}: {e}")))
}

fn pixmap_rgb(pixmap: &Pixmap) -> Vec<u8> {
    packed_rgb(
        pixmap.samples(),
        pixmap.width() as usize,
        pixmap.height() as usize,
        pixmap.n() as usize,
    )
}

/// Repack raw samples into tightly packed RGB rows.
///
/// Rows may carry padding past `width * channels`; channels beyond the third
/// (alpha) are dropped.
fn packed_rgb(samples: &[u8], width: usize, height: usize, channels: usize) -> Vec<u8> {
    if width == 0 || height == 0 || channels < 3 {
        return Vec::new();
    }
    let stride = samples.len() / height;
    let mut rgb = Vec::with_capacity(width * height * 3);
    for row in samples.chunks(stride).take(height) {
        for pixel in row.chunks_exact(channels).take(width) {
            rgb.extend_from_slice(&pixel[..3]);
        }
    }
    rgb
}

/// Pixels with at least one channel below `near_white_level`.
fn count_ink_pixels(rgb: &[u8], near_white_level: u8) -> usize {
    rgb.chunks_exact(3)
        .filter(|px| px.iter().any(|&c| c < near_white_level))
        .count()
}

fn is_nonblank(ink_pixels: usize, total_pixels: usize, ink_ratio_threshold: f64) -> bool {
    if total_pixels == 0 {
        return false;
    }
    ink_pixels as f64 / total_pixels as f64 >= ink_ratio_threshold
}

fn encode_image(
    rgb: Vec<u8>,
    width: u32,
    height: u32,
    format: ImageFormat,
) -> Result<Vec<u8>, BackendError> {
    let img = image::RgbImage::from_raw(width, height, rgb)
        .ok_or_else(|| BackendError::RenderError("pixel buffer does not match page size".into()))?;
    let target = match format {
        ImageFormat::Png => image::ImageFormat::Png,
        ImageFormat::Jpeg => image::ImageFormat::Jpeg,
    };
    let mut buffer = Vec::new();
    img.write_to(&mut Cursor::new(&mut buffer), target)
        .map_err(|e| BackendError::RenderError(e.to_string()))?;
    Ok(buffer)
}

impl PageSource for MupdfPageSource {
    fn render(&self, path: &Path, options: &RenderOptions) -> Result<Vec<RenderedPage>, BackendError> {
        let document = open_document(path)?;
        let numbers = selected_page_numbers(
            page_count(&document)?,
            options.page_start,
            options.page_end,
            options.max_pages,
        );

        let mut pages = Vec::with_capacity(numbers.len());
        for page_number in numbers {
            let pixmap = rasterize(&document, page_number, options.dpi)?;
            let encoded = encode_image(
                pixmap_rgb(&pixmap),
                pixmap.width(),
                pixmap.height(),
                options.image_format,
            )?;
            pages.push(RenderedPage {
                page_number,
                mime_type: options.image_format.mime_type().to_string(),
                data_base64: STANDARD.encode(encoded),
            });
        }
        tracing::debug!(path = %path.display(), pages = pages.len(), "rendered pages");
        Ok(pages)
    }

    fn analyze_selection(
        &self,
        request: &PageSelectionRequest,
    ) -> Result<PageSelectionAnalysis, BackendError> {
        let document = open_document(&request.pdf_path)?;
        let selected = selected_page_numbers(
            page_count(&document)?,
            request.page_start,
            request.page_end,
            request.max_pages,
        );

        let mut nonblank = Vec::with_capacity(selected.len());
        for &page_number in &selected {
            let pixmap = rasterize(&document, page_number, request.sample_dpi)?;
            let total = pixmap.width() as usize * pixmap.height() as usize;
            let ink = count_ink_pixels(&pixmap_rgb(&pixmap), request.near_white_level);
            if is_nonblank(ink, total, request.ink_ratio_threshold) {
                nonblank.push(page_number);
            } else {
                tracing::debug!(page = page_number, ink, total, "page looks blank");
            }
        }

        Ok(PageSelectionAnalysis {
            selected_page_numbers: selected,
            nonblank_page_numbers: nonblank,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn ink_counts_any_dark_channel() {
        let rgb = [
            255, 255, 255, // white
            250, 250, 244, // blue channel below 245
            10, 10, 10, // black
            245, 245, 245, // exactly at the level
        ];
        assert_eq!(count_ink_pixels(&rgb, 245), 2);
        assert_eq!(count_ink_pixels(&rgb, 0), 0);
    }

    #[test]
    fn nonblank_uses_inclusive_threshold() {
        assert!(is_nonblank(1, 1000, 0.001));
        assert!(!is_nonblank(0, 1000, 0.001));
        assert!(is_nonblank(0, 1000, 0.0));
        assert!(!is_nonblank(0, 0, 0.0));
    }

    #[test]
    fn packed_rgb_drops_padding_and_alpha() {
        // 2x2 RGBA with two bytes of row padding.
        let samples = [
            1, 2, 3, 255, 4, 5, 6, 255, 0, 0, //
            7, 8, 9, 255, 10, 11, 12, 255, 0, 0,
        ];
        assert_eq!(
            packed_rgb(&samples, 2, 2, 4),
            vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]
        );
        assert!(packed_rgb(&samples, 2, 2, 1).is_empty());
    }

    #[test]
    fn encodes_png_and_jpeg() {
        let rgb = vec![200u8; 4 * 4 * 3];
        let png = encode_image(rgb.clone(), 4, 4, ImageFormat::Png).unwrap();
        assert_eq!(&png[..4], b"\x89PNG");
        let jpeg = encode_image(rgb, 4, 4, ImageFormat::Jpeg).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn size_mismatch_is_render_error() {
        let err = encode_image(vec![0; 5], 4, 4, ImageFormat::Png).unwrap_err();
        assert!(matches!(err, BackendError::RenderError(_)));
    }

    #[test]
    fn missing_file_is_open_error() {
        let options = RenderOptions {
            dpi: 72,
            image_format: ImageFormat::Png,
            page_start: None,
            page_end: None,
            max_pages: None,
        };
        let err = MupdfPageSource::new()
            .render(&PathBuf::from("/nonexistent/form.pdf"), &options)
            .unwrap_err();
        assert!(matches!(err, BackendError::OpenError(_)));
    }
}
