//! Page rendering and blank-page analysis collaborators.
//!
//! The core only defines the interface; `extractforms-pdf-mupdf` provides the
//! rasterizing implementation.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::backend::BackendError;
use crate::models::{ImageFormat, RenderedPage};

/// How pages are rasterized for a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderOptions {
    pub dpi: u32,
    pub image_format: ImageFormat,
    pub page_start: Option<u32>,
    pub page_end: Option<u32>,
    pub max_pages: Option<u32>,
}

/// Parameters of a blank-page analysis pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PageSelectionRequest {
    pub pdf_path: PathBuf,
    pub page_start: Option<u32>,
    pub page_end: Option<u32>,
    pub max_pages: Option<u32>,
    /// Minimum share of ink pixels for a page to count as non-blank.
    pub ink_ratio_threshold: f64,
    /// A pixel is ink when any channel is below this level.
    pub near_white_level: u8,
    pub sample_dpi: u32,
}

/// Pages considered by a run, before and after blank filtering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageSelectionAnalysis {
    pub selected_page_numbers: Vec<u32>,
    pub nonblank_page_numbers: Vec<u32>,
}

/// Source of rendered pages for a PDF document.
pub trait PageSource: Send + Sync {
    /// Rasterize the selected pages. Page numbers are 1-based physical numbers.
    fn render(&self, path: &Path, options: &RenderOptions)
    -> Result<Vec<RenderedPage>, BackendError>;

    /// Classify the selected pages as blank or non-blank.
    fn analyze_selection(
        &self,
        request: &PageSelectionRequest,
    ) -> Result<PageSelectionAnalysis, BackendError>;
}

/// 1-based page numbers selected from a document of `total` pages.
///
/// The range is `[max(1, start), min(end or total, total)]`, truncated to `max_pages`.
pub fn selected_page_numbers(
    total: u32,
    page_start: Option<u32>,
    page_end: Option<u32>,
    max_pages: Option<u32>,
) -> Vec<u32> {
    let first = page_start.unwrap_or(1).max(1);
    let last = page_end.unwrap_or(total).min(total);
    let pages = (first..=last).take(max_pages.map_or(usize::MAX, |m| m as usize));
    pages.collect()
}

/// Keep only rendered pages listed as non-blank. An empty list keeps everything.
pub fn filter_rendered_pages_to_nonblank(
    pages: Vec<RenderedPage>,
    nonblank_page_numbers: &[u32],
) -> Vec<RenderedPage> {
    if nonblank_page_numbers.is_empty() {
        return pages;
    }
    let keep: HashSet<u32> = nonblank_page_numbers.iter().copied().collect();
    pages
        .into_iter()
        .filter(|p| keep.contains(&p.page_number))
        .collect()
}
