//! OCR backend: reads `label: value` lines produced by an OCR page provider.

use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;

use super::ocr_normalizer::OcrTextNormalizer;
use super::{BackendError, BackendFuture, BackendKind, ExtractedValues, ExtractionBackend, InferredSchema};
use crate::CoreError;
use crate::models::{ConfidenceLevel, FieldValue, RenderedPage, SchemaField, SchemaSpec};
use crate::pricing::PricingCall;

static NON_ALNUM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-zA-Z0-9]+").unwrap());

/// Text recognized on one page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OcrPage {
    /// 1-based page number; the page's position is used when absent.
    pub page_number: Option<u32>,
    pub lines: Vec<String>,
}

/// Turns rendered pages into recognized text lines.
pub trait OcrPageProvider: Send + Sync {
    fn extract_pages(&self, pages: &[RenderedPage]) -> Result<Vec<OcrPage>, BackendError>;
}

pub struct OcrBackend {
    provider: Arc<dyn OcrPageProvider>,
    null_sentinel: String,
    normalizer: Option<OcrTextNormalizer>,
}

impl OcrBackend {
    /// Fails when no page provider is configured.
    pub fn new(
        provider: Option<Arc<dyn OcrPageProvider>>,
        null_sentinel: impl Into<String>,
        normalizer: Option<OcrTextNormalizer>,
    ) -> Result<Self, CoreError> {
        let provider = provider.ok_or_else(|| {
            CoreError::Extraction(
                "OCR backend requires an OCR page provider; configure one before use".into(),
            )
        })?;
        Ok(Self {
            provider,
            null_sentinel: null_sentinel.into(),
            normalizer,
        })
    }

    /// Runs the provider on the blocking pool; recognition must not stall runtime workers.
    async fn page_lines(
        &self,
        pages: &[RenderedPage],
    ) -> Result<Vec<(u32, Vec<String>)>, BackendError> {
        let provider = Arc::clone(&self.provider);
        let pages = pages.to_vec();
        let ocr_pages = tokio::task::spawn_blocking(move || provider.extract_pages(&pages))
            .await
            .map_err(|e| BackendError::Ocr(format!("OCR task failed: {e}")))??;
        Ok(ocr_pages
            .into_iter()
            .enumerate()
            .map(|(index, page)| (page.page_number.unwrap_or(index as u32 + 1), page.lines))
            .collect())
    }

    async fn normalize(
        &self,
        values: &mut [FieldValue],
        extra_instructions: Option<&str>,
    ) -> Result<Option<PricingCall>, BackendError> {
        let Some(normalizer) = &self.normalizer else {
            return Ok(None);
        };
        let raw: IndexMap<String, String> = values
            .iter()
            .filter_map(|v| {
                let text = v.value.as_deref()?;
                (text != self.null_sentinel).then(|| (v.key.clone(), text.to_string()))
            })
            .collect();
        let (normalized, pricing) = normalizer.normalize_values(&raw, extra_instructions).await?;
        for value in values.iter_mut() {
            if let Some(text) = normalized.get(&value.key) {
                value.value = Some(text.clone());
            }
        }
        Ok(pricing)
    }
}

/// `Label: value` -> (`label`, `value`). Lines without a colon or label are skipped.
fn parse_key_value_line(line: &str) -> Option<(String, &str)> {
    let (left, right) = line.split_once(':')?;
    let key = normalize_key(left);
    if key.is_empty() {
        return None;
    }
    Some((key, right.trim()))
}

fn normalize_key(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    NON_ALNUM_RE
        .replace_all(&lowered, "_")
        .trim_matches('_')
        .to_string()
}

fn title_case(key: &str) -> String {
    key.split('_')
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

impl ExtractionBackend for OcrBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Ocr
    }

    fn infer_schema<'a>(&'a self, pages: &'a [RenderedPage]) -> BackendFuture<'a, InferredSchema> {
        Box::pin(async move {
            if pages.is_empty() {
                return Err(BackendError::EmptyPages("OCR schema inference"));
            }
            let mut seen = HashSet::new();
            let mut fields = Vec::new();
            for (page_number, lines) in self.page_lines(pages).await? {
                for line in &lines {
                    let Some((key, _)) = parse_key_value_line(line) else {
                        continue;
                    };
                    if seen.insert(key.clone()) {
                        fields.push(SchemaField::new(key.clone(), title_case(&key), Some(page_number)));
                    }
                }
            }
            tracing::info!(fields = fields.len(), "OCR schema inferred");
            let schema = SchemaSpec {
                id: "ocr-schema".into(),
                name: "OCR Inferred Schema".into(),
                fingerprint: "ocr".into(),
                version: 1,
                schema_family_id: None,
                fields,
            };
            Ok((schema, None))
        })
    }

    fn extract_values<'a>(
        &'a self,
        pages: &'a [RenderedPage],
        keys: &'a [String],
        extra_instructions: Option<&'a str>,
    ) -> BackendFuture<'a, ExtractedValues> {
        Box::pin(async move {
            if pages.is_empty() {
                return Err(BackendError::EmptyPages("OCR value extraction"));
            }
            let requested: IndexMap<String, &String> =
                keys.iter().map(|k| (k.trim().to_lowercase(), k)).collect();
            if requested.is_empty() {
                return Ok((Vec::new(), None));
            }

            let mut found = HashSet::new();
            let mut values = Vec::new();
            for (page_number, lines) in self.page_lines(pages).await? {
                for line in &lines {
                    let Some((parsed_key, parsed_value)) = parse_key_value_line(line) else {
                        continue;
                    };
                    let Some(&key) = requested.get(&parsed_key) else {
                        continue;
                    };
                    if !found.insert(key.clone()) {
                        continue;
                    }
                    let value = if parsed_value.is_empty() {
                        self.null_sentinel.as_str()
                    } else {
                        parsed_value
                    };
                    values.push(FieldValue::new(
                        key.clone(),
                        Some(value),
                        Some(page_number),
                        ConfidenceLevel::Medium,
                    ));
                }
            }

            let pricing = self.normalize(&mut values, extra_instructions).await?;
            Ok((values, pricing))
        })
    }
}
