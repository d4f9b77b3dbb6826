//! Extraction backend trait and implementations.

pub mod mock;
pub mod multimodal;
pub mod ocr;
pub mod ocr_normalizer;
pub mod openai;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{FieldValue, RenderedPage, SchemaSpec};
use crate::pricing::PricingCall;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("backend misconfigured: {0}")]
    Config(String),
    #[error("{0} requires at least one rendered page")]
    EmptyPages(&'static str),
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed backend response: {0}")]
    MalformedResponse(String),
    #[error("failed to open PDF: {0}")]
    OpenError(String),
    #[error("failed to render page: {0}")]
    RenderError(String),
    #[error("OCR provider failed: {0}")]
    Ocr(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which backend family produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Multimodal,
    Ocr,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Multimodal => "multimodal",
            BackendKind::Ocr => "ocr",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "multimodal" => Ok(BackendKind::Multimodal),
            "ocr" => Ok(BackendKind::Ocr),
            other => Err(format!("unknown extraction backend: {other}")),
        }
    }
}

pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BackendError>> + Send + 'a>>;

/// Schema returned by inference, with the usage of the call when reported.
pub type InferredSchema = (SchemaSpec, Option<PricingCall>);

/// Values returned by one extraction call, with the usage of the call when reported.
pub type ExtractedValues = (Vec<FieldValue>, Option<PricingCall>);

/// A backend able to infer form schemas and read field values from rendered pages.
pub trait ExtractionBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Infer a schema from the given pages. Fails on an empty page list.
    fn infer_schema<'a>(&'a self, pages: &'a [RenderedPage]) -> BackendFuture<'a, InferredSchema>;

    /// Read the values of `keys` from the given pages.
    ///
    /// Missing values are reported with the null sentinel. Fails on an empty page list.
    fn extract_values<'a>(
        &'a self,
        pages: &'a [RenderedPage],
        keys: &'a [String],
        extra_instructions: Option<&'a str>,
    ) -> BackendFuture<'a, ExtractedValues>;
}
