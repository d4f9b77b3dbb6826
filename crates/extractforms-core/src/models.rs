//! Data model shared by the extraction pipeline, the backends and the schema store.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;
use crate::pricing::PricingCall;

/// Structural kind of a form field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Number,
    Date,
    Checkbox,
    Select,
    Phone,
    Amount,
    Address,
    Email,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Meaning of a field's value, used to pick a normalization rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSemanticType {
    Phone,
    Amount,
    Percentage,
    Address,
    Email,
    Date,
    Text,
    #[serde(other)]
    Other,
}

/// Confidence attached to an extracted value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    Low,
    Medium,
    High,
    #[default]
    Unknown,
}

impl ConfidenceLevel {
    /// Total order used by the reconciler: unknown < low < medium < high.
    pub fn rank(self) -> u8 {
        match self {
            ConfidenceLevel::Unknown => 0,
            ConfidenceLevel::Low => 1,
            ConfidenceLevel::Medium => 2,
            ConfidenceLevel::High => 3,
        }
    }
}

/// How the orchestrator obtains the schema for a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassMode {
    OnePass,
    #[default]
    TwoPass,
    OneSchemaPass,
}

impl PassMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PassMode::OnePass => "one_pass",
            PassMode::TwoPass => "two_pass",
            PassMode::OneSchemaPass => "one_schema_pass",
        }
    }
}

impl fmt::Display for PassMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raster encoding used when rendering pages for a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageFormat {
    #[default]
    Png,
    Jpeg,
}

impl ImageFormat {
    pub fn mime_type(self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
        }
    }
}

impl FromStr for ImageFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "png" => Ok(ImageFormat::Png),
            "jpeg" | "jpg" => Ok(ImageFormat::Jpeg),
            other => Err(format!("unsupported image format: {other}")),
        }
    }
}

/// One field of a form schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaField {
    pub key: String,
    pub label: String,
    /// 1-based page in the document's logical page order, when known.
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub kind: FieldKind,
    #[serde(default)]
    pub semantic_type: Option<FieldSemanticType>,
    #[serde(default)]
    pub expected_type: Option<String>,
    #[serde(default)]
    pub regex: Option<String>,
    /// Allowed choices for select fields.
    #[serde(default)]
    pub options: Vec<String>,
}

impl SchemaField {
    pub fn new(key: impl Into<String>, label: impl Into<String>, page: Option<u32>) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
            page,
            kind: FieldKind::default(),
            semantic_type: None,
            expected_type: None,
            regex: None,
            options: Vec::new(),
        }
    }

    pub fn with_kind(mut self, kind: FieldKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_semantic_type(mut self, semantic_type: FieldSemanticType) -> Self {
        self.semantic_type = Some(semantic_type);
        self
    }
}

fn default_version() -> u32 {
    1
}

/// A form schema: the ordered set of fields expected in a document family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaSpec {
    pub id: String,
    pub name: String,
    pub fingerprint: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub schema_family_id: Option<String>,
    #[serde(default)]
    pub fields: Vec<SchemaField>,
}

impl SchemaSpec {
    /// Family identifier, defaulting to the schema's own id.
    pub fn family_id(&self) -> &str {
        self.schema_family_id.as_deref().unwrap_or(&self.id)
    }

    /// Build the next revision of this schema with a replacement field list.
    pub fn revise(&self, fields: Vec<SchemaField>) -> SchemaSpec {
        SchemaSpec {
            id: uuid::Uuid::new_v4().to_string(),
            name: self.name.clone(),
            fingerprint: self.fingerprint.clone(),
            version: self.version + 1,
            schema_family_id: Some(self.family_id().to_string()),
            fields,
        }
    }

    /// Highest page number referenced by any field.
    pub fn max_field_page(&self) -> Option<u32> {
        self.fields.iter().filter_map(|f| f.page).max()
    }
}

/// A raw value reported by a backend for one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub confidence: ConfidenceLevel,
}

impl FieldValue {
    pub fn new(
        key: impl Into<String>,
        value: Option<&str>,
        page: Option<u32>,
        confidence: ConfidenceLevel,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.map(str::to_string),
            page,
            confidence,
        }
    }

    /// Trimmed value, or `None` when absent or whitespace-only.
    pub fn trimmed_value(&self) -> Option<&str> {
        self.value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}

/// Output of one extraction run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub schema_id: String,
    pub schema_name: String,
    /// One entry per schema field, in schema order.
    pub fields: Vec<FieldValue>,
    pub flat: IndexMap<String, String>,
    pub schema_fields_count: usize,
    #[serde(default)]
    pub pricing: Option<PricingCall>,
    #[serde(default)]
    pub metadata: IndexMap<String, serde_json::Value>,
}

/// A rasterized page ready to be sent to a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPage {
    /// 1-based physical page number in the source PDF.
    pub page_number: u32,
    pub mime_type: String,
    pub data_base64: String,
}

/// Outcome of looking up a cached schema for a document fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub matched: bool,
    pub schema_id: Option<String>,
    pub score: Option<f64>,
    pub reason: Option<String>,
}

/// Parameters of one extraction run, as supplied by a caller.
#[derive(Debug, Clone)]
pub struct ExtractRequest {
    pub input_path: PathBuf,
    pub output_path: Option<PathBuf>,
    pub mode: PassMode,
    pub backend: Option<BackendKind>,
    pub use_cache: bool,
    pub dpi: u32,
    pub image_format: String,
    pub page_start: Option<u32>,
    pub page_end: Option<u32>,
    pub max_pages: Option<u32>,
    pub chunk_pages: usize,
    pub drop_blank_pages: Option<bool>,
    pub blank_page_ink_threshold: Option<f64>,
    pub blank_page_near_white_level: Option<u8>,
    pub schema_id: Option<String>,
    pub schema_path: Option<PathBuf>,
    pub match_schema: bool,
    pub extra_instructions: Option<String>,
}

impl ExtractRequest {
    pub fn new(input_path: impl Into<PathBuf>) -> Self {
        Self {
            input_path: input_path.into(),
            output_path: None,
            mode: PassMode::default(),
            backend: None,
            use_cache: true,
            dpi: 200,
            image_format: "png".to_string(),
            page_start: None,
            page_end: None,
            max_pages: None,
            chunk_pages: 1,
            drop_blank_pages: None,
            blank_page_ink_threshold: None,
            blank_page_near_white_level: None,
            schema_id: None,
            schema_path: None,
            match_schema: false,
            extra_instructions: None,
        }
    }
}
