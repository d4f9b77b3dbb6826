use thiserror::Error;

pub mod assemble;
pub mod backend;
pub mod collector;
pub mod config_file;
pub mod models;
pub mod normalize;
pub mod orchestrator;
pub mod pages;
pub mod pricing;
pub mod prompts;
pub mod reconcile;
pub mod routing;
pub mod runtime;
pub mod schema_store;
pub mod settings;

// Re-export for convenience
pub use backend::{BackendError, BackendKind, ExtractionBackend};
pub use models::{
    ConfidenceLevel, ExtractRequest, ExtractionResult, FieldKind, FieldSemanticType, FieldValue,
    ImageFormat, MatchResult, PassMode, RenderedPage, SchemaField, SchemaSpec,
};
pub use orchestrator::{Extractor, persist_result};
pub use pages::{PageSelectionAnalysis, PageSelectionRequest, PageSource, RenderOptions};
pub use pricing::{PricingCall, merge_pricing_calls};
pub use schema_store::SchemaStore;
pub use settings::{EffectiveConfig, Settings};

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("extraction error: {0}")]
    Extraction(String),
    #[error("settings error: {0}")]
    Settings(String),
    #[error(
        "cannot combine pricing for {left_provider}/{left_model} with {right_provider}/{right_model}"
    )]
    ModelMismatch {
        left_provider: String,
        left_model: String,
        right_provider: String,
        right_model: String,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("async execution failed: {0}")]
    AsyncExecution(String),
}
