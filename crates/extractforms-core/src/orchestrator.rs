//! Top-level extraction flow: pass-mode selection, schema inference and caching.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;

use crate::CoreError;
use crate::assemble::assemble;
use crate::backend::multimodal::MultimodalBackend;
use crate::backend::ocr::{OcrBackend, OcrPageProvider};
use crate::backend::ocr_normalizer::OcrTextNormalizer;
use crate::backend::{BackendKind, ExtractionBackend};
use crate::collector::collect_values;
use crate::models::{ExtractRequest, ExtractionResult, PassMode, RenderedPage, SchemaSpec};
use crate::pages::{PageSelectionAnalysis, PageSource, filter_rendered_pages_to_nonblank};
use crate::pricing::{PricingCall, merge_pricing_calls};
use crate::routing::build_schema_page_mapping;
use crate::runtime::run_blocking;
use crate::schema_store::{SchemaStore, fingerprint_pdf, load_schema};
use crate::settings::{EffectiveConfig, Settings};

/// Pages of one document, rendered once per run and shared by every pass.
#[derive(Debug, Clone)]
pub struct PreparedDocument {
    pub pages: Vec<RenderedPage>,
    pub analysis: Option<PageSelectionAnalysis>,
}

/// Entry point for extraction runs.
pub struct Extractor {
    settings: Settings,
    page_source: Arc<dyn PageSource>,
    ocr_provider: Option<Arc<dyn OcrPageProvider>>,
    backend: Option<Arc<dyn ExtractionBackend>>,
}

impl Extractor {
    pub fn new(settings: Settings, page_source: Arc<dyn PageSource>) -> Self {
        Self {
            settings,
            page_source,
            ocr_provider: None,
            backend: None,
        }
    }

    /// Page provider used when the OCR backend is selected.
    pub fn with_ocr_provider(mut self, provider: Arc<dyn OcrPageProvider>) -> Self {
        self.ocr_provider = Some(provider);
        self
    }

    /// Use `backend` for every run instead of building one from settings.
    pub fn with_backend(mut self, backend: Arc<dyn ExtractionBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn schema_store(&self) -> Result<SchemaStore, CoreError> {
        SchemaStore::open(&self.settings.schema_cache_dir)
    }

    fn backend_for(&self, kind: BackendKind) -> Result<Arc<dyn ExtractionBackend>, CoreError> {
        if let Some(backend) = &self.backend {
            return Ok(Arc::clone(backend));
        }
        let backend: Arc<dyn ExtractionBackend> = match kind {
            BackendKind::Multimodal => Arc::new(MultimodalBackend::from_settings(&self.settings)?),
            BackendKind::Ocr => {
                let normalizer = if self.settings.ocr_enable_text_normalization {
                    Some(OcrTextNormalizer::from_settings(&self.settings)?)
                } else {
                    None
                };
                Arc::new(OcrBackend::new(
                    self.ocr_provider.clone(),
                    self.settings.null_sentinel.clone(),
                    normalizer,
                )?)
            }
        };
        Ok(backend)
    }

    /// Render the selected pages and drop blank ones when enabled.
    ///
    /// A failing blank-page analysis is logged and leaves every page in place.
    pub async fn prepare(&self, config: &EffectiveConfig) -> Result<PreparedDocument, CoreError> {
        let source = Arc::clone(&self.page_source);
        let path = config.input_path.clone();
        let options = config.render.clone();
        let pages = tokio::task::spawn_blocking(move || source.render(&path, &options))
            .await
            .map_err(|e| CoreError::AsyncExecution(e.to_string()))??;
        tracing::info!(
            path = %config.input_path.display(),
            pages = pages.len(),
            dpi = config.render.dpi,
            "rendered document"
        );

        if !config.drop_blank_pages {
            return Ok(PreparedDocument {
                pages,
                analysis: None,
            });
        }

        let source = Arc::clone(&self.page_source);
        let request = config.selection_request();
        let analysis = match tokio::task::spawn_blocking(move || source.analyze_selection(&request)).await {
            Ok(Ok(analysis)) => Some(analysis),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "blank page analysis failed; keeping all pages");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "blank page analysis task failed; keeping all pages");
                None
            }
        };

        let pages = match &analysis {
            Some(a) => {
                let kept = filter_rendered_pages_to_nonblank(pages, &a.nonblank_page_numbers);
                tracing::debug!(
                    selected = a.selected_page_numbers.len(),
                    kept = kept.len(),
                    "filtered blank pages"
                );
                kept
            }
            None => pages,
        };
        Ok(PreparedDocument { pages, analysis })
    }

    /// Infer a fresh schema and give it an identity.
    pub async fn infer_schema(
        &self,
        config: &EffectiveConfig,
        document: &PreparedDocument,
        backend: &dyn ExtractionBackend,
    ) -> Result<(SchemaSpec, Option<PricingCall>), CoreError> {
        let (mut schema, pricing) = backend.infer_schema(&document.pages).await?;
        schema.id = uuid::Uuid::new_v4().to_string();
        if schema.name.trim().is_empty() {
            schema.name = config
                .input_path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "document".to_string());
        }
        schema.fingerprint = fingerprint_pdf(&config.input_path)?;
        if schema.schema_family_id.is_none() {
            schema.schema_family_id = Some(schema.id.clone());
        }
        tracing::info!(
            schema_id = %schema.id,
            name = %schema.name,
            fields = schema.fields.len(),
            "schema inferred"
        );
        Ok((schema, pricing))
    }

    /// Collect and assemble values for `schema`.
    pub async fn extract_values(
        &self,
        schema: &SchemaSpec,
        config: &EffectiveConfig,
        document: &PreparedDocument,
        backend: &dyn ExtractionBackend,
        use_page_groups: bool,
    ) -> Result<ExtractionResult, CoreError> {
        let page_map = build_schema_page_mapping(schema, document.analysis.as_ref());
        let options = config.collect_options(use_page_groups, Some(&page_map));
        let collected = collect_values(schema, &document.pages, backend, &options).await?;
        let pricing = merge_pricing_calls(&collected.pricing_calls)?;

        let mut result = assemble(schema, collected.values, &config.null_sentinel, pricing);
        let metadata = &mut result.metadata;
        metadata.insert("backend".into(), json!(backend.kind().as_str()));
        metadata.insert("pages_processed".into(), json!(document.pages.len()));
        metadata.insert("model_calls".into(), json!(collected.model_calls));
        metadata.insert("schema_version".into(), json!(schema.version));
        metadata.insert("schema_family_id".into(), json!(schema.family_id()));
        let pricing = result.pricing.clone();
        set_pricing(&mut result, pricing);
        Ok(result)
    }

    /// Run one extraction according to the request's pass mode.
    pub async fn run_extract(&self, request: &ExtractRequest) -> Result<ExtractionResult, CoreError> {
        let started = Instant::now();
        let config = EffectiveConfig::resolve(request, &self.settings)?;
        let backend = self.backend_for(config.backend)?;
        tracing::info!(
            path = %config.input_path.display(),
            mode = %config.mode,
            backend = %backend.kind(),
            "starting extraction"
        );

        let (mut result, cache_hit) = if let Some(schema_path) = &config.schema_path {
            let schema = load_schema(schema_path)?;
            let document = self.prepare(&config).await?;
            let result = self
                .extract_values(&schema, &config, &document, backend.as_ref(), true)
                .await?;
            (result, false)
        } else {
            match config.mode {
                PassMode::OnePass => (self.run_one_pass(&config, backend.as_ref()).await?, false),
                PassMode::OneSchemaPass => {
                    (self.run_one_schema_pass(&config, backend.as_ref()).await?, false)
                }
                PassMode::TwoPass => self.run_two_pass(&config, backend.as_ref()).await?,
            }
        };

        let metadata = &mut result.metadata;
        metadata.insert("mode".into(), json!(config.mode.as_str()));
        metadata.insert("cache_hit".into(), json!(cache_hit));
        metadata.insert(
            "duration_ms".into(),
            json!(started.elapsed().as_millis() as u64),
        );

        if let Some(output) = &request.output_path {
            persist_result(&result, output)?;
        }
        tracing::info!(
            schema_id = %result.schema_id,
            fields = result.schema_fields_count,
            cache_hit,
            "extraction finished"
        );
        Ok(result)
    }

    /// Blocking variant of [`Extractor::run_extract`] for synchronous callers.
    pub fn run_extract_blocking(&self, request: &ExtractRequest) -> Result<ExtractionResult, CoreError> {
        run_blocking(self.run_extract(request))?
    }

    async fn run_one_pass(
        &self,
        config: &EffectiveConfig,
        backend: &dyn ExtractionBackend,
    ) -> Result<ExtractionResult, CoreError> {
        let document = self.prepare(config).await?;
        let (schema, schema_pricing) = self.infer_schema(config, &document, backend).await?;
        let mut result = self
            .extract_values(&schema, config, &document, backend, false)
            .await?;

        let calls: Vec<PricingCall> = schema_pricing.into_iter().chain(result.pricing.clone()).collect();
        set_pricing(&mut result, merge_pricing_calls(&calls)?);
        bump_model_calls(&mut result);
        Ok(result)
    }

    async fn run_one_schema_pass(
        &self,
        config: &EffectiveConfig,
        backend: &dyn ExtractionBackend,
    ) -> Result<ExtractionResult, CoreError> {
        let schema_id = config.schema_id.as_deref().ok_or_else(|| {
            CoreError::Extraction("ONE_SCHEMA_PASS requires --schema-id or --schema-path".into())
        })?;
        let schema = self
            .schema_store()?
            .find_by_id(schema_id)?
            .ok_or_else(|| CoreError::Extraction(format!("Schema id not found: {schema_id}")))?;
        let document = self.prepare(config).await?;
        self.extract_values(&schema, config, &document, backend, true)
            .await
    }

    async fn run_two_pass(
        &self,
        config: &EffectiveConfig,
        backend: &dyn ExtractionBackend,
    ) -> Result<(ExtractionResult, bool), CoreError> {
        if config.match_schema || config.use_cache {
            let store = self.schema_store()?;
            let fingerprint = fingerprint_pdf(&config.input_path)?;
            let matched = store.match_schema(&fingerprint)?;
            let cached = match matched.schema_id.as_deref() {
                Some(id) if matched.matched => store.find_by_id(id)?,
                _ => None,
            };
            if let Some(schema) = cached {
                tracing::info!(schema_id = %schema.id, "reusing cached schema");
                let document = self.prepare(config).await?;
                let result = self
                    .extract_values(&schema, config, &document, backend, true)
                    .await?;
                return Ok((result, true));
            }
        }

        let document = self.prepare(config).await?;
        let (schema, schema_pricing) = self.infer_schema(config, &document, backend).await?;
        if config.use_cache {
            self.schema_store()?.save(&schema)?;
        }
        let mut result = self
            .extract_values(&schema, config, &document, backend, true)
            .await?;

        let calls: Vec<PricingCall> = schema_pricing.into_iter().chain(result.pricing.clone()).collect();
        set_pricing(&mut result, merge_pricing_calls(&calls)?);
        bump_model_calls(&mut result);
        Ok((result, false))
    }
}

fn set_pricing(result: &mut ExtractionResult, pricing: Option<PricingCall>) {
    let value = serde_json::to_value(&pricing).unwrap_or(serde_json::Value::Null);
    result.metadata.insert("pricing".into(), value);
    result.pricing = pricing;
}

/// Count the schema inference call alongside the collection calls.
fn bump_model_calls(result: &mut ExtractionResult) {
    let calls = result
        .metadata
        .get("model_calls")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0);
    result.metadata.insert("model_calls".into(), json!(calls + 1));
}

/// Write `result` as pretty JSON, creating parent directories.
pub fn persist_result(result: &ExtractionResult, path: &Path) -> Result<(), CoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(result)?)?;
    tracing::info!(path = %path.display(), "wrote extraction result");
    Ok(())
}
