//! Process-wide settings and the per-run effective configuration.
//!
//! Precedence: CLI flags (applied by the caller) > environment > config file > defaults.

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::CoreError;
use crate::backend::{BackendError, BackendKind};
use crate::collector::CollectOptions;
use crate::config_file::{self, ConfigFile};
use crate::models::{ExtractRequest, ImageFormat, PassMode};
use crate::pages::{PageSelectionRequest, RenderOptions};
use crate::routing::PageMap;

/// DPI used when sampling pages for blank detection.
pub const BLANK_PAGE_SAMPLE_DPI: u32 = 72;

/// Runtime settings shared by every extraction.
#[derive(Clone)]
pub struct Settings {
    pub openai_base_url: Option<String>,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub openai_concurrency: usize,
    pub openai_timeout_secs: u64,
    pub max_connections: usize,
    pub http_proxy_url: Option<String>,
    /// USD per million prompt tokens, used to price calls when set.
    pub input_cost_per_mtok: Option<f64>,
    pub output_cost_per_mtok: Option<f64>,
    pub null_sentinel: String,
    pub schema_cache_dir: PathBuf,
    pub extraction_backend: BackendKind,
    pub ocr_enable_text_normalization: bool,
    pub ocr_text_normalization_model: Option<String>,
    pub drop_blank_pages: bool,
    pub blank_page_ink_threshold: f64,
    pub blank_page_near_white_level: u8,
    pub log_level: String,
    pub log_json: bool,
    pub log_file: Option<PathBuf>,
    pub app_env: String,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("openai_base_url", &self.openai_base_url)
            .field("openai_api_key", &self.openai_api_key.as_ref().map(|_| "***"))
            .field("openai_model", &self.openai_model)
            .field("openai_concurrency", &self.openai_concurrency)
            .field("openai_timeout_secs", &self.openai_timeout_secs)
            .field("max_connections", &self.max_connections)
            .field("http_proxy_url", &self.http_proxy_url)
            .field("input_cost_per_mtok", &self.input_cost_per_mtok)
            .field("output_cost_per_mtok", &self.output_cost_per_mtok)
            .field("null_sentinel", &self.null_sentinel)
            .field("schema_cache_dir", &self.schema_cache_dir)
            .field("extraction_backend", &self.extraction_backend)
            .field(
                "ocr_enable_text_normalization",
                &self.ocr_enable_text_normalization,
            )
            .field(
                "ocr_text_normalization_model",
                &self.ocr_text_normalization_model,
            )
            .field("drop_blank_pages", &self.drop_blank_pages)
            .field("blank_page_ink_threshold", &self.blank_page_ink_threshold)
            .field(
                "blank_page_near_white_level",
                &self.blank_page_near_white_level,
            )
            .field("log_level", &self.log_level)
            .field("log_json", &self.log_json)
            .field("log_file", &self.log_file)
            .field("app_env", &self.app_env)
            .finish()
    }
}

/// Default schema cache: `<cache_dir>/extractforms/schemas`.
pub fn default_schema_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|d| d.join("extractforms").join("schemas"))
        .unwrap_or_else(|| PathBuf::from(".extractforms").join("schemas"))
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            openai_base_url: None,
            openai_api_key: None,
            openai_model: "gpt-4o-mini".to_string(),
            openai_concurrency: 8,
            openai_timeout_secs: 120,
            max_connections: 16,
            http_proxy_url: None,
            input_cost_per_mtok: None,
            output_cost_per_mtok: None,
            null_sentinel: "NULL".to_string(),
            schema_cache_dir: default_schema_cache_dir(),
            extraction_backend: BackendKind::Multimodal,
            ocr_enable_text_normalization: false,
            ocr_text_normalization_model: None,
            drop_blank_pages: true,
            blank_page_ink_threshold: 0.001,
            blank_page_near_white_level: 245,
            log_level: "info".to_string(),
            log_json: true,
            log_file: None,
            app_env: "dev".to_string(),
        }
    }
}

fn env_value<T, F>(env: &F, name: &str) -> Result<Option<T>, CoreError>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match env(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| CoreError::Settings(format!("invalid {name}={raw:?}: {e}"))),
    }
}

fn env_flag<F>(env: &F, name: &str) -> Result<Option<bool>, CoreError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = env(name).map(|v| v.trim().to_ascii_lowercase()) else {
        return Ok(None);
    };
    match raw.as_str() {
        "" => Ok(None),
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(CoreError::Settings(format!(
            "invalid {name}={raw:?}: expected a boolean"
        ))),
    }
}

impl Settings {
    /// Settings from the config file cascade and the process environment.
    pub fn load() -> Result<Self, CoreError> {
        Self::from_sources(&config_file::load_config(), |name| {
            std::env::var(name).ok()
        })
    }

    /// Layer `env` over `file` over the defaults.
    pub fn from_sources<F>(file: &ConfigFile, env: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut s = Settings::default();
        s.apply_file(file)?;

        if let Some(v) = env_value(&env, "OPENAI_BASE_URL")? {
            s.openai_base_url = Some(v);
        }
        if let Some(v) = env_value(&env, "OPENAI_API_KEY")? {
            s.openai_api_key = Some(v);
        }
        if let Some(v) = env_value(&env, "OPENAI_MODEL")? {
            s.openai_model = v;
        }
        if let Some(v) = env_value(&env, "OPENAI_CONCURRENCY")? {
            s.openai_concurrency = v;
        }
        if let Some(v) = env_value(&env, "OPENAI_TIMEOUT_SECS")? {
            s.openai_timeout_secs = v;
        }
        if let Some(v) = env_value(&env, "MAX_CONNECTIONS")? {
            s.max_connections = v;
        }
        if let Some(v) = env_value(&env, "HTTP_PROXY_URL")? {
            s.http_proxy_url = Some(v);
        }
        if let Some(v) = env_value(&env, "OPENAI_INPUT_COST_PER_MTOK")? {
            s.input_cost_per_mtok = Some(v);
        }
        if let Some(v) = env_value(&env, "OPENAI_OUTPUT_COST_PER_MTOK")? {
            s.output_cost_per_mtok = Some(v);
        }
        if let Some(v) = env_value(&env, "NULL_SENTINEL")? {
            s.null_sentinel = v;
        }
        if let Some(v) = env_value(&env, "SCHEMA_CACHE_DIR")? {
            s.schema_cache_dir = v;
        }
        if let Some(v) = env_value(&env, "EXTRACTION_BACKEND")? {
            s.extraction_backend = v;
        }
        if let Some(v) = env_flag(&env, "OCR_ENABLE_TEXT_NORMALIZATION")? {
            s.ocr_enable_text_normalization = v;
        }
        if let Some(v) = env_value(&env, "OCR_TEXT_NORMALIZATION_MODEL")? {
            s.ocr_text_normalization_model = Some(v);
        }
        if let Some(v) = env_flag(&env, "DROP_BLANK_PAGES")? {
            s.drop_blank_pages = v;
        }
        if let Some(v) = env_value(&env, "BLANK_PAGE_INK_THRESHOLD")? {
            s.blank_page_ink_threshold = v;
        }
        if let Some(v) = env_value(&env, "BLANK_PAGE_NEAR_WHITE_LEVEL")? {
            s.blank_page_near_white_level = v;
        }
        if let Some(v) = env_value(&env, "LOG_LEVEL")? {
            s.log_level = v;
        }
        if let Some(v) = env_flag(&env, "LOG_JSON")? {
            s.log_json = v;
        }
        if let Some(v) = env_value(&env, "LOG_FILE")? {
            s.log_file = Some(v);
        }
        if let Some(v) = env_value(&env, "APP_ENV")? {
            s.app_env = v;
        }

        s.validate()?;
        Ok(s)
    }

    fn apply_file(&mut self, file: &ConfigFile) -> Result<(), CoreError> {
        if let Some(openai) = &file.openai {
            if let Some(v) = &openai.base_url {
                self.openai_base_url = Some(v.clone());
            }
            if let Some(v) = &openai.api_key {
                self.openai_api_key = Some(v.clone());
            }
            if let Some(v) = &openai.model {
                self.openai_model = v.clone();
            }
            self.openai_concurrency = openai.concurrency.unwrap_or(self.openai_concurrency);
            self.openai_timeout_secs = openai.timeout_secs.unwrap_or(self.openai_timeout_secs);
            self.max_connections = openai.max_connections.unwrap_or(self.max_connections);
            if let Some(v) = &openai.proxy_url {
                self.http_proxy_url = Some(v.clone());
            }
            self.input_cost_per_mtok = openai.input_cost_per_mtok.or(self.input_cost_per_mtok);
            self.output_cost_per_mtok = openai.output_cost_per_mtok.or(self.output_cost_per_mtok);
        }
        if let Some(extraction) = &file.extraction {
            if let Some(v) = &extraction.backend {
                self.extraction_backend = v
                    .parse()
                    .map_err(|e| CoreError::Settings(format!("config file: {e}")))?;
            }
            if let Some(v) = &extraction.null_sentinel {
                self.null_sentinel = v.clone();
            }
            if let Some(v) = &extraction.schema_cache_dir {
                self.schema_cache_dir = PathBuf::from(v);
            }
            if let Some(v) = extraction.ocr_enable_text_normalization {
                self.ocr_enable_text_normalization = v;
            }
            if let Some(v) = &extraction.ocr_text_normalization_model {
                self.ocr_text_normalization_model = Some(v.clone());
            }
        }
        if let Some(blank) = &file.blank_pages {
            self.drop_blank_pages = blank.drop.unwrap_or(self.drop_blank_pages);
            self.blank_page_ink_threshold =
                blank.ink_threshold.unwrap_or(self.blank_page_ink_threshold);
            self.blank_page_near_white_level = blank
                .near_white_level
                .unwrap_or(self.blank_page_near_white_level);
        }
        if let Some(logging) = &file.logging {
            if let Some(v) = &logging.level {
                self.log_level = v.clone();
            }
            self.log_json = logging.json.unwrap_or(self.log_json);
            if let Some(v) = &logging.file {
                self.log_file = Some(PathBuf::from(v));
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), CoreError> {
        if !(0.0..=1.0).contains(&self.blank_page_ink_threshold) {
            return Err(CoreError::Settings(format!(
                "blank page ink threshold must be within [0, 1], got {}",
                self.blank_page_ink_threshold
            )));
        }
        if self.null_sentinel.trim().is_empty() {
            return Err(CoreError::Settings("null sentinel must not be blank".into()));
        }
        Ok(())
    }

    /// Model used by the OCR text normalizer.
    pub fn ocr_normalization_model(&self) -> &str {
        self.ocr_text_normalization_model
            .as_deref()
            .unwrap_or(&self.openai_model)
    }
}

/// Copy `.env.example` to `.env` in `dir` when no `.env` exists yet.
///
/// Returns whether a file was created. Meant to be called once by the entry point.
pub fn bootstrap_env_file(dir: &Path) -> Result<bool, CoreError> {
    let target = dir.join(".env");
    let template = dir.join(".env.example");
    if target.exists() || !template.is_file() {
        return Ok(false);
    }
    std::fs::copy(&template, &target)?;
    tracing::info!(path = %target.display(), "created .env from template");
    Ok(true)
}

/// Every value an extraction run reads, resolved once from request and settings.
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    pub input_path: PathBuf,
    pub mode: PassMode,
    pub backend: BackendKind,
    pub use_cache: bool,
    pub match_schema: bool,
    pub render: RenderOptions,
    pub chunk_pages: usize,
    pub concurrency: usize,
    pub drop_blank_pages: bool,
    pub blank_page_ink_threshold: f64,
    pub blank_page_near_white_level: u8,
    pub null_sentinel: String,
    pub schema_id: Option<String>,
    pub schema_path: Option<PathBuf>,
    pub extra_instructions: Option<String>,
}

impl EffectiveConfig {
    pub fn resolve(request: &ExtractRequest, settings: &Settings) -> Result<Self, CoreError> {
        if !request.input_path.is_file() {
            return Err(CoreError::Extraction(format!(
                "input path is not a file: {}",
                request.input_path.display()
            )));
        }
        let image_format: ImageFormat = request
            .image_format
            .parse()
            .map_err(|e: String| CoreError::Backend(BackendError::Config(e)))?;
        let blank_page_ink_threshold = request
            .blank_page_ink_threshold
            .unwrap_or(settings.blank_page_ink_threshold);
        if !(0.0..=1.0).contains(&blank_page_ink_threshold) {
            return Err(CoreError::Extraction(format!(
                "blank page ink threshold must be within [0, 1], got {blank_page_ink_threshold}"
            )));
        }

        Ok(Self {
            input_path: request.input_path.clone(),
            mode: request.mode,
            backend: request.backend.unwrap_or(settings.extraction_backend),
            use_cache: request.use_cache,
            match_schema: request.match_schema,
            render: RenderOptions {
                dpi: request.dpi,
                image_format,
                page_start: request.page_start,
                page_end: request.page_end,
                max_pages: request.max_pages,
            },
            chunk_pages: request.chunk_pages.max(1),
            concurrency: settings.openai_concurrency.max(1),
            drop_blank_pages: request.drop_blank_pages.unwrap_or(settings.drop_blank_pages),
            blank_page_ink_threshold,
            blank_page_near_white_level: request
                .blank_page_near_white_level
                .unwrap_or(settings.blank_page_near_white_level),
            null_sentinel: settings.null_sentinel.clone(),
            schema_id: request.schema_id.clone(),
            schema_path: request.schema_path.clone(),
            extra_instructions: request
                .extra_instructions
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        })
    }

    pub fn selection_request(&self) -> PageSelectionRequest {
        PageSelectionRequest {
            pdf_path: self.input_path.clone(),
            page_start: self.render.page_start,
            page_end: self.render.page_end,
            max_pages: self.render.max_pages,
            ink_ratio_threshold: self.blank_page_ink_threshold,
            near_white_level: self.blank_page_near_white_level,
            sample_dpi: BLANK_PAGE_SAMPLE_DPI,
        }
    }

    pub fn collect_options<'a>(
        &'a self,
        use_page_groups: bool,
        page_map: Option<&'a PageMap>,
    ) -> CollectOptions<'a> {
        CollectOptions {
            chunk_pages: self.chunk_pages,
            concurrency: self.concurrency,
            null_sentinel: &self.null_sentinel,
            extra_instructions: self.extra_instructions.as_deref(),
            use_page_groups,
            page_map,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::config_file::{BlankPagesConfig, ExtractionConfig, OpenAiConfig};

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_without_sources() {
        let s = Settings::from_sources(&ConfigFile::default(), env(&[])).unwrap();
        assert_eq!(s.null_sentinel, "NULL");
        assert_eq!(s.openai_concurrency, 8);
        assert_eq!(s.extraction_backend, BackendKind::Multimodal);
        assert!(s.drop_blank_pages);
        assert_eq!(s.blank_page_near_white_level, 245);
    }

    #[test]
    fn env_overrides_file() {
        let file = ConfigFile {
            openai: Some(OpenAiConfig {
                model: Some("file-model".into()),
                concurrency: Some(2),
                ..Default::default()
            }),
            extraction: Some(ExtractionConfig {
                backend: Some("ocr".into()),
                ..Default::default()
            }),
            blank_pages: Some(BlankPagesConfig {
                drop: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };
        let s = Settings::from_sources(
            &file,
            env(&[("OPENAI_MODEL", "env-model"), ("DROP_BLANK_PAGES", "yes")]),
        )
        .unwrap();
        assert_eq!(s.openai_model, "env-model");
        assert_eq!(s.openai_concurrency, 2);
        assert_eq!(s.extraction_backend, BackendKind::Ocr);
        assert!(s.drop_blank_pages);
    }

    #[test]
    fn invalid_env_value_names_variable() {
        let err = Settings::from_sources(&ConfigFile::default(), env(&[("OPENAI_CONCURRENCY", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("OPENAI_CONCURRENCY"));
        let err = Settings::from_sources(&ConfigFile::default(), env(&[("LOG_JSON", "maybe")]))
            .unwrap_err();
        assert!(matches!(err, CoreError::Settings(_)));
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let err = Settings::from_sources(
            &ConfigFile::default(),
            env(&[("BLANK_PAGE_INK_THRESHOLD", "1.5")]),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::Settings(_)));
    }

    #[test]
    fn debug_masks_api_key() {
        let s = Settings {
            openai_api_key: Some("sk-secret".into()),
            ..Settings::default()
        };
        let printed = format!("{s:?}");
        assert!(!printed.contains("sk-secret"));
        assert!(printed.contains("***"));
    }

    #[test]
    fn bootstrap_copies_template_once() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!bootstrap_env_file(dir.path()).unwrap());
        std::fs::write(dir.path().join(".env.example"), "OPENAI_MODEL=m\n").unwrap();
        assert!(bootstrap_env_file(dir.path()).unwrap());
        assert!(!bootstrap_env_file(dir.path()).unwrap());
        let content = std::fs::read_to_string(dir.path().join(".env")).unwrap();
        assert_eq!(content, "OPENAI_MODEL=m\n");
    }

    #[test]
    fn resolve_layers_request_over_settings() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut request = ExtractRequest::new(file.path());
        request.chunk_pages = 0;
        request.drop_blank_pages = Some(false);
        request.image_format = "JPG".into();
        request.extra_instructions = Some("   ".into());
        let settings = Settings {
            openai_concurrency: 0,
            ..Settings::default()
        };
        let config = EffectiveConfig::resolve(&request, &settings).unwrap();
        assert_eq!(config.chunk_pages, 1);
        assert_eq!(config.concurrency, 1);
        assert!(!config.drop_blank_pages);
        assert_eq!(config.render.image_format, ImageFormat::Jpeg);
        assert_eq!(config.extra_instructions, None);
        assert_eq!(config.blank_page_near_white_level, 245);
        assert_eq!(config.selection_request().sample_dpi, BLANK_PAGE_SAMPLE_DPI);
    }

    #[test]
    fn resolve_rejects_missing_input_and_bad_format() {
        let err = EffectiveConfig::resolve(
            &ExtractRequest::new("/definitely/not/here.pdf"),
            &Settings::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::Extraction(_)));

        let file = tempfile::NamedTempFile::new().unwrap();
        let mut request = ExtractRequest::new(file.path());
        request.image_format = "tiff".into();
        let err = EffectiveConfig::resolve(&request, &Settings::default()).unwrap_err();
        assert!(matches!(err, CoreError::Backend(BackendError::Config(_))));
    }
}
