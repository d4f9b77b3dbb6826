use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// On-disk TOML configuration structure.
/// All fields are optional so partial configs work (merge with defaults).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    pub openai: Option<OpenAiConfig>,
    pub extraction: Option<ExtractionConfig>,
    pub blank_pages: Option<BlankPagesConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpenAiConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub concurrency: Option<usize>,
    pub timeout_secs: Option<u64>,
    pub max_connections: Option<usize>,
    pub proxy_url: Option<String>,
    pub input_cost_per_mtok: Option<f64>,
    pub output_cost_per_mtok: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionConfig {
    pub backend: Option<String>,
    pub null_sentinel: Option<String>,
    pub schema_cache_dir: Option<String>,
    pub ocr_enable_text_normalization: Option<bool>,
    pub ocr_text_normalization_model: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlankPagesConfig {
    pub drop: Option<bool>,
    pub ink_threshold: Option<f64>,
    pub near_white_level: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub json: Option<bool>,
    pub file: Option<String>,
}

/// Platform config directory path: `<config_dir>/extractforms/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("extractforms").join("config.toml"))
}

/// Load config by cascading CWD `.extractforms.toml` over platform config.
/// CWD values override platform values.
pub fn load_config() -> ConfigFile {
    let platform = config_path().and_then(|p| load_from_path(&p));
    let cwd = load_from_path(Path::new(".extractforms.toml"));

    match (platform, cwd) {
        (None, None) => ConfigFile::default(),
        (Some(p), None) => p,
        (None, Some(c)) => c,
        (Some(p), Some(c)) => merge(p, c),
    }
}

/// Load a config from a specific path. Returns `None` if the file doesn't
/// exist or can't be parsed.
pub fn load_from_path(path: &Path) -> Option<ConfigFile> {
    let content = std::fs::read_to_string(path).ok()?;
    match toml::from_str(&content) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unparsable config file");
            None
        }
    }
}

fn merge_section<T>(base: Option<T>, overlay: Option<T>, merge: fn(T, T) -> T) -> Option<T> {
    match (base, overlay) {
        (Some(b), Some(o)) => Some(merge(b, o)),
        (b, o) => o.or(b),
    }
}

/// Merge two configs: `overlay` values take precedence over `base`.
pub fn merge(base: ConfigFile, overlay: ConfigFile) -> ConfigFile {
    ConfigFile {
        openai: merge_section(base.openai, overlay.openai, |b, o| OpenAiConfig {
            base_url: o.base_url.or(b.base_url),
            api_key: o.api_key.or(b.api_key),
            model: o.model.or(b.model),
            concurrency: o.concurrency.or(b.concurrency),
            timeout_secs: o.timeout_secs.or(b.timeout_secs),
            max_connections: o.max_connections.or(b.max_connections),
            proxy_url: o.proxy_url.or(b.proxy_url),
            input_cost_per_mtok: o.input_cost_per_mtok.or(b.input_cost_per_mtok),
            output_cost_per_mtok: o.output_cost_per_mtok.or(b.output_cost_per_mtok),
        }),
        extraction: merge_section(base.extraction, overlay.extraction, |b, o| {
            ExtractionConfig {
                backend: o.backend.or(b.backend),
                null_sentinel: o.null_sentinel.or(b.null_sentinel),
                schema_cache_dir: o.schema_cache_dir.or(b.schema_cache_dir),
                ocr_enable_text_normalization: o
                    .ocr_enable_text_normalization
                    .or(b.ocr_enable_text_normalization),
                ocr_text_normalization_model: o
                    .ocr_text_normalization_model
                    .or(b.ocr_text_normalization_model),
            }
        }),
        blank_pages: merge_section(base.blank_pages, overlay.blank_pages, |b, o| {
            BlankPagesConfig {
                drop: o.drop.or(b.drop),
                ink_threshold: o.ink_threshold.or(b.ink_threshold),
                near_white_level: o.near_white_level.or(b.near_white_level),
            }
        }),
        logging: merge_section(base.logging, overlay.logging, |b, o| LoggingConfig {
            level: o.level.or(b.level),
            json: o.json.or(b.json),
            file: o.file.or(b.file),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_toml() {
        let config = ConfigFile {
            openai: Some(OpenAiConfig {
                model: Some("gpt-4o".to_string()),
                concurrency: Some(4),
                ..Default::default()
            }),
            ..Default::default()
        };
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: ConfigFile = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn partial_sections_deserialize() {
        let toml_str = "[blank_pages]\ndrop = false\n";
        let parsed: ConfigFile = toml::from_str(toml_str).unwrap();
        let blank = parsed.blank_pages.unwrap();
        assert_eq!(blank.drop, Some(false));
        assert!(blank.ink_threshold.is_none());
        assert!(parsed.openai.is_none());
    }

    #[test]
    fn merge_overlay_wins() {
        let base = ConfigFile {
            extraction: Some(ExtractionConfig {
                null_sentinel: Some("N/A".to_string()),
                backend: Some("ocr".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let overlay = ConfigFile {
            extraction: Some(ExtractionConfig {
                null_sentinel: Some("-".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let merged = merge(base, overlay).extraction.unwrap();
        assert_eq!(merged.null_sentinel.as_deref(), Some("-"));
        assert_eq!(merged.backend.as_deref(), Some("ocr"));
    }

    #[test]
    fn merge_base_preserved_when_overlay_absent() {
        let base = ConfigFile {
            logging: Some(LoggingConfig {
                level: Some("debug".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let merged = merge(base, ConfigFile::default());
        assert_eq!(merged.logging.unwrap().level.as_deref(), Some("debug"));
    }

    #[test]
    fn load_from_path_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[openai]\nmodel = \"m\"\n").unwrap();
        let loaded = load_from_path(&path).unwrap();
        assert_eq!(loaded.openai.unwrap().model.as_deref(), Some("m"));

        std::fs::write(&path, "not = [valid").unwrap();
        assert!(load_from_path(&path).is_none());
        assert!(load_from_path(&dir.path().join("missing.toml")).is_none());
    }
}
