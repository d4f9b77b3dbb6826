use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use extractforms_core::schema_store::fingerprint_pdf;
use extractforms_core::settings::bootstrap_env_file;
use extractforms_core::{BackendKind, ExtractRequest, Extractor, PassMode, SchemaStore, Settings};
use extractforms_pdf_mupdf::{MupdfPageSource, MupdfTextLayer};

mod output;

use output::ColorMode;

/// Schema-driven PDF form extraction
#[derive(Parser, Debug)]
#[command(name = "extractforms", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract form field values from a PDF
    Extract(ExtractArgs),

    /// Inspect the schema cache
    Schemas {
        #[command(subcommand)]
        command: SchemasCommand,
    },
}

#[derive(Subcommand, Debug)]
enum SchemasCommand {
    /// List cached schemas
    List,

    /// Look up the cached schema matching a PDF
    Match {
        /// Path to the PDF
        pdf: PathBuf,
    },
}

#[derive(Args, Debug)]
struct ExtractArgs {
    /// Path to the PDF to extract
    input: PathBuf,

    /// Write the result JSON here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// How the schema is obtained
    #[arg(long, value_enum, default_value_t = ModeArg::TwoPass)]
    mode: ModeArg,

    /// Extraction backend (defaults to EXTRACTION_BACKEND)
    #[arg(long, value_enum)]
    backend: Option<BackendArg>,

    /// Neither read nor write the schema cache
    #[arg(long)]
    no_cache: bool,

    /// Render resolution
    #[arg(long, default_value_t = 200)]
    dpi: u32,

    /// Page image encoding (png or jpeg)
    #[arg(long, default_value = "png")]
    image_format: String,

    /// First page to process (1-based)
    #[arg(long)]
    page_start: Option<u32>,

    /// Last page to process (inclusive)
    #[arg(long)]
    page_end: Option<u32>,

    /// Maximum number of pages to process
    #[arg(long)]
    max_pages: Option<u32>,

    /// Pages per value extraction call
    #[arg(long, default_value_t = 1)]
    chunk_pages: usize,

    /// Drop near-blank pages before extraction
    #[arg(long, conflicts_with = "keep_blank_pages")]
    drop_blank_pages: bool,

    /// Keep near-blank pages
    #[arg(long)]
    keep_blank_pages: bool,

    /// Minimum ink ratio for a page to count as non-blank
    #[arg(long)]
    blank_page_ink_threshold: Option<f64>,

    /// Channel level at or above which a pixel counts as white
    #[arg(long)]
    blank_page_near_white_level: Option<u8>,

    /// Use this cached schema (implies --mode one-schema-pass)
    #[arg(long)]
    schema_id: Option<String>,

    /// Use the schema stored in this JSON file
    #[arg(long)]
    schema_path: Option<PathBuf>,

    /// Look up a cached schema even with --no-cache
    #[arg(long)]
    match_schema: bool,

    /// Extra instructions appended to every prompt
    #[arg(long)]
    extra_instructions: Option<String>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    OnePass,
    TwoPass,
    OneSchemaPass,
}

impl From<ModeArg> for PassMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::OnePass => PassMode::OnePass,
            ModeArg::TwoPass => PassMode::TwoPass,
            ModeArg::OneSchemaPass => PassMode::OneSchemaPass,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendArg {
    Multimodal,
    Ocr,
}

impl From<BackendArg> for BackendKind {
    fn from(backend: BackendArg) -> Self {
        match backend {
            BackendArg::Multimodal => BackendKind::Multimodal,
            BackendArg::Ocr => BackendKind::Ocr,
        }
    }
}

impl ExtractArgs {
    fn blank_pages(&self) -> Option<bool> {
        match (self.drop_blank_pages, self.keep_blank_pages) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        }
    }

    fn request(&self) -> ExtractRequest {
        let mode = if self.schema_id.is_some() {
            PassMode::OneSchemaPass
        } else {
            self.mode.into()
        };
        ExtractRequest {
            output_path: self.output.clone(),
            mode,
            backend: self.backend.map(Into::into),
            use_cache: !self.no_cache,
            dpi: self.dpi,
            image_format: self.image_format.clone(),
            page_start: self.page_start,
            page_end: self.page_end,
            max_pages: self.max_pages,
            chunk_pages: self.chunk_pages,
            drop_blank_pages: self.blank_pages(),
            blank_page_ink_threshold: self.blank_page_ink_threshold,
            blank_page_near_white_level: self.blank_page_near_white_level,
            schema_id: self.schema_id.clone(),
            schema_path: self.schema_path.clone(),
            match_schema: self.match_schema,
            extra_instructions: self.extra_instructions.clone(),
            ..ExtractRequest::new(&self.input)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bootstrap_env_file(&std::env::current_dir()?)?;
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let settings = Settings::load().context("invalid configuration")?;
    let _guard = init_tracing(&settings)?;

    match cli.command {
        Command::Extract(args) => extract(args, settings).await,
        Command::Schemas { command } => schemas(command, &settings),
    }
}

/// Logs go to stderr, plus a JSON copy to `LOG_FILE` when configured.
fn init_tracing(settings: &Settings) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))
        .with_context(|| format!("invalid log level {:?}", settings.log_level))?;

    let stderr_layer: Box<dyn Layer<Registry> + Send + Sync> = if settings.log_json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    };

    let (file_layer, guard) = match &settings.log_file {
        Some(path) => {
            let (writer, guard) = tracing_appender::non_blocking(log_file_appender(path)?);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .with(filter)
        .try_init()?;
    Ok(guard)
}

fn log_file_appender(path: &Path) -> anyhow::Result<tracing_appender::rolling::RollingFileAppender> {
    let file_name = path
        .file_name()
        .with_context(|| format!("LOG_FILE has no file name: {}", path.display()))?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)?;
    Ok(tracing_appender::rolling::never(dir, file_name))
}

async fn extract(args: ExtractArgs, settings: Settings) -> anyhow::Result<()> {
    if !args.input.is_file() {
        anyhow::bail!("Input PDF not found: {}", args.input.display());
    }
    if let Some(path) = &args.schema_path
        && !path.is_file()
    {
        anyhow::bail!("Schema file not found: {}", path.display());
    }

    let request = args.request();
    let null_sentinel = settings.null_sentinel.clone();
    let extractor = Extractor::new(settings, Arc::new(MupdfPageSource::new()))
        .with_ocr_provider(Arc::new(MupdfTextLayer::new(&args.input)));

    let result = extractor.run_extract(&request).await?;

    if args.output.is_none() {
        println!("{}", serde_json::to_string_pretty(&result)?);
    }

    let color = ColorMode(!args.no_color && std::io::stderr().is_terminal());
    output::print_summary(
        &mut std::io::stderr(),
        &result,
        &null_sentinel,
        args.output.as_deref(),
        color,
    )?;
    Ok(())
}

fn schemas(command: SchemasCommand, settings: &Settings) -> anyhow::Result<()> {
    let store = SchemaStore::open(&settings.schema_cache_dir)?;
    match command {
        SchemasCommand::List => {
            let color = ColorMode(std::io::stdout().is_terminal());
            let schemas = store.load_all()?;
            output::print_schema_list(&mut std::io::stdout(), store.root(), &schemas, color)?;
        }
        SchemasCommand::Match { pdf } => {
            if !pdf.is_file() {
                anyhow::bail!("Input PDF not found: {}", pdf.display());
            }
            let matched = store.match_schema(&fingerprint_pdf(&pdf)?)?;
            println!("{}", serde_json::to_string_pretty(&matched)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ExtractArgs {
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.command {
            Command::Extract(args) => args,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn extract_defaults() {
        let args = parse(&["extractforms", "extract", "form.pdf"]);
        let request = args.request();
        assert_eq!(request.mode, PassMode::TwoPass);
        assert!(request.use_cache);
        assert_eq!(request.dpi, 200);
        assert_eq!(request.chunk_pages, 1);
        assert_eq!(request.drop_blank_pages, None);
        assert_eq!(request.backend, None);
    }

    #[test]
    fn schema_id_forces_one_schema_pass() {
        let args = parse(&[
            "extractforms",
            "extract",
            "form.pdf",
            "--mode",
            "one-pass",
            "--schema-id",
            "abc",
        ]);
        let request = args.request();
        assert_eq!(request.mode, PassMode::OneSchemaPass);
        assert_eq!(request.schema_id.as_deref(), Some("abc"));
    }

    #[test]
    fn blank_page_flags() {
        let keep = parse(&["extractforms", "extract", "f.pdf", "--keep-blank-pages"]);
        assert_eq!(keep.request().drop_blank_pages, Some(false));
        let drop = parse(&["extractforms", "extract", "f.pdf", "--drop-blank-pages"]);
        assert_eq!(drop.request().drop_blank_pages, Some(true));
        assert!(
            Cli::try_parse_from([
                "extractforms",
                "extract",
                "f.pdf",
                "--drop-blank-pages",
                "--keep-blank-pages"
            ])
            .is_err()
        );
    }

    #[test]
    fn backend_and_cache_flags() {
        let args = parse(&[
            "extractforms",
            "extract",
            "f.pdf",
            "--backend",
            "ocr",
            "--no-cache",
            "--chunk-pages",
            "3",
        ]);
        let request = args.request();
        assert_eq!(request.backend, Some(BackendKind::Ocr));
        assert!(!request.use_cache);
        assert_eq!(request.chunk_pages, 3);
    }
}
