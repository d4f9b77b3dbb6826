use std::io::Write;
use std::path::Path;

use extractforms_core::{ExtractionResult, SchemaSpec};
use owo_colors::OwoColorize;

/// Whether to use colored output.
#[derive(Debug, Clone, Copy)]
pub struct ColorMode(pub bool);

impl ColorMode {
    pub fn enabled(&self) -> bool {
        self.0
    }
}

fn metadata_str(result: &ExtractionResult, key: &str) -> String {
    match result.metadata.get(key) {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Null) | None => "-".to_string(),
        Some(other) => other.to_string(),
    }
}

/// Print the run summary after an extraction.
pub fn print_summary(
    w: &mut dyn Write,
    result: &ExtractionResult,
    null_sentinel: &str,
    output: Option<&Path>,
    color: ColorMode,
) -> std::io::Result<()> {
    let missing: Vec<&str> = result
        .fields
        .iter()
        .filter(|f| f.value.as_deref().is_none_or(|v| v == null_sentinel))
        .map(|f| f.key.as_str())
        .collect();
    let filled = result.schema_fields_count.saturating_sub(missing.len());

    writeln!(w)?;
    if color.enabled() {
        writeln!(w, "{}", "EXTRACTION SUMMARY".bold())?;
    } else {
        writeln!(w, "EXTRACTION SUMMARY")?;
    }
    writeln!(w, "  Schema:   {} ({})", result.schema_name, result.schema_id)?;
    writeln!(
        w,
        "  Mode:     {} via {}{}",
        metadata_str(result, "mode"),
        metadata_str(result, "backend"),
        if result.metadata.get("cache_hit") == Some(&serde_json::Value::Bool(true)) {
            " (cached schema)"
        } else {
            ""
        }
    )?;
    writeln!(
        w,
        "  Pages:    {}   Model calls: {}   Time: {} ms",
        metadata_str(result, "pages_processed"),
        metadata_str(result, "model_calls"),
        metadata_str(result, "duration_ms"),
    )?;

    let fields_line = format!("{filled}/{} fields filled", result.schema_fields_count);
    if color.enabled() {
        if missing.is_empty() {
            writeln!(w, "  Fields:   {}", fields_line.green())?;
        } else {
            writeln!(w, "  Fields:   {}", fields_line.yellow())?;
        }
    } else {
        writeln!(w, "  Fields:   {fields_line}")?;
    }

    if !missing.is_empty() {
        let list = missing.join(", ");
        if color.enabled() {
            writeln!(w, "  Missing:  {}", list.dimmed())?;
        } else {
            writeln!(w, "  Missing:  {list}")?;
        }
    }

    if let Some(pricing) = &result.pricing {
        let tokens = match (pricing.input_tokens, pricing.output_tokens) {
            (Some(i), Some(o)) => format!("{i} in / {o} out"),
            (Some(i), None) => format!("{i} in"),
            (None, Some(o)) => format!("{o} out"),
            (None, None) => "tokens unknown".to_string(),
        };
        let cost = pricing
            .total_cost_usd
            .map_or_else(|| "cost unknown".to_string(), |c| format!("${c:.4}"));
        writeln!(w, "  Usage:    {} ({tokens}), {cost}", pricing.model)?;
    }

    if let Some(path) = output {
        if color.enabled() {
            writeln!(w, "  Output:   {}", path.display().cyan())?;
        } else {
            writeln!(w, "  Output:   {}", path.display())?;
        }
    }
    Ok(())
}

/// Print one line per cached schema.
pub fn print_schema_list(
    w: &mut dyn Write,
    root: &Path,
    schemas: &[SchemaSpec],
    color: ColorMode,
) -> std::io::Result<()> {
    if schemas.is_empty() {
        writeln!(w, "No cached schemas in {}", root.display())?;
        return Ok(());
    }
    for schema in schemas {
        let id = if color.enabled() {
            schema.id.cyan().to_string()
        } else {
            schema.id.clone()
        };
        writeln!(
            w,
            "{id}  v{}  {} fields  {}",
            schema.version,
            schema.fields.len(),
            schema.name
        )?;
    }
    Ok(())
}
