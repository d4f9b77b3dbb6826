//! Typed value normalization applied to every assembled field.
//!
//! Every rule is idempotent: normalizing an already-normalized value returns it unchanged.

use std::str::FromStr;

use rust_decimal::Decimal;

use crate::models::{FieldKind, FieldSemanticType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rule {
    Phone,
    Amount,
    Percentage,
    Address,
    Email,
    Verbatim,
}

fn rule_for(kind: FieldKind, semantic_type: Option<FieldSemanticType>) -> Rule {
    match semantic_type {
        Some(FieldSemanticType::Phone) => Rule::Phone,
        Some(FieldSemanticType::Amount) => Rule::Amount,
        Some(FieldSemanticType::Percentage) => Rule::Percentage,
        Some(FieldSemanticType::Address) => Rule::Address,
        Some(FieldSemanticType::Email) => Rule::Email,
        Some(_) => Rule::Verbatim,
        None => match kind {
            FieldKind::Phone => Rule::Phone,
            FieldKind::Amount => Rule::Amount,
            FieldKind::Address => Rule::Address,
            FieldKind::Email => Rule::Email,
            _ => Rule::Verbatim,
        },
    }
}

/// Normalize a raw extracted value according to the field's type.
///
/// Empty input or the null sentinel yields the sentinel. Values that a typed
/// rule cannot parse are returned trimmed but otherwise untouched.
pub fn normalize_value(
    value: &str,
    kind: FieldKind,
    semantic_type: Option<FieldSemanticType>,
    null_sentinel: &str,
) -> String {
    let value = value.trim();
    if value.is_empty() || value == null_sentinel {
        return null_sentinel.to_string();
    }

    match rule_for(kind, semantic_type) {
        Rule::Phone => normalize_phone(value),
        Rule::Amount => normalize_decimal(value),
        Rule::Percentage => normalize_percentage(value),
        Rule::Address => collapse_whitespace(value),
        Rule::Email => value.to_lowercase(),
        Rule::Verbatim => value.to_string(),
    }
}

fn normalize_phone(value: &str) -> String {
    let mut compact: String = value
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '+')
        .collect();
    if !compact.chars().any(|c| c.is_ascii_digit()) {
        return value.to_string();
    }
    if let Some(rest) = compact.strip_prefix("00") {
        compact = format!("+{rest}");
    }
    if compact.matches('+').count() > 1 {
        compact.retain(|c| c != '+');
    }
    compact
}

fn normalize_decimal(value: &str) -> String {
    let compact: String = value
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| if c == ',' { '.' } else { c })
        .collect();
    match Decimal::from_str(&compact) {
        Ok(parsed) => parsed.normalize().to_string(),
        Err(_) => value.to_string(),
    }
}

fn normalize_percentage(value: &str) -> String {
    let stripped = value.replace('%', "");
    let stripped = stripped.trim();
    if stripped.is_empty() {
        return value.to_string();
    }
    format!("{}%", normalize_decimal(stripped))
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}
