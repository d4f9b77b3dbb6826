//! Builds the final [`ExtractionResult`] from raw backend observations.

use indexmap::IndexMap;

use crate::models::{ConfidenceLevel, ExtractionResult, FieldValue, SchemaSpec};
use crate::normalize::normalize_value;
use crate::pricing::PricingCall;
use crate::reconcile::reconcile_by_key;

/// One normalized value per schema field, in schema order.
///
/// Fields without a non-blank observation get the null sentinel, keeping whatever
/// confidence and page were observed.
pub fn assemble(
    schema: &SchemaSpec,
    values: Vec<FieldValue>,
    null_sentinel: &str,
    pricing: Option<PricingCall>,
) -> ExtractionResult {
    let best = reconcile_by_key(values);
    let mut fields = Vec::with_capacity(schema.fields.len());
    let mut flat = IndexMap::with_capacity(schema.fields.len());

    for field in &schema.fields {
        let observed = best.get(&field.key);
        let page = observed.and_then(|v| v.page).or(field.page);
        let confidence = observed.map_or(ConfidenceLevel::Unknown, |v| v.confidence);

        let value = match observed.and_then(FieldValue::trimmed_value) {
            Some(raw) => normalize_value(raw, field.kind, field.semantic_type, null_sentinel),
            None => null_sentinel.to_string(),
        };

        flat.insert(field.key.clone(), value.clone());
        fields.push(FieldValue {
            key: field.key.clone(),
            value: Some(value),
            page,
            confidence,
        });
    }

    ExtractionResult {
        schema_id: schema.id.clone(),
        schema_name: schema.name.clone(),
        fields,
        flat,
        schema_fields_count: schema.fields.len(),
        pricing,
        metadata: IndexMap::new(),
    }
}
