//! Prompt builders and strict response-format schemas for chat-completion backends.

use serde_json::{Map, Value, json};

fn with_instructions(base: String, extra_instructions: Option<&str>) -> String {
    match extra_instructions.map(str::trim).filter(|s| !s.is_empty()) {
        Some(extra) => format!("{base}\nAdditional instructions: {extra}"),
        None => base,
    }
}

pub fn build_schema_inference_prompt(extra_instructions: Option<&str>) -> String {
    with_instructions(
        "Infer a stable schema for this form document. \
         Return fields with key, label, page, and field kind."
            .to_string(),
        extra_instructions,
    )
}

pub fn build_values_extraction_prompt(
    keys: &[String],
    null_sentinel: &str,
    extra_instructions: Option<&str>,
) -> String {
    with_instructions(
        format!(
            "Extract values for the following keys. \
             When a value is missing return {null_sentinel}. \
             Keys: {}.",
            keys.join(", ")
        ),
        extra_instructions,
    )
}

pub fn build_text_normalization_prompt(values_json: &str, extra_instructions: Option<&str>) -> String {
    with_instructions(
        format!(
            "Normalize each provided value without inventing missing data. \
             Return a compact JSON object with exactly one top-level key `values` \
             mapping input keys to normalized string values.\nInput JSON: {values_json}"
        ),
        extra_instructions,
    )
}

/// Tighten a JSON schema for strict structured output.
///
/// Every object with `properties` gets `type: object`, all properties required and
/// no additional properties. `default` is dropped next to `$ref`.
pub fn sanitize_json_schema(schema: &Value) -> Value {
    let mut cleaned = schema.clone();
    sanitize_node(&mut cleaned);
    cleaned
}

fn sanitize_node(node: &mut Value) {
    match node {
        Value::Object(map) => {
            sanitize_object(map);
            for value in map.values_mut() {
                sanitize_node(value);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(sanitize_node),
        _ => {}
    }
}

fn sanitize_object(map: &mut Map<String, Value>) {
    let required = match map.get("properties") {
        Some(Value::Object(props)) => {
            let mut keys: Vec<String> = props.keys().cloned().collect();
            keys.sort();
            Some(keys)
        }
        _ => None,
    };
    if let Some(required) = required {
        map.entry("type").or_insert_with(|| json!("object"));
        map.insert("required".to_string(), json!(required));
        map.insert("additionalProperties".to_string(), Value::Bool(false));
    }
    if map.contains_key("$ref") {
        map.remove("default");
    }
}

/// `response_format` payload requesting strict JSON-schema output.
pub fn schema_response_format(name: &str, schema: &Value) -> Value {
    json!({
        "type": "json_schema",
        "json_schema": {
            "name": name,
            "schema": sanitize_json_schema(schema),
            "strict": true,
        }
    })
}

/// Shape of a schema-inference answer: `{name, fields[]}`.
pub fn schema_inference_json_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "name": { "type": "string" },
            "fields": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "key": { "type": "string" },
                        "label": { "type": "string" },
                        "page": { "type": ["integer", "null"] },
                        "kind": {
                            "type": "string",
                            "enum": [
                                "text", "number", "date", "checkbox", "select",
                                "phone", "amount", "address", "email", "unknown"
                            ]
                        },
                        "semantic_type": {
                            "type": ["string", "null"],
                            "enum": [
                                "phone", "amount", "percentage", "address", "email",
                                "date", "text", "other", null
                            ]
                        }
                    }
                }
            }
        }
    })
}

/// Shape of a value-extraction answer: `{fields: [{key, value, page, confidence}]}`.
pub fn values_json_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "fields": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "key": { "type": "string" },
                        "value": { "type": ["string", "null"] },
                        "page": { "type": ["integer", "null"] },
                        "confidence": {
                            "type": "string",
                            "enum": ["low", "medium", "high", "unknown"]
                        }
                    }
                }
            }
        }
    })
}
