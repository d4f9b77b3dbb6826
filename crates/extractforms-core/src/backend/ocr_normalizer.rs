//! Optional text-only model pass that cleans up OCR values.

use indexmap::IndexMap;
use serde_json::{Value, json};

use super::BackendError;
use super::openai::{ChatCompletionsClient, message_content};
use crate::pricing::PricingCall;
use crate::prompts::build_text_normalization_prompt;
use crate::settings::Settings;

pub struct OcrTextNormalizer {
    client: ChatCompletionsClient,
    model: String,
}

impl OcrTextNormalizer {
    pub fn new(client: ChatCompletionsClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, BackendError> {
        Ok(Self::new(
            ChatCompletionsClient::from_settings(settings)?,
            settings.ocr_normalization_model(),
        ))
    }

    /// Normalize `values`, keeping their keys and order.
    ///
    /// Transport and endpoint failures are errors. An answer without usable content
    /// leaves the raw values in place.
    pub async fn normalize_values(
        &self,
        values: &IndexMap<String, String>,
        extra_instructions: Option<&str>,
    ) -> Result<(IndexMap<String, String>, Option<PricingCall>), BackendError> {
        if values.is_empty() {
            return Ok((IndexMap::new(), None));
        }

        let input = serde_json::to_string(values)
            .map_err(|e| BackendError::MalformedResponse(e.to_string()))?;
        let payload = json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": build_text_normalization_prompt(&input, extra_instructions),
            }],
            "response_format": { "type": "json_object" },
        });

        let response = self.client.complete(&payload).await?;
        let pricing = self.client.pricing(&self.model, &response);
        Ok((apply_normalized(values, &response), Some(pricing)))
    }
}

fn normalized_map(response: &Value) -> Option<serde_json::Map<String, Value>> {
    let content = message_content(response)?;
    let parsed: Value = serde_json::from_str(content).ok()?;
    match parsed.get("values") {
        Some(Value::Object(map)) => Some(map.clone()),
        _ => None,
    }
}

fn apply_normalized(values: &IndexMap<String, String>, response: &Value) -> IndexMap<String, String> {
    let Some(normalized) = normalized_map(response) else {
        tracing::warn!("OCR normalization returned no usable values; keeping raw text");
        return values.clone();
    };
    values
        .iter()
        .map(|(key, raw)| {
            let value = match normalized.get(key) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => raw.clone(),
                Some(other) => other.to_string(),
            };
            (key.clone(), value)
        })
        .collect()
}
