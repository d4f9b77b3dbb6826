//! Vision chat-completion backend: rendered pages are sent as inline images.

use serde::Deserialize;
use serde_json::{Value, json};

use super::openai::{ChatCompletionsClient, message_content};
use super::{BackendError, BackendFuture, BackendKind, ExtractedValues, ExtractionBackend, InferredSchema};
use crate::models::{FieldValue, RenderedPage, SchemaField, SchemaSpec};
use crate::pricing::PricingCall;
use crate::prompts::{
    build_schema_inference_prompt, build_values_extraction_prompt, schema_inference_json_schema,
    schema_response_format, values_json_schema,
};
use crate::settings::Settings;

#[derive(Deserialize)]
struct SchemaResponse {
    #[serde(default)]
    name: Option<String>,
    fields: Vec<SchemaField>,
}

#[derive(Deserialize)]
struct ValuesResponse {
    fields: Vec<FieldValue>,
}

pub struct MultimodalBackend {
    client: ChatCompletionsClient,
    model: String,
    null_sentinel: String,
}

impl MultimodalBackend {
    pub fn new(client: ChatCompletionsClient, model: impl Into<String>, null_sentinel: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            null_sentinel: null_sentinel.into(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, BackendError> {
        Ok(Self::new(
            ChatCompletionsClient::from_settings(settings)?,
            settings.openai_model.clone(),
            settings.null_sentinel.clone(),
        ))
    }

    fn payload(&self, prompt: String, pages: &[RenderedPage], format_name: &str, schema: &Value) -> Value {
        let mut content = vec![json!({ "type": "text", "text": prompt })];
        content.extend(pages.iter().map(image_content));
        json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": content }],
            "response_format": schema_response_format(format_name, schema),
        })
    }

    async fn complete(&self, payload: Value) -> Result<(String, PricingCall), BackendError> {
        let response = self.client.complete(&payload).await?;
        let pricing = self.client.pricing(&self.model, &response);
        let content = message_content(&response)
            .ok_or_else(|| BackendError::MalformedResponse("response has no message content".into()))?
            .to_string();
        Ok((content, pricing))
    }
}

fn image_content(page: &RenderedPage) -> Value {
    json!({
        "type": "image_url",
        "image_url": { "url": format!("data:{};base64,{}", page.mime_type, page.data_base64) },
    })
}

/// Decode a schema-inference answer. Identity fields are left for the caller to assign.
pub fn parse_schema_response(content: &str) -> Result<SchemaSpec, BackendError> {
    let parsed: SchemaResponse = serde_json::from_str(content)
        .map_err(|e| BackendError::MalformedResponse(format!("schema response: {e}")))?;
    Ok(SchemaSpec {
        id: String::new(),
        name: parsed.name.unwrap_or_default(),
        fingerprint: String::new(),
        version: 1,
        schema_family_id: None,
        fields: parsed.fields,
    })
}

pub fn parse_values_response(content: &str) -> Result<Vec<FieldValue>, BackendError> {
    let parsed: ValuesResponse = serde_json::from_str(content)
        .map_err(|e| BackendError::MalformedResponse(format!("values response: {e}")))?;
    Ok(parsed.fields)
}

impl ExtractionBackend for MultimodalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Multimodal
    }

    fn infer_schema<'a>(&'a self, pages: &'a [RenderedPage]) -> BackendFuture<'a, InferredSchema> {
        Box::pin(async move {
            if pages.is_empty() {
                return Err(BackendError::EmptyPages("schema inference"));
            }
            let payload = self.payload(
                build_schema_inference_prompt(None),
                pages,
                "schema_response",
                &schema_inference_json_schema(),
            );
            let (content, pricing) = self.complete(payload).await?;
            let schema = parse_schema_response(&content)?;
            tracing::info!(fields = schema.fields.len(), pages = pages.len(), "schema inferred");
            Ok((schema, Some(pricing)))
        })
    }

    fn extract_values<'a>(
        &'a self,
        pages: &'a [RenderedPage],
        keys: &'a [String],
        extra_instructions: Option<&'a str>,
    ) -> BackendFuture<'a, ExtractedValues> {
        Box::pin(async move {
            if pages.is_empty() {
                return Err(BackendError::EmptyPages("value extraction"));
            }
            if keys.is_empty() {
                return Ok((Vec::new(), None));
            }
            let payload = self.payload(
                build_values_extraction_prompt(keys, &self.null_sentinel, extra_instructions),
                pages,
                "values_response",
                &values_json_schema(),
            );
            let (content, pricing) = self.complete(payload).await?;
            let values = parse_values_response(&content)?;
            tracing::debug!(fields = values.len(), pages = pages.len(), "values extracted");
            Ok((values, Some(pricing)))
        })
    }
}
