//! Minimal client for OpenAI-compatible `/chat/completions` endpoints.

use std::time::Duration;

use serde_json::Value;

use super::BackendError;
use crate::pricing::PricingCall;
use crate::settings::Settings;

pub const PROVIDER: &str = "openai-compatible";

/// Shared HTTP plumbing for the multimodal backend and the OCR text normalizer.
#[derive(Clone)]
pub struct ChatCompletionsClient {
    http: reqwest::Client,
    base_url: Option<String>,
    api_key: Option<String>,
    input_cost_per_mtok: Option<f64>,
    output_cost_per_mtok: Option<f64>,
}

impl std::fmt::Debug for ChatCompletionsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCompletionsClient")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .finish()
    }
}

impl ChatCompletionsClient {
    pub fn from_settings(settings: &Settings) -> Result<Self, BackendError> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.openai_timeout_secs))
            .pool_max_idle_per_host(settings.max_connections)
            .pool_idle_timeout(Duration::from_secs(30));
        if let Some(proxy) = &settings.http_proxy_url {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }

        Ok(Self {
            http: builder.build()?,
            base_url: settings.openai_base_url.clone(),
            api_key: settings.openai_api_key.clone(),
            input_cost_per_mtok: settings.input_cost_per_mtok,
            output_cost_per_mtok: settings.output_cost_per_mtok,
        })
    }

    /// POST `payload` and return the decoded response body.
    ///
    /// Endpoint configuration is checked here, so a misconfigured client only fails
    /// once a call is actually attempted.
    pub async fn complete(&self, payload: &Value) -> Result<Value, BackendError> {
        let base_url = self
            .base_url
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| BackendError::Config("OPENAI_BASE_URL is required".into()))?;
        let api_key = self
            .api_key
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| BackendError::Config("OPENAI_API_KEY is required".into()))?;

        let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
        let resp = self
            .http
            .post(&url)
            .bearer_auth(api_key)
            .json(payload)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.json().await?)
    }

    /// Usage of one response, priced when per-token rates are configured.
    pub fn pricing(&self, model: &str, response: &Value) -> PricingCall {
        let usage = &response["usage"];
        let input_tokens = usage["prompt_tokens"].as_u64();
        let output_tokens = usage["completion_tokens"].as_u64();
        let cost = |tokens: Option<u64>, rate: Option<f64>| {
            tokens.zip(rate).map(|(t, r)| t as f64 * r / 1_000_000.0)
        };
        let total_cost_usd = match (
            cost(input_tokens, self.input_cost_per_mtok),
            cost(output_tokens, self.output_cost_per_mtok),
        ) {
            (Some(i), Some(o)) => Some(i + o),
            (i, o) => i.or(o),
        };

        PricingCall {
            input_tokens,
            output_tokens,
            total_cost_usd,
            ..PricingCall::new(PROVIDER, model)
        }
    }
}

/// Text of the first choice's message, if present.
pub fn message_content(response: &Value) -> Option<&str> {
    response["choices"][0]["message"]["content"].as_str()
}
