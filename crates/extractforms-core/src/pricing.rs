//! Token and cost accounting for backend calls.

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Usage reported by one backend call. `None` means unknown, not zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingCall {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
}

fn sum_known<T: std::ops::Add<Output = T>>(left: Option<T>, right: Option<T>) -> Option<T> {
    match (left, right) {
        (Some(l), Some(r)) => Some(l + r),
        (Some(v), None) | (None, Some(v)) => Some(v),
        (None, None) => None,
    }
}

impl PricingCall {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            input_tokens: None,
            output_tokens: None,
            total_cost_usd: None,
        }
    }

    /// Add two calls for the same provider and model.
    pub fn combine(&self, other: &PricingCall) -> Result<PricingCall, CoreError> {
        if self.provider != other.provider || self.model != other.model {
            return Err(CoreError::ModelMismatch {
                left_provider: self.provider.clone(),
                left_model: self.model.clone(),
                right_provider: other.provider.clone(),
                right_model: other.model.clone(),
            });
        }
        Ok(PricingCall {
            provider: self.provider.clone(),
            model: self.model.clone(),
            input_tokens: sum_known(self.input_tokens, other.input_tokens),
            output_tokens: sum_known(self.output_tokens, other.output_tokens),
            total_cost_usd: sum_known(self.total_cost_usd, other.total_cost_usd),
        })
    }
}

/// Fold calls in order into a single aggregate. Empty input yields `None`.
pub fn merge_pricing_calls(calls: &[PricingCall]) -> Result<Option<PricingCall>, CoreError> {
    let mut iter = calls.iter();
    let Some(first) = iter.next() else {
        return Ok(None);
    };
    let mut total = first.clone();
    for call in iter {
        total = total.combine(call)?;
    }
    Ok(Some(total))
}
