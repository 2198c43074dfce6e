//! Provider trait: the shape of an LLM call as seen by instrumentation.
//!
//! The telemetry engine never talks to a model itself. It wraps a
//! [`Provider`] supplied by the caller and reads the token counts off the
//! [`ProviderOutput`] it returns.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::attribute::AttributeValue;
use crate::error::ProviderError;

/// A single completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// The prompt text.
    pub prompt: String,

    /// Model identifier (e.g. "openai/gpt-4o"), used for pricing lookups.
    pub model: String,

    /// Free-form sampling parameters (temperature, max_tokens, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, AttributeValue>,
}

impl ProviderRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            parameters: BTreeMap::new(),
        }
    }

    /// Add a sampling parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

/// What a provider hands back: generated text plus token usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderOutput {
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl ProviderOutput {
    pub fn total_tokens(&self) -> u32 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// An LLM backend.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "openrouter", "anthropic").
    fn name(&self) -> &str;

    /// Send a request and get a complete response.
    async fn complete(&self, request: ProviderRequest) -> Result<ProviderOutput, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Provider for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn complete(&self, request: ProviderRequest) -> Result<ProviderOutput, ProviderError> {
            Ok(ProviderOutput {
                text: request.prompt.clone(),
                input_tokens: request.prompt.len() as u32,
                output_tokens: request.prompt.len() as u32,
            })
        }
    }

    #[test]
    fn request_builder_collects_parameters() {
        let req = ProviderRequest::new("openai/gpt-4o", "hi")
            .with_parameter("temperature", 0.2)
            .with_parameter("max_tokens", 256i64);
        assert_eq!(req.parameters.len(), 2);
        assert_eq!(req.parameters["max_tokens"], AttributeValue::Int(256));
    }

    #[tokio::test]
    async fn provider_trait_object_is_usable() {
        let provider: Box<dyn Provider> = Box::new(Echo);
        let out = provider
            .complete(ProviderRequest::new("echo", "hello"))
            .await
            .unwrap();
        assert_eq!(out.text, "hello");
        assert_eq!(out.total_tokens(), 10);
        assert_eq!(provider.name(), "echo");
    }
}
