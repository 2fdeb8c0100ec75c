pub mod http;
pub mod registry;

use std::pin::Pin;

use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::error::KilnError;
use crate::messages::Message;

/// Model selector as sent by clients (one entry of the model catalogue).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmModel {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Display name of the provider, e.g. "Anthropic".
    #[serde(default)]
    pub provider: String,
    /// Routing key into the provider table, e.g. "anthropic".
    #[serde(rename = "providerId")]
    pub provider_id: String,
    #[serde(rename = "multiModal", default)]
    pub multi_modal: bool,
}

impl LlmModel {
    /// Human-readable provider name for error messages.
    pub fn provider_label(&self) -> &str {
        if self.provider.trim().is_empty() {
            &self.provider_id
        } else {
            &self.provider
        }
    }
}

/// Per-request model settings chosen by the user.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmModelConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(rename = "baseURL", default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl LlmModelConfig {
    /// The caller's own key, if it is non-blank.
    pub fn own_api_key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|k| !k.trim().is_empty())
    }

    /// Everything except model, key and base URL, forwarded to the provider.
    pub fn params(&self) -> GenerationParams {
        GenerationParams {
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            frequency_penalty: self.frequency_penalty,
            presence_penalty: self.presence_penalty,
            max_tokens: self.max_tokens,
        }
    }
}

impl std::fmt::Debug for LlmModelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmModelConfig")
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("base_url", &self.base_url)
            .field("temperature", &self.temperature)
            .field("top_p", &self.top_p)
            .field("top_k", &self.top_k)
            .field("frequency_penalty", &self.frequency_penalty)
            .field("presence_penalty", &self.presence_penalty)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GenerationParams {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
    pub frequency_penalty: Option<f64>,
    pub presence_penalty: Option<f64>,
    pub max_tokens: Option<u32>,
}

/// Internal request type handed to the HTTP backend.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    /// Provider-side model name.
    pub model: String,
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub params: GenerationParams,
    /// JSON schema the structured output must follow.
    pub schema: serde_json::Value,
}

/// Lazily consumed sequence of raw text deltas from the provider.
pub type TextDeltaStream = Pin<Box<dyn Stream<Item = Result<String, KilnError>> + Send>>;
