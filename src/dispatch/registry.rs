use std::collections::HashMap;

use serde::Deserialize;

use crate::dispatch::{LlmModel, LlmModelConfig};
use crate::error::{GatewayError, KilnError};

/// API format for HTTP backends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiFormat {
    /// OpenAI-compatible chat completions (default for most providers).
    #[default]
    OpenAi,
    /// Anthropic Messages API (different headers, SSE format).
    Anthropic,
}

impl ApiFormat {
    /// Path appended to a provider base URL.
    pub fn path(&self) -> &'static str {
        match self {
            Self::OpenAi => "/chat/completions",
            Self::Anthropic => "/messages",
        }
    }
}

/// One routable provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderEntry {
    pub provider_id: String,
    pub base_url: String,
    pub api_format: ApiFormat,
    /// Name of the credential this provider requires. `None` for
    /// self-hosted providers that need no key.
    pub credential_env: Option<String>,
}

impl ProviderEntry {
    fn hosted(id: &str, base_url: &str, env: &str) -> Self {
        Self {
            provider_id: id.to_string(),
            base_url: base_url.to_string(),
            api_format: ApiFormat::OpenAi,
            credential_env: Some(env.to_string()),
        }
    }
}

/// Built-in provider table.
pub fn default_providers() -> Vec<ProviderEntry> {
    vec![
        ProviderEntry {
            api_format: ApiFormat::Anthropic,
            ..ProviderEntry::hosted("anthropic", "https://api.anthropic.com/v1", "ANTHROPIC_API_KEY")
        },
        ProviderEntry::hosted("openai", "https://api.openai.com/v1", "OPENAI_API_KEY"),
        ProviderEntry::hosted(
            "google",
            "https://generativelanguage.googleapis.com/v1beta/openai",
            "GOOGLE_AI_API_KEY",
        ),
        ProviderEntry::hosted("mistral", "https://api.mistral.ai/v1", "MISTRAL_API_KEY"),
        ProviderEntry::hosted("groq", "https://api.groq.com/openai/v1", "GROQ_API_KEY"),
        ProviderEntry::hosted("togetherai", "https://api.together.xyz/v1", "TOGETHER_API_KEY"),
        ProviderEntry::hosted(
            "fireworks",
            "https://api.fireworks.ai/inference/v1",
            "FIREWORKS_API_KEY",
        ),
        ProviderEntry::hosted("xai", "https://api.x.ai/v1", "XAI_API_KEY"),
        ProviderEntry::hosted("deepseek", "https://api.deepseek.com", "DEEPSEEK_API_KEY"),
        ProviderEntry {
            provider_id: "ollama".to_string(),
            base_url: "http://localhost:11434/v1".to_string(),
            api_format: ApiFormat::OpenAi,
            credential_env: None,
        },
    ]
}

/// Resolved upstream target for one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub provider: String,
    pub url: String,
    pub api_format: ApiFormat,
}

pub struct ProviderRegistry {
    providers: HashMap<String, ProviderEntry>,
    allow_base_url_override: bool,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<ProviderEntry>, allow_base_url_override: bool) -> Self {
        Self {
            providers: providers
                .into_iter()
                .map(|p| (p.provider_id.clone(), p))
                .collect(),
            allow_base_url_override,
        }
    }

    /// Pick the URL and wire format for `model`. A request-supplied base URL
    /// replaces the provider default when overrides are allowed and the
    /// server's own key would not travel with it: the request brings its own
    /// key, or the provider needs none.
    pub fn endpoint(
        &self,
        model: &LlmModel,
        config: &LlmModelConfig,
    ) -> Result<Endpoint, KilnError> {
        let entry = self
            .providers
            .get(&model.provider_id)
            .ok_or_else(|| KilnError::UnknownProvider(model.provider_id.clone()))?;

        let uses_server_key = config.own_api_key().is_none() && entry.credential_env.is_some();
        let base = match config.base_url.as_deref().filter(|u| !u.trim().is_empty()) {
            Some(custom) if self.allow_base_url_override && !uses_server_key => custom,
            Some(_) => {
                tracing::warn!(
                    provider = %entry.provider_id,
                    uses_server_key,
                    "base URL override rejected"
                );
                &entry.base_url
            }
            None => &entry.base_url,
        };

        Ok(Endpoint {
            provider: entry.provider_id.clone(),
            url: format!("{}{}", base.trim_end_matches('/'), entry.api_format.path()),
            api_format: entry.api_format,
        })
    }
}

/// Provider credential. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

/// Maps providers to the credential they require and finds it, request
/// key first, then the server's own.
pub struct ProviderKeyResolver {
    /// provider id -> credential name
    required: HashMap<String, String>,
    /// credential name -> value
    server_keys: HashMap<String, String>,
}

impl ProviderKeyResolver {
    pub fn new(required: HashMap<String, String>, server_keys: HashMap<String, String>) -> Self {
        Self {
            required,
            server_keys,
        }
    }

    pub fn from_providers<'a>(
        providers: impl IntoIterator<Item = &'a ProviderEntry>,
        server_keys: HashMap<String, String>,
    ) -> Self {
        let required = providers
            .into_iter()
            .filter_map(|p| {
                p.credential_env
                    .as_ref()
                    .map(|env| (p.provider_id.clone(), env.clone()))
            })
            .collect();
        Self::new(required, server_keys)
    }

    pub fn requires_key(&self, provider_id: &str) -> bool {
        self.required.contains_key(provider_id)
    }

    /// Returns `Ok(None)` for providers outside the required set that were
    /// given no key; they run unauthenticated.
    pub fn resolve(
        &self,
        model: &LlmModel,
        request_key: Option<&str>,
    ) -> Result<Option<Credential>, GatewayError> {
        if let Some(key) = request_key.filter(|k| !k.trim().is_empty()) {
            return Ok(Some(Credential::new(key)));
        }

        let Some(env_var) = self.required.get(&model.provider_id) else {
            return Ok(None);
        };

        match self.server_keys.get(env_var).filter(|k| !k.trim().is_empty()) {
            Some(key) => Ok(Some(Credential::new(key.clone()))),
            None => Err(GatewayError::KeyMissing {
                provider: model.provider_label().to_string(),
                env_var: env_var.clone(),
            }),
        }
    }
}
