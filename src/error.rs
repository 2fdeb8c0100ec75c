use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ratelimit::RateLimitDecision;

#[derive(Debug, Error)]
pub enum KilnError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("rate limited by {provider}")]
    RateLimited { provider: String },

    #[error("upstream error from {provider}: {message}")]
    Upstream {
        provider: String,
        message: String,
        status: Option<u16>,
    },

    #[error("auth failed for {provider}: {message}")]
    AuthFailed {
        provider: String,
        message: String,
        status: u16,
    },

    #[error("schema parse error: {0}")]
    SchemaParse(String),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("counter store unavailable: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("{0}")]
    Other(String),
}

impl KilnError {
    /// HTTP-equivalent status carried by the failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RateLimited { .. } => Some(429),
            Self::Upstream { status, .. } => *status,
            Self::AuthFailed { status, .. } => Some(*status),
            Self::Request(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Produce a sanitized error message safe for returning to clients.
    /// Does not leak internal URLs, connection details, or upstream error bodies.
    pub fn user_message(&self) -> String {
        match self {
            Self::UnknownProvider(p) => format!("unknown provider: {p}"),
            Self::RateLimited { provider } => {
                format!("rate limited by {provider}, try again shortly")
            }
            Self::Upstream { provider, .. } => format!("upstream error from {provider}"),
            Self::AuthFailed { provider, .. } => {
                format!("authentication failed for {provider}")
            }
            Self::SchemaParse(_) => "failed to parse provider response".to_string(),
            Self::Request(_) => "request to provider failed".to_string(),
            Self::Store(_) => "rate limit store unavailable".to_string(),
            Self::Config(msg) => format!("configuration error: {msg}"),
            Self::Sandbox(_) => "sandbox could not be created".to_string(),
            Self::Persistence(_) => "build could not be saved".to_string(),
            Self::Other(msg) => msg.clone(),
        }
    }
}

/// Closed classification of anything that goes wrong between the gateway and
/// the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    RateLimited,
    Overloaded,
    AccessDenied,
    Unexpected,
}

/// Substrings that mark a failure message as provider rate limiting.
const RATE_LIMIT_TOKENS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "rate-limit",
    "ratelimit",
    "too many requests",
];

impl UpstreamErrorKind {
    /// Status wins over message; the rate-limit check runs first so a 503 that
    /// says "rate limit" is still reported as rate limiting.
    pub fn classify(status: Option<u16>, message: &str) -> Self {
        let lower = message.to_lowercase();
        if status == Some(429) || RATE_LIMIT_TOKENS.iter().any(|t| lower.contains(t)) {
            return Self::RateLimited;
        }
        match status {
            Some(503 | 529) => Self::Overloaded,
            Some(401 | 403) => Self::AccessDenied,
            _ => Self::Unexpected,
        }
    }

    pub fn of(err: &KilnError) -> Self {
        Self::classify(err.status(), &err.to_string())
    }

    pub fn code(self) -> ErrorCode {
        match self {
            Self::RateLimited => ErrorCode::ProviderRateLimited,
            Self::Overloaded => ErrorCode::ProviderOverloaded,
            Self::AccessDenied => ErrorCode::AccessDenied,
            Self::Unexpected => ErrorCode::UnexpectedError,
        }
    }
}

/// Wire-level error codes. Every non-success response carries exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    RateLimited,
    ApiKeyMissing,
    ProviderRateLimited,
    ProviderOverloaded,
    AccessDenied,
    UnexpectedError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::ApiKeyMissing => "api_key_missing",
            Self::ProviderRateLimited => "provider_rate_limited",
            Self::ProviderOverloaded => "provider_overloaded",
            Self::AccessDenied => "access_denied",
            Self::UnexpectedError => "unexpected_error",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::RateLimited | Self::ProviderRateLimited => 429,
            Self::ApiKeyMissing => 400,
            Self::ProviderOverloaded => 529,
            Self::AccessDenied => 403,
            Self::UnexpectedError => 500,
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "rate_limited" => Some(Self::RateLimited),
            "api_key_missing" => Some(Self::ApiKeyMissing),
            "provider_rate_limited" => Some(Self::ProviderRateLimited),
            "provider_overloaded" => Some(Self::ProviderOverloaded),
            "access_denied" => Some(Self::AccessDenied),
            "unexpected_error" => Some(Self::UnexpectedError),
            _ => None,
        }
    }

    /// True for both the local budget and provider-side rate limiting.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited | Self::ProviderRateLimited)
    }
}

/// Terminal rejection of one generation request.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("request limit reached for {identity}")]
    RateLimited {
        identity: String,
        decision: RateLimitDecision,
    },

    #[error("missing API key for {provider} (set {env_var})")]
    KeyMissing { provider: String, env_var: String },

    #[error("{} [{incident_id}]", kind.code().as_str())]
    Upstream {
        kind: UpstreamErrorKind,
        incident_id: String,
    },
}

impl GatewayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::RateLimited { .. } => ErrorCode::RateLimited,
            Self::KeyMissing { .. } => ErrorCode::ApiKeyMissing,
            Self::Upstream { kind, .. } => kind.code(),
        }
    }

    pub fn status(&self) -> u16 {
        self.code().status()
    }

    pub fn incident_id(&self) -> Option<&str> {
        match self {
            Self::Upstream { incident_id, .. } => Some(incident_id),
            _ => None,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::RateLimited { .. } => "You have reached your request limit.".to_string(),
            Self::KeyMissing { provider, env_var } => format!(
                "Missing API key for {provider}. Enter an API key in LLM settings or set {env_var} on the server."
            ),
            Self::Upstream { kind, .. } => match kind {
                UpstreamErrorKind::RateLimited => "The provider is currently unavailable due to request limit. Try using your own API key.".to_string(),
                UpstreamErrorKind::Overloaded => {
                    "The provider is currently unavailable. Please try again later.".to_string()
                }
                UpstreamErrorKind::AccessDenied => {
                    "Access denied. Please make sure your API key is valid.".to_string()
                }
                UpstreamErrorKind::Unexpected => {
                    "An unexpected error has occurred. Please try again later.".to_string()
                }
            },
        }
    }
}
