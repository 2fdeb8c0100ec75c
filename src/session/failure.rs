use serde::Deserialize;

use crate::error::{ErrorCode, KilnError};

const RATE_LIMIT_MESSAGE: &str = "You have reached your request limit.";
const FALLBACK_MESSAGE: &str = "An unexpected error has occurred. Please try again later.";

/// What the session shows after a generation failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientFailure {
    pub code: ErrorCode,
    pub message: String,
    pub incident_id: Option<String>,
    /// Drives the "use your own key" hint.
    pub rate_limited: bool,
}

#[derive(Deserialize)]
struct WireError {
    error: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    incident_id: Option<String>,
}

fn parse_wire(text: &str) -> Option<WireError> {
    let text = text.trim();
    if let Ok(w) = serde_json::from_str(text) {
        return Some(w);
    }
    // JSON embedded in a longer transport message.
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

/// Matches `rate limit`, `rate-limit`, `ratelimit` and the like.
fn mentions_rate_limit(lower: &str) -> bool {
    lower.match_indices("rate").any(|(idx, _)| {
        let rest = &lower[idx + "rate".len()..];
        if rest.starts_with("limit") {
            return true;
        }
        let mut chars = rest.chars();
        chars.next().is_some() && chars.as_str().starts_with("limit")
    })
}

impl ClientFailure {
    fn new(code: ErrorCode, message: String, incident_id: Option<String>) -> Self {
        let rate_limited = code.is_rate_limit() || message.to_lowercase().contains("limit");
        Self {
            code,
            message,
            incident_id,
            rate_limited,
        }
    }

    /// Interpret raw failure text: structured `{error, message}` JSON first,
    /// then a substring check for rate limiting.
    pub fn from_raw(raw: &str) -> Self {
        if let Some(wire) = parse_wire(raw) {
            let code = ErrorCode::parse(&wire.error).unwrap_or(ErrorCode::UnexpectedError);
            let message = wire
                .message
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| raw.trim().to_string());
            return Self::new(code, message, wire.incident_id);
        }

        let lower = raw.to_lowercase();
        if lower.contains("429") || lower.contains("too many") || mentions_rate_limit(&lower) {
            return Self::new(ErrorCode::RateLimited, RATE_LIMIT_MESSAGE.to_string(), None);
        }

        let message = match raw.trim() {
            "" => FALLBACK_MESSAGE.to_string(),
            text => text.to_string(),
        };
        Self::new(ErrorCode::UnexpectedError, message, None)
    }

    pub fn from_error(err: &KilnError) -> Self {
        let raw = match err {
            KilnError::Upstream { message, .. } => message.clone(),
            other => other.to_string(),
        };
        let failure = Self::from_raw(&raw);
        if failure.code == ErrorCode::UnexpectedError && err.status() == Some(429) {
            return Self::new(ErrorCode::RateLimited, RATE_LIMIT_MESSAGE.to_string(), None);
        }
        failure
    }
}
