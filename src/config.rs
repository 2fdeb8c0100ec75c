use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::dispatch::registry::{ApiFormat, ProviderEntry, default_providers};
use crate::error::KilnError;

pub const DEFAULT_BIND: &str = "127.0.0.1:3000";
pub const DEFAULT_MAX_REQUESTS: u64 = 60;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(10 * 60);
const DEFAULT_CONFIG_FILE: &str = "kiln.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSettings {
    pub max_requests: u64,
    pub window: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_MAX_REQUESTS,
            window: DEFAULT_WINDOW,
        }
    }
}

pub struct Config {
    pub bind: String,
    pub rate_limit: RateLimitSettings,
    pub providers: Vec<ProviderEntry>,
    /// credential name -> value, read from the environment.
    pub server_keys: HashMap<String, String>,
    pub allow_base_url_override: bool,
    /// Take the rate-limit identity from `X-Forwarded-For`.
    pub trust_forwarded_for: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<&str> = self.server_keys.keys().map(String::as_str).collect();
        keys.sort_unstable();
        f.debug_struct("Config")
            .field("bind", &self.bind)
            .field("rate_limit", &self.rate_limit)
            .field("providers", &self.providers)
            .field("server_keys", &keys)
            .field("allow_base_url_override", &self.allow_base_url_override)
            .field("trust_forwarded_for", &self.trust_forwarded_for)
            .finish()
    }
}

/// Optional `kiln.toml` contents. Every field may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub bind: Option<String>,
    pub allow_base_url_override: Option<bool>,
    pub trust_forwarded_for: Option<bool>,
    #[serde(default)]
    pub rate_limit: FileRateLimit,
    /// provider id -> overrides or a new provider.
    #[serde(default)]
    pub providers: HashMap<String, FileProvider>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileRateLimit {
    pub max_requests: Option<u64>,
    pub window: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileProvider {
    pub base_url: Option<String>,
    pub api_format: Option<ApiFormat>,
    /// Credential variable name. An empty string marks the provider keyless.
    pub credential_env: Option<String>,
}

impl FileConfig {
    pub fn parse(text: &str) -> Result<Self, KilnError> {
        toml::from_str(text).map_err(|e| KilnError::Config(e.to_string()))
    }

    fn read(path: &Path) -> Result<Self, KilnError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| KilnError::Config(format!("{}: {e}", path.display())))?;
        Self::parse(&text)
    }
}

impl Config {
    /// Defaults, then the TOML file (`KILN_CONFIG` or `./kiln.toml`), then
    /// environment variables.
    pub fn load() -> Self {
        let explicit = env::var("KILN_CONFIG").ok().map(PathBuf::from);
        let path = explicit
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let file = if path.exists() {
            match FileConfig::read(&path) {
                Ok(file) => {
                    tracing::info!(path = %path.display(), "loaded config file");
                    Some(file)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring unreadable config file");
                    None
                }
            }
        } else {
            if explicit.is_some() {
                tracing::warn!(path = %path.display(), "KILN_CONFIG points at a missing file");
            }
            None
        };

        Self::from_sources(file, |name| env::var(name).ok())
    }

    pub fn from_sources(file: Option<FileConfig>, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let file = file.unwrap_or_default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let mut providers = default_providers();
        for (id, over) in file.providers {
            let idx = match providers.iter().position(|p| p.provider_id == id) {
                Some(idx) => idx,
                None => {
                    let Some(base_url) = over.base_url.clone() else {
                        tracing::warn!(provider = %id, "new provider without base_url ignored");
                        continue;
                    };
                    providers.push(ProviderEntry {
                        provider_id: id.clone(),
                        base_url,
                        api_format: ApiFormat::default(),
                        credential_env: None,
                    });
                    providers.len() - 1
                }
            };
            let entry = &mut providers[idx];
            if let Some(url) = over.base_url {
                entry.base_url = url;
            }
            if let Some(format) = over.api_format {
                entry.api_format = format;
            }
            if let Some(cred) = over.credential_env {
                entry.credential_env = Some(cred).filter(|c| !c.is_empty());
            }
        }

        if let Some(url) = var("KILN_OLLAMA_BASE_URL") {
            for ollama in providers.iter_mut().filter(|p| p.provider_id == "ollama") {
                ollama.base_url = url.clone();
            }
        }

        let server_keys: HashMap<String, String> = providers
            .iter()
            .filter_map(|p| p.credential_env.as_ref())
            .filter_map(|name| var(name).map(|v| (name.clone(), v)))
            .collect();

        for name in providers
            .iter()
            .filter_map(|p| p.credential_env.as_ref())
            .filter(|name| !server_keys.contains_key(*name))
        {
            tracing::debug!("{name} not set; requests must bring their own key");
        }

        let mut rate_limit = RateLimitSettings::default();
        if let Some(max) = file.rate_limit.max_requests {
            rate_limit.max_requests = max;
        }
        if let Some(window) = file.rate_limit.window.as_deref() {
            apply_window(&mut rate_limit, window, "rate_limit.window");
        }
        if let Some(max) = var("RATE_LIMIT_MAX_REQUESTS") {
            match max.trim().parse() {
                Ok(max) => rate_limit.max_requests = max,
                Err(_) => tracing::warn!(value = %max, "invalid RATE_LIMIT_MAX_REQUESTS, keeping {}", rate_limit.max_requests),
            }
        }
        if let Some(window) = var("RATE_LIMIT_WINDOW") {
            apply_window(&mut rate_limit, &window, "RATE_LIMIT_WINDOW");
        }

        let mut allow_base_url_override = file.allow_base_url_override.unwrap_or(true);
        if let Some(flag) = var("KILN_ALLOW_BASE_URL_OVERRIDE") {
            match parse_bool(&flag) {
                Some(b) => allow_base_url_override = b,
                None => tracing::warn!(value = %flag, "invalid KILN_ALLOW_BASE_URL_OVERRIDE"),
            }
        }

        let mut trust_forwarded_for = file.trust_forwarded_for.unwrap_or(false);
        if let Some(flag) = var("KILN_TRUST_FORWARDED_FOR") {
            match parse_bool(&flag) {
                Some(b) => trust_forwarded_for = b,
                None => tracing::warn!(value = %flag, "invalid KILN_TRUST_FORWARDED_FOR"),
            }
        }

        Config {
            bind: var("KILN_BIND")
                .or(file.bind)
                .unwrap_or_else(|| DEFAULT_BIND.to_string()),
            rate_limit,
            providers,
            server_keys,
            allow_base_url_override,
            trust_forwarded_for,
        }
    }
}

fn apply_window(settings: &mut RateLimitSettings, raw: &str, source: &str) {
    match parse_window(raw) {
        Ok(window) => settings.window = window,
        Err(e) => tracing::warn!(source, error = %e, "keeping window of {:?}", settings.window),
    }
}

/// Parse a window such as `10m`, `30 s`, `500ms`, `1h` or `1d`. A bare
/// number is read as seconds.
pub fn parse_window(raw: &str) -> Result<Duration, KilnError> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let n: u64 = digits
        .parse()
        .map_err(|_| KilnError::Config(format!("invalid window: {raw:?}")))?;
    let unit_ms: u64 = match unit.trim() {
        "ms" => 1,
        "" | "s" => 1000,
        "m" => 60 * 1000,
        "h" => 60 * 60 * 1000,
        "d" => 24 * 60 * 60 * 1000,
        other => return Err(KilnError::Config(format!("unknown window unit {other:?}"))),
    };
    let ms = n
        .checked_mul(unit_ms)
        .ok_or_else(|| KilnError::Config(format!("window too large: {raw:?}")))?;
    if ms == 0 {
        return Err(KilnError::Config("window must be positive".to_string()));
    }
    Ok(Duration::from_millis(ms))
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
