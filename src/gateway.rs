use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::{Stream, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::{Config, RateLimitSettings};
use crate::dispatch::http::HttpDispatch;
use crate::dispatch::registry::{ProviderKeyResolver, ProviderRegistry};
use crate::dispatch::{LlmModel, LlmModelConfig, ProviderRequest};
use crate::error::{GatewayError, KilnError, UpstreamErrorKind};
use crate::fragment::{self, Fragment};
use crate::messages::Message;
use crate::prompt;
use crate::ratelimit::RateLimiter;
use crate::response::ErrorBody;
use crate::templates::{self, Templates};

/// Body of `POST /api/chat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub messages: Vec<Message>,
    #[serde(rename = "userID", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(rename = "teamID", default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    /// Templates the model may choose from. Empty means the built-in set.
    #[serde(default)]
    pub template: Templates,
    pub model: LlmModel,
    #[serde(default)]
    pub config: LlmModelConfig,
}

/// Lifecycle of one generation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationPhase {
    Idle,
    RateLimitCheck,
    KeyResolution,
    Streaming,
    Completed,
    Rejected,
}

impl GenerationPhase {
    pub fn can_advance_to(self, next: Self) -> bool {
        use GenerationPhase::*;
        matches!(
            (self, next),
            (Idle, RateLimitCheck)
                | (Idle, KeyResolution)
                | (RateLimitCheck, KeyResolution)
                | (RateLimitCheck, Rejected)
                | (KeyResolution, Streaming)
                | (KeyResolution, Rejected)
                | (Streaming, Completed)
                | (Streaming, Rejected)
        )
    }

    fn advance(&mut self, next: Self) {
        debug_assert!(self.can_advance_to(next), "{self:?} -> {next:?}");
        tracing::debug!(from = ?self, to = ?next, "generation phase");
        *self = next;
    }
}

/// NDJSON lines, each terminated by `\n`: fragment snapshots, possibly
/// followed by a single error line.
pub type SnapshotLines = Pin<Box<dyn Stream<Item = String> + Send>>;

pub struct GenerationGateway {
    limiter: RateLimiter,
    registry: ProviderRegistry,
    keys: ProviderKeyResolver,
    http: HttpDispatch,
    limits: RateLimitSettings,
}

impl GenerationGateway {
    pub fn new(
        limiter: RateLimiter,
        registry: ProviderRegistry,
        keys: ProviderKeyResolver,
        limits: RateLimitSettings,
    ) -> Self {
        Self {
            limiter,
            registry,
            keys,
            http: HttpDispatch::new(),
            limits,
        }
    }

    /// In-memory rate limiting, providers and keys from `config`.
    pub fn from_config(config: &Config) -> Self {
        let keys = ProviderKeyResolver::from_providers(&config.providers, config.server_keys.clone());
        let registry = ProviderRegistry::new(config.providers.clone(), config.allow_base_url_override);
        Self::new(RateLimiter::in_memory(), registry, keys, config.rate_limit)
    }

    /// Run the gate checks, open the upstream stream and return the snapshot
    /// lines. Anything that fails before the first upstream byte is an `Err`;
    /// later failures become the last line of the stream.
    pub async fn generate(
        &self,
        identity: &str,
        req: GenerationRequest,
    ) -> Result<SnapshotLines, GatewayError> {
        let mut phase = GenerationPhase::Idle;
        let own_key = req.config.own_api_key();

        // Callers paying with their own key are not counted.
        if own_key.is_none() {
            phase.advance(GenerationPhase::RateLimitCheck);
            let decision = self
                .limiter
                .check(identity, self.limits.max_requests, self.limits.window)
                .await;
            if !decision.allowed {
                phase.advance(GenerationPhase::Rejected);
                tracing::info!(identity, limit = decision.limit, reset = decision.reset, "request limit reached");
                return Err(GatewayError::RateLimited {
                    identity: identity.to_string(),
                    decision,
                });
            }
        }

        phase.advance(GenerationPhase::KeyResolution);
        let credential = self.keys.resolve(&req.model, own_key).inspect_err(|e| {
            phase.advance(GenerationPhase::Rejected);
            tracing::info!(error = %e, "generation rejected");
        })?;

        let provider = req.model.provider_id.clone();
        let endpoint = match self.registry.endpoint(&req.model, &req.config) {
            Ok(ep) => ep,
            Err(e) => {
                phase.advance(GenerationPhase::Rejected);
                return Err(classify_failure(&provider, &e));
            }
        };

        let templates = if req.template.is_empty() {
            templates::builtin()
        } else {
            req.template
        };
        let model = req
            .config
            .model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| req.model.id.clone());

        tracing::info!(
            user_id = req.user_id.as_deref().unwrap_or(""),
            team_id = req.team_id.as_deref().unwrap_or(""),
            provider = %provider,
            model = %model,
            "generation started"
        );

        let provider_req = ProviderRequest {
            model,
            system_prompt: prompt::system_prompt(&templates),
            messages: req.messages.iter().filter_map(Message::for_provider).collect(),
            params: req.config.params(),
            schema: fragment::fragment_schema(),
        };

        phase.advance(GenerationPhase::Streaming);
        let mut deltas = match self
            .http
            .stream_object(&provider_req, &endpoint, credential.as_ref())
            .await
        {
            Ok(deltas) => deltas,
            Err(e) => {
                phase.advance(GenerationPhase::Rejected);
                return Err(classify_failure(&provider, &e));
            }
        };

        let lines = async_stream::stream! {
            let mut text = String::new();
            let mut last: Option<Fragment> = None;
            while let Some(item) = deltas.next().await {
                match item {
                    Ok(delta) => {
                        text.push_str(&delta);
                        let Some(snapshot) = fragment::snapshot_from_text(&text) else {
                            continue;
                        };
                        if last.as_ref() == Some(&snapshot) {
                            continue;
                        }
                        if let Ok(line) = serde_json::to_string(&snapshot) {
                            yield format!("{line}\n");
                        }
                        last = Some(snapshot);
                    }
                    Err(e) => {
                        phase.advance(GenerationPhase::Rejected);
                        let err = classify_failure(&provider, &e);
                        if let Ok(line) = serde_json::to_string(&ErrorBody::from(&err)) {
                            yield format!("{line}\n");
                        }
                        return;
                    }
                }
            }
            phase.advance(GenerationPhase::Completed);
            tracing::info!(provider = %provider, bytes = text.len(), "generation completed");
        };

        Ok(Box::pin(lines))
    }
}

/// Classify an upstream failure, stamp it with a fresh incident id and log it.
pub fn classify_failure(provider: &str, err: &KilnError) -> GatewayError {
    let kind = UpstreamErrorKind::of(err);
    let incident_id = new_incident_id();
    tracing::error!(
        incident_id = %incident_id,
        provider,
        kind = ?kind,
        status = ?err.status(),
        error = %err,
        "generation failed"
    );
    GatewayError::Upstream { kind, incident_id }
}

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// `inc_<unix millis>_<9 random base36 chars>`
pub fn new_incident_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("inc_{millis}_{suffix}")
}
