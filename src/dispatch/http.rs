use std::time::Duration;

use eventsource_stream::{EventStreamError, Eventsource};
use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::time::Instant;

use crate::dispatch::registry::{ApiFormat, Credential, Endpoint};
use crate::dispatch::{ProviderRequest, TextDeltaStream};
use crate::error::KilnError;
use crate::messages::{ContentPart, Message, Role};

/// Cap on how much of an error body is kept for logs and classification.
const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;

/// Time allowed for the provider to answer with status and headers.
pub const HEADERS_TIMEOUT: Duration = Duration::from_secs(60);

/// Longest gap tolerated between two SSE events once streaming started.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Hard ceiling on one generation, start to finish.
pub const MAX_STREAM_DURATION: Duration = Duration::from_secs(300);

const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_DEFAULT_MAX_TOKENS: u32 = 8192;

pub struct HttpDispatch {
    client: Client,
}

impl Default for HttpDispatch {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicEvent {
    ContentBlockDelta { delta: AnthropicDelta },
    MessageStop,
    Error { error: AnthropicError },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicDelta {
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct AnthropicError {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

impl AnthropicError {
    fn status(&self) -> u16 {
        match self.kind.as_str() {
            "overloaded_error" => 529,
            "rate_limit_error" => 429,
            "authentication_error" => 401,
            "permission_error" => 403,
            _ => 500,
        }
    }
}

impl HttpDispatch {
    pub fn new() -> Self {
        // No retries: a failed attempt surfaces to the caller as-is.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .build()
            .expect("failed to build HTTP client");

        Self { client }
    }

    /// Start a structured-output generation and return the raw text deltas.
    ///
    /// Errors before the first byte (status, auth, connect) come back as
    /// `Err`; failures after that arrive as the stream's last item.
    pub async fn stream_object(
        &self,
        req: &ProviderRequest,
        endpoint: &Endpoint,
        credential: Option<&Credential>,
    ) -> Result<TextDeltaStream, KilnError> {
        let provider = endpoint.provider.clone();
        let started = Instant::now();

        let mut builder = self
            .client
            .post(&endpoint.url)
            .header("Content-Type", "application/json");

        let body = match endpoint.api_format {
            ApiFormat::OpenAi => {
                if let Some(cred) = credential {
                    builder = builder.header("Authorization", format!("Bearer {}", cred.expose()));
                }
                openai_body(req)
            }
            ApiFormat::Anthropic => {
                if let Some(cred) = credential {
                    builder = builder.header("x-api-key", cred.expose());
                }
                builder = builder.header("anthropic-version", ANTHROPIC_VERSION);
                anthropic_body(req)
            }
        };

        let response = tokio::time::timeout(HEADERS_TIMEOUT, builder.json(&body).send())
            .await
            .map_err(|_| KilnError::Upstream {
                provider: provider.clone(),
                message: format!("no response headers within {}s", HEADERS_TIMEOUT.as_secs()),
                status: None,
            })??;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(KilnError::RateLimited { provider });
        }

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(KilnError::AuthFailed {
                provider,
                message: format!("{status}"),
                status: status.as_u16(),
            });
        }

        // Cap error body reads to keep a hostile upstream from filling memory.
        if !status.is_success() {
            let error_bytes = response.bytes().await.unwrap_or_default();
            let truncated = &error_bytes[..error_bytes.len().min(MAX_ERROR_BODY_BYTES)];
            let text = String::from_utf8_lossy(truncated);
            return Err(KilnError::Upstream {
                provider,
                message: format!("{status}: {text}"),
                status: Some(status.as_u16()),
            });
        }

        let format = endpoint.api_format;
        let deadline = started + MAX_STREAM_DURATION;
        let mut events = response.bytes_stream().eventsource();

        let stream = async_stream::try_stream! {
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let wait = remaining.min(STALL_TIMEOUT);
                let next = match tokio::time::timeout(wait, events.next()).await {
                    Ok(next) => next,
                    Err(_) => Err(KilnError::Upstream {
                        provider: provider.clone(),
                        message: if remaining <= STALL_TIMEOUT {
                            format!("generation exceeded {}s", MAX_STREAM_DURATION.as_secs())
                        } else {
                            format!("stream stalled for {}s", STALL_TIMEOUT.as_secs())
                        },
                        status: None,
                    })?,
                };

                let Some(event) = next else { break };
                let event = event.map_err(|e| stream_error(&provider, e))?;
                if event.data.is_empty() {
                    continue;
                }
                if event.data == "[DONE]" {
                    break;
                }

                match format {
                    ApiFormat::OpenAi => {
                        let chunk: ChatChunk = serde_json::from_str(&event.data).map_err(|e| {
                            KilnError::SchemaParse(format!("failed to parse stream chunk: {e}"))
                        })?;
                        if let Some(error) = chunk.error {
                            Err(inline_error(&provider, &error))?;
                        }
                        if let Some(text) = chunk
                            .choices
                            .into_iter()
                            .next()
                            .and_then(|c| c.delta.content)
                            .filter(|t| !t.is_empty())
                        {
                            yield text;
                        }
                    }
                    ApiFormat::Anthropic => {
                        let parsed: AnthropicEvent = serde_json::from_str(&event.data).map_err(|e| {
                            KilnError::SchemaParse(format!("failed to parse stream event: {e}"))
                        })?;
                        match parsed {
                            AnthropicEvent::ContentBlockDelta { delta: AnthropicDelta::TextDelta { text } } => {
                                if !text.is_empty() {
                                    yield text;
                                }
                            }
                            AnthropicEvent::MessageStop => break,
                            AnthropicEvent::Error { error } => {
                                Err(KilnError::Upstream {
                                    provider: provider.clone(),
                                    status: Some(error.status()),
                                    message: format!("{}: {}", error.kind, error.message),
                                })?;
                            }
                            _ => {}
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

fn stream_error(provider: &str, err: EventStreamError<reqwest::Error>) -> KilnError {
    match err {
        EventStreamError::Transport(e) => KilnError::Request(e),
        EventStreamError::Utf8(_) => KilnError::Upstream {
            provider: provider.to_string(),
            message: "invalid UTF-8 in event stream".to_string(),
            status: None,
        },
        EventStreamError::Parser(e) => KilnError::Upstream {
            provider: provider.to_string(),
            message: format!("invalid event stream data: {e}"),
            status: None,
        },
    }
}

/// OpenAI-compatible servers report some failures as a JSON `error` object
/// inside an otherwise successful stream.
fn inline_error(provider: &str, error: &Value) -> KilnError {
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string());
    let status = error
        .get("code")
        .and_then(|c| c.as_u64().or_else(|| c.as_str().and_then(|s| s.parse().ok())))
        .and_then(|c| u16::try_from(c).ok());
    KilnError::Upstream {
        provider: provider.to_string(),
        message,
        status,
    }
}

fn openai_content(msg: &Message) -> Value {
    let only_text = msg
        .content
        .iter()
        .all(|p| !matches!(p, ContentPart::Image { .. }));
    if only_text {
        return Value::String(msg.text());
    }
    Value::Array(
        msg.content
            .iter()
            .map(|p| match p {
                ContentPart::Text { text } | ContentPart::Code { text } => {
                    json!({"type": "text", "text": text})
                }
                ContentPart::Image { image } => {
                    json!({"type": "image_url", "image_url": {"url": image}})
                }
            })
            .collect(),
    )
}

fn openai_body(req: &ProviderRequest) -> Value {
    let mut messages = vec![json!({"role": "system", "content": req.system_prompt})];
    messages.extend(req.messages.iter().map(|m| {
        json!({"role": m.role.as_str(), "content": openai_content(m)})
    }));

    let mut body = json!({
        "model": req.model,
        "messages": messages,
        "stream": true,
        "response_format": {
            "type": "json_schema",
            "json_schema": {"name": "fragment", "schema": req.schema},
        },
    });

    let p = &req.params;
    if let Some(obj) = body.as_object_mut() {
        insert_opt(obj, "temperature", p.temperature);
        insert_opt(obj, "top_p", p.top_p);
        insert_opt(obj, "frequency_penalty", p.frequency_penalty);
        insert_opt(obj, "presence_penalty", p.presence_penalty);
        insert_opt(obj, "max_tokens", p.max_tokens);
    }
    body
}

/// `data:image/png;base64,AAAA` -> (`image/png`, `AAAA`)
fn split_data_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let media_type = meta.strip_suffix(";base64")?;
    Some((media_type, data))
}

fn anthropic_content(msg: &Message) -> Value {
    Value::Array(
        msg.content
            .iter()
            .map(|p| match p {
                ContentPart::Text { text } | ContentPart::Code { text } => {
                    json!({"type": "text", "text": text})
                }
                ContentPart::Image { image } => match split_data_url(image) {
                    Some((media_type, data)) => json!({
                        "type": "image",
                        "source": {"type": "base64", "media_type": media_type, "data": data},
                    }),
                    None => json!({"type": "image", "source": {"type": "url", "url": image}}),
                },
            })
            .collect(),
    )
}

fn anthropic_body(req: &ProviderRequest) -> Value {
    // System turns go into the top-level system field.
    let messages: Vec<Value> = req
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| json!({"role": m.role.as_str(), "content": anthropic_content(m)}))
        .collect();

    let system = format!(
        "{}\n\nRespond with a single JSON object, and nothing else, that matches this JSON schema:\n{}",
        req.system_prompt, req.schema
    );

    let p = &req.params;
    let mut body = json!({
        "model": req.model,
        "system": system,
        "messages": messages,
        "stream": true,
        "max_tokens": p.max_tokens.unwrap_or(ANTHROPIC_DEFAULT_MAX_TOKENS),
    });
    if let Some(obj) = body.as_object_mut() {
        insert_opt(obj, "temperature", p.temperature);
        insert_opt(obj, "top_p", p.top_p);
        insert_opt(obj, "top_k", p.top_k);
    }
    body
}

fn insert_opt<T: Into<Value>>(obj: &mut serde_json::Map<String, Value>, key: &str, v: Option<T>) {
    if let Some(v) = v {
        obj.insert(key.to_string(), v.into());
    }
}
