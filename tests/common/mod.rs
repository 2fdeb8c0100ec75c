//! Mock upstream provider: a raw TCP listener that answers every request with
//! a canned HTTP response and counts connections.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use kiln::config::RateLimitSettings;
use kiln::dispatch::registry::{ApiFormat, ProviderEntry, ProviderKeyResolver, ProviderRegistry};
use kiln::dispatch::{LlmModel, LlmModelConfig};
use kiln::gateway::{GenerationGateway, GenerationRequest};
use kiln::messages::Message;
use kiln::ratelimit::RateLimiter;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const MOCK_KEY_ENV: &str = "MOCK_API_KEY";

pub struct MockUpstream {
    pub base_url: String,
    pub hits: Arc<AtomicUsize>,
    /// Raw text of every request received.
    pub requests: Arc<Mutex<Vec<String>>>,
}

impl MockUpstream {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

/// Read one full request (headers plus Content-Length body) so closing the
/// socket afterwards never resets the connection under the client.
pub async fn read_request(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = socket.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = find(&buf, b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
            let len = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + len {
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Serve `response` to every connection.
pub async fn mock_upstream(response: Vec<u8>) -> MockUpstream {
    mock_upstream_with_delay(response, Duration::ZERO).await
}

/// Serve `response`, holding the connection open for `linger` afterwards.
pub async fn mock_upstream_with_delay(response: Vec<u8>, linger: Duration) -> MockUpstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let log = requests.clone();
    let response = Arc::new(response);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let response = response.clone();
            let log = log.clone();
            tokio::spawn(async move {
                let request = read_request(&mut socket).await;
                log.lock().unwrap().push(request);
                let _ = socket.write_all(&response).await;
                let _ = socket.flush().await;
                if !linger.is_zero() {
                    tokio::time::sleep(linger).await;
                }
            });
        }
    });

    MockUpstream {
        base_url: format!("http://127.0.0.1:{port}/v1"),
        hits,
        requests,
    }
}

pub fn status_response(status: u16, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {status} Mock\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

pub const SSE_HEADERS: &str =
    "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n";

/// OpenAI-style SSE chunk carrying `content` as the delta.
pub fn openai_chunk(content: &str) -> String {
    let data = json!({"choices": [{"delta": {"content": content}}]});
    format!("data: {data}\n\n")
}

pub fn sse_body(events: &[String]) -> Vec<u8> {
    let mut out = SSE_HEADERS.to_string();
    for e in events {
        out.push_str(e);
    }
    out.into_bytes()
}

pub fn mock_model(provider_id: &str) -> LlmModel {
    LlmModel {
        id: "mock-model".to_string(),
        name: "Mock".to_string(),
        provider: "Mock AI".to_string(),
        provider_id: provider_id.to_string(),
        multi_modal: false,
    }
}

pub fn request(provider_id: &str) -> GenerationRequest {
    GenerationRequest {
        messages: vec![Message::user_text("build a todo app")],
        user_id: Some("user-1".to_string()),
        team_id: None,
        template: Default::default(),
        model: mock_model(provider_id),
        config: LlmModelConfig::default(),
    }
}

pub fn provider(id: &str, base_url: &str, api_format: ApiFormat) -> ProviderEntry {
    ProviderEntry {
        provider_id: id.to_string(),
        base_url: base_url.to_string(),
        api_format,
        credential_env: Some(MOCK_KEY_ENV.to_string()),
    }
}

/// Gateway routing provider id `mock` (and `mock-anthropic`) to `base_url`.
pub fn gateway(base_url: &str, server_key: Option<&str>, limits: RateLimitSettings) -> GenerationGateway {
    gateway_with_override(base_url, server_key, limits, false)
}

pub fn gateway_with_override(
    base_url: &str,
    server_key: Option<&str>,
    limits: RateLimitSettings,
    allow_base_url_override: bool,
) -> GenerationGateway {
    let providers = vec![
        provider("mock", base_url, ApiFormat::OpenAi),
        provider("mock-anthropic", base_url, ApiFormat::Anthropic),
    ];
    let server_keys: HashMap<String, String> = server_key
        .map(|k| HashMap::from([(MOCK_KEY_ENV.to_string(), k.to_string())]))
        .unwrap_or_default();
    let keys = ProviderKeyResolver::from_providers(&providers, server_keys);
    GenerationGateway::new(
        RateLimiter::in_memory(),
        ProviderRegistry::new(providers, allow_base_url_override),
        keys,
        limits,
    )
}

pub fn generous() -> RateLimitSettings {
    RateLimitSettings {
        max_requests: 1000,
        window: Duration::from_secs(600),
    }
}
