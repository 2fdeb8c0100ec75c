use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt, TryStreamExt};
use reqwest::Client;
use serde_json::Value;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use crate::error::KilnError;
use crate::fragment::Fragment;
use crate::gateway::GenerationRequest;
use crate::session::failure::ClientFailure;

/// Longest NDJSON line accepted from the gateway.
const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// One decoded line of the gateway's response stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Snapshot(Fragment),
    Failed(ClientFailure),
}

impl StreamFrame {
    /// `None` for blank lines and lines that are neither a snapshot nor an error.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, "skipping undecodable stream line");
                return None;
            }
        };
        if value.get("error").is_some() {
            return Some(Self::Failed(ClientFailure::from_raw(line)));
        }
        match serde_json::from_value(value) {
            Ok(fragment) => Some(Self::Snapshot(fragment)),
            Err(e) => {
                tracing::debug!(error = %e, "skipping non-fragment stream line");
                None
            }
        }
    }
}

type FrameStream = Pin<Box<dyn Stream<Item = Result<StreamFrame, KilnError>> + Send>>;

/// Cancellable, lazily consumed sequence of stream frames.
pub struct SnapshotStream {
    frames: FrameStream,
    cancel: CancellationToken,
}

/// Stops a [`SnapshotStream`] from another task.
#[derive(Debug, Clone)]
pub struct StopHandle(CancellationToken);

impl StopHandle {
    pub fn stop(&self) {
        self.0.cancel();
    }
}

impl SnapshotStream {
    pub fn new(frames: impl Stream<Item = Result<StreamFrame, KilnError>> + Send + 'static) -> Self {
        Self {
            frames: Box::pin(frames),
            cancel: CancellationToken::new(),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.cancel.clone())
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Next frame, or `None` once the stream ended or was cancelled.
    pub async fn next(&mut self) -> Option<Result<StreamFrame, KilnError>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            item = self.frames.next() => item,
        }
    }
}

/// Where a session opens generation streams.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn open(&self, req: &GenerationRequest) -> Result<SnapshotStream, KilnError>;
}

/// HTTP client for a gateway's `POST /api/chat`.
pub struct GenerationClient {
    client: Client,
    url: String,
}

impl GenerationClient {
    pub fn new(base_url: &str) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            url: format!("{}/api/chat", base_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl SnapshotSource for GenerationClient {
    async fn open(&self, req: &GenerationRequest) -> Result<SnapshotStream, KilnError> {
        let response = self.client.post(&self.url).json(req).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(KilnError::Upstream {
                provider: "gateway".to_string(),
                message: body,
                status: Some(status.as_u16()),
            });
        }

        let bytes = response.bytes_stream().map_err(std::io::Error::other);
        let lines = FramedRead::new(
            StreamReader::new(bytes),
            LinesCodec::new_with_max_length(MAX_LINE_BYTES),
        );
        let frames = lines.filter_map(|line| async move {
            match line {
                Ok(line) => StreamFrame::parse(&line).map(Ok),
                Err(e) => Some(Err(KilnError::Other(format!("reading generation stream: {e}")))),
            }
        });

        Ok(SnapshotStream::new(frames))
    }
}
