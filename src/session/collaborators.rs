//! Services the session calls but does not implement: sandbox creation and
//! build persistence.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::KilnError;
use crate::fragment::{Fragment, SandboxResult};
use crate::session::SessionIdentity;

#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn create(
        &self,
        fragment: &Fragment,
        identity: &SessionIdentity,
    ) -> Result<SandboxResult, KilnError>;
}

/// Sandbox service reached over HTTP.
pub struct HttpSandbox {
    client: Client,
    url: String,
}

impl HttpSandbox {
    pub fn new(url: impl Into<String>) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Sandbox for HttpSandbox {
    async fn create(
        &self,
        fragment: &Fragment,
        identity: &SessionIdentity,
    ) -> Result<SandboxResult, KilnError> {
        let body = json!({
            "fragment": fragment,
            "userID": identity.user_id,
            "teamID": identity.team_id,
            "accessToken": identity.access_token,
        });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| KilnError::Sandbox(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(KilnError::Sandbox(format!("{status}: {text}")));
        }
        response
            .json()
            .await
            .map_err(|e| KilnError::Sandbox(format!("invalid sandbox response: {e}")))
    }
}

/// One row of the `builds` table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildRecord {
    pub user_id: Option<String>,
    pub team_id: Option<String>,
    pub template: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub file_path: Option<String>,
    pub sbx_id: Option<String>,
    pub url: Option<String>,
}

impl BuildRecord {
    pub fn new(fragment: &Fragment, result: &SandboxResult, identity: &SessionIdentity) -> Self {
        Self {
            user_id: identity.user_id.clone(),
            team_id: identity.team_id.clone(),
            template: fragment.template.clone(),
            title: fragment.title.clone(),
            description: fragment.description.clone(),
            file_path: fragment.file_path.clone(),
            sbx_id: Some(result.sbx_id.clone()),
            url: result.public_url().map(str::to_string),
        }
    }
}

/// One row of the `build_files` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildFileRecord {
    pub build_id: String,
    pub file_path: String,
    pub content: String,
}

#[async_trait]
pub trait BuildStore: Send + Sync {
    /// Insert the build row and return its id.
    async fn insert_build(&self, build: &BuildRecord) -> Result<String, KilnError>;
    async fn insert_files(&self, files: &[BuildFileRecord]) -> Result<(), KilnError>;
}

/// Save a finished build and its files.
pub async fn persist_build(
    store: &dyn BuildStore,
    fragment: &Fragment,
    result: &SandboxResult,
    identity: &SessionIdentity,
) -> Result<String, KilnError> {
    let build_id = store
        .insert_build(&BuildRecord::new(fragment, result, identity))
        .await?;
    let files: Vec<BuildFileRecord> = fragment
        .files()
        .into_iter()
        .map(|f| BuildFileRecord {
            build_id: build_id.clone(),
            file_path: f.path,
            content: f.content,
        })
        .collect();
    if !files.is_empty() {
        store.insert_files(&files).await?;
    }
    Ok(build_id)
}

/// PostgREST-style store (`/rest/v1/builds`, `/rest/v1/build_files`).
pub struct RestBuildStore {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Deserialize)]
struct InsertedRow {
    id: Value,
}

impl RestBuildStore {
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    /// `SUPABASE_URL` and `SUPABASE_KEY`; `None` when either is missing,
    /// which turns persistence off.
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        match (var("SUPABASE_URL"), var("SUPABASE_KEY")) {
            (Some(url), Some(key)) => Some(Self::new(&url, key)),
            _ => {
                tracing::debug!("SUPABASE_URL or SUPABASE_KEY not set; builds are not persisted");
                None
            }
        }
    }

    async fn post(&self, table: &str, body: &impl Serialize) -> Result<reqwest::Response, KilnError> {
        let response = self
            .client
            .post(format!("{}/rest/v1/{table}", self.base_url))
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header("Prefer", "return=representation")
            .json(body)
            .send()
            .await
            .map_err(|e| KilnError::Persistence(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(KilnError::Persistence(format!("{table}: {status}: {text}")));
        }
        Ok(response)
    }
}

impl std::fmt::Debug for RestBuildStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestBuildStore")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl BuildStore for RestBuildStore {
    async fn insert_build(&self, build: &BuildRecord) -> Result<String, KilnError> {
        let rows: Vec<InsertedRow> = self
            .post("builds", build)
            .await?
            .json()
            .await
            .map_err(|e| KilnError::Persistence(format!("builds: {e}")))?;
        let id = rows
            .into_iter()
            .next()
            .ok_or_else(|| KilnError::Persistence("builds: no row returned".to_string()))?
            .id;
        Ok(match id {
            Value::String(s) => s,
            other => other.to_string(),
        })
    }

    async fn insert_files(&self, files: &[BuildFileRecord]) -> Result<(), KilnError> {
        self.post("build_files", &files).await.map(|_| ())
    }
}
