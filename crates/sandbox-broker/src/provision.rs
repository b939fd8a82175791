//! Interface to whatever creates sandbox processes, plus an HTTP client for
//! a sandbox control plane.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub const SERVER_APP_ENTRYPOINT: &str = "/data/server_app/server.ts";
pub const SERVER_APP_VOLUME: &str = "server-app-storage-volume";
pub const IMAGEMAGICK_VOLUME: &str = "imagemagick-storage-volume";

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("sandbox api request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status from sandbox api: {status} body={body}")]
    UnexpectedStatus { status: StatusCode, body: String },
    #[error("invalid sandbox api url: {0}")]
    InvalidUrl(String),
    #[error("sandbox backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxOptions {
    pub region: String,
    pub memory: String,
    /// Platform-side lifetime, e.g. `10m`.
    pub timeout: String,
    /// Port inside the sandbox that gets a public URL.
    pub port: u16,
    /// Mount path -> volume slug.
    pub volumes: BTreeMap<String, String>,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        let volumes = BTreeMap::from([
            ("/data/server_app".to_string(), SERVER_APP_VOLUME.to_string()),
            ("/data/imagemagick".to_string(), IMAGEMAGICK_VOLUME.to_string()),
        ]);
        Self {
            region: "ord".to_string(),
            memory: "1GB".to_string(),
            timeout: "10m".to_string(),
            port: 3000,
            volumes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub entrypoint: String,
    pub options: SandboxOptions,
    /// Secrets and settings exported to the worker at launch.
    pub env: BTreeMap<String, String>,
}

impl Default for LaunchSpec {
    fn default() -> Self {
        Self {
            entrypoint: SERVER_APP_ENTRYPOINT.to_string(),
            options: SandboxOptions::default(),
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedSandbox {
    pub public_url: String,
    pub sandbox_id: String,
}

#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    /// Starts a worker and returns once it has a public endpoint. May take
    /// several seconds; callers do not put a timeout on it.
    async fn create(&self, spec: &LaunchSpec) -> Result<ProvisionedSandbox, ProvisionError>;

    /// Platform-level view of whether `sandbox_id` is still running.
    async fn is_running(&self, sandbox_id: &str) -> Result<bool, ProvisionError>;
}

#[derive(Debug, Serialize)]
struct CreateSandboxBody<'a> {
    entrypoint: &'a str,
    region: &'a str,
    memory: &'a str,
    timeout: &'a str,
    expose_port: u16,
    volumes: &'a BTreeMap<String, String>,
    env: &'a BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct SandboxStatusBody {
    #[serde(default)]
    id: Option<String>,
    status: String,
}

/// Client for a REST sandbox control plane.
#[derive(Clone)]
pub struct HttpSandboxBackend {
    http: Client,
    base_url: String,
    token: String,
}

impl HttpSandboxBackend {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url, token)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    /// `{base}/v1/sandboxes/{id}` with the id escaped as one path segment.
    fn sandbox_url(&self, sandbox_id: &str) -> Result<Url, ProvisionError> {
        let mut url = Url::parse(&format!("{}/v1/sandboxes", self.base_url))
            .map_err(|err| ProvisionError::InvalidUrl(err.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| ProvisionError::InvalidUrl(self.base_url.clone()))?
            .push(sandbox_id);
        Ok(url)
    }
}

#[async_trait]
impl ProvisioningBackend for HttpSandboxBackend {
    async fn create(&self, spec: &LaunchSpec) -> Result<ProvisionedSandbox, ProvisionError> {
        let url = format!("{}/v1/sandboxes", self.base_url);
        let body = CreateSandboxBody {
            entrypoint: &spec.entrypoint,
            region: &spec.options.region,
            memory: &spec.options.memory,
            timeout: &spec.options.timeout,
            expose_port: spec.options.port,
            volumes: &spec.options.volumes,
            env: &spec.env,
        };
        info!(entrypoint = %spec.entrypoint, region = %spec.options.region, "creating sandbox");

        let res = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(ProvisionError::UnexpectedStatus { status, body });
        }
        Ok(res.json::<ProvisionedSandbox>().await?)
    }

    async fn is_running(&self, sandbox_id: &str) -> Result<bool, ProvisionError> {
        let url = self.sandbox_url(sandbox_id)?;
        let res = self.http.get(url).bearer_auth(&self.token).send().await?;

        if res.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(ProvisionError::UnexpectedStatus { status, body });
        }
        let body = res.json::<SandboxStatusBody>().await?;
        let same_sandbox = body.id.as_deref().map_or(true, |id| id == sandbox_id);
        Ok(same_sandbox && body.status == "running")
    }
}
