use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;

use crate::broker::ConnectionRecord;
use crate::provision::ProvisioningBackend;
use crate::relay::CREDENTIAL_HEADER;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a cached connection was judged unusable. Never shown to clients; it
/// only decides whether to provision again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeFailure {
    #[error("probe timed out")]
    Timeout,
    #[error("worker answered with status {0}")]
    Status(u16),
    #[error("worker unreachable: {0}")]
    Transport(String),
    #[error("sandbox is not running")]
    NotRunning,
    #[error("platform status check failed: {0}")]
    Platform(String),
}

#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn check(&self, record: &ConnectionRecord) -> Result<(), ProbeFailure>;
}

/// Sends an authenticated `GET /` to the worker itself.
#[derive(Clone)]
pub struct HttpProbe {
    http: Client,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self::with_client(Client::new(), timeout)
    }

    pub fn with_client(http: Client, timeout: Duration) -> Self {
        Self { http, timeout }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

#[async_trait]
impl LivenessProbe for HttpProbe {
    async fn check(&self, record: &ConnectionRecord) -> Result<(), ProbeFailure> {
        let url = format!("{}/", record.public_url.trim_end_matches('/'));
        let res = self
            .http
            .get(url)
            .header(CREDENTIAL_HEADER, &record.pass_phrase)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    ProbeFailure::Timeout
                } else {
                    ProbeFailure::Transport(err.to_string())
                }
            })?;

        if res.status().is_success() {
            Ok(())
        } else {
            Err(ProbeFailure::Status(res.status().as_u16()))
        }
    }
}

/// Asks the provisioning platform whether the sandbox id is still running.
///
/// A running sandbox does not guarantee the worker inside still accepts
/// requests, so prefer [`HttpProbe`].
#[derive(Clone)]
pub struct PlatformProbe {
    backend: Arc<dyn ProvisioningBackend>,
}

impl PlatformProbe {
    pub fn new(backend: Arc<dyn ProvisioningBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl LivenessProbe for PlatformProbe {
    async fn check(&self, record: &ConnectionRecord) -> Result<(), ProbeFailure> {
        match self.backend.is_running(&record.sandbox_id).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(ProbeFailure::NotRunning),
            Err(err) => Err(ProbeFailure::Platform(err.to_string())),
        }
    }
}
