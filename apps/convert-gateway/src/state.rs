use std::sync::Arc;

use anyhow::{Context, Result};
use sandbox_broker::{
    HttpProbe, HttpSandboxBackend, KvStore, LivenessProbe, MemoryStore, PlatformProbe,
    ProvisioningBackend, RedisStore, SandboxBroker, SandboxRelay,
};
use tracing::{info, warn};

use crate::config::{AppConfig, ProbeMode};

#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<SandboxBroker>,
    pub relay: SandboxRelay,
}

impl AppState {
    pub fn new(broker: SandboxBroker, relay: SandboxRelay) -> Self {
        Self {
            broker: Arc::new(broker),
            relay,
        }
    }

    pub async fn from_config(cfg: &AppConfig) -> Result<Self> {
        let store: Arc<dyn KvStore> = if cfg.is_prod() {
            let store = RedisStore::connect(cfg.redis_url())
                .await
                .with_context(|| format!("failed to connect to redis at {}", cfg.redis_url()))?;
            info!("using redis connection cache");
            Arc::new(store)
        } else {
            info!("APP_ENV is not prod; using in-memory connection cache");
            Arc::new(MemoryStore::new())
        };

        let api_url = cfg
            .sandbox_api_url
            .clone()
            .context("SANDBOX_API_URL must be set")?;
        let token = cfg.sandbox_api_token.clone().unwrap_or_else(|| {
            warn!("SANDBOX_API_TOKEN not set; sandbox api calls are unauthenticated");
            String::new()
        });
        let backend: Arc<dyn ProvisioningBackend> = Arc::new(HttpSandboxBackend::new(api_url, token));

        let probe: Arc<dyn LivenessProbe> = match cfg.probe_mode {
            ProbeMode::Endpoint => Arc::new(HttpProbe::new(cfg.probe_timeout())),
            ProbeMode::Platform => {
                warn!("platform probe selected; a running sandbox may still refuse requests");
                Arc::new(PlatformProbe::new(backend.clone()))
            }
        };

        let broker = SandboxBroker::new(store, backend, probe, cfg.broker_config());
        Ok(Self::new(broker, SandboxRelay::default()))
    }
}
