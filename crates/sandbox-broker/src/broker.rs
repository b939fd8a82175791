//! Resolves a usable worker connection, provisioning one when needed.
//!
//! Fast path: read the cached record and probe it, no lock. Slow path: take
//! the `refresh` lock, re-read and re-probe (another caller may have just
//! provisioned), and only then create a new sandbox. The record is written
//! before the lock is released, so whoever takes the lock next sees it.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{TtlCache, CACHE_NAMESPACE};
use crate::lock::{DistributedLock, LockError, LockOptions};
use crate::probe::LivenessProbe;
use crate::provision::{LaunchSpec, ProvisionError, ProvisioningBackend};
use crate::store::{KvStore, StoreError};

pub const PUBLIC_URL_KEY: &str = "server_app_public_url";
pub const SANDBOX_ID_KEY: &str = "server_app_sandbox_id";
pub const PASS_PHRASE_KEY: &str = "server_app_pass_phrase";

/// Env var through which a new worker receives its passphrase.
pub const PASSPHRASE_ENV: &str = "CALLER_PASSPHRASE";

pub const DEFAULT_RECORD_TTL: Duration = Duration::from_secs(600);
pub const REFRESH_LOCK: &str = "refresh";

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("failed to provision sandbox: {0}")]
    Provisioning(#[from] ProvisionError),
    #[error("connection cache unavailable: {0}")]
    Store(#[from] StoreError),
    #[error("refresh task did not complete: {0}")]
    Refresh(#[from] tokio::task::JoinError),
}

impl BrokerError {
    /// Whether the caller should report "try again later" rather than a
    /// hard failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Lock(LockError::Timeout { .. }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub public_url: String,
    pub sandbox_id: String,
    pub pass_phrase: String,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Lifetime of each of the three cached fields.
    pub record_ttl: Duration,
    pub lock_name: String,
    /// The lock TTL must exceed the slowest expected provisioning call.
    pub lock: LockOptions,
    pub launch: LaunchSpec,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            record_ttl: DEFAULT_RECORD_TTL,
            lock_name: REFRESH_LOCK.to_string(),
            lock: LockOptions::default(),
            launch: LaunchSpec::default(),
        }
    }
}

#[derive(Clone)]
pub struct SandboxBroker {
    cache: TtlCache,
    lock: DistributedLock,
    backend: Arc<dyn ProvisioningBackend>,
    probe: Arc<dyn LivenessProbe>,
    config: BrokerConfig,
}

impl SandboxBroker {
    pub fn new(
        store: Arc<dyn KvStore>,
        backend: Arc<dyn ProvisioningBackend>,
        probe: Arc<dyn LivenessProbe>,
        config: BrokerConfig,
    ) -> Self {
        Self {
            cache: TtlCache::new(store.clone(), CACHE_NAMESPACE),
            lock: DistributedLock::new(store),
            backend,
            probe,
            config,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub async fn ensure_ready(&self) -> Result<ConnectionRecord, BrokerError> {
        if let Some(record) = self.usable_cached().await? {
            debug!(sandbox_id = %record.sandbox_id, "reusing cached sandbox");
            return Ok(record);
        }

        // Runs detached so a dropped caller cannot abandon the lock or a
        // half-finished provision.
        let broker = self.clone();
        tokio::spawn(async move { broker.refresh().await }).await?
    }

    async fn refresh(&self) -> Result<ConnectionRecord, BrokerError> {
        self.lock
            .with_lock(&self.config.lock_name, &self.config.lock, || async {
                if let Some(record) = self.usable_cached().await? {
                    debug!(
                        sandbox_id = %record.sandbox_id,
                        "sandbox refreshed by another caller"
                    );
                    return Ok(record);
                }
                self.provision().await
            })
            .await
    }

    /// The cached record if all three fields are present, without probing.
    pub async fn cached(&self) -> Result<Option<ConnectionRecord>, BrokerError> {
        let public_url = self.cached_field(PUBLIC_URL_KEY).await?;
        let sandbox_id = self.cached_field(SANDBOX_ID_KEY).await?;
        let pass_phrase = self.cached_field(PASS_PHRASE_KEY).await?;

        Ok(match (public_url, sandbox_id, pass_phrase) {
            (Some(public_url), Some(sandbox_id), Some(pass_phrase)) => Some(ConnectionRecord {
                public_url,
                sandbox_id,
                pass_phrase,
            }),
            _ => None,
        })
    }

    /// Forgets the cached record so the next call provisions again.
    pub async fn invalidate(&self) -> Result<(), BrokerError> {
        for key in [PUBLIC_URL_KEY, SANDBOX_ID_KEY, PASS_PHRASE_KEY] {
            self.cache.delete(key).await?;
        }
        Ok(())
    }

    async fn cached_field(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let value = self.cache.get::<String>(key).await?;
        Ok(value.filter(|v| !v.is_empty()))
    }

    async fn usable_cached(&self) -> Result<Option<ConnectionRecord>, BrokerError> {
        let Some(record) = self.cached().await? else {
            return Ok(None);
        };
        match self.probe.check(&record).await {
            Ok(()) => Ok(Some(record)),
            Err(failure) => {
                warn!(
                    sandbox_id = %record.sandbox_id,
                    public_url = %record.public_url,
                    reason = %failure,
                    "cached sandbox failed liveness probe"
                );
                Ok(None)
            }
        }
    }

    async fn provision(&self) -> Result<ConnectionRecord, BrokerError> {
        let pass_phrase = Uuid::new_v4().to_string();
        let mut spec = self.config.launch.clone();
        spec.env.insert(PASSPHRASE_ENV.to_string(), pass_phrase.clone());

        info!(entrypoint = %spec.entrypoint, "provisioning new sandbox");
        let sandbox = self.backend.create(&spec).await?;

        let ttl = self.config.record_ttl;
        self.cache.set(PUBLIC_URL_KEY, &sandbox.public_url, ttl).await?;
        self.cache.set(SANDBOX_ID_KEY, &sandbox.sandbox_id, ttl).await?;
        self.cache.set(PASS_PHRASE_KEY, &pass_phrase, ttl).await?;
        info!(
            sandbox_id = %sandbox.sandbox_id,
            public_url = %sandbox.public_url,
            "sandbox ready"
        );

        Ok(ConnectionRecord {
            public_url: sandbox.public_url,
            sandbox_id: sandbox.sandbox_id,
            pass_phrase,
        })
    }
}
