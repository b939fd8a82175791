//! Mutual exclusion across processes that share nothing but a [`KvStore`].
//!
//! A lock is a record `{owner, expires_at_ms}` written with a conditional
//! write. Holders that crash never release, so every record carries a
//! deadline after which any caller may take it over. Release re-checks the
//! owner token and only deletes the record it observed, so a holder that
//! overran its TTL cannot remove a lock someone else now holds.
//!
//! [`KvStore`]: crate::store::KvStore

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{TtlCache, LOCK_NAMESPACE};
use crate::store::{KvStore, StoreError};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for lock '{name}'")]
    Timeout { name: String, waited: Duration },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// How long a holder may keep the lock before others may reclaim it.
    pub ttl: Duration,
    pub poll_interval: Duration,
    pub max_wait: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(120),
            poll_interval: Duration::from_millis(500),
            max_wait: Duration::from_secs(90),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub owner: String,
    pub expires_at_ms: i64,
}

impl LockRecord {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms <= now_ms
    }
}

/// Proof of a successful acquisition, needed to release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub name: String,
    pub owner: String,
    pub expires_at_ms: i64,
}

#[derive(Clone)]
pub struct DistributedLock {
    records: TtlCache,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            records: TtlCache::new(store, LOCK_NAMESPACE),
        }
    }

    /// Makes one attempt to take `name`. Returns `None` if it is held and
    /// unexpired, or if another caller won the conditional write.
    pub async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockLease>, LockError> {
        let current = self.records.read::<LockRecord>(name).await?;
        let now_ms = now_millis();
        if let Some(record) = &current.value {
            if !record.is_expired(now_ms) {
                return Ok(None);
            }
            debug!(lock = %name, previous_owner = %record.owner, "reclaiming expired lock");
        }

        let record = LockRecord {
            owner: Uuid::new_v4().to_string(),
            expires_at_ms: now_ms.saturating_add(duration_millis(ttl)),
        };
        if !self.records.cas_set(name, &current.version, &record, ttl).await? {
            return Ok(None);
        }

        Ok(Some(LockLease {
            name: name.to_string(),
            owner: record.owner,
            expires_at_ms: record.expires_at_ms,
        }))
    }

    /// Deletes the lock only if `lease` still owns it. Returns `false` when
    /// the record is gone or belongs to someone else; that is not an error.
    pub async fn release(&self, lease: &LockLease) -> Result<bool, LockError> {
        let current = self.records.read::<LockRecord>(&lease.name).await?;
        match current.value {
            Some(record) if record.owner == lease.owner => {
                Ok(self.records.cas_delete(&lease.name, &current.version).await?)
            }
            _ => Ok(false),
        }
    }

    /// Polls for `name` until it is acquired or `options.max_wait` passes,
    /// runs `body`, then releases. The body's outcome is returned even if the
    /// release fails.
    pub async fn with_lock<T, E, F, Fut>(
        &self,
        name: &str,
        options: &LockOptions,
        body: F,
    ) -> Result<T, E>
    where
        E: From<LockError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let lease = self.acquire(name, options).await?;
        let outcome = body().await;

        match self.release(&lease).await {
            Ok(true) => debug!(lock = %name, "lock released"),
            Ok(false) => warn!(
                lock = %name,
                "lock was reclaimed by another owner before release"
            ),
            Err(err) => warn!(lock = %name, error = %err, "failed to release lock"),
        }

        outcome
    }

    async fn acquire(&self, name: &str, options: &LockOptions) -> Result<LockLease, LockError> {
        let started = Instant::now();
        loop {
            if let Some(lease) = self.try_acquire(name, options.ttl).await? {
                debug!(lock = %name, owner = %lease.owner, "lock acquired");
                return Ok(lease);
            }
            let waited = started.elapsed();
            if waited >= options.max_wait {
                return Err(LockError::Timeout {
                    name: name.to_string(),
                    waited,
                });
            }
            let remaining = options.max_wait - waited;
            tokio::time::sleep(options.poll_interval.min(remaining)).await;
        }
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
