//! Expiring key-value storage with optimistic concurrency.
//!
//! Every write mints a fresh [`Version`]. Conditional writes compare the
//! caller's last observed version with the current one, where a missing or
//! expired key has the distinguished [`Version::absent`] token.

mod memory;
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("failed to encode or decode value for {key}: {source}")]
    Codec {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Opaque version token attached to a stored value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Version(Option<String>);

impl Version {
    pub fn absent() -> Self {
        Self(None)
    }

    pub(crate) fn from_token(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn is_absent(&self) -> bool {
        self.0.is_none()
    }

    pub(crate) fn token(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub value: String,
    pub version: Version,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Returns `None` both for keys never written and keys past their TTL.
    async fn get(&self, key: &str) -> Result<Option<Entry>, StoreError>;

    /// Unconditionally replaces the value and TTL of `key`.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Removes `key`; deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Writes only if the current version of `key` equals `expected`.
    async fn cas_set(
        &self,
        key: &str,
        expected: &Version,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Deletes only if the current version of `key` equals `expected`.
    async fn cas_delete(&self, key: &str, expected: &Version) -> Result<bool, StoreError>;
}

/// Backends have millisecond resolution and reject a zero expiry.
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}
