use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::store::{KvStore, StoreError, Version};

pub const CACHE_NAMESPACE: &str = "kvCache";
pub const LOCK_NAMESPACE: &str = "kvLock";

/// A value read together with the version it was read at.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub value: Option<T>,
    pub version: Version,
}

/// JSON-typed, namespaced view over a [`KvStore`].
#[derive(Clone)]
pub struct TtlCache {
    store: Arc<dyn KvStore>,
    namespace: String,
}

impl TtlCache {
    pub fn new(store: Arc<dyn KvStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn key(&self, id: &str) -> String {
        format!("{}:{}", self.namespace, id)
    }

    pub async fn set<T: Serialize>(&self, id: &str, value: &T, ttl: Duration) -> Result<(), StoreError> {
        let key = self.key(id);
        let encoded = encode(&key, value)?;
        self.store.set(&key, &encoded, ttl).await
    }

    pub async fn get<T: DeserializeOwned>(&self, id: &str) -> Result<Option<T>, StoreError> {
        Ok(self.read(id).await?.value)
    }

    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.store.delete(&self.key(id)).await
    }

    pub async fn read<T: DeserializeOwned>(&self, id: &str) -> Result<Versioned<T>, StoreError> {
        let key = self.key(id);
        match self.store.get(&key).await? {
            Some(entry) => Ok(Versioned {
                value: Some(decode(&key, &entry.value)?),
                version: entry.version,
            }),
            None => Ok(Versioned {
                value: None,
                version: Version::absent(),
            }),
        }
    }

    pub async fn cas_set<T: Serialize>(
        &self,
        id: &str,
        expected: &Version,
        value: &T,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let key = self.key(id);
        let encoded = encode(&key, value)?;
        self.store.cas_set(&key, expected, &encoded, ttl).await
    }

    pub async fn cas_delete(&self, id: &str, expected: &Version) -> Result<bool, StoreError> {
        self.store.cas_delete(&self.key(id), expected).await
    }

    /// Returns the cached value or computes and caches it.
    ///
    /// A `None` from `compute` is returned as-is and not cached, so a failed
    /// lookup is retried on the next call instead of being remembered.
    pub async fn fetch_or_compute<T, E, F, Fut>(
        &self,
        id: &str,
        ttl: Duration,
        compute: F,
    ) -> Result<Option<T>, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<StoreError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        if let Some(hit) = self.get::<T>(id).await? {
            return Ok(Some(hit));
        }
        let Some(computed) = compute().await? else {
            return Ok(None);
        };
        self.set(id, &computed, ttl).await?;
        Ok(Some(computed))
    }
}

fn encode<T: Serialize>(key: &str, value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|source| StoreError::Codec {
        key: key.to_string(),
        source,
    })
}

fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|source| StoreError::Codec {
        key: key.to_string(),
        source,
    })
}
