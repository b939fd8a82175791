use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{ttl_millis, Entry, KvStore, StoreError, Version};

#[derive(Debug)]
struct Slot {
    value: String,
    version: u64,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    slots: HashMap<String, Slot>,
    next_version: u64,
}

impl Inner {
    /// Drops the slot for `key` if it has expired and returns what remains.
    fn live(&mut self, key: &str, now: Instant) -> Option<&Slot> {
        if self.slots.get(key).is_some_and(|slot| slot.deadline <= now) {
            self.slots.remove(key);
        }
        self.slots.get(key)
    }

    fn current_version(&mut self, key: &str, now: Instant) -> Version {
        match self.live(key, now) {
            Some(slot) => Version::from_token(slot.version.to_string()),
            None => Version::absent(),
        }
    }

    fn write(&mut self, key: &str, value: &str, ttl: Duration, now: Instant) {
        self.next_version += 1;
        let slot = Slot {
            value: value.to_string(),
            version: self.next_version,
            deadline: now + Duration::from_millis(ttl_millis(ttl)),
        };
        self.slots.insert(key.to_string(), slot);
    }
}

/// Process-local store for development and tests.
///
/// Clones share the same map, so handing a clone to every broker in a test
/// models many handlers talking to one external store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Entry>, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.live(key, Instant::now()).map(|slot| Entry {
            value: slot.value.clone(),
            version: Version::from_token(slot.version.to_string()),
        }))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.write(key, value, ttl, Instant::now());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.lock().await.slots.remove(key);
        Ok(())
    }

    async fn cas_set(
        &self,
        key: &str,
        expected: &Version,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        if inner.current_version(key, now) != *expected {
            return Ok(false);
        }
        inner.write(key, value, ttl, now);
        Ok(true)
    }

    async fn cas_delete(&self, key: &str, expected: &Version) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.current_version(key, Instant::now()) != *expected {
            return Ok(false);
        }
        inner.slots.remove(key);
        Ok(true)
    }
}
