use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Client;
use uuid::Uuid;

use super::{ttl_millis, Entry, KvStore, StoreError, Version};

// Each key is a hash of {ver, val}. The version check and the write happen in
// one script so no other client can interleave between them.
const CAS_SET_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'ver')
if current == false then current = '' end
if current ~= ARGV[1] then return 0 end
redis.call('DEL', KEYS[1])
redis.call('HSET', KEYS[1], 'ver', ARGV[2], 'val', ARGV[3])
redis.call('PEXPIRE', KEYS[1], ARGV[4])
return 1
"#;

const CAS_DELETE_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'ver')
if current == false then current = '' end
if current ~= ARGV[1] then return 0 end
redis.call('DEL', KEYS[1])
return 1
"#;

/// Shared store backed by Redis, used in production.
#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self { redis })
    }

    async fn eval(&self, script: &str, key: &str, args: &[&str]) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let mut cmd = redis::cmd("EVAL");
        cmd.arg(script).arg(1).arg(key);
        for arg in args {
            cmd.arg(*arg);
        }
        let applied: i64 = cmd.query_async(&mut conn).await?;
        Ok(applied == 1)
    }
}

fn fresh_version() -> String {
    Uuid::new_v4().to_string()
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Entry>, StoreError> {
        let mut conn = self.redis.clone();
        let (version, value): (Option<String>, Option<String>) = redis::cmd("HMGET")
            .arg(key)
            .arg("ver")
            .arg("val")
            .query_async(&mut conn)
            .await?;

        Ok(match (version, value) {
            (Some(version), Some(value)) => Some(Entry {
                value,
                version: Version::from_token(version),
            }),
            _ => None,
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(key)
            .ignore()
            .cmd("HSET")
            .arg(key)
            .arg("ver")
            .arg(fresh_version())
            .arg("val")
            .arg(value)
            .ignore()
            .cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn cas_set(
        &self,
        key: &str,
        expected: &Version,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let version = fresh_version();
        let ttl = ttl_millis(ttl).to_string();
        self.eval(
            CAS_SET_SCRIPT,
            key,
            &[expected.token().unwrap_or(""), &version, value, &ttl],
        )
        .await
    }

    async fn cas_delete(&self, key: &str, expected: &Version) -> Result<bool, StoreError> {
        self.eval(CAS_DELETE_SCRIPT, key, &[expected.token().unwrap_or("")])
            .await
    }
}
