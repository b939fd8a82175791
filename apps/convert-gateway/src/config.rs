use std::time::Duration;

use sandbox_broker::broker::{BrokerConfig, REFRESH_LOCK};
use sandbox_broker::provision::{LaunchSpec, SandboxOptions, SERVER_APP_ENTRYPOINT};
use sandbox_broker::LockOptions;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMode {
    /// Authenticated GET against the worker itself.
    #[default]
    Endpoint,
    /// Ask the sandbox platform whether the id is running.
    Platform,
}

/// Process configuration, read from the environment once at startup.
///
/// Durations carry their unit in the field name.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub app_env: Option<String>,
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default)]
    pub app_origin: Option<String>,
    #[serde(default)]
    pub sandbox_api_url: Option<String>,
    #[serde(default)]
    pub sandbox_api_token: Option<String>,
    #[serde(default = "default_entrypoint")]
    pub sandbox_entrypoint: String,
    #[serde(default = "default_region")]
    pub sandbox_region: String,
    #[serde(default = "default_memory")]
    pub sandbox_memory: String,
    #[serde(default = "default_sandbox_timeout")]
    pub sandbox_timeout: String,
    #[serde(default = "default_record_ttl_secs")]
    pub record_ttl_secs: u64,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_lock_poll_ms")]
    pub lock_poll_ms: u64,
    #[serde(default = "default_lock_max_wait_secs")]
    pub lock_max_wait_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    #[serde(default)]
    pub probe_mode: ProbeMode,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::load(None)
    }

    /// Reads from `vars` instead of the process environment when given.
    pub fn load(vars: Option<config::Map<String, String>>) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true)
                    .source(vars),
            )
            .build()?
            .try_deserialize::<AppConfig>()
            .map(AppConfig::normalize)
    }

    fn normalize(mut self) -> Self {
        self.app_env = Self::normalize_opt(self.app_env.take());
        self.redis_url = Self::normalize_opt(self.redis_url.take());
        self.app_origin = Self::normalize_opt(self.app_origin.take());
        self.sandbox_api_url = Self::normalize_opt(self.sandbox_api_url.take());
        self.sandbox_api_token = Self::normalize_opt(self.sandbox_api_token.take());
        self
    }

    fn normalize_opt(value: Option<String>) -> Option<String> {
        value.and_then(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    /// Production uses the shared Redis store; everything else stays in
    /// process memory.
    pub fn is_prod(&self) -> bool {
        self.app_env.as_deref() == Some("prod")
    }

    pub fn redis_url(&self) -> &str {
        self.redis_url.as_deref().unwrap_or("redis://localhost:6379")
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            record_ttl: Duration::from_secs(self.record_ttl_secs),
            lock_name: REFRESH_LOCK.to_string(),
            lock: LockOptions {
                ttl: Duration::from_secs(self.lock_ttl_secs),
                poll_interval: Duration::from_millis(self.lock_poll_ms),
                max_wait: Duration::from_secs(self.lock_max_wait_secs),
            },
            launch: LaunchSpec {
                entrypoint: self.sandbox_entrypoint.clone(),
                options: SandboxOptions {
                    region: self.sandbox_region.clone(),
                    memory: self.sandbox_memory.clone(),
                    timeout: self.sandbox_timeout.clone(),
                    ..SandboxOptions::default()
                },
                env: Default::default(),
            },
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_entrypoint() -> String {
    SERVER_APP_ENTRYPOINT.to_string()
}

fn default_region() -> String {
    "ord".to_string()
}

fn default_memory() -> String {
    "1GB".to_string()
}

fn default_sandbox_timeout() -> String {
    "10m".to_string()
}

fn default_record_ttl_secs() -> u64 {
    600
}

fn default_lock_ttl_secs() -> u64 {
    120
}

fn default_lock_poll_ms() -> u64 {
    500
}

fn default_lock_max_wait_secs() -> u64 {
    90
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_max_upload_bytes() -> usize {
    20 * 1024 * 1024
}
