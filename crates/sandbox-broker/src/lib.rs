//! Shared-sandbox connection broker.
//!
//! Many short-lived request handlers share one expensive, ephemeral worker
//! sandbox. They coordinate only through an expiring key-value store:
//!
//! - [`cache::TtlCache`] is the typed, namespaced view over a [`store::KvStore`].
//! - [`lock::DistributedLock`] serializes provisioning using conditional writes.
//! - [`broker::SandboxBroker`] resolves a live `(url, sandbox id, passphrase)`
//!   record, provisioning through a [`provision::ProvisioningBackend`] when
//!   the cached one is missing or fails its [`probe::LivenessProbe`].
//! - [`relay::SandboxRelay`] forwards work to the resolved worker with the
//!   credential header attached.

pub mod broker;
pub mod cache;
pub mod lock;
pub mod probe;
pub mod provision;
pub mod relay;
pub mod store;

pub use broker::{BrokerConfig, BrokerError, ConnectionRecord, SandboxBroker};
pub use cache::TtlCache;
pub use lock::{DistributedLock, LockError, LockOptions};
pub use probe::{HttpProbe, LivenessProbe, PlatformProbe, ProbeFailure};
pub use provision::{HttpSandboxBackend, LaunchSpec, ProvisionError, ProvisioningBackend, SandboxOptions};
pub use relay::{ConvertUpload, RelayBody, RelayError, RelayFailure, RelayRequest, RelayResponse, SandboxRelay};
pub use store::{KvStore, MemoryStore, RedisStore, StoreError};
