//! Discovery Client
//!
//! Service discovery client core: a locally cached, eventually-consistent view of
//! service instances kept fresh by long-polling a Consul-style registry, healthy
//! instance selection, and self registration with TTL heartbeats.

pub mod config;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod retry;

// Re-exports
pub use config::{ClientConfig, ConsulConfig, LogConfig, RegistrationConfig, SelectionConfig, WatchConfig};
pub use discovery::{
    ChangeIndex, ConsulBackend, DiscoveryClient, InMemoryRegistry, Instance, InstanceSelector,
    RegistrationBackend, RegistrationManager, RegistrationState, RegistryTransport,
    SelectionPolicy, ServiceName, Snapshot, SnapshotStore, WatchHandle, WatchLoop, WatchPhase,
    WatchState, WatchStatus,
};
pub use error::{
    ConfigError, DiscoveryError, RegistrationError, Result, SelectionError, TransportError,
};
pub use retry::{ExponentialBackoffPolicy, RetryPolicy};
