//! 服务发现核心模块
//!
//! 本地缓存一份最终一致的服务实例视图：每个服务一个长轮询监听任务，
//! 带健康过滤的实例选择，以及当前进程的自注册与心跳。

pub mod backend;
pub mod client;
pub mod instance;
pub mod registration;
pub mod selector;
pub mod snapshot;
pub mod store;
pub mod watch;

pub use backend::{ConsulBackend, InMemoryRegistry, RegistrationBackend, RegistryTransport};
pub use client::DiscoveryClient;
pub use instance::{Instance, ServiceName};
pub use registration::{RegistrationManager, RegistrationState};
pub use selector::{InstanceSelector, SelectionPolicy};
pub use snapshot::{ChangeIndex, Snapshot};
pub use store::SnapshotStore;
pub use watch::{WatchHandle, WatchLoop, WatchPhase, WatchState, WatchStatus};
