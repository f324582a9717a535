//! 注册中心后端抽象和实现

pub mod consul;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;

use crate::discovery::instance::{Instance, ServiceName};
use crate::discovery::snapshot::{ChangeIndex, Snapshot};
use crate::error::TransportError;

pub use consul::ConsulBackend;
pub use memory::InMemoryRegistry;

/// 注册中心传输层
///
/// 由监听循环调用，使用动态分发，因此使用 async-trait
#[async_trait]
pub trait RegistryTransport: Send + Sync {
    /// 长轮询获取服务快照
    ///
    /// 携带 `last_index` 时后端可以挂起请求，直到数据变化或 `wait` 到期。
    /// 到期且无变化时返回索引不变的同一份快照，这不是错误。
    async fn fetch(
        &self,
        service: &ServiceName,
        last_index: Option<ChangeIndex>,
        wait: Duration,
    ) -> Result<Snapshot, TransportError>;

    /// 后端已知的全部服务名
    async fn list_services(&self) -> Result<Vec<ServiceName>, TransportError>;
}

/// 自注册后端
///
/// 不同后端心跳方式不同：
/// - **Consul**: 调用 TTL 更新 API (`/v1/agent/check/pass/service:<id>`)
/// - **内存**: 直接刷新实例心跳时间
#[async_trait]
pub trait RegistrationBackend: Send + Sync {
    /// 注册服务实例
    async fn register(&self, instance: &Instance) -> Result<(), TransportError>;

    /// 注销服务实例
    async fn deregister(&self, instance_id: &str) -> Result<(), TransportError>;

    /// 发送心跳
    async fn heartbeat(&self, instance_id: &str) -> Result<(), TransportError>;
}
