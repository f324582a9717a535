//! 服务发现客户端门面
//!
//! 组合快照缓存、监听循环、实例选择和自注册。客户端是显式构造的对象，
//! 通过 `Arc` 在调用方之间共享，不存在全局单例。

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::discovery::backend::{ConsulBackend, InMemoryRegistry, RegistrationBackend, RegistryTransport};
use crate::discovery::instance::{Instance, ServiceName};
use crate::discovery::registration::{RegistrationManager, RegistrationState};
use crate::discovery::selector::{InstanceSelector, SelectionPolicy};
use crate::discovery::store::SnapshotStore;
use crate::discovery::watch::{WatchHandle, WatchLoop, WatchStatus};
use crate::error::{RegistrationError, Result};

/// 服务发现客户端
pub struct DiscoveryClient {
    config: ClientConfig,
    transport: Arc<dyn RegistryTransport>,
    store: Arc<SnapshotStore>,
    selector: InstanceSelector,
    registration: RegistrationManager,
    watches: Mutex<HashMap<ServiceName, WatchHandle>>,
    shutdown: CancellationToken,
}

impl DiscoveryClient {
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn RegistryTransport>,
        registrar: Arc<dyn RegistrationBackend>,
    ) -> Self {
        let store = Arc::new(SnapshotStore::new());
        let selector = InstanceSelector::new(store.clone());
        let registration = RegistrationManager::new(registrar, &config.registration, &config.watch);

        Self {
            config,
            transport,
            store,
            selector,
            registration,
            watches: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// 使用 Consul 后端创建客户端
    pub fn consul(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let backend = Arc::new(ConsulBackend::from_config(&config)?);
        info!(address = %config.consul.address, "Using Consul registry");
        Ok(Self::new(config, backend.clone(), backend))
    }

    /// 使用内存注册中心创建客户端
    pub fn in_memory(config: ClientConfig, registry: Arc<InMemoryRegistry>) -> Self {
        Self::new(config, registry.clone(), registry)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    /// 确保服务已被监听，返回是否新启动了监听任务
    pub fn watch(&self, service: &ServiceName) -> bool {
        let mut watches = self.watches.lock();
        if let Some(handle) = watches.get(service) {
            if !handle.is_finished() {
                return false;
            }
        }

        let handle = WatchLoop::new(
            service.clone(),
            self.transport.clone(),
            self.store.clone(),
            &self.config.watch,
        )
        .with_cancellation(self.shutdown.child_token())
        .spawn();
        watches.insert(service.clone(), handle);
        debug!(service = %service, "Watch scheduled");
        true
    }

    /// 停止监听并清除该服务的缓存
    ///
    /// 等待期间若已有新的监听任务接管该服务，缓存保留给新任务。
    pub async fn unwatch(&self, service: &str) -> bool {
        let Some(handle) = self.watches.lock().remove(service) else {
            return false;
        };
        let generation = handle.generation();
        handle.stop().await;

        if self.store.release(service, generation) {
            self.selector.forget(service);
        } else {
            debug!(service = %service, "Service re-watched while stopping, cache kept");
        }
        true
    }

    /// 正在监听的服务
    pub fn watched_services(&self) -> Vec<ServiceName> {
        let mut names: Vec<ServiceName> = self.watches.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// 监听任务状态
    pub fn watch_status(&self, service: &str) -> Option<WatchStatus> {
        self.watches.lock().get(service).map(|h| h.status())
    }

    /// 缓存中已有快照的服务
    pub fn list_services(&self) -> BTreeSet<ServiceName> {
        self.store.list_service_names()
    }

    /// 向注册中心查询全部已注册服务（不经过缓存）
    pub async fn catalog_services(&self) -> Result<Vec<ServiceName>> {
        Ok(self.transport.list_services().await?)
    }

    /// 获取服务的全部实例（含不健康实例）
    ///
    /// 首次调用会启动监听，并最多等待 `initial_fetch_timeout` 拿到第一个快照；
    /// 超时仍无快照时返回空列表。
    pub async fn get_instances(&self, service: &str) -> Result<Vec<Instance>> {
        let name = ServiceName::new(service)?;
        self.watch(&name);
        self.wait_for_snapshot(&name, self.config.initial_fetch_timeout())
            .await;

        Ok(self
            .store
            .get(service)
            .map(|snap| snap.instances.clone())
            .unwrap_or_default())
    }

    /// 使用配置的策略从缓存中选择实例，不触发拉取
    pub fn select(&self, service: &str) -> Result<Instance> {
        self.select_with(service, self.config.selection.policy)
    }

    /// 使用指定策略从缓存中选择实例
    pub fn select_with(&self, service: &str, policy: SelectionPolicy) -> Result<Instance> {
        Ok(self.selector.select(service, policy)?)
    }

    /// 确保服务被监听、等待首个快照后再选择实例
    pub async fn resolve(&self, service: &str) -> Result<Instance> {
        let name = ServiceName::new(service)?;
        self.watch(&name);
        self.wait_for_snapshot(&name, self.config.initial_fetch_timeout())
            .await;
        self.select(service)
    }

    /// 注册当前进程
    pub async fn register(&self, instance: Instance) -> Result<()> {
        Ok(self.registration.register(instance).await?)
    }

    /// 注销当前进程
    pub async fn deregister(&self) -> Result<()> {
        Ok(self.registration.deregister().await?)
    }

    pub fn registration_state(&self) -> RegistrationState {
        self.registration.state()
    }

    /// 订阅自注册状态，后台重新注册失败时会变为 `Failed`
    pub fn subscribe_registration(&self) -> watch::Receiver<RegistrationState> {
        self.registration.subscribe()
    }

    /// 停止全部监听并注销当前进程
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<WatchHandle> = self.watches.lock().drain().map(|(_, h)| h).collect();
        let count = handles.len();
        join_all(handles.into_iter().map(WatchHandle::stop)).await;

        match self.registration.deregister().await {
            Ok(()) | Err(RegistrationError::NotRegistered) => {}
            Err(e) => warn!(error = %e, "Failed to deregister during shutdown"),
        }
        info!(watches = count, "Discovery client shut down");
    }

    async fn wait_for_snapshot(&self, service: &ServiceName, timeout: Duration) -> bool {
        let mut rx = self.store.subscribe();
        let deadline = Instant::now() + timeout;
        loop {
            if self.store.contains(service.as_str()) {
                return true;
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => return self.store.contains(service.as_str()),
            }
        }
    }
}

impl Drop for DiscoveryClient {
    fn drop(&mut self) {
        // 未调用 shutdown 时也要让监听任务退出
        self.shutdown.cancel();
    }
}
