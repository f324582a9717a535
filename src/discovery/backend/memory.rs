//! 内存注册中心（用于测试和本地开发）
//!
//! 行为上模拟 Consul：全局递增的索引、支持阻塞查询、TTL 心跳。
//! 还可以注入故障，驱动监听循环和自注册的退避路径。

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use http::StatusCode;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::discovery::backend::{RegistrationBackend, RegistryTransport};
use crate::discovery::instance::{Instance, ServiceName};
use crate::discovery::snapshot::{ChangeIndex, Snapshot};
use crate::error::TransportError;

/// 未注册过的服务返回的索引
const EMPTY_INDEX: u64 = 1;

#[derive(Default)]
struct ServiceRecord {
    modify_index: u64,
    instances: BTreeMap<String, Instance>,
}

struct RegistryState {
    index: u64,
    services: HashMap<ServiceName, ServiceRecord>,
}

/// 内存注册中心
pub struct InMemoryRegistry {
    state: Mutex<RegistryState>,
    changed: watch::Sender<u64>,
    fetch_failures: Mutex<VecDeque<TransportError>>,
    registration_failures: Mutex<VecDeque<TransportError>>,
    heartbeat_failures: Mutex<VecDeque<TransportError>>,
    fetches: AtomicUsize,
    registrations: AtomicUsize,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        let (changed, _) = watch::channel(EMPTY_INDEX);
        Self {
            state: Mutex::new(RegistryState {
                index: EMPTY_INDEX,
                services: HashMap::new(),
            }),
            changed,
            fetch_failures: Mutex::new(VecDeque::new()),
            registration_failures: Mutex::new(VecDeque::new()),
            heartbeat_failures: Mutex::new(VecDeque::new()),
            fetches: AtomicUsize::new(0),
            registrations: AtomicUsize::new(0),
        }
    }

    /// 修改状态并推进全局索引
    fn mutate<F>(&self, service: &ServiceName, f: F)
    where
        F: FnOnce(&mut ServiceRecord),
    {
        let index = {
            let mut state = self.state.lock();
            state.index += 1;
            let index = state.index;
            let record = state.services.entry(service.clone()).or_default();
            f(record);
            record.modify_index = index;
            index
        };
        self.changed.send_replace(index);
    }

    fn find_service(&self, instance_id: &str) -> Option<ServiceName> {
        self.state
            .lock()
            .services
            .iter()
            .find(|(_, record)| record.instances.contains_key(instance_id))
            .map(|(name, _)| name.clone())
    }

    fn snapshot(&self, service: &ServiceName) -> Snapshot {
        let state = self.state.lock();
        match state.services.get(service) {
            Some(record) => Snapshot::new(
                service.clone(),
                record.instances.values().cloned().collect(),
                ChangeIndex(record.modify_index),
            ),
            None => Snapshot::new(service.clone(), Vec::new(), ChangeIndex(EMPTY_INDEX)),
        }
    }

    /// 直接写入实例（不经过注册流程，也不计入注册次数）
    pub fn upsert(&self, instance: Instance) {
        let service = instance.service_name.clone();
        self.mutate(&service, |record| {
            record.instances.insert(instance.instance_id.clone(), instance);
        });
    }

    /// 删除实例，返回是否存在
    pub fn remove(&self, instance_id: &str) -> bool {
        match self.find_service(instance_id) {
            Some(service) => {
                self.mutate(&service, |record| {
                    record.instances.remove(instance_id);
                });
                true
            }
            None => false,
        }
    }

    /// 修改实例健康状态
    pub fn set_health(&self, instance_id: &str, healthy: bool) -> bool {
        match self.find_service(instance_id) {
            Some(service) => {
                self.mutate(&service, |record| {
                    if let Some(inst) = record.instances.get_mut(instance_id) {
                        *inst = inst.clone().with_health(healthy);
                    }
                });
                true
            }
            None => false,
        }
    }

    /// 当前实例（跨服务查找）
    pub fn instance(&self, instance_id: &str) -> Option<Instance> {
        self.state
            .lock()
            .services
            .values()
            .find_map(|record| record.instances.get(instance_id).cloned())
    }

    /// 当前全局索引
    pub fn index(&self) -> u64 {
        self.state.lock().index
    }

    /// 接下来的 `fetch` 依次返回这些错误
    pub fn inject_fetch_failures(&self, errors: impl IntoIterator<Item = TransportError>) {
        self.fetch_failures.lock().extend(errors);
    }

    /// 接下来的 `register` 依次返回这些错误
    pub fn inject_registration_failures(&self, errors: impl IntoIterator<Item = TransportError>) {
        self.registration_failures.lock().extend(errors);
    }

    /// 接下来的 `heartbeat` 依次返回这些错误
    pub fn inject_heartbeat_failures(&self, errors: impl IntoIterator<Item = TransportError>) {
        self.heartbeat_failures.lock().extend(errors);
    }

    /// `fetch` 被调用的次数（包括失败）
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// `register` 被调用的次数（包括失败）
    pub fn registration_count(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryTransport for InMemoryRegistry {
    async fn fetch(
        &self,
        service: &ServiceName,
        last_index: Option<ChangeIndex>,
        wait: Duration,
    ) -> Result<Snapshot, TransportError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.fetch_failures.lock().pop_front() {
            return Err(err);
        }

        // 先订阅再读快照，避免漏掉两者之间的变更
        let mut rx = self.changed.subscribe();
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let snapshot = self.snapshot(service);
            match last_index {
                Some(last) if snapshot.change_index <= last => {}
                _ => return Ok(snapshot),
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => return Ok(self.snapshot(service)),
            }
        }
    }

    async fn list_services(&self) -> Result<Vec<ServiceName>, TransportError> {
        let state = self.state.lock();
        let mut names: Vec<ServiceName> = state
            .services
            .iter()
            .filter(|(_, record)| !record.instances.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }
}

#[async_trait]
impl RegistrationBackend for InMemoryRegistry {
    async fn register(&self, instance: &Instance) -> Result<(), TransportError> {
        self.registrations.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.registration_failures.lock().pop_front() {
            return Err(err);
        }
        self.upsert(instance.clone().with_last_heartbeat(Utc::now()));
        Ok(())
    }

    async fn deregister(&self, instance_id: &str) -> Result<(), TransportError> {
        self.remove(instance_id);
        Ok(())
    }

    async fn heartbeat(&self, instance_id: &str) -> Result<(), TransportError> {
        if let Some(err) = self.heartbeat_failures.lock().pop_front() {
            return Err(err);
        }
        let service = self.find_service(instance_id).ok_or_else(|| {
            TransportError::backend(
                StatusCode::NOT_FOUND,
                format!("unknown check service:{}", instance_id),
            )
        })?;

        let was_healthy = self.instance(instance_id).map(|i| i.healthy).unwrap_or(false);
        if was_healthy {
            // 心跳只刷新时间，不推进索引
            let mut state = self.state.lock();
            if let Some(inst) = state
                .services
                .get_mut(&service)
                .and_then(|record| record.instances.get_mut(instance_id))
            {
                *inst = inst.clone().with_last_heartbeat(Utc::now());
            }
        } else {
            self.mutate(&service, |record| {
                if let Some(inst) = record.instances.get_mut(instance_id) {
                    *inst = inst.clone().with_health(true).with_last_heartbeat(Utc::now());
                }
            });
        }
        Ok(())
    }
}
