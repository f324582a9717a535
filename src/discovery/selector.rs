//! 实例选择（负载均衡）
//!
//! 只读取缓存中的最新快照，不会触发拉取，因此结果与后端最终一致。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::discovery::instance::{Instance, ServiceName};
use crate::discovery::store::SnapshotStore;
use crate::error::SelectionError;

/// 选择策略
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// 轮询
    #[default]
    RoundRobin,
    /// 随机
    Random,
    /// 固定取第一个健康实例，不提供任何分布保证
    First,
}

impl std::str::FromStr for SelectionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "round_robin" | "roundrobin" => Ok(SelectionPolicy::RoundRobin),
            "random" => Ok(SelectionPolicy::Random),
            "first" | "none" => Ok(SelectionPolicy::First),
            _ => Err(format!("Unknown selection policy: {}", s)),
        }
    }
}

/// 实例选择器
pub struct InstanceSelector {
    store: Arc<SnapshotStore>,
    // 每个服务一个轮询计数器，成员变化时不重置，只取模
    counters: RwLock<HashMap<ServiceName, Arc<AtomicUsize>>>,
}

impl InstanceSelector {
    pub fn new(store: Arc<SnapshotStore>) -> Self {
        Self {
            store,
            counters: RwLock::new(HashMap::new()),
        }
    }

    /// 从缓存快照中选出一个健康实例
    pub fn select(&self, service: &str, policy: SelectionPolicy) -> Result<Instance, SelectionError> {
        let snapshot = self
            .store
            .get(service)
            .filter(|snap| !snap.is_empty())
            .ok_or_else(|| SelectionError::UnknownService(service.to_string()))?;

        let healthy: Vec<&Instance> = snapshot.healthy_instances().collect();
        if healthy.is_empty() {
            return Err(SelectionError::NoHealthyInstance(service.to_string()));
        }

        let index = match policy {
            SelectionPolicy::RoundRobin => {
                self.counter(&snapshot.service_name).fetch_add(1, Ordering::Relaxed) % healthy.len()
            }
            SelectionPolicy::Random => rand::thread_rng().gen_range(0..healthy.len()),
            SelectionPolicy::First => 0,
        };

        Ok(healthy[index].clone())
    }

    /// 当前缓存的全部健康实例
    pub fn healthy_instances(&self, service: &str) -> Result<Vec<Instance>, SelectionError> {
        let snapshot = self
            .store
            .get(service)
            .filter(|snap| !snap.is_empty())
            .ok_or_else(|| SelectionError::UnknownService(service.to_string()))?;
        Ok(snapshot.healthy_instances().cloned().collect())
    }

    /// 丢弃服务的轮询计数器，停止监听时调用
    pub fn forget(&self, service: &str) -> bool {
        self.counters.write().remove(service).is_some()
    }

    fn counter(&self, service: &ServiceName) -> Arc<AtomicUsize> {
        if let Some(counter) = self.counters.read().get(service) {
            return counter.clone();
        }
        self.counters
            .write()
            .entry(service.clone())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone()
    }
}
