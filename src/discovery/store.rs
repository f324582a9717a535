//! 快照缓存
//!
//! 每个服务的条目只由其监听任务写入，读者拿到的是 `Arc<Snapshot>`，
//! 替换在键粒度上是原子的，不会读到半成品。
//!
//! 写入权通过代号（generation）认领：新的监听任务认领后，旧任务的写入和清理都会被忽略。

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::discovery::instance::ServiceName;
use crate::discovery::snapshot::Snapshot;

/// 线程安全的服务快照缓存
pub struct SnapshotStore {
    inner: RwLock<StoreInner>,
    next_generation: AtomicU64,
    version: watch::Sender<u64>,
}

#[derive(Default)]
struct StoreInner {
    entries: HashMap<ServiceName, Arc<Snapshot>>,
    owners: HashMap<ServiceName, u64>,
}

impl StoreInner {
    /// 写入并返回是否产生了可观察的变化
    fn replace(&mut self, service: &ServiceName, snapshot: Arc<Snapshot>) -> bool {
        let changed = self
            .entries
            .get(service)
            .map(|current| !snapshot.is_unchanged_from(current))
            .unwrap_or(true);
        self.entries.insert(service.clone(), snapshot);
        changed
    }
}

impl SnapshotStore {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: RwLock::new(StoreInner::default()),
            next_generation: AtomicU64::new(1),
            version,
        }
    }

    /// 认领服务的写入权，返回新的代号
    pub fn claim(&self, service: &ServiceName) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        self.inner.write().owners.insert(service.clone(), generation);
        generation
    }

    /// 当前持有写入权的代号
    pub fn owner(&self, service: &str) -> Option<u64> {
        self.inner.read().owners.get(service).copied()
    }

    /// 以 `generation` 的身份写入快照
    ///
    /// 写入权已被其他代号认领时返回 `None`，不做任何修改。
    pub fn put_owned(&self, service: &ServiceName, generation: u64, snapshot: Snapshot) -> Option<bool> {
        debug_assert_eq!(service, &snapshot.service_name);

        let snapshot = Arc::new(snapshot);
        let changed = {
            let mut inner = self.inner.write();
            if inner.owners.get(service) != Some(&generation) {
                return None;
            }
            inner.replace(service, snapshot)
        };

        if changed {
            self.version.send_modify(|v| *v += 1);
        }
        Some(changed)
    }

    /// 放弃写入权并清除条目
    ///
    /// 只有 `generation` 仍是当前持有者时才生效，返回是否生效。
    pub fn release(&self, service: &str, generation: u64) -> bool {
        let removed = {
            let mut inner = self.inner.write();
            if inner.owners.get(service) != Some(&generation) {
                return false;
            }
            inner.owners.remove(service);
            inner.entries.remove(service).is_some()
        };
        if removed {
            self.version.send_modify(|v| *v += 1);
        }
        true
    }

    /// 写入快照
    ///
    /// 返回是否产生了可观察的变化。索引和成员都没变时只刷新条目，
    /// 不递增版本，也不通知订阅者。
    pub fn put(&self, service: &ServiceName, snapshot: Snapshot) -> bool {
        debug_assert_eq!(service, &snapshot.service_name);

        let changed = self.inner.write().replace(service, Arc::new(snapshot));

        if changed {
            self.version.send_modify(|v| *v += 1);
        }
        changed
    }

    /// 读取服务的当前快照
    pub fn get(&self, service: &str) -> Option<Arc<Snapshot>> {
        self.inner.read().entries.get(service).cloned()
    }

    /// 移除服务条目
    pub fn remove(&self, service: &str) -> Option<Arc<Snapshot>> {
        let removed = self.inner.write().entries.remove(service);
        if removed.is_some() {
            self.version.send_modify(|v| *v += 1);
        }
        removed
    }

    /// 当前缓存的服务名集合
    pub fn list_service_names(&self) -> BTreeSet<ServiceName> {
        self.inner.read().entries.keys().cloned().collect()
    }

    pub fn contains(&self, service: &str) -> bool {
        self.inner.read().entries.contains_key(service)
    }

    /// 全局版本号，每次可观察变化递增
    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    /// 订阅版本变化
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    /// 版本变化流
    pub fn changes(&self) -> WatchStream<u64> {
        WatchStream::from_changes(self.subscribe())
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}
