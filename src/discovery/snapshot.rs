//! 服务实例快照

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::discovery::instance::{Instance, ServiceName};

/// 变更索引
///
/// 对应 Consul 的 `X-Consul-Index`，成员变化时严格递增
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChangeIndex(pub u64);

impl ChangeIndex {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChangeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 某个服务在某一时刻的完整实例列表
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub service_name: ServiceName,
    pub instances: Vec<Instance>,
    pub change_index: ChangeIndex,
    pub fetched_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(service_name: ServiceName, instances: Vec<Instance>, change_index: ChangeIndex) -> Self {
        Self {
            service_name,
            instances,
            change_index,
            fetched_at: Utc::now(),
        }
    }

    /// 健康实例（保持原有顺序）
    pub fn healthy_instances(&self) -> impl Iterator<Item = &Instance> {
        self.instances.iter().filter(|inst| inst.healthy)
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// 成员是否一致
    ///
    /// 忽略心跳时间，只比较实例身份、地址、健康状态和元数据
    pub fn same_membership(&self, other: &Snapshot) -> bool {
        self.instances.len() == other.instances.len()
            && self
                .instances
                .iter()
                .zip(other.instances.iter())
                .all(|(a, b)| {
                    a.instance_id == b.instance_id
                        && a.host == b.host
                        && a.port == b.port
                        && a.healthy == b.healthy
                        && a.metadata == b.metadata
                        && a.tags == b.tags
                })
    }

    /// 与另一快照相比是否没有变化（索引相同且成员一致）
    pub fn is_unchanged_from(&self, other: &Snapshot) -> bool {
        self.change_index == other.change_index && self.same_membership(other)
    }
}
