//! 服务实例定义

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DiscoveryError;

/// 服务名
///
/// 非空、大小写敏感，作为快照缓存的键
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceName(String);

impl ServiceName {
    /// 创建服务名，空字符串返回错误
    pub fn new(name: impl Into<String>) -> Result<Self, DiscoveryError> {
        let name = name.into();
        if name.is_empty() {
            return Err(DiscoveryError::InvalidServiceName(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ServiceName {
    type Error = DiscoveryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for ServiceName {
    type Error = DiscoveryError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ServiceName> for String {
    fn from(name: ServiceName) -> Self {
        name.0
    }
}

impl Borrow<str> for ServiceName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ServiceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 服务实例
///
/// 构造后不可变：快照更新时整体替换，不做原地修改
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Instance {
    /// 所属服务
    pub service_name: ServiceName,

    /// 实例 ID（服务内唯一）
    pub instance_id: String,

    /// 主机地址
    pub host: String,

    /// 端口
    pub port: u16,

    /// 是否健康
    pub healthy: bool,

    /// 元数据
    pub metadata: BTreeMap<String, String>,

    /// 标签
    pub tags: Vec<String>,

    /// 最近一次心跳（后端观测到的时间）
    pub last_heartbeat: DateTime<Utc>,
}

impl Instance {
    /// 创建新的服务实例（默认健康）
    pub fn new(
        service_name: ServiceName,
        instance_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            service_name,
            instance_id: instance_id.into(),
            host: host.into(),
            port,
            healthy: true,
            metadata: BTreeMap::new(),
            tags: Vec::new(),
            last_heartbeat: Utc::now(),
        }
    }

    /// 为当前进程生成实例 ID：`<service>-<uuid>`
    pub fn generate_id(service_name: &ServiceName) -> String {
        format!("{}-{}", service_name, uuid::Uuid::new_v4().simple())
    }

    /// 添加元数据
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// 添加标签
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// 设置健康状态
    pub fn with_health(mut self, healthy: bool) -> Self {
        self.healthy = healthy;
        self
    }

    /// 设置心跳时间
    pub fn with_last_heartbeat(mut self, at: DateTime<Utc>) -> Self {
        self.last_heartbeat = at;
        self
    }

    /// `host:port`
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// 转换为 HTTP URL
    pub fn url(&self) -> String {
        format!("http://{}", self.authority())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_name_rejects_empty() {
        assert!(ServiceName::new("").is_err());
        assert!(ServiceName::try_from("orders").is_ok());
    }

    #[test]
    fn test_service_name_is_case_sensitive() {
        let a = ServiceName::new("Orders").unwrap();
        let b = ServiceName::new("orders").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_instance_url() {
        let name = ServiceName::new("orders").unwrap();
        let v4 = Instance::new(name.clone(), "orders-1", "10.0.0.5", 8080);
        assert_eq!(v4.url(), "http://10.0.0.5:8080");

        let v6 = Instance::new(name, "orders-2", "::1", 9000);
        assert_eq!(v6.url(), "http://[::1]:9000");
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let name = ServiceName::new("orders").unwrap();
        let a = Instance::generate_id(&name);
        let b = Instance::generate_id(&name);
        assert!(a.starts_with("orders-"));
        assert_ne!(a, b);
    }
}
