//! 客户端配置
//!
//! 启动时从 TOML 文件加载一次，环境变量可覆盖部分字段。

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::discovery::selector::SelectionPolicy;
use crate::error::ConfigError;
use crate::retry::ExponentialBackoffPolicy;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    pub consul: ConsulConfig,
    pub watch: WatchConfig,
    pub selection: SelectionConfig,
    pub registration: RegistrationConfig,
    pub log: LogConfig,
    /// 首次 `get_instances` 等待首个快照的最长时间（毫秒）
    pub initial_fetch_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            consul: ConsulConfig::default(),
            watch: WatchConfig::default(),
            selection: SelectionConfig::default(),
            registration: RegistrationConfig::default(),
            log: LogConfig::default(),
            initial_fetch_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConsulConfig {
    pub address: String,
    pub token: Option<String>,
    pub datacenter: Option<String>,
    /// 只查询通过健康检查的实例
    pub passing_only: bool,
    /// 非阻塞请求（注册、心跳、注销）的超时（秒）
    pub request_timeout_secs: u64,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:8500".to_string(),
            token: None,
            datacenter: None,
            passing_only: false,
            request_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WatchConfig {
    /// 长轮询等待时间（秒）
    pub wait_secs: u64,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// 抖动比例 `[0, 1]`
    pub jitter: f64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            wait_secs: 30,
            base_delay_ms: 200,
            max_delay_ms: 30_000,
            jitter: 0.2,
        }
    }
}

impl WatchConfig {
    /// 长轮询等待时长，Consul 的最小粒度为 1 秒
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs.max(1))
    }

    /// 监听循环使用的退避策略（不限次数）
    pub fn backoff_policy(&self) -> ExponentialBackoffPolicy {
        ExponentialBackoffPolicy::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
        .with_jitter(self.jitter)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SelectionConfig {
    pub policy: SelectionPolicy,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistrationConfig {
    /// 注册最大尝试次数
    pub max_attempts: usize,
    pub heartbeat_interval_secs: u64,
    /// TTL 检查时长，应为心跳间隔的 2-3 倍
    pub ttl_secs: u64,
    /// 连续心跳失败多少次后重新注册
    pub failure_threshold: u32,
    pub deregister_critical_after_secs: u64,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            heartbeat_interval_secs: 10,
            ttl_secs: 30,
            failure_threshold: 3,
            deregister_critical_after_secs: 90,
        }
    }
}

impl RegistrationConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// 注册重试策略：与监听循环相同的退避参数，加上次数预算
    pub fn retry_policy(&self, watch: &WatchConfig) -> ExponentialBackoffPolicy {
        watch.backoff_policy().with_max_attempts(self.max_attempts)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl ClientConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// 使用进程环境变量覆盖配置
    ///
    /// - `CONSUL_HTTP_ADDR`
    /// - `CONSUL_HTTP_TOKEN`
    /// - `CONSUL_TTL_SECONDS`
    /// - `SERVICE_HEARTBEAT_INTERVAL`
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("CONSUL_HTTP_ADDR") {
            self.consul.address = if addr.starts_with("http://") || addr.starts_with("https://") {
                addr
            } else {
                format!("http://{}", addr)
            };
        }
        if let Some(token) = lookup("CONSUL_HTTP_TOKEN") {
            self.consul.token = Some(token);
        }
        if let Some(ttl) = lookup("CONSUL_TTL_SECONDS").and_then(|v| v.parse::<u64>().ok()) {
            self.registration.ttl_secs = ttl;
            self.registration.deregister_critical_after_secs = ttl * 2;
        }
        if let Some(interval) =
            lookup("SERVICE_HEARTBEAT_INTERVAL").and_then(|v| v.parse::<u64>().ok())
        {
            self.registration.heartbeat_interval_secs = interval;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.consul.address.is_empty() {
            return Err(ConfigError::Invalid("consul.address must not be empty".into()));
        }
        if self.consul.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "consul.request_timeout_secs must be > 0".into(),
            ));
        }
        // 长轮询等待为 0 时监听循环会空转
        if self.watch.wait_secs == 0 {
            return Err(ConfigError::Invalid("watch.wait_secs must be > 0".into()));
        }
        if self.watch.base_delay_ms == 0 {
            return Err(ConfigError::Invalid("watch.base_delay_ms must be > 0".into()));
        }
        if self.watch.max_delay_ms < self.watch.base_delay_ms {
            return Err(ConfigError::Invalid(
                "watch.max_delay_ms must be >= watch.base_delay_ms".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.watch.jitter) {
            return Err(ConfigError::Invalid("watch.jitter must be within [0, 1]".into()));
        }
        if self.registration.max_attempts == 0 {
            return Err(ConfigError::Invalid("registration.max_attempts must be > 0".into()));
        }
        if self.registration.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "registration.heartbeat_interval_secs must be > 0".into(),
            ));
        }
        if self.registration.ttl_secs == 0 {
            return Err(ConfigError::Invalid("registration.ttl_secs must be > 0".into()));
        }
        if self.registration.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "registration.failure_threshold must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn initial_fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.initial_fetch_timeout_ms)
    }
}
