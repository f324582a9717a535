//! 重试策略模块

pub mod exponential;

pub use exponential::ExponentialBackoffPolicy;

use std::time::Duration;

use crate::error::TransportError;

/// 重试策略 trait
pub trait RetryPolicy: Send + Sync {
    /// 第 `attempt` 次失败后是否继续重试（`attempt` 从 1 开始）
    fn should_retry(&self, attempt: usize, error: &TransportError) -> bool;

    /// 第 `attempt` 次失败后的等待时长
    fn backoff_duration(&self, attempt: usize) -> Duration;

    /// 最大尝试次数，`None` 表示不限
    fn max_attempts(&self) -> Option<usize>;
}
