use super::RetryPolicy;
use crate::error::TransportError;
use rand::Rng;
use std::time::Duration;

/// 指数退避重试策略
///
/// 延迟上限为 `min(max_delay, base_delay * 2^attempt)`，
/// 实际延迟在 `[ceiling * (1 - jitter), ceiling]` 内随机取值。
#[derive(Debug, Clone)]
pub struct ExponentialBackoffPolicy {
    max_attempts: Option<usize>,
    base_delay: Duration,
    max_delay: Duration,
    jitter: f64,
}

impl ExponentialBackoffPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: None,
            base_delay,
            max_delay,
            jitter: 0.0,
        }
    }

    /// 设置最大尝试次数
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// 设置抖动比例，取值 `[0, 1]`
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// 不含抖动的延迟上限，随 `attempt` 单调不减
    pub fn ceiling(&self, attempt: usize) -> Duration {
        let shift = attempt.min(20) as u32;
        let delay_ms = (self.base_delay.as_millis() as u64).saturating_mul(1u64 << shift);
        Duration::from_millis(delay_ms).min(self.max_delay)
    }
}

impl RetryPolicy for ExponentialBackoffPolicy {
    fn should_retry(&self, attempt: usize, error: &TransportError) -> bool {
        if let Some(max) = self.max_attempts {
            if attempt >= max {
                return false;
            }
        }
        error.is_retryable()
    }

    fn backoff_duration(&self, attempt: usize) -> Duration {
        let ceiling = self.ceiling(attempt);
        if self.jitter <= 0.0 || ceiling.is_zero() {
            return ceiling;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=1.0);
        ceiling.mul_f64(factor)
    }

    fn max_attempts(&self) -> Option<usize> {
        self.max_attempts
    }
}
