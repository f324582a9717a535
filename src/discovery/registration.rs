//! 自注册管理
//!
//! 启动时注册当前进程（带退避重试），后台定期发送心跳，关闭时注销。
//! - 注册重试预算耗尽是唯一的致命错误，会返回给调用方并以 error 级别记录
//! - 心跳失败只记录日志；连续失败达到阈值后认为实例已被后端摘除，从头重新注册
//! - 后端对心跳返回 404 时立即重新注册
//! - 注销会打断仍在退避重试中的注册

use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::{RegistrationConfig, WatchConfig};
use crate::discovery::backend::RegistrationBackend;
use crate::discovery::instance::Instance;
use crate::error::{RegistrationError, TransportError};
use crate::retry::{ExponentialBackoffPolicy, RetryPolicy};

/// 自注册状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered,
    /// 重试预算耗尽或被后端拒绝，实例不可被发现
    Failed,
    Deregistered,
}

struct ActiveRegistration {
    instance: Instance,
    cancel: CancellationToken,
    heartbeat: JoinHandle<()>,
}

/// 自注册管理器
pub struct RegistrationManager {
    backend: Arc<dyn RegistrationBackend>,
    retry: ExponentialBackoffPolicy,
    heartbeat_interval: Duration,
    failure_threshold: u32,
    state: Arc<watch::Sender<RegistrationState>>,
    // 最近一次注册的取消令牌，注册成功后也用于停止心跳
    pending: parking_lot::Mutex<CancellationToken>,
    active: Mutex<Option<ActiveRegistration>>,
}

impl RegistrationManager {
    pub fn new(
        backend: Arc<dyn RegistrationBackend>,
        config: &RegistrationConfig,
        watch_config: &WatchConfig,
    ) -> Self {
        let (state, _) = watch::channel(RegistrationState::Unregistered);
        Self {
            backend,
            retry: config.retry_policy(watch_config),
            heartbeat_interval: config.heartbeat_interval(),
            failure_threshold: config.failure_threshold,
            state: Arc::new(state),
            pending: parking_lot::Mutex::new(CancellationToken::new()),
            active: Mutex::new(None),
        }
    }

    /// 替换注册重试策略
    pub fn with_retry_policy(mut self, retry: ExponentialBackoffPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn state(&self) -> RegistrationState {
        *self.state.borrow()
    }

    /// 订阅状态变化，后台重新注册失败时由此感知
    pub fn subscribe(&self) -> watch::Receiver<RegistrationState> {
        self.state.subscribe()
    }

    /// 当前注册的实例
    pub async fn instance(&self) -> Option<Instance> {
        self.active.lock().await.as_ref().map(|a| a.instance.clone())
    }

    /// 注册实例并启动心跳任务
    ///
    /// 已有注册时先停止旧的心跳任务；实例 ID 变化时同时注销旧实例。
    pub async fn register(&self, instance: Instance) -> Result<(), RegistrationError> {
        let cancel = CancellationToken::new();
        let superseded = std::mem::replace(&mut *self.pending.lock(), cancel.clone());
        superseded.cancel();

        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            let previous_id = previous.instance.instance_id.clone();
            stop_heartbeat(previous).await;
            if previous_id != instance.instance_id {
                self.deregister_instance(&previous_id).await;
            }
        }

        self.state.send_replace(RegistrationState::Registering);
        if let Err(e) =
            register_with_retry(self.backend.as_ref(), &self.retry, &instance, &cancel).await
        {
            let state = match e {
                RegistrationError::Cancelled => RegistrationState::Deregistered,
                _ => RegistrationState::Failed,
            };
            self.state.send_replace(state);
            return Err(e);
        }
        self.state.send_replace(RegistrationState::Registered);

        let heartbeat = HeartbeatTask {
            backend: self.backend.clone(),
            retry: self.retry.clone(),
            instance: instance.clone(),
            interval: self.heartbeat_interval,
            failure_threshold: self.failure_threshold,
            cancel: cancel.clone(),
            state: self.state.clone(),
        };
        let span = info_span!("heartbeat", instance_id = %instance.instance_id);
        let heartbeat = tokio::spawn(heartbeat.run().instrument(span));

        *active = Some(ActiveRegistration {
            instance,
            cancel,
            heartbeat,
        });
        Ok(())
    }

    /// 停止心跳并注销（尽力而为）
    ///
    /// 后端注销失败只记录日志，实例最终会因 TTL 过期被后端摘除。
    pub async fn deregister(&self) -> Result<(), RegistrationError> {
        self.pending.lock().cancel();
        let Some(active) = self.active.lock().await.take() else {
            return Err(RegistrationError::NotRegistered);
        };

        let instance_id = active.instance.instance_id.clone();
        stop_heartbeat(active).await;
        self.deregister_instance(&instance_id).await;
        self.state.send_replace(RegistrationState::Deregistered);
        Ok(())
    }

    async fn deregister_instance(&self, instance_id: &str) {
        match self.backend.deregister(instance_id).await {
            Ok(()) => info!(instance_id = %instance_id, "✅ Service deregistered"),
            Err(e) => warn!(
                instance_id = %instance_id,
                error = %e,
                "⚠️ Failed to deregister service"
            ),
        }
    }
}

async fn stop_heartbeat(active: ActiveRegistration) {
    active.cancel.cancel();
    if let Err(e) = active.heartbeat.await {
        warn!(
            instance_id = %active.instance.instance_id,
            error = %e,
            "Heartbeat task ended abnormally"
        );
    }
}

impl Drop for RegistrationManager {
    fn drop(&mut self) {
        // 没有显式调用 deregister 时，尽量在后台注销
        self.pending.get_mut().cancel();
        let Some(active) = self.active.get_mut().take() else {
            return;
        };
        active.cancel.cancel();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let backend = self.backend.clone();
                let instance_id = active.instance.instance_id.clone();
                handle.spawn(async move {
                    match backend.deregister(&instance_id).await {
                        Ok(()) => info!(instance_id = %instance_id, "✅ Service deregistered (from Drop)"),
                        Err(e) => warn!(
                            instance_id = %instance_id,
                            error = %e,
                            "⚠️ Failed to deregister service (from Drop)"
                        ),
                    }
                });
            }
            Err(_) => warn!(
                instance_id = %active.instance.instance_id,
                "⚠️ Cannot deregister service: tokio runtime not available"
            ),
        }
    }
}

/// 带退避的注册
async fn register_with_retry(
    backend: &dyn RegistrationBackend,
    retry: &ExponentialBackoffPolicy,
    instance: &Instance,
    cancel: &CancellationToken,
) -> Result<(), RegistrationError> {
    let mut attempt = 0usize;
    loop {
        if cancel.is_cancelled() {
            return Err(RegistrationError::Cancelled);
        }
        attempt += 1;
        let err = match backend.register(instance).await {
            Ok(()) => {
                info!(
                    service = %instance.service_name,
                    instance_id = %instance.instance_id,
                    address = %instance.authority(),
                    attempt,
                    "✅ Service registered"
                );
                return Ok(());
            }
            Err(err) => err,
        };

        if !err.is_retryable() {
            error!(
                instance_id = %instance.instance_id,
                error = %err,
                "❌ Registration rejected by backend"
            );
            return Err(RegistrationError::BackendRejected(err));
        }

        if !retry.should_retry(attempt, &err) {
            error!(
                instance_id = %instance.instance_id,
                error = %err,
                attempts = attempt,
                "❌ Registration retry budget exhausted, instance is not discoverable"
            );
            return Err(RegistrationError::RetryBudgetExhausted {
                attempts: attempt,
                last_error: err,
            });
        }

        let delay = retry.backoff_duration(attempt);
        warn!(
            instance_id = %instance.instance_id,
            error = %err,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "⚠️ Registration failed, retrying"
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(instance_id = %instance.instance_id, "Registration cancelled during backoff");
                return Err(RegistrationError::Cancelled);
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

struct HeartbeatTask {
    backend: Arc<dyn RegistrationBackend>,
    retry: ExponentialBackoffPolicy,
    instance: Instance,
    interval: Duration,
    failure_threshold: u32,
    cancel: CancellationToken,
    state: Arc<watch::Sender<RegistrationState>>,
}

impl HeartbeatTask {
    async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = 0u32;
        let instance_id = self.instance.instance_id.as_str();

        loop {
            // 第一次 tick 立即触发，注册后马上把 TTL 检查置为 passing
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = self.backend.heartbeat(instance_id) => result,
            };

            let err = match result {
                Ok(()) => {
                    failures = 0;
                    debug!(instance_id = %instance_id, "💓 Heartbeat sent");
                    continue;
                }
                Err(err) => err,
            };

            failures += 1;
            warn!(
                instance_id = %instance_id,
                error = %err,
                failures,
                "⚠️ Failed to send heartbeat"
            );

            if failures < self.failure_threshold && !is_forgotten(&err) {
                continue;
            }

            warn!(instance_id = %instance_id, "Instance assumed removed by backend, re-registering");
            self.state.send_replace(RegistrationState::Registering);
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = register_with_retry(self.backend.as_ref(), &self.retry, &self.instance, &self.cancel) => result,
            };
            match result {
                Ok(()) => {
                    failures = 0;
                    self.state.send_replace(RegistrationState::Registered);
                }
                Err(RegistrationError::Cancelled) => break,
                Err(e) => {
                    error!(instance_id = %instance_id, error = %e, "❌ Re-registration failed");
                    self.state.send_replace(RegistrationState::Failed);
                    break;
                }
            }
        }

        debug!(instance_id = %instance_id, "🛑 Heartbeat task stopped");
    }
}

/// 后端已不认识该实例
fn is_forgotten(err: &TransportError) -> bool {
    matches!(err, TransportError::Backend { status, .. } if *status == StatusCode::NOT_FOUND)
}
