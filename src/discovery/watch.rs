//! 服务监听循环
//!
//! 每个被监听的服务一个任务：长轮询注册中心，把快照写入缓存，失败时退避。
//! 状态流转：`Starting → Polling → (Applying | Backoff) → Polling → … → Stopped`。
//! 任务创建时认领其服务在缓存中的键，同一服务的快照按拉取顺序写入；
//! 写入权被新任务认领后，旧任务不再写入并自行退出。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::config::WatchConfig;
use crate::discovery::backend::RegistryTransport;
use crate::discovery::instance::ServiceName;
use crate::discovery::snapshot::ChangeIndex;
use crate::discovery::store::SnapshotStore;
use crate::retry::{ExponentialBackoffPolicy, RetryPolicy};

/// 监听循环所处阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchPhase {
    Starting,
    Polling,
    Applying,
    Backoff,
    Stopped,
}

/// 监听循环私有状态
#[derive(Debug, Clone, Default)]
pub struct WatchState {
    pub last_change_index: Option<ChangeIndex>,
    pub consecutive_failures: u32,
    pub next_retry_at: Option<Instant>,
}

/// 对外可观察的监听状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchStatus {
    pub phase: WatchPhase,
    pub last_change_index: Option<ChangeIndex>,
    pub consecutive_failures: u32,
}

impl WatchStatus {
    fn starting() -> Self {
        Self {
            phase: WatchPhase::Starting,
            last_change_index: None,
            consecutive_failures: 0,
        }
    }
}

/// 单个服务的监听循环
pub struct WatchLoop {
    service: ServiceName,
    transport: Arc<dyn RegistryTransport>,
    store: Arc<SnapshotStore>,
    generation: u64,
    backoff: ExponentialBackoffPolicy,
    wait: Duration,
    cancel: CancellationToken,
    status: watch::Sender<WatchStatus>,
}

/// 监听任务句柄
pub struct WatchHandle {
    service: ServiceName,
    generation: u64,
    cancel: CancellationToken,
    status: watch::Receiver<WatchStatus>,
    task: JoinHandle<()>,
}

impl WatchLoop {
    pub fn new(
        service: ServiceName,
        transport: Arc<dyn RegistryTransport>,
        store: Arc<SnapshotStore>,
        config: &WatchConfig,
    ) -> Self {
        let (status, _) = watch::channel(WatchStatus::starting());
        let generation = store.claim(&service);
        Self {
            service,
            transport,
            store,
            generation,
            backoff: config.backoff_policy(),
            wait: config.wait(),
            cancel: CancellationToken::new(),
            status,
        }
    }

    /// 替换退避策略
    pub fn with_backoff(mut self, backoff: ExponentialBackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// 使用外部取消令牌（例如客户端关闭时统一取消）
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// 在 tokio 运行时上启动监听任务
    pub fn spawn(self) -> WatchHandle {
        let service = self.service.clone();
        let generation = self.generation;
        let cancel = self.cancel.clone();
        let status = self.status.subscribe();
        let span = info_span!("watch", service = %service);
        let task = tokio::spawn(self.run().instrument(span));

        WatchHandle {
            service,
            generation,
            cancel,
            status,
            task,
        }
    }

    /// 运行监听循环，直到被取消
    pub async fn run(self) {
        let mut state = WatchState::default();
        info!(service = %self.service, "👀 Watch started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.publish(WatchPhase::Polling, &state);

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = self.transport.fetch(&self.service, state.last_change_index, self.wait) => result,
            };

            match result {
                Ok(snapshot) => {
                    // 取消后不再写缓存
                    if self.cancel.is_cancelled() {
                        break;
                    }

                    let index = snapshot.change_index;
                    if let Some(last) = state.last_change_index {
                        if index < last {
                            warn!(
                                service = %self.service,
                                last = %last,
                                index = %index,
                                "Change index went backwards, resetting"
                            );
                            state.last_change_index = None;
                            continue;
                        }
                    }

                    self.publish(WatchPhase::Applying, &state);
                    let instances = snapshot.instances.len();
                    let Some(changed) = self.store.put_owned(&self.service, self.generation, snapshot)
                    else {
                        debug!(service = %self.service, "Store key claimed by another watch");
                        break;
                    };
                    state.last_change_index = Some(index);
                    state.consecutive_failures = 0;
                    state.next_retry_at = None;

                    if changed {
                        info!(
                            service = %self.service,
                            index = %index,
                            instances,
                            "Service snapshot updated"
                        );
                    } else {
                        debug!(service = %self.service, index = %index, "No change");
                    }
                }
                Err(err) if err.is_retryable() => {
                    state.consecutive_failures += 1;
                    let delay = self
                        .backoff
                        .backoff_duration(state.consecutive_failures as usize);
                    let retry_at = Instant::now() + delay;
                    state.next_retry_at = Some(retry_at);
                    self.publish(WatchPhase::Backoff, &state);

                    warn!(
                        service = %self.service,
                        error = %err,
                        failures = state.consecutive_failures,
                        delay_ms = delay.as_millis() as u64,
                        "Failed to fetch service snapshot, backing off"
                    );

                    if !self.sleep_until(retry_at).await {
                        break;
                    }
                }
                Err(err) => {
                    // 格式错误或后端拒绝：跳过本次轮询，不计入失败
                    warn!(
                        service = %self.service,
                        error = %err,
                        "Skipping unusable registry response"
                    );
                    let retry_at = Instant::now() + self.backoff.base_delay();
                    if !self.sleep_until(retry_at).await {
                        break;
                    }
                }
            }
        }

        self.publish(WatchPhase::Stopped, &state);
        info!(service = %self.service, "🛑 Watch stopped");
    }

    /// 可取消的等待，被取消时返回 false
    async fn sleep_until(&self, deadline: Instant) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep_until(deadline) => true,
        }
    }

    fn publish(&self, phase: WatchPhase, state: &WatchState) {
        self.status.send_replace(WatchStatus {
            phase,
            last_change_index: state.last_change_index,
            consecutive_failures: state.consecutive_failures,
        });
    }
}

impl WatchHandle {
    pub fn service(&self) -> &ServiceName {
        &self.service
    }

    /// 该任务在缓存中持有的写入代号
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// 当前状态
    pub fn status(&self) -> WatchStatus {
        self.status.borrow().clone()
    }

    /// 订阅状态变化
    pub fn subscribe(&self) -> watch::Receiver<WatchStatus> {
        self.status.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// 发出取消信号，不等待任务退出
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// 取消并等待任务进入 `Stopped`
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(service = %self.service, error = %e, "Watch task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::backend::InMemoryRegistry;
    use crate::discovery::instance::Instance;
    use crate::error::TransportError;

    fn config() -> WatchConfig {
        WatchConfig {
            wait_secs: 5,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter: 0.0,
        }
    }

    async fn wait_for<F>(rx: &mut watch::Receiver<WatchStatus>, pred: F) -> WatchStatus
    where
        F: Fn(&WatchStatus) -> bool,
    {
        rx.wait_for(|s| pred(s)).await.unwrap().clone()
    }

    #[tokio::test(start_paused = true)]
    async fn test_applies_first_snapshot() {
        let registry = Arc::new(InMemoryRegistry::new());
        let name = ServiceName::new("orders").unwrap();
        registry.upsert(Instance::new(name.clone(), "a", "10.0.0.1", 80));
        let store = Arc::new(SnapshotStore::new());

        let handle = WatchLoop::new(name.clone(), registry.clone(), store.clone(), &config()).spawn();
        let mut rx = handle.subscribe();
        wait_for(&mut rx, |s| s.last_change_index.is_some()).await;

        assert_eq!(store.get("orders").unwrap().instances.len(), 1);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_then_recover() {
        let registry = Arc::new(InMemoryRegistry::new());
        let name = ServiceName::new("orders").unwrap();
        registry.upsert(Instance::new(name.clone(), "a", "10.0.0.1", 80));
        registry.inject_fetch_failures([
            TransportError::network("refused"),
            TransportError::network("refused"),
        ]);
        let store = Arc::new(SnapshotStore::new());

        let handle = WatchLoop::new(name, registry.clone(), store.clone(), &config()).spawn();
        let mut rx = handle.subscribe();

        let status = wait_for(&mut rx, |s| s.consecutive_failures == 2).await;
        assert_eq!(status.phase, WatchPhase::Backoff);

        let status = wait_for(&mut rx, |s| s.last_change_index.is_some()).await;
        assert_eq!(status.consecutive_failures, 0);
        assert!(store.get("orders").is_some());
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_response_is_skipped() {
        let registry = Arc::new(InMemoryRegistry::new());
        let name = ServiceName::new("orders").unwrap();
        registry.upsert(Instance::new(name.clone(), "a", "10.0.0.1", 80));
        registry.inject_fetch_failures([TransportError::malformed("garbage")]);
        let store = Arc::new(SnapshotStore::new());

        let handle = WatchLoop::new(name, registry.clone(), store.clone(), &config()).spawn();
        let mut rx = handle.subscribe();
        let status = wait_for(&mut rx, |s| s.last_change_index.is_some()).await;

        assert_eq!(status.consecutive_failures, 0);
        assert!(registry.fetch_count() >= 2);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_watch_exits() {
        let registry = Arc::new(InMemoryRegistry::new());
        let name = ServiceName::new("orders").unwrap();
        registry.upsert(Instance::new(name.clone(), "a", "10.0.0.1", 80));
        let store = Arc::new(SnapshotStore::new());

        let old = WatchLoop::new(name.clone(), registry.clone(), store.clone(), &config()).spawn();
        let mut old_rx = old.subscribe();
        wait_for(&mut old_rx, |s| s.last_change_index.is_some()).await;

        let new = WatchLoop::new(name.clone(), registry.clone(), store.clone(), &config()).spawn();
        assert_eq!(store.owner("orders"), Some(new.generation()));

        // 变更唤醒两个任务，只有新任务能写入
        registry.upsert(Instance::new(name, "b", "10.0.0.2", 80));
        wait_for(&mut old_rx, |s| s.phase == WatchPhase::Stopped).await;

        let mut new_rx = new.subscribe();
        wait_for(&mut new_rx, |s| s.last_change_index.is_some()).await;
        assert!(!store.release("orders", old.generation()));
        assert!(store.contains("orders"));
        new.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_reaches_stopped_and_stops_writing() {
        let registry = Arc::new(InMemoryRegistry::new());
        let name = ServiceName::new("orders").unwrap();
        registry.upsert(Instance::new(name.clone(), "a", "10.0.0.1", 80));
        let store = Arc::new(SnapshotStore::new());

        let handle = WatchLoop::new(name.clone(), registry.clone(), store.clone(), &config()).spawn();
        let mut rx = handle.subscribe();
        wait_for(&mut rx, |s| s.last_change_index.is_some()).await;
        handle.stop().await;
        assert_eq!(rx.borrow().phase, WatchPhase::Stopped);

        let version = store.version();
        registry.upsert(Instance::new(name, "b", "10.0.0.2", 80));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(store.version(), version);
        assert_eq!(store.get("orders").unwrap().instances.len(), 1);
    }
}
