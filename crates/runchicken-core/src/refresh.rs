//! 周期刷新
//!
//! 两个触发来源:
//! - 固定间隔 (默认 300s)
//! - 按需请求 (例如设备重新出现在广播中)
//!
//! 按需请求经过防抖：冷却期外的请求立即执行，冷却期内的请求合并为
//! 冷却期结束时的一次刷新。任何按需刷新都会让间隔计时重新开始。

use log::debug;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_REFRESH_DEBOUNCE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshConfig {
    pub interval: Duration,
    pub debounce: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_REFRESH_INTERVAL,
            debounce: DEFAULT_REFRESH_DEBOUNCE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshReason {
    Interval,
    Requested,
}

/// 请求一次刷新
#[derive(Debug, Clone)]
pub struct RefreshHandle {
    tx: mpsc::Sender<()>,
}

impl RefreshHandle {
    /// 返回 false 表示调度器已经退出
    pub fn request(&self) -> bool {
        match self.tx.try_send(()) {
            // 已有未处理的请求，本次与之合并
            Ok(()) | Err(TrySendError::Full(())) => true,
            Err(TrySendError::Closed(())) => false,
        }
    }
}

pub struct RefreshScheduler {
    config: RefreshConfig,
    rx: mpsc::Receiver<()>,
    handle: RefreshHandle,
}

impl RefreshScheduler {
    pub fn new(config: RefreshConfig) -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            config,
            rx,
            handle: RefreshHandle { tx },
        }
    }

    pub fn handle(&self) -> RefreshHandle {
        self.handle.clone()
    }

    /// 运行直到 `shutdown` 被取消
    ///
    /// 启动时立即执行一次间隔刷新。`refresh` 串行调用，不会重叠。
    pub async fn run<F, Fut>(mut self, shutdown: CancellationToken, mut refresh: F)
    where
        F: FnMut(RefreshReason) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut ticker = time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut cooldown_until: Option<Instant> = None;
        let mut pending = false;

        loop {
            let reason = tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => RefreshReason::Interval,
                Some(()) = self.rx.recv() => {
                    if cooldown_until.is_some_and(|until| Instant::now() < until) {
                        debug!("Refresh request coalesced into pending refresh");
                        pending = true;
                        continue;
                    }
                    RefreshReason::Requested
                }
                () = time::sleep_until(cooldown_until.unwrap_or_else(Instant::now)), if pending => {
                    pending = false;
                    RefreshReason::Requested
                }
            };

            if reason == RefreshReason::Requested {
                cooldown_until = Some(Instant::now() + self.config.debounce);
                ticker.reset();
            }
            debug!("Refreshing ({:?})", reason);
            refresh(reason).await;
        }

        debug!("Refresh scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn start(
        config: RefreshConfig,
    ) -> (
        RefreshHandle,
        CancellationToken,
        UnboundedReceiver<RefreshReason>,
        tokio::task::JoinHandle<()>,
    ) {
        let scheduler = RefreshScheduler::new(config);
        let handle = scheduler.handle();
        let shutdown = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();

        let token = shutdown.clone();
        let task = tokio::spawn(scheduler.run(token, move |reason| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(reason);
            }
        }));
        (handle, shutdown, rx, task)
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_refresh() {
        let (_handle, shutdown, mut rx, task) = start(RefreshConfig::default());
        let started = Instant::now();

        assert_eq!(rx.recv().await, Some(RefreshReason::Interval));
        assert_eq!(rx.recv().await, Some(RefreshReason::Interval));
        assert!(started.elapsed() >= Duration::from_secs(300));

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_are_debounced() {
        let (handle, shutdown, mut rx, task) = start(RefreshConfig::default());
        assert_eq!(rx.recv().await, Some(RefreshReason::Interval));

        // 冷却期外：立即执行
        assert!(handle.request());
        assert_eq!(rx.recv().await, Some(RefreshReason::Requested));
        let first = Instant::now();

        // 冷却期内：合并为一次
        handle.request();
        tokio::task::yield_now().await;
        handle.request();
        assert!(
            time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .is_err()
        );

        assert_eq!(rx.recv().await, Some(RefreshReason::Requested));
        assert!(first.elapsed() >= Duration::from_secs(10));

        // 之后只剩间隔刷新
        assert!(
            time::timeout(Duration::from_secs(100), rx.recv())
                .await
                .is_err()
        );
        assert_eq!(rx.recv().await, Some(RefreshReason::Interval));

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_resets_interval() {
        let (handle, shutdown, mut rx, task) = start(RefreshConfig {
            interval: Duration::from_secs(60),
            debounce: Duration::from_secs(1),
        });
        assert_eq!(rx.recv().await, Some(RefreshReason::Interval));

        time::sleep(Duration::from_secs(50)).await;
        handle.request();
        assert_eq!(rx.recv().await, Some(RefreshReason::Requested));
        let requested_at = Instant::now();

        assert_eq!(rx.recv().await, Some(RefreshReason::Interval));
        assert!(requested_at.elapsed() >= Duration::from_secs(60));

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_after_shutdown() {
        let (handle, shutdown, _rx, task) = start(RefreshConfig::default());
        shutdown.cancel();
        task.await.unwrap();
        assert!(!handle.request());
    }
}
