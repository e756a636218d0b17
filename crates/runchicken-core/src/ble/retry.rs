//! 重试策略
//!
//! 只重试瞬时传输错误，永久错误立即返回。重试耗尽后错误包装为
//! [`TransportError::RetriesExhausted`]，不再被视为可重试。
//!
//! 退避: `delay = min(initial * 2^(attempt-1), max)`

use crate::ble::transport::TransportError;
use crate::error::{Error, Result};
use log::{debug, warn};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 包含第一次在内的最大尝试次数
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::command()
    }
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            max_backoff,
        }
    }

    /// 建立连接: 4 次，250ms 起步，最长 4s
    pub const fn connect() -> Self {
        Self::new(4, Duration::from_millis(250), Duration::from_secs(4))
    }

    /// 写命令: 3 次，短退避
    pub const fn command() -> Self {
        Self::new(3, Duration::from_millis(250), Duration::from_secs(1))
    }

    /// 读状态
    pub const fn poll() -> Self {
        Self::new(3, Duration::from_millis(250), Duration::from_secs(1))
    }

    /// 只尝试一次
    pub const fn once() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// 第 `attempt` 次失败后的等待时间 (attempt 从 1 开始)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    /// 执行 `op`，瞬时错误按策略重试
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{} succeeded on attempt {}", what, attempt);
                    }
                    return Ok(value);
                }
                Err(Error::Transport(e)) if e.is_transient() => {
                    if attempt >= max_attempts {
                        warn!("{} failed after {} attempts: {}", what, attempt, e);
                        return Err(Error::Transport(TransportError::RetriesExhausted {
                            attempts: attempt,
                            last: Box::new(e),
                        }));
                    }
                    let delay = self.backoff(attempt);
                    debug!(
                        "{} attempt {}/{} failed ({}), retrying in {:?}",
                        what, attempt, max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(2))
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = fast(3)
            .run("write", || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(Error::Transport(TransportError::Timeout("write".into())))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = fast(5)
            .run("connect", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Transport(TransportError::DeviceNotFound("AA".into())))
            })
            .await;

        assert!(matches!(
            result,
            Err(Error::Transport(TransportError::DeviceNotFound(_)))
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_wraps_last_error() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = fast(2)
            .run("read", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Transport(TransportError::LinkLost))
            })
            .await;

        match result {
            Err(Error::Transport(TransportError::RetriesExhausted { attempts, last })) => {
                assert_eq!(attempts, 2);
                assert_eq!(*last, TransportError::LinkLost);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_transport_errors_pass_through() {
        let result: Result<()> = fast(3)
            .run("poll", || async { Err(Error::ConnectionUnavailable) })
            .await;
        assert!(matches!(result, Err(Error::ConnectionUnavailable)));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_millis(700));
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(700));
        assert_eq!(policy.backoff(40), Duration::from_millis(700));
    }

    #[tokio::test]
    async fn test_zero_attempts_still_runs_once() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = RetryPolicy::new(0, Duration::ZERO, Duration::ZERO)
            .run("write", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Transport(TransportError::Busy("hci0".into())))
            })
            .await;

        assert!(matches!(
            result,
            Err(Error::Transport(TransportError::RetriesExhausted { attempts: 1, .. }))
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
