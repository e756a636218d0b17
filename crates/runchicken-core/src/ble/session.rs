//! Device Session - 单个设备的连接生命周期
//!
//! 状态机:
//!
//! ```text
//! Disconnected ──请求──▶ Connecting ──成功──▶ Connected
//!      ▲                     │                   │
//!      └──────失败───────────┘                   │
//!      └────────── 断开信号 / teardown ───────────┘
//! ```
//!
//! - "确保已连接" 在一个互斥区内完成，同一时刻只有一个连接尝试，
//!   并发的调用方排队等待而不是各自发起连接
//! - 同一句柄上的读写经由同一把锁串行化
//! - 传输层取消 `lost` 令牌即视为断开，当前链接立即作废，下次操作重新连接
//! - 调用方放弃进行中的操作 (future 被 drop) 时，会话回到 Disconnected，
//!   被放弃的链路在下一次连接前于互斥区内断开

use crate::ble::Channel;
use crate::ble::retry::RetryPolicy;
use crate::ble::transport::{NotificationStream, Transport, TransportError};
use crate::error::{Error, Result};
use futures_util::StreamExt;
use log::{debug, info, warn};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Disconnected,
    Connecting {
        address: String,
    },
    Connected {
        address: String,
        name: Option<String>,
    },
}

impl SessionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionStatus::Connected { .. })
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Disconnected => write!(f, "disconnected"),
            SessionStatus::Connecting { address } => write!(f, "connecting to {}", address),
            SessionStatus::Connected { address, .. } => write!(f, "connected to {}", address),
        }
    }
}

struct ActiveLink<H> {
    address: String,
    handle: H,
    lost: CancellationToken,
    generation: u64,
}

struct SessionState<H> {
    /// 最近一次关联的设备地址
    target: Option<String>,
    link: Option<ActiveLink<H>>,
}

pub struct DeviceSession<T: Transport> {
    transport: Arc<T>,
    connect_policy: RetryPolicy,
    state: Mutex<SessionState<T::Handle>>,
    status: Arc<watch::Sender<SessionStatus>>,
    generation: Arc<AtomicU64>,
    /// 被放弃的操作留下的句柄，等待断开
    abandoned: std::sync::Mutex<Vec<T::Handle>>,
}

impl<T: Transport> DeviceSession<T> {
    pub fn new(transport: Arc<T>, address: Option<String>, connect_policy: RetryPolicy) -> Self {
        let (status, _) = watch::channel(SessionStatus::Disconnected);
        Self {
            transport,
            connect_policy,
            state: Mutex::new(SessionState {
                target: address,
                link: None,
            }),
            status: Arc::new(status),
            generation: Arc::new(AtomicU64::new(0)),
            abandoned: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub async fn target(&self) -> Option<String> {
        self.state.lock().await.target.clone()
    }

    /// 确保已连接
    ///
    /// `address` 与当前目标不同时，旧会话被关闭并连接新地址；
    /// 为 `None` 时使用之前关联的地址。
    pub async fn connect(&self, address: Option<&str>) -> Result<()> {
        self.with_link(address, |_, _, _| async { Ok::<_, TransportError>(()) })
            .await
    }

    pub async fn write(&self, address: Option<&str>, channel: Channel, data: &[u8]) -> Result<()> {
        self.with_link(address, |transport, handle, _| async move {
            transport.write(&handle, channel, data).await
        })
        .await
    }

    pub async fn read(&self, address: Option<&str>, channel: Channel) -> Result<Vec<u8>> {
        self.with_link(address, |transport, handle, _| async move {
            transport.read(&handle, channel).await
        })
        .await
    }

    /// 订阅通知
    ///
    /// 返回的流在链路断开时结束，重新连接后需要再次订阅。
    pub async fn subscribe(
        &self,
        address: Option<&str>,
        channel: Channel,
    ) -> Result<NotificationStream> {
        self.with_link(address, |transport, handle, lost| async move {
            let stream = transport.subscribe(&handle, channel).await?;
            Ok::<_, TransportError>(stream.take_until(lost.cancelled_owned()).boxed())
        })
        .await
    }

    /// 主动断开
    pub async fn teardown(&self) {
        let mut state = self.state.lock().await;
        self.drain_abandoned().await;
        if let Some(link) = state.link.take() {
            info!("Tearing down session to {}", link.address);
            if link.lost.is_cancelled() {
                self.discard_link(&link);
            } else {
                self.close_link(link).await;
            }
        }
    }

    async fn with_link<R, F, Fut>(&self, address: Option<&str>, op: F) -> Result<R>
    where
        F: FnOnce(Arc<T>, T::Handle, CancellationToken) -> Fut,
        Fut: Future<Output = Result<R, TransportError>>,
    {
        let mut state = self.state.lock().await;
        let (handle, lost) = {
            let link = self.ensure_connected(&mut state, address).await?;
            (link.handle.clone(), link.lost.clone())
        };

        let guard = AbandonGuard::<T>::in_flight(
            &self.status,
            &self.abandoned,
            handle.clone(),
            lost.clone(),
        );
        let result = tokio::select! {
            biased;
            () = lost.cancelled() => Err(TransportError::LinkLost),
            r = op(Arc::clone(&self.transport), handle, lost.clone()) => r,
        };
        guard.disarm();

        if lost.is_cancelled() || matches!(result, Err(TransportError::LinkLost)) {
            if let Some(link) = state.link.take() {
                debug!("Link to {} lost during operation", link.address);
                self.close_link(link).await;
            }
        }

        result.map_err(Error::from)
    }

    async fn ensure_connected<'s>(
        &self,
        state: &'s mut SessionState<T::Handle>,
        address: Option<&str>,
    ) -> Result<&'s ActiveLink<T::Handle>> {
        self.drain_abandoned().await;

        if let Some(address) = address {
            if state.target.as_deref() != Some(address) {
                if let Some(previous) = state.link.take() {
                    info!(
                        "Target changed from {} to {}, closing existing session",
                        previous.address, address
                    );
                    self.close_link(previous).await;
                }
                state.target = Some(address.to_string());
            }
        }

        if state
            .link
            .as_ref()
            .is_some_and(|link| link.lost.is_cancelled())
        {
            if let Some(stale) = state.link.take() {
                debug!("Discarding session to {} after disconnect", stale.address);
                self.discard_link(&stale);
            }
        }

        if state.link.is_none() {
            let target = state.target.clone().ok_or(Error::ConnectionUnavailable)?;
            let link = self.open_link(&target).await?;
            state.link = Some(link);
        }

        state.link.as_ref().ok_or(Error::ConnectionUnavailable)
    }

    async fn open_link(&self, address: &str) -> Result<ActiveLink<T::Handle>> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.status.send_replace(SessionStatus::Connecting {
            address: address.to_string(),
        });
        info!("Connecting to {}", address);

        let guard = AbandonGuard::<T>::connecting(&self.status);
        let result = self
            .connect_policy
            .run("connect", || {
                let transport = Arc::clone(&self.transport);
                let lost = CancellationToken::new();
                async move {
                    let link = transport.connect(address, lost.clone()).await?;
                    Ok::<_, Error>((link, lost))
                }
            })
            .await;
        guard.disarm();

        match result {
            Ok((link, lost)) => {
                info!("Connected to {} ({:?})", address, link.name);
                self.status.send_replace(SessionStatus::Connected {
                    address: address.to_string(),
                    name: link.name.clone(),
                });
                self.watch_link(&lost, generation, address);
                Ok(ActiveLink {
                    address: address.to_string(),
                    handle: link.handle,
                    lost,
                    generation,
                })
            }
            Err(e) => {
                warn!("Failed to connect to {}: {}", address, e);
                mark_disconnected(&self.status);
                Err(e)
            }
        }
    }

    /// 链路断开信号触发时把状态切回 Disconnected
    fn watch_link(&self, lost: &CancellationToken, generation: u64, address: &str) {
        let lost = lost.clone();
        let status = Arc::clone(&self.status);
        let current = Arc::clone(&self.generation);
        let address = address.to_string();

        tokio::spawn(async move {
            lost.cancelled().await;
            let changed = status.send_if_modified(|s| {
                if current.load(Ordering::SeqCst) == generation && s.is_connected() {
                    *s = SessionStatus::Disconnected;
                    true
                } else {
                    false
                }
            });
            if changed {
                warn!("Device {} disconnected unexpectedly", address);
            }
        });
    }

    /// 断开被放弃的链路，调用方需持有会话锁
    async fn drain_abandoned(&self) {
        let handles = std::mem::take(
            &mut *self
                .abandoned
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            debug!("Disconnecting abandoned link");
            if let Err(e) = self.transport.disconnect(&handle).await {
                debug!("Disconnect of abandoned link failed: {}", e);
            }
        }
    }

    fn discard_link(&self, link: &ActiveLink<T::Handle>) {
        if self.generation.load(Ordering::SeqCst) == link.generation {
            mark_disconnected(&self.status);
        }
        link.lost.cancel();
    }

    async fn close_link(&self, link: ActiveLink<T::Handle>) {
        self.discard_link(&link);
        if let Err(e) = self.transport.disconnect(&link.handle).await {
            debug!("Disconnect from {} failed: {}", link.address, e);
        }
    }
}

fn mark_disconnected(status: &watch::Sender<SessionStatus>) {
    status.send_if_modified(|s| {
        if *s == SessionStatus::Disconnected {
            false
        } else {
            *s = SessionStatus::Disconnected;
            true
        }
    });
}

/// 操作未完成就被 drop 时把会话恢复为 Disconnected
///
/// 进行中的操作被放弃时，链路作废，句柄交给会话在下一次连接前断开。
struct AbandonGuard<'a, T: Transport> {
    status: &'a watch::Sender<SessionStatus>,
    link: Option<(
        &'a std::sync::Mutex<Vec<T::Handle>>,
        T::Handle,
        CancellationToken,
    )>,
    armed: bool,
}

impl<'a, T: Transport> AbandonGuard<'a, T> {
    fn connecting(status: &'a watch::Sender<SessionStatus>) -> Self {
        Self {
            status,
            link: None,
            armed: true,
        }
    }

    fn in_flight(
        status: &'a watch::Sender<SessionStatus>,
        abandoned: &'a std::sync::Mutex<Vec<T::Handle>>,
        handle: T::Handle,
        lost: CancellationToken,
    ) -> Self {
        Self {
            status,
            link: Some((abandoned, handle, lost)),
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<T: Transport> Drop for AbandonGuard<'_, T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        mark_disconnected(self.status);
        if let Some((abandoned, handle, lost)) = self.link.take() {
            debug!("Operation abandoned mid-flight, dropping link");
            lost.cancel();
            abandoned
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(handle);
        }
    }
}
