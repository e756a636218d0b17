//! Run-Chicken 设备
//!
//! 组合会话、门控制和状态聚合，对外提供:
//! - `open()` / `close()`
//! - `poll_now()`: 读取状态特征并更新状态
//! - `update_from_notification()`: 应用一次通知载荷
//! - `subscribe()`: 在后台接收通知，重连后自动重新订阅
//! - `current_state()` / `watch_state()`

use crate::ble::Channel;
use crate::ble::retry::RetryPolicy;
use crate::ble::session::{DeviceSession, SessionStatus};
use crate::ble::transport::{NotificationStream, Transport};
use crate::door::{Clock, DoorController, SystemClock};
use crate::error::{Error, Result};
use crate::protocol::{DoorCommand, decode_status};
use crate::state::{DeviceState, StateAggregator};
use futures_util::StreamExt;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// 各类操作的重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceOptions {
    pub connect_retry: RetryPolicy,
    pub command_retry: RetryPolicy,
    pub poll_retry: RetryPolicy,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            connect_retry: RetryPolicy::connect(),
            command_retry: RetryPolicy::command(),
            poll_retry: RetryPolicy::poll(),
        }
    }
}

pub struct RunChickenDevice<T: Transport> {
    session: Arc<DeviceSession<T>>,
    controller: DoorController<T>,
    aggregator: Arc<StateAggregator>,
    poll_retry: RetryPolicy,
    shutdown: CancellationToken,
}

impl<T: Transport> RunChickenDevice<T> {
    pub fn new(transport: Arc<T>, address: Option<String>, options: DeviceOptions) -> Self {
        Self::with_clock(transport, address, options, Arc::new(SystemClock))
    }

    pub fn with_clock(
        transport: Arc<T>,
        address: Option<String>,
        options: DeviceOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let aggregator = Arc::new(StateAggregator::new(address.clone().unwrap_or_default()));
        let session = Arc::new(DeviceSession::new(
            transport,
            address,
            options.connect_retry,
        ));
        let controller = DoorController::new(Arc::clone(&session), clock, options.command_retry);

        Self {
            session,
            controller,
            aggregator,
            poll_retry: options.poll_retry,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn session(&self) -> &Arc<DeviceSession<T>> {
        &self.session
    }

    pub fn session_status(&self) -> SessionStatus {
        self.session.status()
    }

    pub fn current_state(&self) -> DeviceState {
        self.aggregator.current()
    }

    pub fn watch_state(&self) -> watch::Receiver<DeviceState> {
        self.aggregator.subscribe()
    }

    /// 连接 (或切换到) 指定设备
    pub async fn connect(&self, address: Option<&str>) -> Result<()> {
        self.session.connect(address).await?;
        self.note_peer();
        Ok(())
    }

    pub async fn open(&self) -> Result<()> {
        self.send(DoorCommand::Open).await
    }

    pub async fn close(&self) -> Result<()> {
        self.send(DoorCommand::Close).await
    }

    /// 写入成功即返回，门的实际状态由后续读取或通知确认
    pub async fn send(&self, command: DoorCommand) -> Result<()> {
        self.controller.send(command).await?;
        self.note_peer();
        Ok(())
    }

    pub async fn poll_now(&self) -> Result<DeviceState> {
        self.poll(None).await
    }

    /// 读取状态特征
    ///
    /// 传输失败包装为 [`Error::PollFailed`]；解码失败原样返回，
    /// 状态只应用兜底字段 (如有)。
    pub async fn poll(&self, address: Option<&str>) -> Result<DeviceState> {
        let read = self
            .poll_retry
            .run("poll", || self.session.read(address, Channel::Status))
            .await;

        let payload = match read {
            Ok(payload) => payload,
            Err(Error::ConnectionUnavailable) => return Err(Error::ConnectionUnavailable),
            Err(e) => {
                warn!("Status poll failed: {}", e);
                return Err(Error::PollFailed(Box::new(e)));
            }
        };

        self.note_peer();
        apply_payload(&self.aggregator, &payload)
    }

    pub fn update_from_notification(&self, payload: &[u8]) -> Result<DeviceState> {
        apply_payload(&self.aggregator, payload)
    }

    /// 订阅状态通知
    ///
    /// 首次订阅失败时返回错误。成功后在后台任务中应用通知，
    /// 链路断开后等待下一次连接并重新订阅，直到设备被移除。
    pub async fn subscribe(&self) -> Result<()> {
        let mut status = self.session.watch_status();
        let stream = self.session.subscribe(None, Channel::Status).await?;
        status.borrow_and_update();
        self.note_peer();
        info!("Subscribed to status notifications");

        tokio::spawn(notification_loop(
            Arc::clone(&self.session),
            Arc::clone(&self.aggregator),
            stream,
            status,
            self.shutdown.clone(),
        ));
        Ok(())
    }

    /// 移除设备：停止后台任务并断开连接
    pub async fn remove(self) {
        info!("Removing device");
        self.shutdown.cancel();
        self.session.teardown().await;
    }

    fn note_peer(&self) {
        if let SessionStatus::Connected { address, name } = self.session.status() {
            self.aggregator.identify(&address, name.as_deref());
        }
    }
}

impl<T: Transport> Drop for RunChickenDevice<T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn apply_payload(aggregator: &StateAggregator, payload: &[u8]) -> Result<DeviceState> {
    match decode_status(payload) {
        Ok(fields) => Ok(aggregator.apply(fields)),
        Err(e) => {
            let fallback = e.fallback_fields();
            if !fallback.is_empty() {
                aggregator.apply(fallback.iter().cloned());
            }
            warn!("Failed to decode status payload: {}", e);
            Err(e.into())
        }
    }
}

/// 应用通知直到链路断开，然后在下一次连接上重新订阅
///
/// `status` 在订阅成功时标记为已读，此后的任何状态变化都会被看到。
async fn notification_loop<T: Transport>(
    session: Arc<DeviceSession<T>>,
    aggregator: Arc<StateAggregator>,
    mut stream: NotificationStream,
    mut status: watch::Receiver<SessionStatus>,
    shutdown: CancellationToken,
) {
    loop {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => return,
                item = stream.next() => match item {
                    Some(payload) => {
                        debug!("Handling notification payload ({} bytes)", payload.len());
                        let _ = apply_payload(&aggregator, &payload);
                    }
                    None => break,
                },
            }
        }

        debug!("Notification stream ended, waiting for reconnect");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => return,
                changed = status.changed() => if changed.is_err() { return },
            }
            if !status.borrow_and_update().is_connected() {
                continue;
            }

            match session.subscribe(None, Channel::Status).await {
                Ok(resubscribed) => {
                    status.borrow_and_update();
                    info!("Re-subscribed to status notifications");
                    stream = resubscribed;
                    break;
                }
                Err(e) => warn!("Failed to re-subscribe to notifications: {}", e),
            }
        }
    }
}
