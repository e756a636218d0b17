//! 内存中的模拟传输
//!
//! 用于测试会话管理和设备逻辑：可编排失败、延迟、状态载荷和通知，
//! 并记录所有调用以便断言。

use crate::ble::Channel;
use crate::ble::transport::{Link, NotificationStream, Transport, TransportError};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockHandle {
    pub id: u64,
    pub address: String,
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    name: Option<String>,
    unknown_addresses: HashSet<String>,
    connect_failures: VecDeque<TransportError>,
    write_failures: VecDeque<TransportError>,
    read_failures: VecDeque<TransportError>,
    status_payload: Vec<u8>,
    connect_delay: Duration,
    read_delay: Duration,
    write_delay: Duration,
    live: Option<(MockHandle, CancellationToken)>,
    subscribers: Vec<mpsc::UnboundedSender<Vec<u8>>>,

    connect_calls: Vec<String>,
    connects_in_flight: usize,
    max_concurrent_connects: usize,
    io_in_flight: usize,
    max_concurrent_io: usize,
    writes: Vec<(Channel, Vec<u8>)>,
    disconnect_calls: usize,
}

impl MockState {
    fn check_live(&self, handle: &MockHandle) -> Result<(), TransportError> {
        match &self.live {
            Some((live, lost)) if live == handle && !lost.is_cancelled() => Ok(()),
            _ => Err(TransportError::LinkLost),
        }
    }

    fn drop_live(&mut self) -> bool {
        self.subscribers.clear();
        match self.live.take() {
            Some((_, lost)) => {
                lost.cancel();
                true
            }
            None => false,
        }
    }
}

pub struct MockTransport {
    state: Mutex<MockState>,
}

/// 统计同时进行的读写，drop 时计数减一 (包括被取消的操作)
struct IoInFlight<'a> {
    transport: &'a MockTransport,
}

impl<'a> IoInFlight<'a> {
    fn enter(transport: &'a MockTransport) -> Self {
        let mut state = transport.lock();
        state.io_in_flight += 1;
        state.max_concurrent_io = state.max_concurrent_io.max(state.io_in_flight);
        Self { transport }
    }
}

impl Drop for IoInFlight<'_> {
    fn drop(&mut self) {
        self.transport.lock().io_in_flight -= 1;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// 默认状态载荷为 18 字节全零 (门开)
    pub fn new() -> Self {
        let state = MockState {
            status_payload: vec![0; 18],
            ..MockState::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn with_name(self, name: &str) -> Self {
        self.set_name(name);
        self
    }

    /// 之后的连接报告该名称
    pub fn set_name(&self, name: &str) {
        self.lock().name = Some(name.to_string());
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_status_payload(&self, payload: &[u8]) {
        self.lock().status_payload = payload.to_vec();
    }

    pub fn fail_next_connect(&self, error: TransportError) {
        self.lock().connect_failures.push_back(error);
    }

    pub fn fail_next_write(&self, error: TransportError) {
        self.lock().write_failures.push_back(error);
    }

    pub fn fail_next_read(&self, error: TransportError) {
        self.lock().read_failures.push_back(error);
    }

    /// 对该地址的连接返回 `DeviceNotFound`
    pub fn mark_unknown(&self, address: &str) {
        self.lock().unknown_addresses.insert(address.to_string());
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.lock().connect_delay = delay;
    }

    pub fn set_read_delay(&self, delay: Duration) {
        self.lock().read_delay = delay;
    }

    pub fn set_write_delay(&self, delay: Duration) {
        self.lock().write_delay = delay;
    }

    /// 模拟设备侧断开，返回断开前是否有活动链路
    pub fn drop_link(&self) -> bool {
        self.lock().drop_live()
    }

    /// 向所有订阅者推送一次通知，返回收到的订阅者数量
    pub fn notify(&self, payload: &[u8]) -> usize {
        let mut state = self.lock();
        state
            .subscribers
            .retain(|tx| tx.send(payload.to_vec()).is_ok());
        state.subscribers.len()
    }

    pub fn is_connected(&self) -> bool {
        self.lock()
            .live
            .as_ref()
            .is_some_and(|(_, lost)| !lost.is_cancelled())
    }

    pub fn connect_calls(&self) -> usize {
        self.lock().connect_calls.len()
    }

    pub fn connected_addresses(&self) -> Vec<String> {
        self.lock().connect_calls.clone()
    }

    pub fn max_concurrent_connects(&self) -> usize {
        self.lock().max_concurrent_connects
    }

    /// 同一时刻进行中的读写数量的最大值
    pub fn max_concurrent_io(&self) -> usize {
        self.lock().max_concurrent_io
    }

    pub fn disconnect_calls(&self) -> usize {
        self.lock().disconnect_calls
    }

    pub fn written(&self, channel: Channel) -> Vec<Vec<u8>> {
        self.lock()
            .writes
            .iter()
            .filter(|(c, _)| *c == channel)
            .map(|(_, data)| data.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Handle = MockHandle;

    async fn connect(
        &self,
        address: &str,
        lost: CancellationToken,
    ) -> Result<Link<MockHandle>, TransportError> {
        let delay = {
            let mut state = self.lock();
            state.connect_calls.push(address.to_string());
            state.connects_in_flight += 1;
            state.max_concurrent_connects = state
                .max_concurrent_connects
                .max(state.connects_in_flight);
            state.connect_delay
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        state.connects_in_flight -= 1;
        if let Some(error) = state.connect_failures.pop_front() {
            return Err(error);
        }
        if state.unknown_addresses.contains(address) {
            return Err(TransportError::DeviceNotFound(address.to_string()));
        }

        // 设备同一时刻只接受一个连接
        state.drop_live();
        state.next_id += 1;
        let handle = MockHandle {
            id: state.next_id,
            address: address.to_string(),
        };
        state.live = Some((handle.clone(), lost));
        Ok(Link {
            handle,
            name: state.name.clone(),
        })
    }

    async fn write(
        &self,
        handle: &MockHandle,
        channel: Channel,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let _io = IoInFlight::enter(self);
        let delay = self.lock().write_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        state.check_live(handle)?;
        if let Some(error) = state.write_failures.pop_front() {
            return Err(error);
        }
        state.writes.push((channel, data.to_vec()));
        Ok(())
    }

    async fn read(&self, handle: &MockHandle, channel: Channel) -> Result<Vec<u8>, TransportError> {
        let _io = IoInFlight::enter(self);
        let delay = self.lock().read_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        state.check_live(handle)?;
        if let Some(error) = state.read_failures.pop_front() {
            return Err(error);
        }
        match channel {
            Channel::Status => Ok(state.status_payload.clone()),
            Channel::Command => Err(TransportError::Unsupported(
                "command characteristic is write-only".into(),
            )),
        }
    }

    async fn subscribe(
        &self,
        handle: &MockHandle,
        _channel: Channel,
    ) -> Result<NotificationStream, TransportError> {
        let mut state = self.lock();
        state.check_live(handle)?;
        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.push(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn disconnect(&self, handle: &MockHandle) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.disconnect_calls += 1;
        if state.live.as_ref().is_some_and(|(live, _)| live == handle) {
            state.drop_live();
        }
        Ok(())
    }
}
