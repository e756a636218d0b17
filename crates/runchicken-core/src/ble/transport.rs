//! 传输层抽象
//!
//! 会话管理只依赖 [`Transport`]，真实蓝牙由 [`super::btle::BtleTransport`] 实现，
//! 测试使用 [`super::mock::MockTransport`]。
//!
//! 意外断开不经由方法返回值报告：`connect` 时传入的 `CancellationToken`
//! 由传输层在链路断开时取消。

use crate::ble::Channel;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Bluetooth adapter busy: {0}")]
    Busy(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Link to device lost")]
    LinkLost,

    #[error("Bluetooth I/O error: {0}")]
    Io(String),

    #[error("No Bluetooth adapters found")]
    NoAdapter,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Invalid device address: {0}")]
    InvalidAddress(String),

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("Not supported: {0}")]
    Unsupported(String),

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<TransportError>,
    },
}

impl TransportError {
    /// 瞬时错误：重试可能成功 (超时、适配器忙、链路抖动)
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Busy(_)
                | TransportError::Timeout(_)
                | TransportError::LinkLost
                | TransportError::Io(_)
        )
    }
}

/// 一次成功的连接
#[derive(Debug, Clone)]
pub struct Link<H> {
    pub handle: H,
    /// 设备广播的名称 (如果有)
    pub name: Option<String>,
}

/// 状态通知流，每项是一次通知的原始载荷
pub type NotificationStream = BoxStream<'static, Vec<u8>>;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Handle: Clone + Send + Sync + 'static;

    /// 连接到指定地址
    ///
    /// 链路之后断开时，实现必须取消 `lost`。
    async fn connect(
        &self,
        address: &str,
        lost: CancellationToken,
    ) -> Result<Link<Self::Handle>, TransportError>;

    async fn write(
        &self,
        handle: &Self::Handle,
        channel: Channel,
        data: &[u8],
    ) -> Result<(), TransportError>;

    async fn read(&self, handle: &Self::Handle, channel: Channel)
    -> Result<Vec<u8>, TransportError>;

    async fn subscribe(
        &self,
        handle: &Self::Handle,
        channel: Channel,
    ) -> Result<NotificationStream, TransportError>;

    async fn disconnect(&self, handle: &Self::Handle) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(TransportError::Busy("hci0".into()).is_transient());
        assert!(TransportError::Timeout("connect".into()).is_transient());
        assert!(TransportError::LinkLost.is_transient());
        assert!(TransportError::Io("l2cap".into()).is_transient());

        assert!(!TransportError::NoAdapter.is_transient());
        assert!(!TransportError::DeviceNotFound("AA".into()).is_transient());
        assert!(!TransportError::InvalidAddress("zz".into()).is_transient());
        assert!(
            !TransportError::RetriesExhausted {
                attempts: 3,
                last: Box::new(TransportError::LinkLost),
            }
            .is_transient()
        );
    }
}
