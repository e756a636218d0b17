//! 开门/关门
//!
//! 命令包在发送时按当前时间编码一次，重试时重发同一个包。
//! 写入成功即返回，不等待门的动作完成；门状态由下一次读取或通知更新。

use crate::ble::Channel;
use crate::ble::retry::RetryPolicy;
use crate::ble::session::DeviceSession;
use crate::ble::transport::Transport;
use crate::error::{Error, Result};
use crate::protocol::{DoorCommand, encode_command, to_hex};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::sync::Arc;

/// 时间来源
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 固定时间，测试用
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

pub struct DoorController<T: Transport> {
    session: Arc<DeviceSession<T>>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl<T: Transport> DoorController<T> {
    pub fn new(session: Arc<DeviceSession<T>>, clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
        Self {
            session,
            clock,
            retry,
        }
    }

    pub async fn open(&self) -> Result<()> {
        self.send(DoorCommand::Open).await
    }

    pub async fn close(&self) -> Result<()> {
        self.send(DoorCommand::Close).await
    }

    pub async fn send(&self, command: DoorCommand) -> Result<()> {
        let packet = encode_command(command, self.clock.now())?;
        debug!("{} packet: {}", command, to_hex(packet.as_bytes()));

        let result = self
            .retry
            .run(command.name(), || {
                self.session.write(None, Channel::Command, packet.as_bytes())
            })
            .await;

        match result {
            Ok(()) => {
                info!("Sent {} command", command);
                Ok(())
            }
            Err(Error::ConnectionUnavailable) => Err(Error::ConnectionUnavailable),
            Err(e) => {
                warn!("{} command failed: {}", command, e);
                Err(Error::CommandFailed {
                    command,
                    source: Box::new(e),
                })
            }
        }
    }
}
