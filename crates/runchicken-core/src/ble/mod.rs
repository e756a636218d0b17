pub mod btle;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod retry;
pub mod session;
pub mod transport;

use std::fmt;
use uuid::Uuid;

pub const COMMAND_SERVICE_UUID: Uuid = Uuid::from_u128(0x00000000_cc7a_482a_984a_7f2ed5b3e58f);
pub const COMMAND_CHAR_UUID: Uuid = Uuid::from_u128(0x00000000_8e22_4541_9d4c_21edae82ed19);
pub const STATUS_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000004f_cc7a_482a_984a_7f2ed5b3e58f);
pub const STATUS_CHAR_UUID: Uuid = Uuid::from_u128(0x00000001_8e22_4541_9d4c_21edae82ed19);

/// 广播数据中的厂商 ID
pub const MANUFACTURER_ID: u16 = 43521;

/// 设备上使用的两个逻辑通道
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// 写入命令包
    Command,
    /// 读取/订阅门状态
    Status,
}

impl Channel {
    pub fn service_uuid(self) -> Uuid {
        match self {
            Channel::Command => COMMAND_SERVICE_UUID,
            Channel::Status => STATUS_SERVICE_UUID,
        }
    }

    pub fn characteristic_uuid(self) -> Uuid {
        match self {
            Channel::Command => COMMAND_CHAR_UUID,
            Channel::Status => STATUS_CHAR_UUID,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Command => write!(f, "command ({})", COMMAND_CHAR_UUID),
            Channel::Status => write!(f, "status ({})", STATUS_CHAR_UUID),
        }
    }
}
