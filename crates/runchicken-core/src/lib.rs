//! Run-Chicken Core Library
//!
//! Run-Chicken (T-50) 自动鸡舍门的 BLE 通信核心库
//!
//! # 模块
//!
//! - **protocol**: 命令包编码 (32 字节 + CRC-8) 与状态载荷解码
//! - **ble**: 传输层抽象、btleplug 实现、会话管理与重试策略
//! - **door**: 开门/关门命令
//! - **state**: 设备状态聚合
//! - **device**: 组合以上模块的设备门面
//! - **refresh**: 周期刷新触发器
//! - **config**: 设置的存储和读取
//!
//! # 使用示例
//!
//! ```ignore
//! use runchicken_core::{BtleTransport, DeviceOptions, RunChickenDevice};
//! use std::sync::Arc;
//!
//! let transport = Arc::new(BtleTransport::new().await?);
//! let device = RunChickenDevice::new(
//!     transport,
//!     Some("00:80:E1:22:43:0D".to_string()),
//!     DeviceOptions::default(),
//! );
//!
//! // 读取门状态
//! let state = device.poll_now().await?;
//! println!("Door is {}", state.door_state);
//!
//! // 关门 (不等待确认，状态由下一次读取或通知更新)
//! device.close().await?;
//! ```

pub mod ble;
pub mod config;
pub mod device;
pub mod door;
pub mod error;
pub mod ipc;
pub mod protocol;
pub mod refresh;
pub mod state;

pub use error::{Error, Result};

// BLE re-exports
pub use ble::btle::BtleTransport;
#[cfg(any(test, feature = "test-util"))]
pub use ble::mock::MockTransport;
pub use ble::retry::RetryPolicy;
pub use ble::session::{DeviceSession, SessionStatus};
pub use ble::transport::{Link, NotificationStream, Transport, TransportError};
pub use ble::{Channel, MANUFACTURER_ID};

// Protocol re-exports
pub use protocol::{
    CommandPacket, DecodeError, DecodedField, DoorCommand, DoorState, EncodeError, Reading,
    decode_status, encode_command,
};

pub use config::Settings;
pub use device::{DeviceOptions, RunChickenDevice};
pub use door::{Clock, DoorController, FixedClock, SystemClock};
pub use refresh::{RefreshConfig, RefreshHandle, RefreshReason, RefreshScheduler};
pub use state::{DeviceIdentity, DeviceState, StateAggregator};
