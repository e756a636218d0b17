//! 守护进程 IPC 消息
//!
//! Unix Domain Socket 上每行一个 JSON 对象，请求和响应一一对应。

use crate::state::DeviceState;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub fn socket_path() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join("runchicken.sock")
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum IpcRequest {
    /// 返回缓存的状态，不访问设备
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "open")]
    Open,
    #[serde(rename = "close")]
    Close,
    /// 立即读取设备状态
    #[serde(rename = "poll")]
    Poll,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum IpcResponse {
    #[serde(rename = "ok")]
    Ok { message: String },
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "state")]
    State {
        state: DeviceState,
        /// 会话状态的可读描述
        session: String,
    },
}
