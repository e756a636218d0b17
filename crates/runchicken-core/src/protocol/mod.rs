//! Run-Chicken 线协议
//!
//! - **packet**: 开/关门命令包 (写入命令特征)
//! - **status**: 状态载荷 (从状态特征读取或通知)
//!
//! 两者都是纯函数，不依赖时钟或传输层。

pub mod packet;
pub mod status;

pub use packet::{
    COMMAND_PACKET_LEN, CommandPacket, DoorCommand, EncodeError, checksum, encode_command,
};
pub use status::{
    DOOR_STATE_CODE_FIELD, DOOR_STATE_FIELD, DecodeError, DecodedField, DoorState, Reading,
    STATUS_PAYLOAD_MIN_LEN, decode_status,
};

/// 调试日志用的十六进制表示
pub(crate) fn to_hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}
