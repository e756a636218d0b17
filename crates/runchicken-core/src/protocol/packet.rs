//! 命令包编码
//!
//! 命令包固定 32 字节，多字节字段为小端序：
//!
//! | 偏移 | 长度 | 内容 |
//! |------|------|------|
//! | 0    | 1    | 帧类型 `0x00` (门命令) |
//! | 1    | 4    | Unix 时间戳 (秒, u32) |
//! | 5    | 4    | 同一时间戳，重复一次 |
//! | 9    | 6    | 保留，全 0 |
//! | 15   | 1    | UTC 小时 |
//! | 16   | 1    | UTC 分钟 |
//! | 17   | 1    | UTC 小时，重复 |
//! | 18   | 1    | UTC 分钟，重复 |
//! | 19   | 2    | 保留，全 0 |
//! | 21   | 1    | 命令码: 开门 `0x01`, 关门 `0x02` |
//! | 22   | 9    | 保留，全 0 |
//! | 31   | 1    | CRC-8/SMBUS，覆盖前 31 字节 |
//!
//! 时间戳和时/分字段各出现两次，设备固件就是这样解析的，不能省略。

use chrono::{DateTime, Timelike, Utc};
use crc::{CRC_8_SMBUS, Crc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const COMMAND_PACKET_LEN: usize = 32;

const FRAME_TYPE_COMMAND: u8 = 0x00;
const OFFSET_TIMESTAMP: usize = 1;
const OFFSET_TIMESTAMP_REPEAT: usize = 5;
const OFFSET_HOUR: usize = 15;
const OFFSET_MINUTE: usize = 16;
const OFFSET_HOUR_REPEAT: usize = 17;
const OFFSET_MINUTE_REPEAT: usize = 18;
pub const OFFSET_COMMAND: usize = 21;
pub const OFFSET_CHECKSUM: usize = COMMAND_PACKET_LEN - 1;

/// poly 0x07, init 0x00, 不反射, 无输出异或
const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("Invalid door command: {0}")]
    InvalidCommand(String),

    #[error("Timestamp {0} does not fit in a 32-bit unix time")]
    TimestampOutOfRange(DateTime<Utc>),
}

/// 门命令
///
/// 只有两个变体，"同时开关" 或 "什么都不做" 在类型层面无法表示。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoorCommand {
    Open,
    Close,
}

impl DoorCommand {
    /// 线上的命令码
    pub fn code(self) -> u8 {
        match self {
            DoorCommand::Open => 0x01,
            DoorCommand::Close => 0x02,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DoorCommand::Open => "open",
            DoorCommand::Close => "close",
        }
    }

    /// 从一对开/关标志构造，两者必须恰好一个为真
    pub fn from_flags(open: bool, close: bool) -> Result<Self, EncodeError> {
        match (open, close) {
            (true, false) => Ok(DoorCommand::Open),
            (false, true) => Ok(DoorCommand::Close),
            (true, true) => Err(EncodeError::InvalidCommand(
                "only one door command can be sent at a time".to_string(),
            )),
            (false, false) => Err(EncodeError::InvalidCommand(
                "one of open or close must be requested".to_string(),
            )),
        }
    }
}

impl fmt::Display for DoorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DoorCommand {
    type Err = EncodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "open" => Ok(DoorCommand::Open),
            "close" => Ok(DoorCommand::Close),
            other => Err(EncodeError::InvalidCommand(format!(
                "unknown command '{}'",
                other
            ))),
        }
    }
}

/// 编码完成的命令包
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandPacket([u8; COMMAND_PACKET_LEN]);

impl CommandPacket {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn command_code(&self) -> u8 {
        self.0[OFFSET_COMMAND]
    }

    pub fn checksum(&self) -> u8 {
        self.0[OFFSET_CHECKSUM]
    }
}

impl AsRef<[u8]> for CommandPacket {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<CommandPacket> for Vec<u8> {
    fn from(packet: CommandPacket) -> Self {
        packet.0.to_vec()
    }
}

/// CRC-8/SMBUS 校验
pub fn checksum(data: &[u8]) -> u8 {
    CRC8.checksum(data)
}

/// 编码门命令
///
/// `timestamp` 由调用方提供 (通常来自 [`crate::door::Clock`])，本函数不读取系统时钟。
pub fn encode_command(
    command: DoorCommand,
    timestamp: DateTime<Utc>,
) -> Result<CommandPacket, EncodeError> {
    let unix_time = u32::try_from(timestamp.timestamp())
        .map_err(|_| EncodeError::TimestampOutOfRange(timestamp))?;
    // hour() 在 0..24，minute() 在 0..60
    let hour = timestamp.hour() as u8;
    let minute = timestamp.minute() as u8;

    let mut buf = [0u8; COMMAND_PACKET_LEN];
    buf[0] = FRAME_TYPE_COMMAND;
    buf[OFFSET_TIMESTAMP..OFFSET_TIMESTAMP + 4].copy_from_slice(&unix_time.to_le_bytes());
    buf[OFFSET_TIMESTAMP_REPEAT..OFFSET_TIMESTAMP_REPEAT + 4]
        .copy_from_slice(&unix_time.to_le_bytes());
    buf[OFFSET_HOUR] = hour;
    buf[OFFSET_MINUTE] = minute;
    buf[OFFSET_HOUR_REPEAT] = hour;
    buf[OFFSET_MINUTE_REPEAT] = minute;
    buf[OFFSET_COMMAND] = command.code();
    buf[OFFSET_CHECKSUM] = checksum(&buf[..OFFSET_CHECKSUM]);

    Ok(CommandPacket(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const OPEN_2023_01_01: [u8; 32] = [
        0x00, 0x00, 0xcd, 0xb0, 0x63, 0x00, 0xcd, 0xb0, 0x63, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0xa8,
    ];

    const CLOSE_2023_01_01: [u8; 32] = [
        0x00, 0x00, 0xcd, 0xb0, 0x63, 0x00, 0xcd, 0xb0, 0x63, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x10,
    ];

    fn new_year_2023() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_crc8_smbus_check_value() {
        // CRC 目录中 CRC-8/SMBUS 的标准校验值
        assert_eq!(checksum(b"123456789"), 0xf4);
        assert_eq!(checksum(&[]), 0x00);
    }

    #[test]
    fn test_open_golden_vector() {
        let packet = encode_command(DoorCommand::Open, new_year_2023()).unwrap();
        assert_eq!(packet.as_bytes(), &OPEN_2023_01_01);
    }

    #[test]
    fn test_close_golden_vector() {
        let packet = encode_command(DoorCommand::Close, new_year_2023()).unwrap();
        assert_eq!(packet.as_bytes(), &CLOSE_2023_01_01);
    }

    #[test]
    fn test_hour_and_minute_fields() {
        let t = Utc.with_ymd_and_hms(2025, 11, 8, 19, 37, 45).unwrap();
        let packet = encode_command(DoorCommand::Open, t).unwrap();
        let bytes = packet.as_bytes();

        assert_eq!(&bytes[1..5], &[0x09, 0x9c, 0x0f, 0x69]);
        assert_eq!(&bytes[5..9], &[0x09, 0x9c, 0x0f, 0x69]);
        assert_eq!(&bytes[15..19], &[19, 37, 19, 37]);
        assert_eq!(packet.checksum(), 0xbc);
    }

    #[test]
    fn test_length_and_checksum_hold_for_many_timestamps() {
        let start = new_year_2023().timestamp();
        for step in 0..500i64 {
            let t = Utc.timestamp_opt(start + step * 7_919, 0).unwrap();
            for command in [DoorCommand::Open, DoorCommand::Close] {
                let packet = encode_command(command, t).unwrap();
                let bytes = packet.as_bytes();
                assert_eq!(bytes.len(), COMMAND_PACKET_LEN);
                assert_eq!(bytes[OFFSET_CHECKSUM], checksum(&bytes[..OFFSET_CHECKSUM]));
                assert_eq!(bytes[0], 0x00);
            }
        }
    }

    #[test]
    fn test_open_and_close_differ_only_in_command_and_checksum() {
        let t = Utc.with_ymd_and_hms(2024, 6, 30, 5, 4, 3).unwrap();
        let open = encode_command(DoorCommand::Open, t).unwrap();
        let close = encode_command(DoorCommand::Close, t).unwrap();

        let differing: Vec<usize> = open
            .as_bytes()
            .iter()
            .zip(close.as_bytes())
            .enumerate()
            .filter(|(_, (a, b))| a != b)
            .map(|(i, _)| i)
            .collect();

        assert_eq!(differing, vec![OFFSET_COMMAND, OFFSET_CHECKSUM]);
        assert_eq!(open.command_code(), 0x01);
        assert_eq!(close.command_code(), 0x02);
    }

    #[test]
    fn test_timestamp_out_of_range() {
        let before_epoch = Utc.with_ymd_and_hms(1969, 12, 31, 23, 59, 59).unwrap();
        assert!(matches!(
            encode_command(DoorCommand::Open, before_epoch),
            Err(EncodeError::TimestampOutOfRange(_))
        ));

        let after_u32 = Utc.timestamp_opt(i64::from(u32::MAX) + 1, 0).unwrap();
        assert!(matches!(
            encode_command(DoorCommand::Close, after_u32),
            Err(EncodeError::TimestampOutOfRange(_))
        ));
    }

    #[test]
    fn test_command_from_flags() {
        assert_eq!(DoorCommand::from_flags(true, false), Ok(DoorCommand::Open));
        assert_eq!(DoorCommand::from_flags(false, true), Ok(DoorCommand::Close));
        assert!(matches!(
            DoorCommand::from_flags(true, true),
            Err(EncodeError::InvalidCommand(_))
        ));
        assert!(matches!(
            DoorCommand::from_flags(false, false),
            Err(EncodeError::InvalidCommand(_))
        ));
    }

    #[test]
    fn test_command_from_str() {
        assert_eq!("open".parse::<DoorCommand>(), Ok(DoorCommand::Open));
        assert_eq!(" CLOSE ".parse::<DoorCommand>(), Ok(DoorCommand::Close));
        assert!(matches!(
            "toggle".parse::<DoorCommand>(),
            Err(EncodeError::InvalidCommand(_))
        ));
    }
}
