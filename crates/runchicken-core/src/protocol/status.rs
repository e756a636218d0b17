//! 状态载荷解码
//!
//! 状态特征值至少 18 字节，偏移 17 为门状态码：
//! - `0`: 打开
//! - `1`: 关闭
//!
//! 偏移 18 之后的字节 (新固件可能携带的遥测) 不做解释，按 `raw_<offset>`
//! 保留为辅助读数，避免静默丢弃。

use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::to_hex;

pub const STATUS_PAYLOAD_MIN_LEN: usize = 18;
const OFFSET_DOOR_STATE: usize = 17;

/// 门状态的字段名
pub const DOOR_STATE_FIELD: &str = "door_state";
/// 无法识别的门状态码保存在此辅助读数下
pub const DOOR_STATE_CODE_FIELD: &str = "door_state_code";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoorState {
    #[default]
    Unknown,
    Open,
    Closed,
}

impl DoorState {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(DoorState::Open),
            1 => Some(DoorState::Closed),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DoorState::Unknown => "unknown",
            DoorState::Open => "open",
            DoorState::Closed => "closed",
        }
    }
}

impl fmt::Display for DoorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 辅助数值读数
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reading {
    Int(i64),
    Float(f64),
}

impl From<u8> for Reading {
    fn from(v: u8) -> Self {
        Reading::Int(i64::from(v))
    }
}

impl From<i64> for Reading {
    fn from(v: i64) -> Self {
        Reading::Int(v)
    }
}

impl From<f64> for Reading {
    fn from(v: f64) -> Self {
        Reading::Float(v)
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reading::Int(v) => write!(f, "{}", v),
            Reading::Float(v) => write!(f, "{}", v),
        }
    }
}

/// 解码得到的单个字段
///
/// 已知的结构化字段各有一个变体，其余一律进入 `Auxiliary`。
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedField {
    DoorState(DoorState),
    Auxiliary { name: String, value: Reading },
}

impl DecodedField {
    pub fn auxiliary(name: impl Into<String>, value: impl Into<Reading>) -> Self {
        DecodedField::Auxiliary {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            DecodedField::DoorState(_) => DOOR_STATE_FIELD,
            DecodedField::Auxiliary { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("Status payload too short: {len} bytes, need at least {}", STATUS_PAYLOAD_MIN_LEN)]
    PayloadTooShort { len: usize },

    /// 载荷结构完整，但状态码没有已知映射。`fields` 是应当应用的兜底字段
    /// (门状态 Unknown + 原始状态码)。
    #[error("Unrecognized door status code: {code:#04x}")]
    UnrecognizedStatusCode { code: u8, fields: Vec<DecodedField> },
}

impl DecodeError {
    /// 出错时仍应应用到设备状态的字段
    pub fn fallback_fields(&self) -> &[DecodedField] {
        match self {
            DecodeError::PayloadTooShort { .. } => &[],
            DecodeError::UnrecognizedStatusCode { fields, .. } => fields,
        }
    }
}

/// 解码状态载荷
pub fn decode_status(payload: &[u8]) -> Result<Vec<DecodedField>, DecodeError> {
    debug!("Parsing status payload: {}", to_hex(payload));

    if payload.len() < STATUS_PAYLOAD_MIN_LEN {
        return Err(DecodeError::PayloadTooShort { len: payload.len() });
    }

    let code = payload[OFFSET_DOOR_STATE];
    let trailing = payload
        .iter()
        .enumerate()
        .skip(STATUS_PAYLOAD_MIN_LEN)
        .map(|(offset, &b)| DecodedField::auxiliary(format!("raw_{}", offset), b));

    let mut fields = Vec::with_capacity(2 + payload.len() - STATUS_PAYLOAD_MIN_LEN);
    match DoorState::from_code(code) {
        Some(state) => {
            fields.push(DecodedField::DoorState(state));
            fields.extend(trailing);
            Ok(fields)
        }
        None => {
            fields.push(DecodedField::DoorState(DoorState::Unknown));
            fields.push(DecodedField::auxiliary(DOOR_STATE_CODE_FIELD, code));
            fields.extend(trailing);
            Err(DecodeError::UnrecognizedStatusCode { code, fields })
        }
    }
}
