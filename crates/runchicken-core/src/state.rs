//! 设备状态聚合
//!
//! [`StateAggregator`] 持有设备最后已知的状态。`apply` 是唯一的修改入口，
//! 轮询路径和通知路径都经由它更新状态，每次更新后通过 watch 通道发布。

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::watch;

use crate::protocol::DOOR_STATE_CODE_FIELD;
pub use crate::protocol::{DecodedField, DoorState, Reading};

pub const DEFAULT_MODEL: &str = "T-50";
pub const DEFAULT_MANUFACTURER: &str = "Run-Chicken";

/// 设备身份
///
/// 名称、型号、厂商仅用于显示，首次成功连接时确定，之后不再改变；
/// 地址跟随当前连接的设备。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub address: String,
    pub name: String,
    pub model: String,
    pub manufacturer: String,
}

impl DeviceIdentity {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: String::new(),
            model: DEFAULT_MODEL.to_string(),
            manufacturer: DEFAULT_MANUFACTURER.to_string(),
        }
    }

    pub fn friendly_name(&self) -> String {
        format!("Run-Chicken Door {}", self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub identity: DeviceIdentity,
    pub door_state: DoorState,
    /// 尚未建模的遥测字段
    pub readings: BTreeMap<String, Reading>,
}

impl DeviceState {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            identity: DeviceIdentity::new(address),
            door_state: DoorState::Unknown,
            readings: BTreeMap::new(),
        }
    }

    fn apply_field(&mut self, field: DecodedField) {
        match field {
            DecodedField::DoorState(state) => {
                // 识别出的状态使之前的未知状态码失效
                if state != DoorState::Unknown {
                    self.readings.remove(DOOR_STATE_CODE_FIELD);
                }
                self.door_state = state;
            }
            DecodedField::Auxiliary { name, value } => {
                self.readings.insert(name, value);
            }
        }
    }
}

struct Inner {
    state: DeviceState,
    identified: bool,
}

pub struct StateAggregator {
    inner: Mutex<Inner>,
    updates: watch::Sender<DeviceState>,
}

impl StateAggregator {
    pub fn new(address: impl Into<String>) -> Self {
        let state = DeviceState::new(address);
        let (updates, _) = watch::channel(state.clone());
        Self {
            inner: Mutex::new(Inner {
                state,
                identified: false,
            }),
            updates,
        }
    }

    /// 应用解码字段，返回更新后的状态
    ///
    /// 同名字段后写覆盖先写，未出现的字段保持不变。
    pub fn apply<I>(&self, fields: I) -> DeviceState
    where
        I: IntoIterator<Item = DecodedField>,
    {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        for field in fields {
            inner.state.apply_field(field);
        }
        debug!(
            "Device state updated: door={}, readings={}",
            inner.state.door_state,
            inner.state.readings.len()
        );
        let snapshot = inner.state.clone();
        self.updates.send_replace(snapshot.clone());
        snapshot
    }

    /// 记录当前连接的设备
    ///
    /// 地址随每次连接更新；名称只在首次连接时写入。
    /// 返回本次是否写入了显示身份。
    pub fn identify(&self, address: &str, name: Option<&str>) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut changed = false;
        if inner.state.identity.address != address {
            debug!(
                "Device address changed from {} to {}",
                inner.state.identity.address, address
            );
            inner.state.identity.address = address.to_string();
            changed = true;
        }

        let first = !inner.identified;
        if first {
            inner.identified = true;
            if let Some(name) = name {
                inner.state.identity.name = name.to_string();
            }
            info!(
                "Identified {} at {}",
                inner.state.identity.friendly_name(),
                address
            );
            changed = true;
        }

        if changed {
            self.updates.send_replace(inner.state.clone());
        }
        first
    }

    pub fn current(&self) -> DeviceState {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state
            .clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DeviceState> {
        self.updates.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let aggregator = StateAggregator::new("00:80:E1:22:43:0D");
        let state = aggregator.current();
        assert_eq!(state.door_state, DoorState::Unknown);
        assert!(state.readings.is_empty());
        assert_eq!(state.identity.model, "T-50");
        assert_eq!(state.identity.manufacturer, "Run-Chicken");
    }

    #[test]
    fn test_apply_door_state_and_readings() {
        let aggregator = StateAggregator::new("AA");
        let state = aggregator.apply([
            DecodedField::DoorState(DoorState::Closed),
            DecodedField::auxiliary("battery_mv", 3712_i64),
        ]);
        assert_eq!(state.door_state, DoorState::Closed);
        assert_eq!(state.readings.get("battery_mv"), Some(&Reading::Int(3712)));
        assert_eq!(aggregator.current(), state);
    }

    #[test]
    fn test_disjoint_applies_equal_combined_apply() {
        let first = vec![
            DecodedField::DoorState(DoorState::Open),
            DecodedField::auxiliary("a", 1_i64),
        ];
        let second = vec![
            DecodedField::auxiliary("b", 2.5),
            DecodedField::auxiliary("c", 3_i64),
        ];

        let sequential = StateAggregator::new("AA");
        sequential.apply(first.clone());
        let sequential = sequential.apply(second.clone());

        let combined = StateAggregator::new("AA");
        let combined = combined.apply(first.into_iter().chain(second));

        assert_eq!(sequential, combined);
    }

    #[test]
    fn test_last_write_wins_and_unrelated_fields_untouched() {
        let aggregator = StateAggregator::new("AA");
        aggregator.apply([
            DecodedField::DoorState(DoorState::Open),
            DecodedField::auxiliary("a", 1_i64),
            DecodedField::auxiliary("b", 1_i64),
        ]);
        let state = aggregator.apply([
            DecodedField::auxiliary("a", 9_i64),
            DecodedField::auxiliary("a", 10_i64),
        ]);

        assert_eq!(state.door_state, DoorState::Open);
        assert_eq!(state.readings.get("a"), Some(&Reading::Int(10)));
        assert_eq!(state.readings.get("b"), Some(&Reading::Int(1)));
    }

    #[test]
    fn test_recognized_state_clears_unknown_code() {
        let aggregator = StateAggregator::new("AA");
        aggregator.apply([
            DecodedField::DoorState(DoorState::Unknown),
            DecodedField::auxiliary(DOOR_STATE_CODE_FIELD, 0x42_i64),
            DecodedField::auxiliary("raw_18", 7_i64),
        ]);
        let state = aggregator.apply([DecodedField::DoorState(DoorState::Closed)]);

        assert_eq!(state.door_state, DoorState::Closed);
        assert!(!state.readings.contains_key(DOOR_STATE_CODE_FIELD));
        assert_eq!(state.readings.get("raw_18"), Some(&Reading::Int(7)));
    }

    #[test]
    fn test_identity_is_set_once() {
        let aggregator = StateAggregator::new("AA");
        assert!(aggregator.identify("AA", Some("RC-0D")));
        assert!(!aggregator.identify("AA", Some("Renamed")));

        let identity = aggregator.current().identity;
        assert_eq!(identity.name, "RC-0D");
        assert_eq!(identity.friendly_name(), "Run-Chicken Door RC-0D");
    }

    #[test]
    fn test_identify_tracks_address_but_keeps_name() {
        let aggregator = StateAggregator::new("AA");
        aggregator.identify("AA", Some("RC-0D"));
        let mut rx = aggregator.subscribe();

        assert!(!aggregator.identify("BB", Some("Other")));
        assert!(rx.has_changed().unwrap());

        let identity = rx.borrow_and_update().identity.clone();
        assert_eq!(identity.address, "BB");
        assert_eq!(identity.name, "RC-0D");
    }

    #[test]
    fn test_updates_are_published() {
        let aggregator = StateAggregator::new("AA");
        let mut rx = aggregator.subscribe();
        aggregator.apply([DecodedField::DoorState(DoorState::Closed)]);

        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().door_state, DoorState::Closed);
    }
}
