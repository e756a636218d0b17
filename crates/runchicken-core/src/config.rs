//! 设置和持久化
//!
//! 设置保存在 `<config_dir>/runchicken/settings.toml`。缺失的字段取默认值，
//! 文件不存在或无法解析时整体使用默认值。

use crate::ble::retry::RetryPolicy;
use crate::device::DeviceOptions;
use crate::refresh::RefreshConfig;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 单个重试策略的配置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }
}

impl From<RetryPolicy> for RetrySettings {
    fn from(policy: RetryPolicy) -> Self {
        Self {
            max_attempts: policy.max_attempts,
            initial_backoff_ms: u64::try_from(policy.initial_backoff.as_millis()).unwrap_or(u64::MAX),
            max_backoff_ms: u64::try_from(policy.max_backoff.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// 设备 MAC 地址，例如 `00:80:E1:22:43:0D`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// 周期读取状态的间隔
    pub poll_interval_secs: u64,
    /// 设备重新出现后请求刷新的防抖时间
    pub presence_debounce_secs: u64,
    pub connect_timeout_secs: u64,
    pub io_timeout_secs: u64,
    /// 是否订阅状态通知
    pub subscribe_notifications: bool,
    pub connect_retry: RetrySettings,
    pub command_retry: RetrySettings,
    pub poll_retry: RetrySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            address: None,
            poll_interval_secs: 300,
            presence_debounce_secs: 10,
            connect_timeout_secs: 10,
            io_timeout_secs: 5,
            subscribe_notifications: true,
            connect_retry: RetryPolicy::connect().into(),
            command_retry: RetryPolicy::command().into(),
            poll_retry: RetryPolicy::poll().into(),
        }
    }
}

impl Settings {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("runchicken")
            .join("settings.toml")
    }

    /// 加载设置（如果文件不存在则使用默认值）
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(settings) => {
                        debug!("Loaded settings from {:?}", path);
                        return settings;
                    }
                    Err(e) => {
                        warn!("Failed to parse settings: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    warn!("Failed to read settings file: {}, using defaults", e);
                }
            }
        }
        Self::default()
    }

    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }

    pub fn device_options(&self) -> DeviceOptions {
        DeviceOptions {
            connect_retry: self.connect_retry.policy(),
            command_retry: self.command_retry.policy(),
            poll_retry: self.poll_retry.policy(),
        }
    }

    pub fn refresh_config(&self) -> RefreshConfig {
        RefreshConfig {
            interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            debounce: Duration::from_secs(self.presence_debounce_secs),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }
}
