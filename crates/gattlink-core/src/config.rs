//! 会话配置和持久化
//!
//! 服务/特征 UUID、扫描超时和过滤策略等设置的存储和读取。

use crate::ble::{DEFAULT_MAX_PAYLOAD, ServiceDescriptor};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 默认扫描时长
pub const DEFAULT_SCAN_TIMEOUT_MS: u64 = 5000;

/// 扫描进行中再次调用 `start_scan` 时的行为
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScanRepeat {
    /// 停止当前扫描（与手机端按钮的行为一致）
    #[default]
    Toggle,
    /// 返回 `ScanInProgress`
    Reject,
}

/// 扫描设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    /// 扫描时长（毫秒）
    pub timeout_ms: u64,
    /// 只上报带广播名称的设备
    pub require_name: bool,
    pub repeat: ScanRepeat,
    /// 每次开始扫描时清空设备列表
    pub clear_on_start: bool,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_SCAN_TIMEOUT_MS,
            require_name: true,
            repeat: ScanRepeat::Toggle,
            clear_on_start: false,
        }
    }
}

impl ScanSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// 会话配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// 单次写入的最大字节数
    pub max_payload: usize,
    /// 详细日志模式
    pub verbose: bool,
    pub service: ServiceDescriptor,
    pub scan: ScanSettings,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            verbose: false,
            service: ServiceDescriptor::default(),
            scan: ScanSettings::default(),
        }
    }
}

impl LinkConfig {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gattlink");
        config_dir.join("config.toml")
    }

    /// 加载配置（如果文件不存在则使用默认值）
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(config) => {
                        debug!("Loaded config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        log::warn!("Failed to parse config: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read config file: {}, using defaults", e);
                }
            }
        }
        Self::default()
    }

    /// 保存配置
    pub fn save(&self) -> anyhow::Result<PathBuf> {
        let path = Self::config_path();
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        debug!("Saved config to {:?}", path);
        Ok(())
    }
}
