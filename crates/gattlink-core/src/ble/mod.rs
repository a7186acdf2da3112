pub mod client;
pub mod mock;
pub mod registry;
pub mod scanner;
pub mod session;
pub mod transport;

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

pub const SERVICE_UUID: Uuid = Uuid::from_u128(0xab0828b1_198e_4351_b779_901fa0e0371e);
/// 写入特征 (RX)：中心设备 -> 外设
pub const WRITE_CHAR_UUID: Uuid = Uuid::from_u128(0x4ac8a682_9736_4e5d_932b_e9b31405049c);
/// 通知特征 (TX)：外设 -> 中心设备
pub const NOTIFY_CHAR_UUID: Uuid = Uuid::from_u128(0x84d4f420_e7f0_4b0c_b16a_a125b0521aed);
/// Client Characteristic Configuration Descriptor (0x2902)
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// 写入 CCCD 以启用通知的值
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// ATT 属性值的最大长度
pub const DEFAULT_MAX_PAYLOAD: usize = 512;

/// 会话使用的 GATT 服务描述
///
/// 这些 UUID 是编译期已知的配置，不是发现得到的数据。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceDescriptor {
    pub service: Uuid,
    pub write_characteristic: Uuid,
    pub notify_characteristic: Uuid,
    pub notify_descriptor: Uuid,
}

impl Default for ServiceDescriptor {
    fn default() -> Self {
        Self {
            service: SERVICE_UUID,
            write_characteristic: WRITE_CHAR_UUID,
            notify_characteristic: NOTIFY_CHAR_UUID,
            notify_descriptor: CCCD_UUID,
        }
    }
}

/// 扫描到的外设
///
/// 以地址为身份标识，发现后不可变。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeripheralRef {
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub last_seen: SystemTime,
}

impl PeripheralRef {
    pub fn new(address: impl AsRef<str>, name: Option<String>) -> Self {
        Self {
            address: normalize_address(address.as_ref()),
            name,
            rssi: None,
            last_seen: SystemTime::now(),
        }
    }

    pub fn with_rssi(mut self, rssi: Option<i16>) -> Self {
        self.rssi = rssi;
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<unknown>")
    }

    /// 是否带有非空的广播名称
    pub fn has_name(&self) -> bool {
        self.name.as_deref().is_some_and(|n| !n.trim().is_empty())
    }
}

impl From<&Advertisement> for PeripheralRef {
    fn from(adv: &Advertisement) -> Self {
        PeripheralRef::new(&adv.address, adv.local_name.clone()).with_rssi(adv.rssi)
    }
}

/// 传输层上报的一次广播
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: String,
    pub local_name: Option<String>,
    pub rssi: Option<i16>,
}

impl Advertisement {
    pub fn new(address: impl Into<String>, local_name: Option<&str>) -> Self {
        Self {
            address: address.into(),
            local_name: local_name.map(str::to_string),
            rssi: None,
        }
    }
}

/// 地址统一为大写，比较时不区分大小写
pub fn normalize_address(address: &str) -> String {
    address.trim().to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_descriptor_uuids() {
        let desc = ServiceDescriptor::default();
        assert_eq!(
            desc.service.to_string(),
            "ab0828b1-198e-4351-b779-901fa0e0371e"
        );
        assert_eq!(
            desc.write_characteristic.to_string(),
            "4ac8a682-9736-4e5d-932b-e9b31405049c"
        );
        assert_eq!(
            desc.notify_characteristic.to_string(),
            "84d4f420-e7f0-4b0c-b16a-a125b0521aed"
        );
        assert_eq!(
            desc.notify_descriptor.to_string(),
            "00002902-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_peripheral_address_normalized() {
        let p = PeripheralRef::new(" aa:bb:cc:dd:ee:ff ", Some("Sensor".into()));
        assert_eq!(p.address, "AA:BB:CC:DD:EE:FF");
        assert_eq!(p.display_name(), "Sensor");
    }

    #[test]
    fn test_has_name() {
        assert!(PeripheralRef::new("X", Some("ESP32".into())).has_name());
        assert!(!PeripheralRef::new("X", Some("  ".into())).has_name());
        assert!(!PeripheralRef::new("X", None).has_name());
    }
}
