//! 错误类型
//!
//! 所有面向调用方的操作都返回 [`LinkError`]。权限和适配器错误会立即中止当前操作；
//! 断开连接不是错误，而是通过 `SessionEvent::Disconnected` 上报。

use crate::ble::session::LinkState;
use crate::permission::Capability;
use uuid::Uuid;

/// BLE 会话错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("Permission denied: {0}")]
    PermissionDenied(Capability),

    #[error("Bluetooth adapter unavailable")]
    AdapterUnavailable,

    #[error("Service not found: {0}")]
    ServiceNotFound(Uuid),

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("Session not ready (state: {0})")]
    NotReady(LinkState),

    #[error("Payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("A scan is already in progress")]
    ScanInProgress,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Session driver is gone")]
    SessionClosed,

    #[error("Transport failure: {0}")]
    TransportFailure(String),
}

impl From<btleplug::Error> for LinkError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::PermissionDenied => LinkError::PermissionDenied(Capability::Connect),
            other => LinkError::TransportFailure(other.to_string()),
        }
    }
}

pub type Result<T, E = LinkError> = std::result::Result<T, E>;
