//! GattLink Core Library
//!
//! BLE GATT 中心端会话管理：扫描附近外设、连接、发现服务、订阅通知、写入消息。
//!
//! # 模块
//!
//! - **ble**: 传输层抽象、扫描控制器、设备列表、GATT 会话
//! - **permission**: 扫描/连接权限检查
//! - **config**: 服务 UUID 和扫描设置
//! - **workflow**: 对外的会话外观
//!
//! # 使用示例
//!
//! ```ignore
//! use gattlink_core::{AllowAll, BtleplugTransport, LinkConfig, SessionFacade};
//!
//! let (transport, events) = BtleplugTransport::new().await?;
//! let facade = SessionFacade::new(Arc::new(transport), events, Arc::new(AllowAll), LinkConfig::load());
//!
//! // 1. 扫描
//! facade.scan().await?;
//!
//! // 2. 连接到列表中的设备
//! let device = facade.devices().into_iter().next().unwrap();
//! facade.connect(device).await?;
//!
//! // 3. 等待 Ready 后发送
//! facade.observe_state().wait_for(|s| s.link == LinkState::Ready).await?;
//! facade.send_text("hello").await?;
//!
//! // 4. 接收通知
//! let mut inbound = facade.observe_inbound();
//! while let Some(msg) = inbound.next().await {
//!     println!("{}", msg.text());
//! }
//! ```

pub mod ble;
pub mod config;
pub mod error;
pub mod permission;
pub mod workflow;

// BLE re-exports
pub use ble::client::BtleplugTransport;
pub use ble::mock::MockTransport;
pub use ble::registry::DeviceRegistry;
pub use ble::scanner::{ScanController, ScanPhase, ScanStart};
pub use ble::session::{GattSession, InboundMessage, LinkState, SessionEvent};
pub use ble::transport::{BleTransport, LinkHandle, TransportEvent};
pub use ble::{
    Advertisement, NOTIFY_CHAR_UUID, PeripheralRef, SERVICE_UUID, ServiceDescriptor,
    WRITE_CHAR_UUID,
};

pub use config::{LinkConfig, ScanRepeat, ScanSettings};
pub use error::{LinkError, Result};
pub use permission::{AllowAll, Capability, CapabilityGate, PermissionProvider, StaticPermissions};
pub use workflow::{LinkStatus, SessionFacade};
