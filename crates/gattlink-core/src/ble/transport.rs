//! 传输层抽象
//!
//! 平台蓝牙栈的最小接口。请求类操作（`connect`、`discover_services`、
//! `write_descriptor`）只负责发出请求，结果通过 [`TransportEvent`] 通道异步上报；
//! `write_characteristic` 等待对端确认后返回。

use crate::ble::Advertisement;
use crate::error::Result;
use futures_util::stream::BoxStream;
use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

pub const GATT_SUCCESS: GattStatus = 0x00;
/// 通用 GATT 错误 (Android 上的 133)
pub const GATT_ERROR: GattStatus = 0x85;

pub type GattStatus = u8;

pub type AdvertisementStream = BoxStream<'static, Advertisement>;

/// 传输层事件的接收端，由传输实现创建时一并返回
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// 一条物理连接的句柄
///
/// 每次 `connect` 都会分配新的 `id`，旧连接的迟到事件不会作用于新会话。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkHandle {
    pub id: u64,
    pub address: String,
}

impl fmt::Display for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.address, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

impl DiscoveredService {
    pub fn new(uuid: Uuid, characteristics: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            uuid,
            characteristics: characteristics.into_iter().collect(),
        }
    }

    pub fn has_characteristic(&self, uuid: Uuid) -> bool {
        self.characteristics.contains(&uuid)
    }
}

/// 平台回调事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    LinkUp {
        link: LinkHandle,
    },
    LinkDown {
        link: LinkHandle,
    },
    ServicesDiscovered {
        link: LinkHandle,
        result: std::result::Result<Vec<DiscoveredService>, GattStatus>,
    },
    Notification {
        link: LinkHandle,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    DescriptorWritten {
        link: LinkHandle,
        descriptor: Uuid,
        status: GattStatus,
    },
}

impl TransportEvent {
    pub fn link(&self) -> &LinkHandle {
        match self {
            TransportEvent::LinkUp { link }
            | TransportEvent::LinkDown { link }
            | TransportEvent::ServicesDiscovered { link, .. }
            | TransportEvent::Notification { link, .. }
            | TransportEvent::DescriptorWritten { link, .. } => link,
        }
    }
}

/// 平台蓝牙栈
#[async_trait::async_trait]
pub trait BleTransport: Send + Sync {
    /// 开始扫描；适配器不存在或未开启时返回 `AdapterUnavailable`
    async fn start_scan(&self) -> Result<AdvertisementStream>;

    async fn stop_scan(&self) -> Result<()>;

    /// 发起连接，连接建立后上报 `LinkUp`
    async fn connect(&self, address: &str) -> Result<LinkHandle>;

    /// 发起服务发现，完成后上报 `ServicesDiscovered`
    async fn discover_services(&self, link: &LinkHandle) -> Result<()>;

    /// 写入特征值（带响应），等待确认后返回
    async fn write_characteristic(
        &self,
        link: &LinkHandle,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<()>;

    async fn set_notification(
        &self,
        link: &LinkHandle,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<()>;

    /// 写入描述符，完成后上报 `DescriptorWritten`
    async fn write_descriptor(
        &self,
        link: &LinkHandle,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<()>;

    async fn disconnect(&self, link: &LinkHandle) -> Result<()>;
}
