//! GATT 会话状态机
//!
//! 一个 [`GattSession`] 对应一条连接，每次 `connect` 都新建。状态流转：
//!
//! ```text
//! Disconnected -> Connecting -> ServiceDiscovery -> Ready -> Disconnected
//!                     \________________\_______________\____-> Failed
//! ```
//!
//! 会话本身不做并发控制，所有方法都由外观层的驱动任务串行调用。

use crate::ble::transport::{
    BleTransport, DiscoveredService, GATT_SUCCESS, GattStatus, LinkHandle, TransportEvent,
};
use crate::ble::{ENABLE_NOTIFICATION_VALUE, PeripheralRef, ServiceDescriptor};
use crate::error::{LinkError, Result};
use crate::permission::{Capability, CapabilityGate};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    ServiceDiscovery,
    Ready,
    Failed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Disconnected => "Disconnected",
            LinkState::Connecting => "Connecting",
            LinkState::ServiceDiscovery => "ServiceDiscovery",
            LinkState::Ready => "Ready",
            LinkState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// 通知特征收到的一条消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub address: String,
    pub characteristic: Uuid,
    pub payload: Vec<u8>,
    pub received_at: SystemTime,
}

impl InboundMessage {
    /// 按 UTF-8 解码（非法字节替换为 U+FFFD）
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// 会话生命周期事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// 物理连接已建立，正在发现服务
    Connected(PeripheralRef),
    /// 服务解析完成
    Ready { writable: bool },
    /// CCCD 写入成功
    NotificationsEnabled,
    /// 非致命问题：缺少特征、缺少服务、通知开启失败等
    Degraded(LinkError),
    DiscoveryFailed { status: GattStatus },
    Disconnected { address: String },
    Failed(LinkError),
    Inbound(InboundMessage),
}

pub struct GattSession {
    peripheral: PeripheralRef,
    service: ServiceDescriptor,
    max_payload: usize,
    transport: Arc<dyn BleTransport>,
    gate: CapabilityGate,
    link: Option<LinkHandle>,
    state: LinkState,
    write_char: Option<Uuid>,
    notify_char: Option<Uuid>,
    notifying: bool,
}

impl GattSession {
    pub fn new(
        peripheral: PeripheralRef,
        service: ServiceDescriptor,
        max_payload: usize,
        transport: Arc<dyn BleTransport>,
        gate: CapabilityGate,
    ) -> Self {
        Self {
            peripheral,
            service,
            max_payload,
            transport,
            gate,
            link: None,
            state: LinkState::Disconnected,
            write_char: None,
            notify_char: None,
            notifying: false,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn peripheral(&self) -> &PeripheralRef {
        &self.peripheral
    }

    pub fn link(&self) -> Option<&LinkHandle> {
        self.link.as_ref()
    }

    /// 事件是否属于本会话的当前连接
    pub fn owns(&self, link: &LinkHandle) -> bool {
        self.link.as_ref() == Some(link)
    }

    pub fn is_writable(&self) -> bool {
        self.state == LinkState::Ready && self.write_char.is_some()
    }

    pub fn is_notifying(&self) -> bool {
        self.notifying
    }

    /// Disconnected -> Connecting
    pub async fn connect(&mut self) -> Result<()> {
        if self.state != LinkState::Disconnected {
            return Err(LinkError::NotReady(self.state));
        }
        self.gate.require(Capability::Connect)?;

        info!("Connecting to {}", self.peripheral.address);
        self.state = LinkState::Connecting;
        match self.transport.connect(&self.peripheral.address).await {
            Ok(link) => {
                debug!("Link requested: {}", link);
                self.link = Some(link);
                Ok(())
            }
            Err(e) => {
                error!("Connect to {} failed: {}", self.peripheral.address, e);
                self.state = LinkState::Failed;
                Err(e)
            }
        }
    }

    /// 处理一条传输层事件，返回需要对外发布的事件
    pub async fn handle_event(&mut self, event: TransportEvent) -> Vec<SessionEvent> {
        if !self.owns(event.link()) {
            debug!("Ignoring event for stale link {}", event.link());
            return Vec::new();
        }

        match event {
            TransportEvent::LinkUp { .. } => self.on_link_up().await,
            TransportEvent::LinkDown { .. } => self.on_link_down(),
            TransportEvent::ServicesDiscovered { result, .. } => {
                self.on_services_discovered(result).await
            }
            TransportEvent::Notification {
                characteristic,
                value,
                ..
            } => self
                .on_notification(characteristic, value)
                .into_iter()
                .collect(),
            TransportEvent::DescriptorWritten {
                descriptor, status, ..
            } => self.on_descriptor_written(descriptor, status),
        }
    }

    async fn on_link_up(&mut self) -> Vec<SessionEvent> {
        if self.state != LinkState::Connecting {
            debug!("Link-up in state {}, ignored", self.state);
            return Vec::new();
        }
        info!("Connected to {}", self.peripheral.address);

        if let Err(e) = self.gate.require(Capability::Connect) {
            return vec![self.fail(e)];
        }

        self.state = LinkState::ServiceDiscovery;
        let Some(link) = self.link.clone() else {
            return Vec::new();
        };
        debug!("Discovering services...");
        if let Err(e) = self.transport.discover_services(&link).await {
            return vec![self.fail(e)];
        }
        vec![SessionEvent::Connected(self.peripheral.clone())]
    }

    fn on_link_down(&mut self) -> Vec<SessionEvent> {
        info!(
            "Disconnected from {} (was {})",
            self.peripheral.address, self.state
        );
        self.clear_handles();
        self.link = None;
        if self.state != LinkState::Failed {
            self.state = LinkState::Disconnected;
        }
        vec![SessionEvent::Disconnected {
            address: self.peripheral.address.clone(),
        }]
    }

    async fn on_services_discovered(
        &mut self,
        result: std::result::Result<Vec<DiscoveredService>, GattStatus>,
    ) -> Vec<SessionEvent> {
        if self.state != LinkState::ServiceDiscovery {
            debug!("Discovery result in state {}, ignored", self.state);
            return Vec::new();
        }

        let services = match result {
            Ok(services) => services,
            Err(status) => {
                warn!("Service discovery failed with status {}", status);
                self.release_link().await;
                self.state = LinkState::Disconnected;
                return vec![
                    SessionEvent::DiscoveryFailed { status },
                    SessionEvent::Disconnected {
                        address: self.peripheral.address.clone(),
                    },
                ];
            }
        };

        debug!(
            "Services discovered: {:?}",
            services.iter().map(|s| s.uuid).collect::<Vec<_>>()
        );
        let Some(service) = services.iter().find(|s| s.uuid == self.service.service) else {
            error!("Service {} not found", self.service.service);
            return vec![SessionEvent::Degraded(LinkError::ServiceNotFound(
                self.service.service,
            ))];
        };

        let write_uuid = self.service.write_characteristic;
        let notify_uuid = self.service.notify_characteristic;
        self.write_char = service.has_characteristic(write_uuid).then_some(write_uuid);
        self.notify_char = service.has_characteristic(notify_uuid).then_some(notify_uuid);
        self.state = LinkState::Ready;

        let mut events = vec![SessionEvent::Ready {
            writable: self.write_char.is_some(),
        }];

        if self.write_char.is_none() {
            error!("Write characteristic {} not found", write_uuid);
            events.push(SessionEvent::Degraded(LinkError::CharacteristicNotFound(
                write_uuid,
            )));
        }

        if self.notify_char.is_some() {
            if let Err(e) = self.enable_notifications(notify_uuid).await {
                warn!("Failed to enable notifications: {}", e);
                self.notify_char = None;
                events.push(SessionEvent::Degraded(e));
            }
        } else {
            error!("Notify characteristic {} not found", notify_uuid);
            events.push(SessionEvent::Degraded(LinkError::CharacteristicNotFound(
                notify_uuid,
            )));
        }

        events
    }

    async fn enable_notifications(&self, characteristic: Uuid) -> Result<()> {
        self.gate.require(Capability::Connect)?;
        let link = self.link.as_ref().ok_or(LinkError::NotReady(self.state))?;

        self.transport
            .set_notification(link, characteristic, true)
            .await?;
        self.transport
            .write_descriptor(
                link,
                characteristic,
                self.service.notify_descriptor,
                &ENABLE_NOTIFICATION_VALUE,
            )
            .await?;
        debug!("Notification enable requested for {}", characteristic);
        Ok(())
    }

    fn on_notification(&self, characteristic: Uuid, value: Vec<u8>) -> Option<SessionEvent> {
        if self.state != LinkState::Ready || self.notify_char != Some(characteristic) {
            debug!("Dropping notification from {}", characteristic);
            return None;
        }
        debug!("Received {} bytes", value.len());
        Some(SessionEvent::Inbound(InboundMessage {
            address: self.peripheral.address.clone(),
            characteristic,
            payload: value,
            received_at: SystemTime::now(),
        }))
    }

    fn on_descriptor_written(&mut self, descriptor: Uuid, status: GattStatus) -> Vec<SessionEvent> {
        if descriptor != self.service.notify_descriptor || self.notify_char.is_none() {
            return Vec::new();
        }
        if status == GATT_SUCCESS {
            info!("Notifications enabled");
            self.notifying = true;
            vec![SessionEvent::NotificationsEnabled]
        } else {
            warn!("Descriptor write failed with status {}", status);
            vec![SessionEvent::Degraded(LinkError::TransportFailure(format!(
                "descriptor write failed with status {status}"
            )))]
        }
    }

    /// 写入一条消息；不重试、不分片
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        if self.state != LinkState::Ready {
            return Err(LinkError::NotReady(self.state));
        }
        let characteristic = self
            .write_char
            .ok_or(LinkError::CharacteristicNotFound(
                self.service.write_characteristic,
            ))?;
        if payload.len() > self.max_payload {
            return Err(LinkError::PayloadTooLarge {
                len: payload.len(),
                max: self.max_payload,
            });
        }
        self.gate.require(Capability::Connect)?;
        let link = self.link.as_ref().ok_or(LinkError::NotReady(self.state))?;

        self.transport
            .write_characteristic(link, characteristic, payload)
            .await
            .inspect_err(|e| warn!("Write of {} bytes failed: {}", payload.len(), e))?;
        debug!("Wrote {} bytes to {}", payload.len(), characteristic);
        Ok(())
    }

    /// 主动关闭连接并释放句柄
    ///
    /// 返回 `Disconnected` 事件（仅当之前存在连接时）。
    pub async fn close(&mut self) -> Option<SessionEvent> {
        let had_link = self.link.is_some();
        self.release_link().await;
        self.clear_handles();
        if self.state != LinkState::Failed {
            self.state = LinkState::Disconnected;
        }
        had_link.then(|| SessionEvent::Disconnected {
            address: self.peripheral.address.clone(),
        })
    }

    async fn release_link(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        if self.gate.require(Capability::Connect).is_err() {
            return;
        }
        if let Err(e) = self.transport.disconnect(&link).await {
            warn!("Disconnect of {} failed: {}", link, e);
        }
    }

    fn clear_handles(&mut self) {
        self.write_char = None;
        self.notify_char = None;
        self.notifying = false;
    }

    fn fail(&mut self, err: LinkError) -> SessionEvent {
        error!("Session with {} failed: {}", self.peripheral.address, err);
        self.state = LinkState::Failed;
        SessionEvent::Failed(err)
    }
}

impl fmt::Debug for GattSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GattSession")
            .field("peripheral", &self.peripheral.address)
            .field("link", &self.link)
            .field("state", &self.state)
            .field("write_char", &self.write_char)
            .field("notify_char", &self.notify_char)
            .field("notifying", &self.notifying)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::mock::{MockTransport, TransportCall};
    use crate::ble::transport::{GATT_ERROR, TransportEvents};
    use crate::ble::{NOTIFY_CHAR_UUID, SERVICE_UUID, WRITE_CHAR_UUID};
    use crate::permission::StaticPermissions;

    fn session_with(mock: MockTransport) -> (GattSession, Arc<MockTransport>, TransportEvents) {
        let (mock, events) = mock.into_shared();
        let session = GattSession::new(
            PeripheralRef::new("X", Some("Device X".into())),
            ServiceDescriptor::default(),
            20,
            mock.clone(),
            CapabilityGate::allow_all(),
        );
        (session, mock, events)
    }

    /// 把传输层已产生的事件全部交给会话处理
    async fn pump(session: &mut GattSession, events: &mut TransportEvents) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.extend(session.handle_event(event).await);
        }
        out
    }

    #[tokio::test]
    async fn test_reaches_ready_and_exchanges_messages() {
        let (mut session, mock, mut events) = session_with(MockTransport::new());

        session.connect().await.unwrap();
        assert_eq!(session.state(), LinkState::Connecting);

        // LinkUp -> ServiceDiscovery -> Ready -> DescriptorWritten
        let out = pump(&mut session, &mut events).await;
        assert_eq!(session.state(), LinkState::Ready);
        assert!(out.contains(&SessionEvent::Ready { writable: true }));
        assert!(out.contains(&SessionEvent::NotificationsEnabled));
        assert!(session.is_notifying());

        session.send(b"hello").await.unwrap();
        assert_eq!(mock.writes(), vec![vec![0x68, 0x65, 0x6C, 0x6C, 0x6F]]);

        let link = session.link().cloned().unwrap();
        let out = session
            .handle_event(TransportEvent::Notification {
                link,
                characteristic: NOTIFY_CHAR_UUID,
                value: vec![0x6F, 0x6B],
            })
            .await;
        match out.as_slice() {
            [SessionEvent::Inbound(msg)] => assert_eq!(msg.text(), "ok"),
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_before_ready_is_rejected() {
        let (mut session, mock, _events) = session_with(MockTransport::new().manual_link_up());

        assert_eq!(
            session.send(b"x").await,
            Err(LinkError::NotReady(LinkState::Disconnected))
        );
        session.connect().await.unwrap();
        assert_eq!(
            session.send(b"x").await,
            Err(LinkError::NotReady(LinkState::Connecting))
        );
        assert!(mock.writes().is_empty());
    }

    #[tokio::test]
    async fn test_missing_write_characteristic_degrades() {
        let services = vec![DiscoveredService::new(SERVICE_UUID, [NOTIFY_CHAR_UUID])];
        let (mut session, mock, mut events) =
            session_with(MockTransport::new().with_services(services));

        session.connect().await.unwrap();
        let out = pump(&mut session, &mut events).await;

        assert_eq!(session.state(), LinkState::Ready);
        assert!(out.contains(&SessionEvent::Ready { writable: false }));
        assert!(out.contains(&SessionEvent::Degraded(
            LinkError::CharacteristicNotFound(WRITE_CHAR_UUID)
        )));
        assert_eq!(
            session.send(b"hello").await,
            Err(LinkError::CharacteristicNotFound(WRITE_CHAR_UUID))
        );
        assert!(mock.writes().is_empty());
    }

    #[tokio::test]
    async fn test_missing_notify_characteristic_is_non_fatal() {
        let services = vec![DiscoveredService::new(SERVICE_UUID, [WRITE_CHAR_UUID])];
        let (mut session, mock, mut events) =
            session_with(MockTransport::new().with_services(services));

        session.connect().await.unwrap();
        pump(&mut session, &mut events).await;

        assert!(session.is_writable());
        assert!(!session.is_notifying());
        assert!(
            !mock
                .calls()
                .iter()
                .any(|c| matches!(c, TransportCall::SetNotification { .. }))
        );
        session.send(b"ping").await.unwrap();
    }

    #[tokio::test]
    async fn test_service_not_found_keeps_link_open() {
        let other = Uuid::from_u128(0x1234);
        let services = vec![DiscoveredService::new(other, [WRITE_CHAR_UUID])];
        let (mut session, _mock, mut events) =
            session_with(MockTransport::new().with_services(services));

        session.connect().await.unwrap();
        let out = pump(&mut session, &mut events).await;

        assert_eq!(
            out.last(),
            Some(&SessionEvent::Degraded(LinkError::ServiceNotFound(
                SERVICE_UUID
            )))
        );
        assert_eq!(session.state(), LinkState::ServiceDiscovery);
        assert!(session.link().is_some());
        assert_eq!(
            session.send(b"x").await,
            Err(LinkError::NotReady(LinkState::ServiceDiscovery))
        );
    }

    #[tokio::test]
    async fn test_discovery_failure_disconnects() {
        let (mut session, mock, mut events) =
            session_with(MockTransport::new().with_discovery_failure(GATT_ERROR));

        session.connect().await.unwrap();
        let out = pump(&mut session, &mut events).await;

        assert!(out.contains(&SessionEvent::DiscoveryFailed { status: GATT_ERROR }));
        assert_eq!(session.state(), LinkState::Disconnected);
        assert!(session.link().is_none());
        assert!(
            mock.calls()
                .iter()
                .any(|c| matches!(c, TransportCall::Disconnect(_)))
        );
    }

    #[tokio::test]
    async fn test_link_down_before_discovery() {
        let (mut session, mock, mut events) = session_with(MockTransport::new().manual_link_up());

        session.connect().await.unwrap();
        mock.drop_link();
        let out = pump(&mut session, &mut events).await;

        assert_eq!(
            out,
            vec![SessionEvent::Disconnected {
                address: "X".into()
            }]
        );
        assert_eq!(session.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_stale_link_events_are_ignored() {
        let (mut session, _mock, mut events) = session_with(MockTransport::new().manual_link_up());
        session.connect().await.unwrap();

        let stale = LinkHandle {
            id: 999,
            address: "X".into(),
        };
        let out = session
            .handle_event(TransportEvent::LinkDown { link: stale })
            .await;
        assert!(out.is_empty());
        assert_eq!(session.state(), LinkState::Connecting);
        assert!(pump(&mut session, &mut events).await.is_empty());
    }

    #[tokio::test]
    async fn test_connect_permission_denied() {
        let (mock, _events) = MockTransport::new().into_shared();
        let gate = CapabilityGate::new(Arc::new(StaticPermissions::new([Capability::Scan])));
        let mut session = GattSession::new(
            PeripheralRef::new("X", None),
            ServiceDescriptor::default(),
            20,
            mock.clone(),
            gate,
        );

        assert_eq!(
            session.connect().await,
            Err(LinkError::PermissionDenied(Capability::Connect))
        );
        assert_eq!(session.state(), LinkState::Disconnected);
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_permission_revoked_before_link_up_fails() {
        let (mock, mut events) = MockTransport::new().into_shared();
        let perms = Arc::new(StaticPermissions::new([Capability::Connect]));
        let mut session = GattSession::new(
            PeripheralRef::new("X", None),
            ServiceDescriptor::default(),
            20,
            mock.clone(),
            CapabilityGate::new(perms.clone()),
        );

        session.connect().await.unwrap();
        perms.revoke(Capability::Connect);
        let out = pump(&mut session, &mut events).await;

        assert_eq!(
            out,
            vec![SessionEvent::Failed(LinkError::PermissionDenied(
                Capability::Connect
            ))]
        );
        assert_eq!(session.state(), LinkState::Failed);
    }

    #[tokio::test]
    async fn test_payload_too_large() {
        let (mut session, mock, mut events) = session_with(MockTransport::new());
        session.connect().await.unwrap();
        pump(&mut session, &mut events).await;

        let big = vec![0u8; 21];
        assert_eq!(
            session.send(&big).await,
            Err(LinkError::PayloadTooLarge { len: 21, max: 20 })
        );
        assert!(mock.writes().is_empty());
    }

    #[tokio::test]
    async fn test_transport_write_failure_is_reported() {
        let (mut session, _mock, mut events) = session_with(MockTransport::new().failing_writes());
        session.connect().await.unwrap();
        pump(&mut session, &mut events).await;

        assert!(matches!(
            session.send(b"hi").await,
            Err(LinkError::TransportFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_close_releases_link() {
        let (mut session, mock, mut events) = session_with(MockTransport::new());
        session.connect().await.unwrap();
        pump(&mut session, &mut events).await;

        let event = session.close().await;
        assert_eq!(
            event,
            Some(SessionEvent::Disconnected {
                address: "X".into()
            })
        );
        assert_eq!(session.state(), LinkState::Disconnected);
        assert!(!session.is_writable());
        assert!(mock.active_link().is_none());

        // 再次关闭不会产生事件
        assert_eq!(session.close().await, None);
    }
}
