//! 会话外观
//!
//! 对外唯一入口：组合扫描控制器和 GATT 会话。
//!
//! 所有会话状态变化都在一个驱动任务里串行执行：调用方命令经 mpsc 发送（oneshot 回复），
//! 传输层事件经事件通道到达，两者在同一个 `select!` 循环里消费。
//!
//! 对外提供三个观察流：
//! - `observe_state()`：扫描阶段 + 连接状态的组合快照 (`watch`)
//! - `observe_events()`：生命周期事件 (`broadcast`)
//! - `observe_inbound()`：收到的消息

use crate::ble::{PeripheralRef, normalize_address};
use crate::ble::registry::DeviceRegistry;
use crate::ble::scanner::{ScanController, ScanPhase, ScanStart};
use crate::ble::session::{GattSession, InboundMessage, LinkState, SessionEvent};
use crate::ble::transport::{BleTransport, TransportEvent, TransportEvents};
use crate::config::LinkConfig;
use crate::error::{LinkError, Result};
use crate::permission::{CapabilityGate, PermissionProvider};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_stream::wrappers::BroadcastStream;

const COMMAND_CAPACITY: usize = 32;
const EVENT_CAPACITY: usize = 256;

/// 组合状态快照
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct LinkStatus {
    pub scan: ScanPhase,
    pub link: LinkState,
    pub peer: Option<PeripheralRef>,
    pub writable: bool,
    pub notifying: bool,
}

enum Command {
    Connect {
        peripheral: PeripheralRef,
        reply: oneshot::Sender<Result<()>>,
    },
    Send {
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// 会话外观句柄
///
/// 可以克隆；最后一个句柄被丢弃时驱动任务关闭当前连接并退出。
#[derive(Clone)]
pub struct SessionFacade {
    commands: mpsc::Sender<Command>,
    scanner: Arc<ScanController>,
    events: broadcast::Sender<SessionEvent>,
    status: watch::Receiver<LinkStatus>,
}

impl SessionFacade {
    /// 创建外观并启动驱动任务（需要在 tokio 运行时内调用）
    pub fn new(
        transport: Arc<dyn BleTransport>,
        transport_events: TransportEvents,
        permissions: Arc<dyn PermissionProvider>,
        config: LinkConfig,
    ) -> Self {
        let gate = CapabilityGate::new(permissions);
        let scanner = Arc::new(ScanController::new(
            transport.clone(),
            gate.clone(),
            DeviceRegistry::new(),
            config.scan.clone(),
        ));

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (status_tx, status_rx) = watch::channel(LinkStatus::default());

        let driver = Driver {
            transport,
            gate,
            config,
            scanner: scanner.clone(),
            session: None,
            commands: cmd_rx,
            transport_events,
            scan_phase: scanner.subscribe(),
            events: event_tx.clone(),
            status: status_tx,
        };
        tokio::spawn(driver.run());

        Self {
            commands: cmd_tx,
            scanner,
            events: event_tx,
            status: status_rx,
        }
    }

    /// 按配置的超时开始扫描
    pub async fn scan(&self) -> Result<ScanStart> {
        self.scanner.start().await
    }

    pub async fn scan_for(&self, timeout: Duration) -> Result<ScanStart> {
        self.scanner.start_scan(timeout).await
    }

    pub async fn stop_scan(&self) {
        self.scanner.stop_scan().await;
    }

    pub fn registry(&self) -> &DeviceRegistry {
        self.scanner.registry()
    }

    /// 已发现设备（插入顺序）
    pub fn devices(&self) -> Vec<PeripheralRef> {
        self.scanner.registry().list()
    }

    /// 按地址查找外设
    ///
    /// 已在设备列表中时直接返回；否则扫描直到发现该地址或扫描超时。
    /// 找到后立即停止扫描。
    pub async fn find_device(&self, address: &str, timeout: Duration) -> Result<PeripheralRef> {
        let wanted = normalize_address(address);
        if let Some(known) = self.registry().get(&wanted) {
            return Ok(known);
        }

        match self.scan_for(timeout).await? {
            ScanStart::Started(mut stream) => {
                while let Some(device) = stream.next().await {
                    if device.address == wanted {
                        self.stop_scan().await;
                        return Ok(device);
                    }
                }
            }
            ScanStart::Stopped => debug!("A running scan was toggled off"),
        }

        self.registry()
            .get(&wanted)
            .ok_or(LinkError::DeviceNotFound(wanted))
    }

    /// 连接到外设；已有会话时先关闭旧会话
    ///
    /// 返回时只表示连接请求已发出，后续进度通过事件流上报。
    pub async fn connect(&self, peripheral: PeripheralRef) -> Result<()> {
        self.request(|reply| Command::Connect { peripheral, reply })
            .await
    }

    /// 写入一条消息，等待传输层确认
    pub async fn send(&self, payload: impl Into<Vec<u8>>) -> Result<()> {
        let payload = payload.into();
        self.request(|reply| Command::Send { payload, reply }).await
    }

    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.send(text.as_bytes()).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// 收到的消息流（从订阅时刻开始）
    pub fn observe_inbound(&self) -> BoxStream<'static, InboundMessage> {
        BroadcastStream::new(self.events.subscribe())
            .filter_map(|event| async move {
                match event {
                    Ok(SessionEvent::Inbound(message)) => Some(message),
                    Ok(_) => None,
                    Err(e) => {
                        warn!("Inbound observer lagged: {}", e);
                        None
                    }
                }
            })
            .boxed()
    }

    pub fn observe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn observe_state(&self) -> watch::Receiver<LinkStatus> {
        self.status.clone()
    }

    pub fn status(&self) -> LinkStatus {
        self.status.borrow().clone()
    }

    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<()>>) -> Command,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| LinkError::SessionClosed)?;
        rx.await.map_err(|_| LinkError::SessionClosed)?
    }
}

/// 驱动任务：会话状态的唯一写入者
struct Driver {
    transport: Arc<dyn BleTransport>,
    gate: CapabilityGate,
    config: LinkConfig,
    scanner: Arc<ScanController>,
    session: Option<GattSession>,
    commands: mpsc::Receiver<Command>,
    transport_events: TransportEvents,
    scan_phase: watch::Receiver<ScanPhase>,
    events: broadcast::Sender<SessionEvent>,
    status: watch::Sender<LinkStatus>,
}

impl Driver {
    async fn run(mut self) {
        debug!("Session driver started");
        loop {
            tokio::select! {
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(cmd) => self.on_command(cmd).await,
                        None => break,
                    }
                }
                Some(event) = self.transport_events.recv() => {
                    self.on_transport_event(event).await;
                }
                Ok(()) = self.scan_phase.changed() => {
                    let phase = *self.scan_phase.borrow_and_update();
                    self.status.send_modify(|s| s.scan = phase);
                }
            }
        }

        self.teardown().await;
        self.publish_status();
        debug!("Session driver stopped");
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { peripheral, reply } => {
                let result = self.connect(peripheral).await;
                let _ = reply.send(result);
            }
            Command::Send { payload, reply } => {
                let result = match &self.session {
                    Some(session) => session.send(&payload).await,
                    None => Err(LinkError::NotReady(LinkState::Disconnected)),
                };
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => {
                self.teardown().await;
                self.publish_status();
                let _ = reply.send(Ok(()));
            }
        }
    }

    async fn connect(&mut self, peripheral: PeripheralRef) -> Result<()> {
        if self.scanner.is_scanning() {
            debug!("Stopping scan before connecting");
            self.scanner.stop_scan().await;
        }
        // 同一时刻只允许一个会话
        self.teardown().await;

        let mut session = GattSession::new(
            peripheral,
            self.config.service,
            self.config.max_payload,
            self.transport.clone(),
            self.gate.clone(),
        );
        let result = session.connect().await;

        match session.state() {
            LinkState::Disconnected => {}
            LinkState::Failed => {
                if let Err(e) = &result {
                    self.emit(SessionEvent::Failed(e.clone()));
                }
                self.session = Some(session);
            }
            _ => self.session = Some(session),
        }
        self.publish_status();
        result
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        let Some(session) = self.session.as_mut() else {
            debug!("No session, dropping event for {}", event.link());
            return;
        };

        let mut out = session.handle_event(event).await;
        match session.state() {
            LinkState::Disconnected => {
                info!("Session with {} ended", session.peripheral().address);
                self.session = None;
            }
            LinkState::Failed if session.link().is_some() => {
                out.extend(session.close().await);
            }
            _ => {}
        }

        for event in out {
            self.emit(event);
        }
        self.publish_status();
    }

    /// 显式关闭当前会话
    async fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            debug!("Tearing down session with {}", session.peripheral().address);
            if let Some(event) = session.close().await {
                self.emit(event);
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        // 没有订阅者时发送失败，忽略
        let _ = self.events.send(event);
    }

    fn publish_status(&self) {
        let (link, peer, writable, notifying) = match &self.session {
            Some(s) => (
                s.state(),
                Some(s.peripheral().clone()),
                s.is_writable(),
                s.is_notifying(),
            ),
            None => (LinkState::Disconnected, None, false, false),
        };
        self.status.send_modify(|status| {
            status.link = link;
            status.peer = peer;
            status.writable = writable;
            status.notifying = notifying;
        });
    }
}
