//! 进程内模拟外设
//!
//! 实现 [`BleTransport`]，记录所有调用，并按预设脚本上报事件。
//! 测试和 CLI 的 `--simulate` 模式都使用它。

use crate::ble::transport::{
    AdvertisementStream, BleTransport, DiscoveredService, GATT_SUCCESS, GattStatus, LinkHandle,
    TransportEvent, TransportEvents,
};
use crate::ble::{Advertisement, NOTIFY_CHAR_UUID, SERVICE_UUID, WRITE_CHAR_UUID};
use crate::error::{LinkError, Result};
use futures_util::StreamExt;
use log::debug;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

/// 根据写入内容生成通知回复
pub type Responder = Box<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

/// 记录下来的传输层调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    StartScan,
    StopScan,
    Connect(String),
    DiscoverServices(LinkHandle),
    Write {
        link: LinkHandle,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    SetNotification {
        link: LinkHandle,
        characteristic: Uuid,
        enabled: bool,
    },
    WriteDescriptor {
        link: LinkHandle,
        characteristic: Uuid,
        descriptor: Uuid,
        value: Vec<u8>,
    },
    Disconnect(LinkHandle),
}

struct MockState {
    adapter_present: bool,
    advertisements: Vec<Advertisement>,
    discovery: std::result::Result<Vec<DiscoveredService>, GattStatus>,
    auto_link_up: bool,
    fail_writes: bool,
    calls: Vec<TransportCall>,
    scan_tx: Option<mpsc::UnboundedSender<Advertisement>>,
    next_link_id: u64,
    active: Option<LinkHandle>,
    notifying: HashSet<Uuid>,
}

pub struct MockTransport {
    state: Mutex<MockState>,
    events: mpsc::UnboundedSender<TransportEvent>,
    responder: Option<Responder>,
    reply_characteristic: Uuid,
}

impl MockTransport {
    /// 默认外设：暴露完整的服务（写入 + 通知特征），连接后自动上报 `LinkUp`
    pub fn new() -> Self {
        // 真正的事件通道在 `into_shared` 中创建
        let (events, _) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(MockState {
                adapter_present: true,
                advertisements: Vec::new(),
                discovery: Ok(vec![DiscoveredService::new(
                    SERVICE_UUID,
                    [WRITE_CHAR_UUID, NOTIFY_CHAR_UUID],
                )]),
                auto_link_up: true,
                fail_writes: false,
                calls: Vec::new(),
                scan_tx: None,
                next_link_id: 1,
                active: None,
                notifying: HashSet::new(),
            }),
            events,
            responder: None,
            reply_characteristic: NOTIFY_CHAR_UUID,
        }
    }

    /// 回显外设：广播一个具名设备和一个匿名设备，收到写入后原样通知回来
    pub fn echo_peripheral() -> Self {
        Self::new()
            .with_advertisements(vec![
                Advertisement::new("C0:FF:EE:00:00:01", Some("gattlink-echo")),
                Advertisement::new("C0:FF:EE:00:00:02", None),
            ])
            .with_responder(|data| Some(data.to_vec()))
    }

    pub fn with_advertisements(self, advertisements: Vec<Advertisement>) -> Self {
        self.lock().advertisements = advertisements;
        self
    }

    pub fn with_services(self, services: Vec<DiscoveredService>) -> Self {
        self.lock().discovery = Ok(services);
        self
    }

    pub fn with_discovery_failure(self, status: GattStatus) -> Self {
        self.lock().discovery = Err(status);
        self
    }

    pub fn without_adapter(self) -> Self {
        self.lock().adapter_present = false;
        self
    }

    /// 连接后不自动上报 `LinkUp`，由测试通过 [`MockTransport::emit`] 控制
    pub fn manual_link_up(self) -> Self {
        self.lock().auto_link_up = false;
        self
    }

    pub fn failing_writes(self) -> Self {
        self.lock().fail_writes = true;
        self
    }

    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        self.responder = Some(Box::new(responder));
        self
    }

    pub fn with_reply_characteristic(mut self, characteristic: Uuid) -> Self {
        self.reply_characteristic = characteristic;
        self
    }

    /// 完成构建，返回共享句柄和事件接收端
    pub fn into_shared(mut self) -> (Arc<Self>, TransportEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = tx;
        (Arc::new(self), rx)
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: TransportCall) {
        debug!("mock transport: {:?}", call);
        self.lock().calls.push(call);
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// 扫描进行中时追加一条广播
    pub fn advertise(&self, advertisement: Advertisement) -> bool {
        match &self.lock().scan_tx {
            Some(tx) => tx.send(advertisement).is_ok(),
            None => false,
        }
    }

    /// 模拟外设主动断开
    pub fn drop_link(&self) {
        let link = self.lock().active.take();
        if let Some(link) = link {
            self.emit(TransportEvent::LinkDown { link });
        }
    }

    /// 在当前连接上推送一条通知
    pub fn notify(&self, characteristic: Uuid, value: &[u8]) {
        let link = self.lock().active.clone();
        if let Some(link) = link {
            self.emit(TransportEvent::Notification {
                link,
                characteristic,
                value: value.to_vec(),
            });
        }
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.lock().calls.clone()
    }

    /// 所有特征写入的内容
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                TransportCall::Write { value, .. } => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn active_link(&self) -> Option<LinkHandle> {
        self.lock().active.clone()
    }

    pub fn is_scanning(&self) -> bool {
        self.lock().scan_tx.is_some()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl BleTransport for MockTransport {
    async fn start_scan(&self) -> Result<AdvertisementStream> {
        self.record(TransportCall::StartScan);
        let mut state = self.lock();
        if !state.adapter_present {
            return Err(LinkError::AdapterUnavailable);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        for adv in &state.advertisements {
            let _ = tx.send(adv.clone());
        }
        state.scan_tx = Some(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.record(TransportCall::StopScan);
        self.lock().scan_tx = None;
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<LinkHandle> {
        self.record(TransportCall::Connect(address.to_string()));
        let (link, auto_link_up) = {
            let mut state = self.lock();
            if !state.adapter_present {
                return Err(LinkError::AdapterUnavailable);
            }
            let link = LinkHandle {
                id: state.next_link_id,
                address: address.to_string(),
            };
            state.next_link_id += 1;
            state.active = Some(link.clone());
            state.notifying.clear();
            (link, state.auto_link_up)
        };
        if auto_link_up {
            self.emit(TransportEvent::LinkUp { link: link.clone() });
        }
        Ok(link)
    }

    async fn discover_services(&self, link: &LinkHandle) -> Result<()> {
        self.record(TransportCall::DiscoverServices(link.clone()));
        let result = self.lock().discovery.clone();
        self.emit(TransportEvent::ServicesDiscovered {
            link: link.clone(),
            result,
        });
        Ok(())
    }

    async fn write_characteristic(
        &self,
        link: &LinkHandle,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<()> {
        self.record(TransportCall::Write {
            link: link.clone(),
            characteristic,
            value: value.to_vec(),
        });
        let (fail, replies) = {
            let state = self.lock();
            (
                state.fail_writes,
                state.notifying.contains(&self.reply_characteristic),
            )
        };
        if fail {
            return Err(LinkError::TransportFailure(
                "write not acknowledged".to_string(),
            ));
        }
        if replies {
            if let Some(reply) = self.responder.as_ref().and_then(|r| r(value)) {
                self.emit(TransportEvent::Notification {
                    link: link.clone(),
                    characteristic: self.reply_characteristic,
                    value: reply,
                });
            }
        }
        Ok(())
    }

    async fn set_notification(
        &self,
        link: &LinkHandle,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<()> {
        self.record(TransportCall::SetNotification {
            link: link.clone(),
            characteristic,
            enabled,
        });
        let mut state = self.lock();
        if enabled {
            state.notifying.insert(characteristic);
        } else {
            state.notifying.remove(&characteristic);
        }
        Ok(())
    }

    async fn write_descriptor(
        &self,
        link: &LinkHandle,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<()> {
        self.record(TransportCall::WriteDescriptor {
            link: link.clone(),
            characteristic,
            descriptor,
            value: value.to_vec(),
        });
        self.emit(TransportEvent::DescriptorWritten {
            link: link.clone(),
            descriptor,
            status: GATT_SUCCESS,
        });
        Ok(())
    }

    async fn disconnect(&self, link: &LinkHandle) -> Result<()> {
        self.record(TransportCall::Disconnect(link.clone()));
        {
            let mut state = self.lock();
            if state.active.as_ref() == Some(link) {
                state.active = None;
                state.notifying.clear();
            }
        }
        self.emit(TransportEvent::LinkDown { link: link.clone() });
        Ok(())
    }
}
