//! BLE Client - 基于 btleplug 的传输层实现
//!
//! 把 btleplug 的 async API 转成回调式的 [`TransportEvent`]：
//! 1. `connect` / `discover_services` 在后台任务中执行，完成后上报事件
//! 2. 适配器的 `DeviceDisconnected` 事件转成 `LinkDown`
//! 3. 通知流转成 `Notification`

use crate::ble::transport::{
    AdvertisementStream, BleTransport, DiscoveredService, GATT_ERROR, GATT_SUCCESS, LinkHandle,
    TransportEvent, TransportEvents,
};
use crate::ble::{Advertisement, CCCD_UUID, normalize_address};
use crate::error::{LinkError, Result};
use crate::permission::Capability;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral};
use futures_util::{StreamExt, stream};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use uuid::Uuid;

struct LinkEntry<P> {
    peripheral: P,
    tasks: Vec<AbortHandle>,
}

/// 活动连接表
///
/// 后台任务（断开监听、连接任务）也持有它，自行上报 `LinkDown` 前先移除表项。
struct LinkTable<P> {
    entries: Mutex<HashMap<u64, LinkEntry<P>>>,
}

impl<P: Clone> LinkTable<P> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, LinkEntry<P>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, id: u64, peripheral: P) {
        self.lock().insert(
            id,
            LinkEntry {
                peripheral,
                tasks: Vec::new(),
            },
        );
    }

    fn peripheral(&self, id: u64) -> Option<P> {
        self.lock().get(&id).map(|entry| entry.peripheral.clone())
    }

    /// 表项已移除时直接取消任务
    fn track(&self, id: u64, task: AbortHandle) {
        if let Some(entry) = self.lock().get_mut(&id) {
            entry.tasks.push(task);
        } else {
            task.abort();
        }
    }

    /// 移除表项并取消其后台任务；只有第一次调用返回 `Some`
    fn release(&self, id: u64) -> Option<P> {
        let entry = self.lock().remove(&id)?;
        for task in entry.tasks {
            task.abort();
        }
        Some(entry.peripheral)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().len()
    }
}

pub struct BtleplugTransport {
    adapter: Adapter,
    events: mpsc::UnboundedSender<TransportEvent>,
    next_link_id: AtomicU64,
    links: Arc<LinkTable<PlatformPeripheral>>,
}

impl BtleplugTransport {
    /// 打开第一个可用的蓝牙适配器
    pub async fn new() -> Result<(Self, TransportEvents)> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(LinkError::AdapterUnavailable)?;

        match adapter.adapter_info().await {
            Ok(info) => info!("Using Bluetooth adapter: {}", info),
            Err(e) => debug!("Adapter info unavailable: {}", e),
        }

        let (tx, rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                adapter,
                events: tx,
                next_link_id: AtomicU64::new(1),
                links: Arc::new(LinkTable::new()),
            },
            rx,
        ))
    }

    fn peripheral(&self, link: &LinkHandle) -> Result<PlatformPeripheral> {
        self.links
            .peripheral(link.id)
            .ok_or_else(|| LinkError::TransportFailure(format!("unknown link {link}")))
    }

    async fn find_device(&self, address: &str) -> Result<PlatformPeripheral> {
        let wanted = normalize_address(address);
        let peripherals = self.adapter.peripherals().await?;

        for peripheral in peripherals {
            if let Some(props) = peripheral.properties().await? {
                if normalize_address(&props.address.to_string()) == wanted {
                    return Ok(peripheral);
                }
            }
        }

        Err(LinkError::DeviceNotFound(wanted))
    }

    fn find_characteristic(
        peripheral: &PlatformPeripheral,
        uuid: Uuid,
    ) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(LinkError::CharacteristicNotFound(uuid))
    }
}

async fn advertisement_of(peripheral: &PlatformPeripheral) -> Option<Advertisement> {
    let props = peripheral.properties().await.ok().flatten()?;
    Some(Advertisement {
        address: props.address.to_string(),
        local_name: props.local_name,
        rssi: props.rssi,
    })
}

#[async_trait::async_trait]
impl BleTransport for BtleplugTransport {
    async fn start_scan(&self) -> Result<AdvertisementStream> {
        let events = self.adapter.events().await?;
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| match e {
                btleplug::Error::PermissionDenied => LinkError::PermissionDenied(Capability::Scan),
                other => {
                    warn!("start_scan failed: {}", other);
                    LinkError::AdapterUnavailable
                }
            })?;

        // 扫描开始前已经缓存的设备也要上报
        let mut cached = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            if let Some(adv) = advertisement_of(&peripheral).await {
                cached.push(adv);
            }
        }
        debug!("{} cached device(s) before scan", cached.len());

        let adapter = self.adapter.clone();
        let live = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        let peripheral = adapter.peripheral(&id).await.ok()?;
                        advertisement_of(&peripheral).await
                    }
                    _ => None,
                }
            }
        });

        Ok(stream::iter(cached).chain(live).boxed())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<LinkHandle> {
        let peripheral = self.find_device(address).await?;
        // 先订阅适配器事件，失败时不会留下表项
        let mut adapter_events = self.adapter.events().await?;

        let link = LinkHandle {
            id: self.next_link_id.fetch_add(1, Ordering::Relaxed),
            address: normalize_address(address),
        };
        self.links.insert(link.id, peripheral.clone());

        // 断开监听：适配器事件比通知流关闭更及时
        let links = self.links.clone();
        let events = self.events.clone();
        let watched = link.clone();
        let peripheral_id = peripheral.id();
        let watcher = tokio::spawn(async move {
            while let Some(event) = adapter_events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    if id == peripheral_id {
                        debug!("Disconnect watcher: {} went away", watched);
                        if links.release(watched.id).is_some() {
                            let _ = events.send(TransportEvent::LinkDown { link: watched });
                        }
                        break;
                    }
                }
            }
        });
        self.links.track(link.id, watcher.abort_handle());

        info!("Connecting to {}", link.address);
        let links = self.links.clone();
        let events = self.events.clone();
        let connecting = link.clone();
        let task = tokio::spawn(async move {
            match peripheral.connect().await {
                Ok(()) => {
                    let _ = events.send(TransportEvent::LinkUp { link: connecting });
                }
                Err(e) => {
                    warn!("Connection to {} failed: {}", connecting, e);
                    if links.release(connecting.id).is_some() {
                        let _ = events.send(TransportEvent::LinkDown { link: connecting });
                    }
                }
            }
        });
        self.links.track(link.id, task.abort_handle());

        Ok(link)
    }

    async fn discover_services(&self, link: &LinkHandle) -> Result<()> {
        let peripheral = self.peripheral(link)?;
        let events = self.events.clone();
        let target = link.clone();
        let task = tokio::spawn(async move {
            let result = match peripheral.discover_services().await {
                Ok(()) => Ok(peripheral
                    .services()
                    .into_iter()
                    .map(|s| {
                        DiscoveredService::new(s.uuid, s.characteristics.iter().map(|c| c.uuid))
                    })
                    .collect()),
                Err(e) => {
                    warn!("discover_services failed: {}", e);
                    Err(GATT_ERROR)
                }
            };
            let _ = events.send(TransportEvent::ServicesDiscovered {
                link: target,
                result,
            });
        });
        self.links.track(link.id, task.abort_handle());
        Ok(())
    }

    async fn write_characteristic(
        &self,
        link: &LinkHandle,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<()> {
        let peripheral = self.peripheral(link)?;
        let target = Self::find_characteristic(&peripheral, characteristic)?;
        peripheral
            .write(&target, value, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn set_notification(
        &self,
        link: &LinkHandle,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<()> {
        let peripheral = self.peripheral(link)?;
        let target = Self::find_characteristic(&peripheral, characteristic)?;

        if !enabled {
            peripheral.unsubscribe(&target).await?;
            return Ok(());
        }

        let mut notifications = peripheral.notifications().await?;
        peripheral.subscribe(&target).await?;

        let events = self.events.clone();
        let source = link.clone();
        let task = tokio::spawn(async move {
            while let Some(n) = notifications.next().await {
                let _ = events.send(TransportEvent::Notification {
                    link: source.clone(),
                    characteristic: n.uuid,
                    value: n.value,
                });
            }
            debug!("Notification stream for {} closed", source);
        });
        self.links.track(link.id, task.abort_handle());
        Ok(())
    }

    async fn write_descriptor(
        &self,
        link: &LinkHandle,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<()> {
        let peripheral = self.peripheral(link)?;

        // btleplug 在 subscribe 时自行写入 CCCD（BlueZ 不允许直接写）
        let status = if descriptor == CCCD_UUID {
            GATT_SUCCESS
        } else {
            let target = Self::find_characteristic(&peripheral, characteristic)?;
            let desc = target
                .descriptors
                .iter()
                .find(|d| d.uuid == descriptor)
                .ok_or(LinkError::CharacteristicNotFound(descriptor))?;
            match peripheral.write_descriptor(desc, value).await {
                Ok(()) => GATT_SUCCESS,
                Err(e) => {
                    warn!("Descriptor write failed: {}", e);
                    GATT_ERROR
                }
            }
        };

        let _ = self.events.send(TransportEvent::DescriptorWritten {
            link: link.clone(),
            descriptor,
            status,
        });
        Ok(())
    }

    async fn disconnect(&self, link: &LinkHandle) -> Result<()> {
        let Some(peripheral) = self.links.release(link.id) else {
            debug!("disconnect on unknown link {}", link);
            return Ok(());
        };

        info!("Disconnecting from {}", link);
        let result = peripheral.disconnect().await;
        let _ = self.events.send(TransportEvent::LinkDown { link: link.clone() });
        result.map_err(LinkError::from)
    }
}
