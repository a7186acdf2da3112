//! BLE Scanner - 限时设备发现
//!
//! 两状态机：`Idle -> Scanning -> Idle`。进入 `Scanning` 时启动超时计时，
//! 超时、`stop_scan()` 或广播流结束都会回到 `Idle` 并关闭结果流（正常结束，不是错误）。
//!
//! # 过滤
//!
//! - 默认只上报带非空广播名称的设备（`ScanSettings::require_name`）
//! - 同一地址只上报一次，由 [`DeviceRegistry`] 去重

use log::{debug, info, trace, warn};

use crate::ble::PeripheralRef;
use crate::ble::registry::DeviceRegistry;
use crate::ble::transport::{AdvertisementStream, BleTransport};
use crate::config::{ScanRepeat, ScanSettings};
use crate::error::{LinkError, Result};
use crate::permission::{Capability, CapabilityGate};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ScanPhase {
    #[default]
    Idle,
    Scanning,
}

/// 新发现设备的流，扫描结束时关闭
pub type ScanStream = UnboundedReceiverStream<PeripheralRef>;

/// `start_scan` 的结果
#[derive(Debug)]
pub enum ScanStart {
    Started(ScanStream),
    /// 扫描进行中再次调用，按 `ScanRepeat::Toggle` 停止了扫描
    Stopped,
}

#[derive(Debug, Default)]
struct ScanInner {
    phase: ScanPhase,
    generation: u64,
    cancel: Option<CancellationToken>,
}

pub struct ScanController {
    transport: Arc<dyn BleTransport>,
    gate: CapabilityGate,
    registry: DeviceRegistry,
    settings: ScanSettings,
    inner: Arc<Mutex<ScanInner>>,
    phase_tx: Arc<watch::Sender<ScanPhase>>,
}

impl ScanController {
    pub fn new(
        transport: Arc<dyn BleTransport>,
        gate: CapabilityGate,
        registry: DeviceRegistry,
        settings: ScanSettings,
    ) -> Self {
        let (phase_tx, _) = watch::channel(ScanPhase::Idle);
        Self {
            transport,
            gate,
            registry,
            settings,
            inner: Arc::new(Mutex::new(ScanInner::default())),
            phase_tx: Arc::new(phase_tx),
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn phase(&self) -> ScanPhase {
        *self.phase_tx.borrow()
    }

    pub fn is_scanning(&self) -> bool {
        self.phase() == ScanPhase::Scanning
    }

    pub fn subscribe(&self) -> watch::Receiver<ScanPhase> {
        self.phase_tx.subscribe()
    }

    /// 使用配置的默认时长扫描
    pub async fn start(&self) -> Result<ScanStart> {
        self.start_scan(self.settings.timeout()).await
    }

    pub async fn start_scan(&self, timeout: Duration) -> Result<ScanStart> {
        let mut inner = self.inner.lock().await;

        if inner.phase == ScanPhase::Scanning {
            return match self.settings.repeat {
                ScanRepeat::Toggle => {
                    info!("Scan already running, stopping it");
                    self.stop_locked(&mut inner).await;
                    Ok(ScanStart::Stopped)
                }
                ScanRepeat::Reject => Err(LinkError::ScanInProgress),
            };
        }

        self.gate.require(Capability::Scan)?;

        debug!("Starting transport scan");
        let advertisements = self.transport.start_scan().await.inspect_err(|e| {
            warn!("Failed to start scan: {}", e);
        })?;

        if self.settings.clear_on_start {
            self.registry.clear();
        }

        inner.generation += 1;
        let cancel = CancellationToken::new();
        inner.cancel = Some(cancel.clone());
        inner.phase = ScanPhase::Scanning;
        self.phase_tx.send_replace(ScanPhase::Scanning);

        info!("Starting BLE scan for {} ms", timeout.as_millis());

        let (tx, rx) = mpsc::unbounded_channel();
        let task = ScanTask {
            transport: self.transport.clone(),
            registry: self.registry.clone(),
            inner: self.inner.clone(),
            phase_tx: self.phase_tx.clone(),
            require_name: self.settings.require_name,
            generation: inner.generation,
            cancel,
            tx,
        };
        tokio::spawn(task.run(advertisements, timeout));

        Ok(ScanStart::Started(UnboundedReceiverStream::new(rx)))
    }

    /// 停止扫描；空闲时调用无副作用
    pub async fn stop_scan(&self) {
        let mut inner = self.inner.lock().await;
        if inner.phase == ScanPhase::Scanning {
            self.stop_locked(&mut inner).await;
        } else {
            debug!("stop_scan while idle, nothing to do");
        }
    }

    async fn stop_locked(&self, inner: &mut ScanInner) {
        if let Some(cancel) = inner.cancel.take() {
            cancel.cancel();
        }
        if let Err(e) = self.transport.stop_scan().await {
            warn!("Failed to stop transport scan: {}", e);
        }
        inner.phase = ScanPhase::Idle;
        self.phase_tx.send_replace(ScanPhase::Idle);
        info!("Scan stopped");
    }
}

/// 单次扫描的后台任务
struct ScanTask {
    transport: Arc<dyn BleTransport>,
    registry: DeviceRegistry,
    inner: Arc<Mutex<ScanInner>>,
    phase_tx: Arc<watch::Sender<ScanPhase>>,
    require_name: bool,
    generation: u64,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<PeripheralRef>,
}

impl ScanTask {
    async fn run(self, mut advertisements: AdvertisementStream, timeout: Duration) {
        let timeout_fut = tokio::time::sleep(timeout);
        tokio::pin!(timeout_fut);

        loop {
            // 停止优先：进入 Idle 之后不能再上报缓冲中的广播
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    debug!("Scan cancelled");
                    break;
                }
                () = &mut timeout_fut => {
                    debug!("Scan timeout reached");
                    break;
                }
                adv = advertisements.next() => {
                    match adv {
                        Some(adv) => self.on_advertisement(PeripheralRef::from(&adv)),
                        None => {
                            debug!("Advertisement stream ended");
                            break;
                        }
                    }
                }
            }
        }
        drop(advertisements);
        self.finish().await;
    }

    fn on_advertisement(&self, peripheral: PeripheralRef) {
        if self.cancel.is_cancelled() {
            trace!("Scan stopped, dropping {}", peripheral.address);
            return;
        }
        if self.require_name && !peripheral.has_name() {
            trace!("Dropping unnamed device {}", peripheral.address);
            return;
        }
        if self.registry.add(peripheral.clone()) {
            debug!(
                "Device found: addr={}, name='{}', rssi={:?}",
                peripheral.address,
                peripheral.display_name(),
                peripheral.rssi
            );
            // 调用方可能已丢弃结果流，设备仍然会登记到注册表
            let _ = self.tx.send(peripheral);
        }
    }

    /// 超时或广播流结束：仅当本次扫描仍是当前扫描时才回到 Idle
    async fn finish(self) {
        let mut inner = self.inner.lock().await;
        if inner.generation == self.generation && inner.phase == ScanPhase::Scanning {
            if let Err(e) = self.transport.stop_scan().await {
                warn!("Failed to stop transport scan: {}", e);
            }
            inner.cancel = None;
            inner.phase = ScanPhase::Idle;
            self.phase_tx.send_replace(ScanPhase::Idle);
            info!("Scan complete: {} device(s) known", self.registry.len());
        }
        // 释放 tx，结果流随之结束
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::Advertisement;
    use crate::ble::mock::{MockTransport, TransportCall};
    use crate::permission::StaticPermissions;
    use tokio::time::Instant;

    fn controller(mock: &Arc<MockTransport>, settings: ScanSettings) -> ScanController {
        ScanController::new(
            mock.clone(),
            CapabilityGate::allow_all(),
            DeviceRegistry::new(),
            settings,
        )
    }

    fn started(start: ScanStart) -> ScanStream {
        match start {
            ScanStart::Started(stream) => stream,
            ScanStart::Stopped => panic!("scan was toggled off"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_filters_and_deduplicates() {
        let (mock, _events) = MockTransport::new()
            .with_advertisements(vec![
                Advertisement::new("AA:01", Some("Alpha")),
                Advertisement::new("AA:02", None),
                Advertisement::new("AA:01", Some("Alpha")),
                Advertisement::new("AA:03", Some("")),
                Advertisement::new("aa:04", Some("Delta")),
            ])
            .into_shared();
        let scanner = controller(&mock, ScanSettings::default());

        let stream = started(scanner.start_scan(Duration::from_secs(5)).await.unwrap());
        let found: Vec<_> = stream.map(|p| p.address).collect().await;

        assert_eq!(found, vec!["AA:01", "AA:04"]);
        assert_eq!(scanner.registry().len(), 2);
        assert_eq!(scanner.phase(), ScanPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unnamed_devices_kept_when_filter_disabled() {
        let (mock, _events) = MockTransport::new()
            .with_advertisements(vec![Advertisement::new("AA:02", None)])
            .into_shared();
        let settings = ScanSettings {
            require_name: false,
            ..Default::default()
        };
        let scanner = controller(&mock, settings);

        let stream = started(scanner.start().await.unwrap());
        assert_eq!(stream.count().await, 1);
    }

    #[tokio::test]
    async fn test_buffered_advertisement_dropped_after_stop() {
        for _ in 0..64 {
            let (mock, _events) = MockTransport::new().into_shared();
            let scanner = controller(&mock, ScanSettings::default());

            let mut stream = started(scanner.start_scan(Duration::from_secs(30)).await.unwrap());
            // 扫描任务尚未运行，这条广播留在缓冲里
            assert!(mock.advertise(Advertisement::new("AA:09", Some("Late"))));
            scanner.stop_scan().await;
            assert_eq!(scanner.phase(), ScanPhase::Idle);

            assert!(stream.next().await.is_none());
            assert!(scanner.registry().is_empty());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_ends_scan_without_devices() {
        let (mock, _events) = MockTransport::new().into_shared();
        let scanner = controller(&mock, ScanSettings::default());
        let timeout = Duration::from_millis(5000);

        let begin = Instant::now();
        let mut stream = started(scanner.start_scan(timeout).await.unwrap());
        assert!(scanner.is_scanning());

        assert!(stream.next().await.is_none());
        assert!(begin.elapsed() >= timeout);
        assert_eq!(scanner.phase(), ScanPhase::Idle);
        assert!(!mock.is_scanning());

        // 结束后即使外设还在广播也不会再上报
        assert!(!mock.advertise(Advertisement::new("late", Some("Late"))));
        assert!(stream.next().await.is_none());
        assert!(scanner.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denied_produces_no_events() {
        let (mock, _events) = MockTransport::new()
            .with_advertisements(vec![Advertisement::new("AA:01", Some("Alpha"))])
            .into_shared();
        let scanner = ScanController::new(
            mock.clone(),
            CapabilityGate::new(Arc::new(StaticPermissions::none())),
            DeviceRegistry::new(),
            ScanSettings::default(),
        );

        let result = scanner.start_scan(Duration::from_secs(1)).await;
        assert!(matches!(
            result,
            Err(LinkError::PermissionDenied(Capability::Scan))
        ));
        assert!(mock.calls().is_empty());
        assert!(scanner.registry().is_empty());
        assert_eq!(scanner.phase(), ScanPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adapter_unavailable() {
        let (mock, _events) = MockTransport::new().without_adapter().into_shared();
        let scanner = controller(&mock, ScanSettings::default());

        let result = scanner.start_scan(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(LinkError::AdapterUnavailable)));
        assert_eq!(scanner.phase(), ScanPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeat_start_toggles_off() {
        let (mock, _events) = MockTransport::new().into_shared();
        let scanner = controller(&mock, ScanSettings::default());

        let mut stream = started(scanner.start_scan(Duration::from_secs(30)).await.unwrap());
        let second = scanner.start_scan(Duration::from_secs(30)).await.unwrap();
        assert!(matches!(second, ScanStart::Stopped));
        assert_eq!(scanner.phase(), ScanPhase::Idle);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeat_start_rejected() {
        let (mock, _events) = MockTransport::new().into_shared();
        let settings = ScanSettings {
            repeat: ScanRepeat::Reject,
            ..Default::default()
        };
        let scanner = controller(&mock, settings);

        let _stream = started(scanner.start_scan(Duration::from_secs(30)).await.unwrap());
        assert!(matches!(
            scanner.start_scan(Duration::from_secs(30)).await,
            Err(LinkError::ScanInProgress)
        ));
        assert!(scanner.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_stale_timer_is_ignored() {
        let (mock, _events) = MockTransport::new().into_shared();
        let scanner = controller(&mock, ScanSettings::default());

        let mut first = started(scanner.start_scan(Duration::from_secs(1)).await.unwrap());
        scanner.stop_scan().await;
        scanner.stop_scan().await;
        assert!(first.next().await.is_none());

        // 新扫描开始后，第一次扫描的计时器不会把它停掉
        let mut second = started(scanner.start_scan(Duration::from_secs(10)).await.unwrap());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(scanner.is_scanning());
        assert!(mock.advertise(Advertisement::new("BB:01", Some("Beta"))));
        assert_eq!(second.next().await.map(|p| p.address), Some("BB:01".into()));

        let stops = mock
            .calls()
            .iter()
            .filter(|c| matches!(c, TransportCall::StopScan))
            .count();
        assert_eq!(stops, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_on_start() {
        let (mock, _events) = MockTransport::new()
            .with_advertisements(vec![Advertisement::new("AA:01", Some("Alpha"))])
            .into_shared();
        let settings = ScanSettings {
            clear_on_start: true,
            ..Default::default()
        };
        let scanner = controller(&mock, settings);
        scanner
            .registry()
            .add(PeripheralRef::new("OLD", Some("Old".into())));

        let stream = started(scanner.start().await.unwrap());
        let _ = stream.count().await;
        let addresses: Vec<_> = scanner
            .registry()
            .list()
            .into_iter()
            .map(|p| p.address)
            .collect();
        assert_eq!(addresses, vec!["AA:01"]);
    }
}
