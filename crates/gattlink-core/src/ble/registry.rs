//! 设备注册表
//!
//! 扫描结果按地址去重，保持插入顺序。句柄可以廉价克隆，
//! 扫描任务写入的同时其他任务可以读取 `list()`。

use crate::ble::{PeripheralRef, normalize_address};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct RegistryInner {
    devices: Vec<PeripheralRef>,
}

#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 添加设备，新插入返回 `true`，重复地址返回 `false`
    pub fn add(&self, mut peripheral: PeripheralRef) -> bool {
        peripheral.address = normalize_address(&peripheral.address);
        let mut inner = self.lock();
        if inner
            .devices
            .iter()
            .any(|d| d.address == peripheral.address)
        {
            return false;
        }
        inner.devices.push(peripheral);
        true
    }

    /// 按插入顺序返回所有设备
    pub fn list(&self) -> Vec<PeripheralRef> {
        self.lock().devices.clone()
    }

    pub fn get(&self, address: &str) -> Option<PeripheralRef> {
        let address = normalize_address(address);
        self.lock()
            .devices
            .iter()
            .find(|d| d.address == address)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().devices.is_empty()
    }

    pub fn clear(&self) {
        self.lock().devices.clear();
    }
}
