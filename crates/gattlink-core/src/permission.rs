//! 权限检查
//!
//! 所有传输层操作在调用之前都要经过同一个 [`CapabilityGate`]，
//! 缺少权限时统一返回 [`LinkError::PermissionDenied`]，不会触达传输层。

use crate::error::{LinkError, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, RwLock};

/// 需要授权的蓝牙能力
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// 扫描广播 (BLUETOOTH_SCAN)
    Scan,
    /// 建立连接及所有 GATT 操作 (BLUETOOTH_CONNECT)
    Connect,
}

impl Capability {
    pub fn name(&self) -> &'static str {
        match self {
            Capability::Scan => "BLUETOOTH_SCAN",
            Capability::Connect => "BLUETOOTH_CONNECT",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 权限提供者（平台相关）
pub trait PermissionProvider: Send + Sync {
    fn has_permission(&self, capability: Capability) -> bool;
}

/// 桌面平台：由操作系统负责授权，始终放行
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl PermissionProvider for AllowAll {
    fn has_permission(&self, _capability: Capability) -> bool {
        true
    }
}

/// 显式授权集合，可在运行时授予或撤销
#[derive(Debug, Default)]
pub struct StaticPermissions {
    granted: RwLock<HashSet<Capability>>,
}

impl StaticPermissions {
    pub fn new(granted: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            granted: RwLock::new(granted.into_iter().collect()),
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn grant(&self, capability: Capability) {
        self.granted
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(capability);
    }

    pub fn revoke(&self, capability: Capability) {
        self.granted
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&capability);
    }
}

impl PermissionProvider for StaticPermissions {
    fn has_permission(&self, capability: Capability) -> bool {
        self.granted
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains(&capability)
    }
}

/// 统一的能力检查入口
#[derive(Clone)]
pub struct CapabilityGate {
    provider: Arc<dyn PermissionProvider>,
}

impl CapabilityGate {
    pub fn new(provider: Arc<dyn PermissionProvider>) -> Self {
        Self { provider }
    }

    pub fn allow_all() -> Self {
        Self::new(Arc::new(AllowAll))
    }

    /// 检查能力，缺失时返回 `PermissionDenied`
    pub fn require(&self, capability: Capability) -> Result<()> {
        if self.provider.has_permission(capability) {
            Ok(())
        } else {
            warn!("Missing permission {}, operation aborted", capability);
            Err(LinkError::PermissionDenied(capability))
        }
    }
}

impl fmt::Debug for CapabilityGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityGate").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_denies_missing_capability() {
        let perms = Arc::new(StaticPermissions::new([Capability::Connect]));
        let gate = CapabilityGate::new(perms.clone());

        assert!(gate.require(Capability::Connect).is_ok());
        assert_eq!(
            gate.require(Capability::Scan),
            Err(LinkError::PermissionDenied(Capability::Scan))
        );

        perms.grant(Capability::Scan);
        assert!(gate.require(Capability::Scan).is_ok());

        perms.revoke(Capability::Connect);
        assert!(gate.require(Capability::Connect).is_err());
    }

    #[test]
    fn test_allow_all() {
        let gate = CapabilityGate::allow_all();
        assert!(gate.require(Capability::Scan).is_ok());
        assert!(gate.require(Capability::Connect).is_ok());
    }
}
