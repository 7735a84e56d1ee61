use crate::domain::model::PortRange;
use crate::utils::error::{Result, SupervisorError};
use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};

/// 管理範圍內已使用的連接埠。
///
/// 所有操作都在單一互斥鎖內完成；`claim` 的「找出最小空閒埠」與「標記使用」
/// 是同一個不可分割的步驟。
#[derive(Debug)]
pub struct PortAllocator {
    range: PortRange,
    used: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Self {
        tracing::info!("Port allocator initialised for range {}", range);
        Self {
            range,
            used: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    pub fn is_in_range(&self, port: u16) -> bool {
        self.range.contains(port)
    }

    /// 取得範圍內最小的空閒連接埠並標記為使用中
    pub fn claim(&self) -> Result<u16> {
        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);

        let free = (self.range.min..=self.range.max).find(|port| !used.contains(port));
        match free {
            Some(port) => {
                used.insert(port);
                tracing::debug!(port, "Claimed port");
                Ok(port)
            }
            None => {
                tracing::warn!("No free port left in range {}", self.range);
                Err(SupervisorError::PortExhausted {
                    min: self.range.min,
                    max: self.range.max,
                })
            }
        }
    }

    /// 標記指定的連接埠；範圍外或已使用時拒絕
    pub fn assign(&self, port: u16) -> Result<()> {
        if !self.is_in_range(port) {
            return Err(SupervisorError::PortUnavailable {
                port,
                reason: format!("outside of range {}", self.range),
            });
        }

        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        if !used.insert(port) {
            return Err(SupervisorError::PortUnavailable {
                port,
                reason: "already in use".to_string(),
            });
        }
        tracing::debug!(port, "Assigned port");
        Ok(())
    }

    /// 冪等：釋放未使用或範圍外的埠只記錄警告
    pub fn release(&self, port: u16) {
        if !self.is_in_range(port) {
            tracing::warn!(port, "Ignoring release of port outside range {}", self.range);
            return;
        }

        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        if used.remove(&port) {
            tracing::debug!(port, "Released port");
        } else {
            tracing::warn!(port, "Ignoring release of port that was not claimed");
        }
    }

    pub fn is_claimed(&self, port: u16) -> bool {
        self.used
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&port)
    }

    pub fn claimed_ports(&self) -> Vec<u16> {
        self.used
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }
}
