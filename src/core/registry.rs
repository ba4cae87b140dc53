//! Device Registry: the live inventory and each device's lifecycle state.
//!
//! The outer map lock is only taken for membership changes (enumeration,
//! detach). Every status mutation goes through the device's own mutex, so
//! wipes of different devices never contend while one device's transitions
//! stay strictly ordered.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use super::error::WipeError;
use super::hardware::BlockDevice;
use super::methods::WipeMethod;
use super::models::{Device, DeviceStatus};

#[derive(Clone, Default)]
pub struct DeviceRegistry {
    devices: Arc<RwLock<HashMap<String, Arc<Mutex<Device>>>>>,
}

/// Outcome of `remove_if_idle`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removal {
    Removed(Device),
    /// Kept because a wipe is running on it.
    Retained,
    Missing,
}

/// Outcome of reconciling the registry with a fresh enumeration.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RescanReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Missing from enumeration but kept because a wipe is running.
    pub retained: Vec<String>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a device record as-is, replacing any previous entry.
    pub async fn insert(&self, device: Device) {
        let mut map = self.devices.write().await;
        map.insert(device.id.clone(), Arc::new(Mutex::new(device)));
    }

    /// Register an enumerated device. An existing entry keeps its lifecycle
    /// state and only has its identity refreshed.
    pub async fn upsert(&self, block: &BlockDevice) -> (Device, bool) {
        let existing = self.devices.read().await.get(&block.id).cloned();

        if let Some(entry) = existing {
            let mut device = entry.lock().await;
            let fresh = Device::from_block(block);
            device.model = fresh.model;
            device.serial_number = fresh.serial_number;
            device.capacity = fresh.capacity;
            device.capacity_display = fresh.capacity_display;
            device.path = fresh.path;
            device.is_wipeable = fresh.is_wipeable;
            device.supported_methods = fresh.supported_methods;
            return (device.clone(), false);
        }

        let device = Device::from_block(block);
        let mut map = self.devices.write().await;
        // Another task may have registered it between the two locks.
        let entry = map
            .entry(block.id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(device)))
            .clone();
        drop(map);
        let snapshot = entry.lock().await.clone();
        (snapshot, true)
    }

    /// Drop a detached device unless it is being wiped. The status check and
    /// the removal happen under the map write lock, which `reserve` also holds
    /// (shared) for its whole run, so a reservation never lands on a device
    /// that is being dropped.
    pub async fn remove_if_idle(&self, device_id: &str) -> Removal {
        let mut map = self.devices.write().await;
        let Some(entry) = map.get(device_id).cloned() else {
            return Removal::Missing;
        };

        let device = entry.lock().await;
        if matches!(device.status, DeviceStatus::WipeInProgress { .. }) {
            return Removal::Retained;
        }
        let snapshot = device.clone();
        drop(device);

        map.remove(device_id);
        Removal::Removed(snapshot)
    }

    /// Reconcile with a full enumeration. Devices mid-wipe are never dropped
    /// here; if they are really gone the sanitizer's I/O fails and reports it.
    pub async fn reconcile(&self, blocks: &[BlockDevice]) -> RescanReport {
        let mut report = RescanReport::default();
        let present: BTreeSet<&str> = blocks.iter().map(|b| b.id.as_str()).collect();

        for block in blocks {
            let (_, added) = self.upsert(block).await;
            if added {
                report.added.push(block.id.clone());
            }
        }

        let known: Vec<String> = self.devices.read().await.keys().cloned().collect();

        for id in known {
            if present.contains(id.as_str()) {
                continue;
            }
            match self.remove_if_idle(&id).await {
                Removal::Removed(_) => report.removed.push(id),
                Removal::Retained => report.retained.push(id),
                Removal::Missing => {}
            }
        }

        report.added.sort();
        report.removed.sort();
        report.retained.sort();
        report
    }

    /// All devices ordered by id.
    pub async fn list(&self) -> Vec<Device> {
        let entries: Vec<Arc<Mutex<Device>>> =
            self.devices.read().await.values().cloned().collect();

        let mut devices = Vec::with_capacity(entries.len());
        for entry in entries {
            devices.push(entry.lock().await.clone());
        }
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    pub async fn get(&self, device_id: &str) -> Result<Device, WipeError> {
        let entry = self.entry(device_id).await?;
        let device = entry.lock().await.clone();
        Ok(device)
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Move one device to `WipeInProgress`.
    pub async fn begin_wipe(
        &self,
        device_id: &str,
        requested: Option<&str>,
    ) -> Result<(Device, WipeMethod), WipeError> {
        let mut reserved = self.reserve(&[device_id.to_string()], requested).await?;
        reserved
            .pop()
            .ok_or_else(|| WipeError::DeviceNotFound(device_id.to_string()))
    }

    /// Move every listed device to `WipeInProgress`, or none of them.
    ///
    /// Device locks are taken in id order so concurrent reservations cannot
    /// deadlock, and all are held until every device has been checked. The map
    /// read lock is held throughout so no device can be detached mid-reservation.
    pub async fn reserve(
        &self,
        device_ids: &[String],
        requested: Option<&str>,
    ) -> Result<Vec<(Device, WipeMethod)>, WipeError> {
        let ids: BTreeSet<&String> = device_ids.iter().collect();
        if ids.is_empty() {
            return Err(WipeError::EmptySelection);
        }

        let map = self.devices.read().await;
        let mut entries = Vec::with_capacity(ids.len());
        for id in &ids {
            let entry = map
                .get(id.as_str())
                .ok_or_else(|| WipeError::DeviceNotFound((*id).clone()))?;
            entries.push(entry.clone());
        }

        let mut guards = Vec::with_capacity(entries.len());
        for entry in &entries {
            guards.push(entry.lock().await);
        }

        let mut methods = Vec::with_capacity(guards.len());
        for device in &guards {
            methods.push(check_eligible(device, requested)?);
        }

        let mut reserved = Vec::with_capacity(guards.len());
        for (device, method) in guards.iter_mut().zip(methods) {
            device.status = DeviceStatus::WipeInProgress {
                progress_percentage: 0,
                method,
            };
            info!(device_id = %device.id, method = %method, "Device reserved for wipe");
            reserved.push((device.clone(), method));
        }
        drop(guards);
        drop(map);

        Ok(reserved)
    }

    /// Raise a running wipe's progress. Returns the updated device only when
    /// the value actually increased, so published progress never goes down.
    pub async fn record_progress(&self, device_id: &str, progress: u8) -> Option<Device> {
        let entry = self.entry(device_id).await.ok()?;
        let mut device = entry.lock().await;

        match &mut device.status {
            DeviceStatus::WipeInProgress {
                progress_percentage,
                ..
            } if progress.min(100) > *progress_percentage => {
                *progress_percentage = progress.min(100);
            }
            _ => return None,
        }
        Some(device.clone())
    }

    pub async fn complete(&self, device_id: &str) -> Result<Device, WipeError> {
        self.finish(device_id, |method| DeviceStatus::Wiped {
            method,
            completed_at: Utc::now(),
        })
        .await
    }

    pub async fn fail(&self, device_id: &str, message: &str) -> Result<Device, WipeError> {
        let message = if message.trim().is_empty() {
            "wipe failed without a reported cause".to_string()
        } else {
            message.to_string()
        };
        self.finish(device_id, move |_| DeviceStatus::Error {
            error_message: message,
        })
        .await
    }

    /// Return a `Wiped` or `Error` device to `Ready` so an operator can
    /// re-initiate a wipe.
    pub async fn rearm(&self, device_id: &str) -> Result<Device, WipeError> {
        let entry = self.entry(device_id).await?;
        let mut device = entry.lock().await;

        match device.status {
            DeviceStatus::WipeInProgress { .. } => {
                return Err(WipeError::DeviceBusy(device_id.to_string()));
            }
            DeviceStatus::Ready => {}
            DeviceStatus::Wiped { .. } | DeviceStatus::Error { .. } => {
                info!(device_id = %device_id, previous = device.status.label(), "Device re-armed");
                device.status = DeviceStatus::Ready;
            }
        }
        Ok(device.clone())
    }

    async fn finish(
        &self,
        device_id: &str,
        next: impl FnOnce(WipeMethod) -> DeviceStatus,
    ) -> Result<Device, WipeError> {
        let entry = self.entry(device_id).await?;
        let mut device = entry.lock().await;

        let method = match device.status {
            DeviceStatus::WipeInProgress { method, .. } => method,
            _ => {
                return Err(WipeError::InvalidDevice {
                    device_id: device_id.to_string(),
                    reason: format!("no wipe in progress (status {})", device.status.label()),
                });
            }
        };

        device.status = next(method);
        debug!(device_id = %device_id, status = device.status.label(), "Device reached terminal state");
        Ok(device.clone())
    }

    async fn entry(&self, device_id: &str) -> Result<Arc<Mutex<Device>>, WipeError> {
        self.devices
            .read()
            .await
            .get(device_id)
            .cloned()
            .ok_or_else(|| WipeError::DeviceNotFound(device_id.to_string()))
    }
}

/// Decide whether a device may start a wipe and with which method.
pub fn check_eligible(device: &Device, requested: Option<&str>) -> Result<WipeMethod, WipeError> {
    if matches!(device.status, DeviceStatus::WipeInProgress { .. }) {
        return Err(WipeError::DeviceBusy(device.id.clone()));
    }
    if !device.is_wipeable {
        return Err(WipeError::DeviceNotWipeable(device.id.clone()));
    }
    if device.status != DeviceStatus::Ready {
        return Err(WipeError::InvalidDevice {
            device_id: device.id.clone(),
            reason: format!("status is {}, re-arm it first", device.status.label()),
        });
    }
    device
        .resolve_method(requested)
        .ok_or_else(|| WipeError::UnknownMethod {
            device_id: device.id.clone(),
            method: requested.unwrap_or("<default>").to_string(),
        })
}
