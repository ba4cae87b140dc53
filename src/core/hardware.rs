use std::path::PathBuf;

use tokio::sync::mpsc;

use super::models::DeviceType;

#[derive(Debug, Clone)]
pub enum HardwareEvent {
    DeviceAdded(BlockDevice),
    /// Carries the registry id of the detached device.
    DeviceRemoved(String),
}

/// A whole-disk block device as seen by an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    pub id: String,
    /// Kernel name, e.g. `sda` or `nvme0n1`.
    pub name: String,
    pub path: PathBuf,
    pub model: String,
    pub serial: String,
    pub device_type: DeviceType,
    pub capacity: u64,
    /// Hosts the running system: root filesystem, a mounted partition or swap.
    pub is_system: bool,
    pub read_only: bool,
}

impl BlockDevice {
    pub fn is_wipeable(&self) -> bool {
        !self.is_system && !self.read_only && self.capacity > 0
    }
}

/// Stable registry id derived from the serial number, or the kernel name
/// when the device reports none.
pub fn device_id_for(serial: &str, name: &str) -> String {
    let source = if serial.trim().is_empty() { name } else { serial.trim() };
    let hash = blake3::hash(source.as_bytes());
    format!("dev-{}", &hash.to_hex()[..12])
}

/// Id for a device whose serial is also reported by another attached device.
/// `locator` is its WWN when it has one, otherwise its physical sysfs path.
pub fn qualified_device_id(serial: &str, locator: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(serial.trim().as_bytes());
    hasher.update(b"@");
    hasher.update(locator.as_bytes());
    format!("dev-{}", &hasher.finalize().to_hex()[..12])
}

pub trait HardwareAdapter: Send + Sync {
    /// Start listening for hardware events.
    /// Spawns internal tasks that send events to the provided channel.
    fn start(&self, event_sender: mpsc::Sender<HardwareEvent>);

    /// Stop the hardware monitor gracefully.
    fn stop(&self);

    /// List all currently attached whole-disk devices.
    /// NOTE: Reads sysfs synchronously; call via spawn_blocking from async code
    /// on real hardware.
    fn list_devices(&self) -> anyhow::Result<Vec<BlockDevice>>;
}
