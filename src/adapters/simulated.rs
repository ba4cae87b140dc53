use chrono::Utc;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::core::hardware::{BlockDevice, HardwareAdapter, HardwareEvent};
use crate::core::methods::WipeMethod;
use crate::core::models::{DeviceStatus, DeviceType};
use crate::core::registry::DeviceRegistry;
use crate::core::sanitizer::simulated::FaultPlan;

const GB: u64 = 1_000_000_000;

enum SimulatedCommand {
    InjectAdd(BlockDevice),
    InjectRemove(String),
}

/// Drives the simulated inventory: hotplug and hardware faults.
#[derive(Clone)]
pub struct Simulator {
    tx: mpsc::UnboundedSender<SimulatedCommand>,
    faults: FaultPlan,
}

impl Simulator {
    pub fn add_device(&self, id: &str, device_type: DeviceType, size_gb: u64) {
        let device = simulated_device(
            id,
            &format!("Simulated {} {}GB", device_type, size_gb),
            &format!("SN-SIM-{}", id),
            device_type,
            size_gb * GB,
        );
        let _ = self.tx.send(SimulatedCommand::InjectAdd(device));
    }

    pub fn remove_device(&self, id: &str) {
        let _ = self.tx.send(SimulatedCommand::InjectRemove(id.to_string()));
    }

    /// Make the next wipe of `id` fail once it reaches `at_percent`.
    pub fn inject_fault(&self, id: &str, at_percent: u8) {
        self.faults.inject(id, at_percent);
    }
}

pub struct SimulatedAdapter {
    devices: Arc<Mutex<Vec<BlockDevice>>>,
    // Moved out on `start()`, which takes &self and runs once.
    cmd_rx: Mutex<Option<mpsc::UnboundedReceiver<SimulatedCommand>>>,
}

impl SimulatedAdapter {
    pub fn new(faults: FaultPlan) -> (Self, Simulator) {
        Self::with_devices(Vec::new(), faults)
    }

    /// The six-drive demo inventory.
    pub fn with_demo_drives(faults: FaultPlan) -> (Self, Simulator) {
        Self::with_devices(demo_drives(), faults)
    }

    fn with_devices(devices: Vec<BlockDevice>, faults: FaultPlan) -> (Self, Simulator) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                devices: Arc::new(Mutex::new(devices)),
                cmd_rx: Mutex::new(Some(rx)),
            },
            Simulator { tx, faults },
        )
    }
}

impl HardwareAdapter for SimulatedAdapter {
    fn start(&self, daemon_tx: mpsc::Sender<HardwareEvent>) {
        let rx = self
            .cmd_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut rx) = rx else {
            warn!("Simulated adapter already started");
            return;
        };

        info!("Simulated adapter listening for controller commands");
        let devices = self.devices.clone();

        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                let event = {
                    let mut devices = devices.lock().unwrap_or_else(PoisonError::into_inner);
                    match cmd {
                        SimulatedCommand::InjectAdd(device) => {
                            devices.retain(|d| d.id != device.id);
                            devices.push(device.clone());
                            HardwareEvent::DeviceAdded(device)
                        }
                        SimulatedCommand::InjectRemove(id) => {
                            devices.retain(|d| d.id != id);
                            HardwareEvent::DeviceRemoved(id)
                        }
                    }
                };

                if daemon_tx.send(event).await.is_err() {
                    break;
                }
            }
        });
    }

    fn stop(&self) {
        info!("Simulated adapter stopped");
    }

    fn list_devices(&self) -> anyhow::Result<Vec<BlockDevice>> {
        Ok(self
            .devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

fn simulated_device(id: &str, model: &str, serial: &str, device_type: DeviceType, capacity: u64) -> BlockDevice {
    BlockDevice {
        id: id.to_string(),
        name: id.to_string(),
        path: PathBuf::from(format!("/dev/sim/{}", id)),
        model: model.to_string(),
        serial: serial.to_string(),
        device_type,
        capacity,
        is_system: false,
        read_only: false,
    }
}

fn demo_drives() -> Vec<BlockDevice> {
    vec![
        simulated_device("dev-1", "Seagate Barracuda 2TB", "SN-HDD-123456789", DeviceType::Hdd, 2_000 * GB),
        simulated_device("dev-2", "Samsung 970 EVO Plus 1TB", "SN-NVMe-987654321", DeviceType::Nvme, 1_000 * GB),
        simulated_device("dev-3", "Crucial MX500 500GB", "SN-SSD-456789123", DeviceType::Ssd, 500 * GB),
        simulated_device("dev-4", "Western Digital Blue 500GB", "SN-HDD-741852963", DeviceType::Hdd, 500 * GB),
        simulated_device("dev-5", "SanDisk SSD Plus 240GB", "SN-SSD-369258147", DeviceType::Ssd, 240 * GB),
        simulated_device("dev-6", "WD Black 4TB", "SN-HDD-159357486", DeviceType::Hdd, 4_000 * GB),
    ]
}

/// Put the demo drives that start out finished into their lifecycle states.
pub async fn apply_demo_states(registry: &DeviceRegistry) {
    let states = [
        (
            "dev-5",
            DeviceStatus::Wiped {
                method: WipeMethod::NistPurgeSecureErase,
                completed_at: Utc::now(),
            },
        ),
        (
            "dev-6",
            DeviceStatus::Error {
                error_message: "Device not responding.".to_string(),
            },
        ),
    ];

    for (id, status) in states {
        if let Ok(mut device) = registry.get(id).await {
            device.status = status;
            registry.insert(device).await;
        }
    }
}
