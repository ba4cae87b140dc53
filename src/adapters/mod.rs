use std::sync::Arc;

use crate::core::hardware::HardwareAdapter;
use crate::core::models::DeviceType;
use crate::core::sanitizer::simulated::FaultPlan;

#[cfg(target_os = "linux")]
mod linux;
mod simulated;

#[cfg(target_os = "linux")]
pub use linux::{LinuxAdapter, LinuxAdapterConfig};
pub use simulated::{SimulatedAdapter, Simulator, apply_demo_states};

const SIMULATOR_USAGE: &str =
    "(Simulator) Use: 'add <id> [hdd|ssd|nvme|usb] [size_gb]', 'rm <id>' or 'fault <id> <percent>'";

pub fn get_adapter(simulation: bool, faults: FaultPlan) -> anyhow::Result<Arc<dyn HardwareAdapter>> {
    if simulation {
        let (adapter, controller) = SimulatedAdapter::with_demo_drives(faults);

        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lines().map_while(Result::ok) {
                if !run_simulator_command(&controller, &line) {
                    println!("{}", SIMULATOR_USAGE);
                }
            }
        });

        return Ok(Arc::new(adapter));
    }

    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(LinuxAdapter::with_defaults()))
    }

    #[cfg(not(target_os = "linux"))]
    {
        anyhow::bail!("hardware access is only supported on Linux; run with --simulation")
    }
}

/// Apply one line of simulator input. Returns false when the line is not a command.
pub fn run_simulator_command(controller: &Simulator, line: &str) -> bool {
    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts.as_slice() {
        ["add", id, rest @ ..] => {
            let device_type = rest
                .first()
                .and_then(|t| DeviceType::parse(t))
                .unwrap_or(DeviceType::Usb);
            let size_gb = rest.get(1).and_then(|s| s.parse().ok()).unwrap_or(64);
            controller.add_device(id, device_type, size_gb);
            true
        }
        ["rm", id] => {
            controller.remove_device(id);
            true
        }
        ["fault", id, percent] => match percent.parse::<u8>() {
            Ok(percent) if percent <= 100 => {
                controller.inject_fault(id, percent);
                true
            }
            _ => false,
        },
        _ => false,
    }
}
