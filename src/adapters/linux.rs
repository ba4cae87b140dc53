use anyhow::{Context, Result};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::stat::{major, minor, stat};
use std::collections::{HashMap, HashSet};
use std::ffi::OsStr;
use std::fs;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::hardware::{
    BlockDevice, HardwareAdapter, HardwareEvent, device_id_for, qualified_device_id,
};
use crate::core::models::DeviceType;

/// Kernel block devices that are never physical disks.
const SKIPPED_PREFIXES: [&str; 7] = ["loop", "ram", "zram", "dm-", "md", "sr", "fd"];

const POLL_TIMEOUT_MS: u16 = 500;

#[derive(Debug, Clone)]
pub struct LinuxAdapterConfig {
    pub sys_block: PathBuf,
    pub proc_mounts: PathBuf,
    pub proc_swaps: PathBuf,
}

impl Default for LinuxAdapterConfig {
    fn default() -> Self {
        Self {
            sys_block: PathBuf::from("/sys/block"),
            proc_mounts: PathBuf::from("/proc/mounts"),
            proc_swaps: PathBuf::from("/proc/swaps"),
        }
    }
}

pub struct LinuxAdapter {
    config: LinuxAdapterConfig,
    cancel: CancellationToken,
    /// Kernel name to registry id, so removals resolve after the device is gone.
    known: Arc<Mutex<HashMap<String, String>>>,
}

impl LinuxAdapter {
    pub fn new(config: LinuxAdapterConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
            known: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(LinuxAdapterConfig::default())
    }
}

impl HardwareAdapter for LinuxAdapter {
    fn start(&self, tx: mpsc::Sender<HardwareEvent>) {
        let config = self.config.clone();
        let cancel = self.cancel.clone();
        let known = self.known.clone();

        let spawned = std::thread::Builder::new()
            .name("udev-monitor".into())
            .spawn(move || {
                if let Err(e) = monitor_loop(&config, &cancel, &known, &tx) {
                    error!(error = %e, "udev monitor stopped");
                }
            });

        if let Err(e) = spawned {
            error!(error = %e, "Failed to spawn udev monitor thread");
        }
    }

    fn stop(&self) {
        self.cancel.cancel();
    }

    fn list_devices(&self) -> Result<Vec<BlockDevice>> {
        let held = HeldDevices::load(&self.config);
        let mut found = Vec::new();

        let entries = fs::read_dir(&self.config.sys_block)
            .with_context(|| format!("Failed to read {}", self.config.sys_block.display()))?;

        for entry in entries {
            let name = entry?.file_name().to_string_lossy().to_string();
            if is_skipped(&name) {
                continue;
            }
            match describe(&self.config, &held, &name) {
                Ok(discovered) => found.push(discovered),
                Err(e) => debug!(device = %name, error = %e, "Skipping block device"),
            }
        }

        // Claim ids in name order so a repeated serial always qualifies the same disks.
        found.sort_by(|a, b| a.device.name.cmp(&b.device.name));
        let mut ids = HashMap::new();
        let devices: Vec<BlockDevice> = found.into_iter().map(|d| claim_id(&mut ids, d)).collect();

        *self.known.lock().unwrap_or_else(PoisonError::into_inner) = ids;
        Ok(devices)
    }
}

fn monitor_loop(
    config: &LinuxAdapterConfig,
    cancel: &CancellationToken,
    known: &Mutex<HashMap<String, String>>,
    tx: &mpsc::Sender<HardwareEvent>,
) -> Result<()> {
    let socket = udev::MonitorBuilder::new()?
        .match_subsystem_devtype("block", "disk")?
        .listen()
        .context("Failed to open udev monitor")?;

    info!("udev monitor listening for block devices");

    while !cancel.is_cancelled() {
        let mut fds = [PollFd::new(socket.as_fd(), PollFlags::POLLIN)];
        let ready = poll(&mut fds, PollTimeout::from(POLL_TIMEOUT_MS)).context("poll failed")?;
        if ready == 0 {
            continue;
        }

        for event in socket.iter() {
            let name = event.sysname().to_string_lossy().to_string();
            if is_skipped(&name) {
                continue;
            }

            let hardware_event = match event.event_type() {
                udev::EventType::Add => {
                    let held = HeldDevices::load(config);
                    match describe(config, &held, &name) {
                        Ok(discovered) => {
                            let mut known = known.lock().unwrap_or_else(PoisonError::into_inner);
                            HardwareEvent::DeviceAdded(claim_id(&mut known, discovered))
                        }
                        Err(e) => {
                            warn!(device = %name, error = %e, "Ignoring added device");
                            continue;
                        }
                    }
                }
                udev::EventType::Remove => {
                    let id = known
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&name)
                        .unwrap_or_else(|| {
                            let serial = event
                                .property_value("ID_SERIAL_SHORT")
                                .map(|s| s.to_string_lossy().to_string())
                                .unwrap_or_default();
                            device_id_for(&serial, &name)
                        });
                    HardwareEvent::DeviceRemoved(id)
                }
                _ => continue,
            };

            debug!(device = %name, "Hardware event");
            if tx.blocking_send(hardware_event).is_err() {
                return Ok(());
            }
        }
    }

    info!("udev monitor stopped");
    Ok(())
}

fn is_skipped(name: &str) -> bool {
    SKIPPED_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
}

fn read_attr(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// A described disk plus what tells it apart when its serial is not unique.
struct Discovered {
    device: BlockDevice,
    /// WWN, or the canonical sysfs path when the disk reports none.
    locator: String,
}

/// Record the device under its kernel name. A serial already claimed by
/// another attached disk is qualified with this disk's locator.
fn claim_id(known: &mut HashMap<String, String>, found: Discovered) -> BlockDevice {
    let Discovered { mut device, locator } = found;

    let taken = known
        .iter()
        .any(|(name, id)| name != &device.name && id == &device.id);
    if taken && !device.serial.trim().is_empty() {
        warn!(device = %device.name, serial = %device.serial, "Serial shared with another disk, qualifying its id");
        device.id = qualified_device_id(&device.serial, &locator);
    }

    known.insert(device.name.clone(), device.id.clone());
    device
}

/// Build the adapter's view of `/sys/block/<name>`.
fn describe(config: &LinuxAdapterConfig, held: &HeldDevices, name: &str) -> Result<Discovered> {
    let sys = config.sys_block.join(name);

    let sectors: u64 = read_attr(&sys.join("size"))
        .context("missing size attribute")?
        .parse()
        .context("unparseable size attribute")?;

    let udev_device = udev::Device::from_syspath(&sys).ok();
    let property = |key: &str| {
        udev_device
            .as_ref()
            .and_then(|d| d.property_value(key))
            .map(|v: &OsStr| v.to_string_lossy().trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let model = read_attr(&sys.join("device/model"))
        .or_else(|| property("ID_MODEL").map(|m| m.replace('_', " ")))
        .unwrap_or_else(|| name.to_string());
    let serial = read_attr(&sys.join("device/serial"))
        .or_else(|| property("ID_SERIAL_SHORT"))
        .unwrap_or_default();

    let device_type = classify(&sys, name, property("ID_BUS").as_deref());
    let read_only = read_attr(&sys.join("ro")).as_deref() == Some("1");

    let locator = read_attr(&sys.join("wwid"))
        .or_else(|| read_attr(&sys.join("device/wwid")))
        .or_else(|| property("ID_WWN_WITH_EXTENSION"))
        .or_else(|| property("ID_WWN"))
        .unwrap_or_else(|| {
            fs::canonicalize(&sys)
                .unwrap_or_else(|_| sys.clone())
                .display()
                .to_string()
        });

    let device = BlockDevice {
        id: device_id_for(&serial, name),
        name: name.to_string(),
        path: PathBuf::from("/dev").join(name),
        model,
        serial,
        device_type,
        capacity: sectors * 512,
        is_system: held.holds(&sys, name),
        read_only,
    };
    Ok(Discovered { device, locator })
}

fn classify(sys: &Path, name: &str, bus: Option<&str>) -> DeviceType {
    if name.starts_with("nvme") {
        return DeviceType::Nvme;
    }

    let on_usb = bus == Some("usb")
        || fs::canonicalize(sys)
            .map(|p| p.to_string_lossy().contains("/usb"))
            .unwrap_or(false);
    if on_usb {
        return DeviceType::Usb;
    }

    match read_attr(&sys.join("queue/rotational")).as_deref() {
        Some("0") => DeviceType::Ssd,
        _ => DeviceType::Hdd,
    }
}

/// Block devices the running system depends on.
struct HeldDevices {
    /// `/dev/...` sources from /proc/mounts and /proc/swaps.
    sources: HashSet<String>,
    /// `major:minor` of the filesystem holding `/`.
    root: Option<String>,
}

impl HeldDevices {
    fn load(config: &LinuxAdapterConfig) -> Self {
        let mut sources = HashSet::new();
        for table in [&config.proc_mounts, &config.proc_swaps] {
            if let Ok(contents) = fs::read_to_string(table) {
                sources.extend(parse_sources(&contents));
            }
        }

        let root = stat("/")
            .ok()
            .map(|st| format!("{}:{}", major(st.st_dev), minor(st.st_dev)));

        Self { sources, root }
    }

    /// True when the disk, any partition on it, or anything stacked on it is in use.
    fn holds(&self, sys: &Path, name: &str) -> bool {
        if self.in_use(sys, name) {
            return true;
        }

        let Ok(entries) = fs::read_dir(sys) else {
            return false;
        };
        entries.flatten().any(|entry| {
            let part = entry.file_name().to_string_lossy().to_string();
            part.starts_with(name) && self.in_use(&entry.path(), &part)
        })
    }

    fn in_use(&self, sys: &Path, name: &str) -> bool {
        if self.sources.contains(&format!("/dev/{}", name)) {
            return true;
        }
        if let (Some(root), Some(dev)) = (&self.root, read_attr(&sys.join("dev"))) {
            if *root == dev {
                return true;
            }
        }
        // LVM, dm-crypt or RAID members
        fs::read_dir(sys.join("holders"))
            .map(|mut holders| holders.next().is_some())
            .unwrap_or(false)
    }
}

fn parse_sources(table: &str) -> impl Iterator<Item = String> + '_ {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|source| source.starts_with("/dev/"))
        .map(str::to_string)
}
