//! Linux adapter integration tests against the running system.
//!
//! The loopback test requires root privileges and losetup.
//!
//! Run all tests: `cargo test --test linux_adapter`
//! Run ignored tests: `sudo cargo test --test linux_adapter -- --ignored`

#![cfg(target_os = "linux")]

use nix::unistd::Uid;
use sanitd::adapters::LinuxAdapter;
use sanitd::core::{HardwareAdapter, HardwareEvent};
use std::process::Command;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn is_root() -> bool {
    Uid::effective().is_root()
}

fn has_losetup() -> bool {
    Command::new("losetup").arg("--version").output().is_ok()
}

/// Attach a zero-filled temp file as a loopback device and return its path.
fn setup_loopback(file_path: &str, size_mb: u64) -> Option<String> {
    let result = Command::new("dd")
        .args([
            "if=/dev/zero",
            &format!("of={}", file_path),
            "bs=1M",
            &format!("count={}", size_mb),
        ])
        .output()
        .ok()?;

    if !result.status.success() {
        eprintln!("dd failed: {}", String::from_utf8_lossy(&result.stderr));
        return None;
    }

    let output = Command::new("losetup")
        .args(["--find", "--show", file_path])
        .output()
        .ok()?;

    if output.status.success() {
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        eprintln!("losetup failed: {}", String::from_utf8_lossy(&output.stderr));
        None
    }
}

fn teardown_loopback(loop_device: &str) {
    let _ = Command::new("losetup").args(["-d", loop_device]).output();
}

#[tokio::test]
async fn test_list_devices() {
    let adapter = LinuxAdapter::with_defaults();
    let devices = match adapter.list_devices() {
        Ok(devices) => devices,
        Err(e) => {
            // Containers may not expose /sys/block.
            eprintln!("Skipping: {:#}", e);
            return;
        }
    };

    for device in &devices {
        assert!(!device.name.starts_with("loop"), "loop devices are never listed");
        assert!(!device.id.is_empty());
        assert_eq!(device.path.to_string_lossy(), format!("/dev/{}", device.name));
    }

    let mut ids: Vec<&str> = devices.iter().map(|d| d.id.as_str()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), devices.len(), "device ids are unique");
}

#[tokio::test]
async fn test_start_stop() {
    let adapter = LinuxAdapter::with_defaults();
    let (tx, _rx) = mpsc::channel(32);

    adapter.start(tx);

    // Give udev monitor time to start
    tokio::time::sleep(Duration::from_millis(100)).await;

    adapter.stop();

    // Give poll timeout (500ms) time to notice cancellation
    tokio::time::sleep(Duration::from_millis(600)).await;
}

#[tokio::test]
#[ignore = "requires root privileges and losetup"]
async fn test_loopback_device_is_ignored() {
    if !is_root() {
        eprintln!("Skipping: requires root");
        return;
    }

    if !has_losetup() {
        eprintln!("Skipping: losetup not available");
        return;
    }

    let temp_file = NamedTempFile::new().expect("create temp file");
    let file_path = temp_file.path().to_string_lossy().to_string();

    let adapter = LinuxAdapter::with_defaults();
    let (tx, mut rx) = mpsc::channel(32);

    adapter.start(tx);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let loop_device = match setup_loopback(&file_path, 16) {
        Some(dev) => dev,
        None => {
            eprintln!("Failed to setup loopback device");
            adapter.stop();
            return;
        }
    };

    let event = timeout(Duration::from_secs(2), rx.recv()).await;
    let listed = adapter.list_devices();

    teardown_loopback(&loop_device);
    adapter.stop();

    if let Ok(Some(HardwareEvent::DeviceAdded(device))) = event {
        assert!(
            !device.name.starts_with("loop"),
            "loop device reported as a disk: {:?}",
            device
        );
    }

    let listed = listed.expect("list_devices");
    assert!(listed.iter().all(|d| !loop_device.ends_with(&d.name)));
}
