use sanitd::adapters::{SimulatedAdapter, apply_demo_states, run_simulator_command};
use sanitd::core::models::{DeviceStatus, DeviceType};
use sanitd::core::sanitizer::simulated::FaultPlan;
use sanitd::core::{DeviceRegistry, HardwareAdapter, HardwareEvent};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

async fn next_event(rx: &mut mpsc::Receiver<HardwareEvent>) -> HardwareEvent {
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timeout waiting for event")
        .expect("channel closed")
}

#[tokio::test]
async fn test_add_device() {
    let (adapter, controller) = SimulatedAdapter::new(FaultPlan::new());
    let (tx, mut rx) = mpsc::channel(32);

    adapter.start(tx);
    controller.add_device("sim-1", DeviceType::Ssd, 64);

    match next_event(&mut rx).await {
        HardwareEvent::DeviceAdded(device) => {
            assert_eq!(device.id, "sim-1");
            assert_eq!(device.device_type, DeviceType::Ssd);
            assert_eq!(device.capacity, 64_000_000_000);
            assert!(device.model.contains("64GB"));
            assert!(device.is_wipeable());
        }
        _ => panic!("expected DeviceAdded event"),
    }

    let listed = adapter.list_devices().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, "sim-1");
}

#[tokio::test]
async fn test_remove_device() {
    let (adapter, controller) = SimulatedAdapter::with_demo_drives(FaultPlan::new());
    let (tx, mut rx) = mpsc::channel(32);

    adapter.start(tx);
    controller.remove_device("dev-3");

    match next_event(&mut rx).await {
        HardwareEvent::DeviceRemoved(id) => assert_eq!(id, "dev-3"),
        _ => panic!("expected DeviceRemoved event"),
    }

    let ids: Vec<String> = adapter.list_devices().unwrap().into_iter().map(|d| d.id).collect();
    assert_eq!(ids.len(), 5);
    assert!(!ids.contains(&"dev-3".to_string()));
}

#[tokio::test]
async fn test_multiple_events_keep_order() {
    let (adapter, controller) = SimulatedAdapter::new(FaultPlan::new());
    let (tx, mut rx) = mpsc::channel(32);

    adapter.start(tx);
    controller.add_device("a", DeviceType::Hdd, 32);
    controller.add_device("b", DeviceType::Usb, 16);
    controller.remove_device("a");

    let mut events = Vec::new();
    for _ in 0..3 {
        events.push(next_event(&mut rx).await);
    }

    assert!(matches!(&events[0], HardwareEvent::DeviceAdded(d) if d.id == "a"));
    assert!(matches!(&events[1], HardwareEvent::DeviceAdded(d) if d.id == "b"));
    assert!(matches!(&events[2], HardwareEvent::DeviceRemoved(id) if id == "a"));
}

#[tokio::test]
async fn test_demo_inventory_and_states() {
    let (adapter, _controller) = SimulatedAdapter::with_demo_drives(FaultPlan::new());
    let blocks = adapter.list_devices().unwrap();
    assert_eq!(blocks.len(), 6);

    let registry = DeviceRegistry::new();
    registry.reconcile(&blocks).await;
    apply_demo_states(&registry).await;

    let dev1 = registry.get("dev-1").await.unwrap();
    assert_eq!(dev1.model, "Seagate Barracuda 2TB");
    assert_eq!(dev1.capacity_display, "2.0 TB");
    assert_eq!(dev1.status, DeviceStatus::Ready);

    assert!(matches!(registry.get("dev-5").await.unwrap().status, DeviceStatus::Wiped { .. }));
    assert_eq!(
        registry.get("dev-6").await.unwrap().status.error_message(),
        Some("Device not responding.")
    );
}

#[tokio::test]
async fn test_simulator_commands() {
    let faults = FaultPlan::new();
    let (adapter, controller) = SimulatedAdapter::new(faults.clone());
    let (tx, mut rx) = mpsc::channel(32);
    adapter.start(tx);

    assert!(run_simulator_command(&controller, "add usb-1 usb 8"));
    assert!(matches!(next_event(&mut rx).await, HardwareEvent::DeviceAdded(d) if d.device_type == DeviceType::Usb));

    assert!(run_simulator_command(&controller, "fault usb-1 40"));
    assert_eq!(faults.take("usb-1"), Some(40));

    assert!(run_simulator_command(&controller, "rm usb-1"));
    assert!(matches!(next_event(&mut rx).await, HardwareEvent::DeviceRemoved(id) if id == "usb-1"));

    assert!(!run_simulator_command(&controller, "explode usb-1"));
}

#[tokio::test]
async fn test_list_devices_empty() {
    let (adapter, _controller) = SimulatedAdapter::new(FaultPlan::new());
    assert!(adapter.list_devices().unwrap().is_empty());
}
