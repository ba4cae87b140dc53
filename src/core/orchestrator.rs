//! Daemon lifecycle: inventory, hotplug, servers and shutdown.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::adapters;
use crate::context::AppContext;
use crate::core::error::WipeError;
use crate::core::events::{DeviceUpdate, Event, Notification, NotificationLevel};
use crate::core::hardware::{BlockDevice, HardwareEvent};
use crate::core::ledger::WipeRecord;
use crate::core::registry::{Removal, RescanReport};
use crate::rpc::RpcServer;
use crate::web::WebServer;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct Orchestrator {
    ctx: AppContext,
}

impl Orchestrator {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    pub async fn start(&self) -> Result<()> {
        let config = self.ctx.config.clone();
        info!(
            simulation = config.simulation,
            backend = ?config.effective_backend(),
            data_dir = %config.data_dir.display(),
            "sanitd starting"
        );

        rescan(&self.ctx).await.context("Initial device enumeration failed")?;
        if config.simulation {
            adapters::apply_demo_states(&self.ctx.registry).await;
        }

        let (tx, mut rx) = mpsc::channel(32);
        self.ctx.adapter.start(tx);

        let rpc_addr: SocketAddr = config
            .rpc_bind
            .parse()
            .with_context(|| format!("Invalid rpc_bind address: {}", config.rpc_bind))?;
        let http_addr: SocketAddr = config
            .http_bind
            .parse()
            .with_context(|| format!("Invalid http_bind address: {}", config.http_bind))?;

        let rpc = Arc::new(RpcServer::new(self.ctx.clone(), rpc_addr));
        let rpc_task = {
            let rpc = rpc.clone();
            tokio::spawn(async move {
                if let Err(e) = rpc.start().await {
                    error!(error = %e, "RPC server failed");
                }
            })
        };

        let web = Arc::new(WebServer::new(self.ctx.clone(), http_addr));
        let web_task = {
            let web = web.clone();
            tokio::spawn(async move {
                if let Err(e) = web.start().await {
                    error!(error = %e, "Web server failed");
                }
            })
        };

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => self.handle_device_event(event).await,
                    None => {
                        warn!("Hardware monitor closed; hotplug disabled");
                        let _ = (&mut shutdown).await;
                        break;
                    }
                },
                _ = &mut shutdown => break,
            }
        }

        info!("Shutdown requested");
        let active = self.ctx.coordinator.active_jobs().await;
        if active > 0 {
            warn!(active_jobs = active, "Exiting with wipes in progress; affected devices are in an undefined state");
        }

        self.ctx.adapter.stop();
        rpc.shutdown();
        web.shutdown();

        let joined = tokio::time::timeout(SHUTDOWN_GRACE, async {
            let _ = rpc_task.await;
            let _ = web_task.await;
        })
        .await;
        if joined.is_err() {
            warn!("Servers did not stop within the grace period");
        }

        Ok(())
    }

    pub async fn handle_device_event(&self, event: HardwareEvent) {
        match event {
            HardwareEvent::DeviceAdded(block) => self.handle_device_added(block).await,
            HardwareEvent::DeviceRemoved(id) => self.handle_device_removed(id).await,
        }
    }

    async fn handle_device_added(&self, block: BlockDevice) {
        let (device, added) = self.ctx.registry.upsert(&block).await;
        info!(
            device_id = %device.id,
            model = %device.model,
            wipeable = device.is_wipeable,
            "Device attached"
        );

        self.ctx
            .events
            .publish(Event::DeviceUpdate(DeviceUpdate::from_device(&device)));
        if added {
            self.ctx.events.publish(Event::Notification(Notification::new(
                NotificationLevel::Info,
                "Device connected",
                format!("{} ({})", device.model, device.capacity_display),
            )));
        }
    }

    async fn handle_device_removed(&self, id: String) {
        let device = match self.ctx.registry.remove_if_idle(&id).await {
            Removal::Removed(device) => device,
            Removal::Retained => {
                // The wipe's own I/O reports the failure.
                warn!(device_id = %id, "Device detached mid-wipe");
                return;
            }
            Removal::Missing => return,
        };
        info!(device_id = %id, "Device detached");

        self.ctx.events.publish(Event::DeviceUpdate(DeviceUpdate {
            device_id: id,
            status: "Removed".to_string(),
            progress: None,
            error_message: None,
            timestamp: chrono::Utc::now(),
        }));
        self.ctx.events.publish(Event::Notification(Notification::new(
            NotificationLevel::Warning,
            "Device disconnected",
            device.model,
        )));
    }
}

/// Reconcile the registry with a fresh enumeration.
pub async fn rescan(ctx: &AppContext) -> Result<RescanReport> {
    let adapter = ctx.adapter.clone();
    let blocks = tokio::task::spawn_blocking(move || adapter.list_devices())
        .await
        .context("Device enumeration task failed")??;

    let report = ctx.registry.reconcile(&blocks).await;
    for id in &report.added {
        if let Ok(device) = ctx.registry.get(id).await {
            ctx.events
                .publish(Event::DeviceUpdate(DeviceUpdate::from_device(&device)));
        }
    }

    info!(
        devices = blocks.len(),
        added = report.added.len(),
        removed = report.removed.len(),
        retained = report.retained.len(),
        "Device inventory reconciled"
    );
    Ok(report)
}

/// Wipes on record for one device, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceHistory {
    pub device_id: String,
    pub history: Vec<WipeRecord>,
    pub total_wipes: usize,
}

/// Inventory counts plus the latest certified wipes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatistics {
    pub total_devices: usize,
    pub wipeable_devices: usize,
    /// Keyed by status label (`Ready`, `WipeInProgress`, `Wiped`, `Error`).
    pub by_status: BTreeMap<String, usize>,
    /// Keyed by device type (`HDD`, `SSD`, `NVMe`, `USB`).
    pub device_types: BTreeMap<String, usize>,
    pub recent_wipes: Vec<WipeRecord>,
}

const RECENT_WIPES: usize = 10;

/// Certified wipes of a device. A device that is neither attached nor on the
/// ledger is unknown.
pub async fn device_history(ctx: &AppContext, device_id: &str) -> Result<DeviceHistory, WipeError> {
    let history = ctx.ledger.history_for_device(device_id).await?;
    if history.is_empty() {
        ctx.registry.get(device_id).await?;
    }

    Ok(DeviceHistory {
        device_id: device_id.to_string(),
        total_wipes: history.len(),
        history,
    })
}

pub async fn statistics(ctx: &AppContext) -> Result<DeviceStatistics, WipeError> {
    let devices = ctx.registry.list().await;

    let mut by_status = BTreeMap::new();
    let mut device_types = BTreeMap::new();
    for device in &devices {
        *by_status.entry(device.status.label().to_string()).or_insert(0) += 1;
        *device_types.entry(device.device_type.to_string()).or_insert(0) += 1;
    }

    Ok(DeviceStatistics {
        total_devices: devices.len(),
        wipeable_devices: devices.iter().filter(|d| d.is_wipeable).count(),
        by_status,
        device_types,
        recent_wipes: ctx.ledger.recent_wipes(RECENT_WIPES).await?,
    })
}
