//! Sanitization Engine: runs one sanitization per device and owns that
//! device's transition out of `WipeInProgress`.

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::error::WipeError;
use super::events::{DeviceUpdate, Event, EventBus};
use super::methods::WipeMethod;
use super::models::Device;
use super::registry::DeviceRegistry;
use super::sanitizer::{SanitizeControl, SanitizeReport, SanitizeRequest, SanitizeStatus, Sanitizer};
use crate::logging::LogThrottle;

/// Floor for the heartbeat period.
const MIN_PROGRESS_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Clone)]
pub struct SanitizationEngine {
    registry: DeviceRegistry,
    events: EventBus,
    sanitizer: Arc<dyn Sanitizer>,
    progress_interval: Duration,
}

/// How a device's wipe ended.
#[derive(Debug, Clone)]
pub struct WipeOutcome {
    /// Device as it stood after the terminal transition.
    pub device: Device,
    pub method: WipeMethod,
    pub result: Result<SanitizeReport, WipeError>,
}

impl WipeOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelDisposition {
    /// The wipe was signalled and will stop at its next check.
    Requested,
    /// The wipe will run to completion regardless.
    PastPointOfNoReturn,
    AlreadyFinished,
}

/// Handle to one running wipe.
#[derive(Debug)]
pub struct WipeHandle {
    pub device_id: String,
    pub method: WipeMethod,
    device: Device,
    progress: watch::Receiver<u8>,
    cancel: CancellationToken,
    past_ponr: Arc<AtomicBool>,
    task: JoinHandle<WipeOutcome>,
}

impl WipeHandle {
    pub fn progress(&self) -> u8 {
        *self.progress.borrow()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<u8> {
        self.progress.clone()
    }

    pub fn is_past_point_of_no_return(&self) -> bool {
        self.past_ponr.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) -> CancelDisposition {
        cancel_wipe(&self.cancel, &self.past_ponr, self.task.is_finished())
    }

    /// Shareable cancel switch for this wipe.
    pub fn canceller(&self) -> WipeCanceller {
        WipeCanceller {
            device_id: self.device_id.clone(),
            cancel: self.cancel.clone(),
            past_ponr: self.past_ponr.clone(),
        }
    }

    pub async fn wait(self) -> WipeOutcome {
        let device = self.device;
        let method = self.method;
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(device_id = %device.id, error = %e, "Wipe task aborted");
                WipeOutcome {
                    result: Err(WipeError::HardwareIo {
                        device_id: device.id.clone(),
                        message: format!("wipe task aborted: {}", e),
                    }),
                    device,
                    method,
                }
            }
        }
    }

    /// Wait for completion, calling `on_progress` for every progress change.
    pub async fn wait_with_progress(mut self, mut on_progress: impl FnMut(u8)) -> WipeOutcome {
        while self.progress.changed().await.is_ok() {
            let value = *self.progress.borrow_and_update();
            on_progress(value);
        }
        self.wait().await
    }
}

/// Cancel switch detached from the handle, for callers that only need to stop a wipe.
#[derive(Clone)]
pub struct WipeCanceller {
    pub device_id: String,
    cancel: CancellationToken,
    past_ponr: Arc<AtomicBool>,
}

impl WipeCanceller {
    pub fn cancel(&self) -> CancelDisposition {
        cancel_wipe(&self.cancel, &self.past_ponr, false)
    }
}

fn cancel_wipe(cancel: &CancellationToken, past_ponr: &AtomicBool, finished: bool) -> CancelDisposition {
    if past_ponr.load(Ordering::SeqCst) {
        CancelDisposition::PastPointOfNoReturn
    } else if finished {
        CancelDisposition::AlreadyFinished
    } else {
        cancel.cancel();
        CancelDisposition::Requested
    }
}

impl SanitizationEngine {
    pub fn new(
        registry: DeviceRegistry,
        events: EventBus,
        sanitizer: Arc<dyn Sanitizer>,
        progress_interval: Duration,
    ) -> Self {
        Self {
            registry,
            events,
            sanitizer,
            progress_interval: progress_interval.max(MIN_PROGRESS_INTERVAL),
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Start wiping one device with the named method, or its default.
    pub async fn start_wipe(
        &self,
        device_id: &str,
        method: Option<&str>,
    ) -> Result<WipeHandle, WipeError> {
        let (device, method) = self.registry.begin_wipe(device_id, method).await?;
        Ok(self.launch(device, method, CancellationToken::new()))
    }

    /// Run a wipe for a device the registry has already moved to `WipeInProgress`.
    pub fn launch(&self, device: Device, method: WipeMethod, cancel: CancellationToken) -> WipeHandle {
        let (progress_tx, progress_rx) = watch::channel(0u8);
        let past_ponr = Arc::new(AtomicBool::new(false));

        let run = WipeRun {
            registry: self.registry.clone(),
            events: self.events.clone(),
            sanitizer: self.sanitizer.clone(),
            progress_interval: self.progress_interval,
            device: device.clone(),
            method,
            cancel: cancel.clone(),
            past_ponr: past_ponr.clone(),
            progress_tx,
        };

        let span = info_span!("wipe", device_id = %device.id, method = %method);
        let task = tokio::spawn(run.execute().instrument(span));

        WipeHandle {
            device_id: device.id.clone(),
            method,
            device,
            progress: progress_rx,
            cancel,
            past_ponr,
            task,
        }
    }
}

struct WipeRun {
    registry: DeviceRegistry,
    events: EventBus,
    sanitizer: Arc<dyn Sanitizer>,
    progress_interval: Duration,
    device: Device,
    method: WipeMethod,
    cancel: CancellationToken,
    past_ponr: Arc<AtomicBool>,
    progress_tx: watch::Sender<u8>,
}

impl WipeRun {
    async fn execute(self) -> WipeOutcome {
        info!(capacity = self.device.capacity, "Wipe started");
        self.events
            .publish(Event::DeviceUpdate(DeviceUpdate::from_device(&self.device)));

        let req = SanitizeRequest::for_device(&self.device, self.method);
        let (tx, mut rx) = mpsc::channel(64);
        let ctl = SanitizeControl {
            progress: tx,
            cancel: self.cancel.clone(),
        };
        let mut work = tokio::spawn(self.sanitizer.sanitize(&req, ctl));

        let mut heartbeat = tokio::time::interval(self.progress_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let throttle = LogThrottle::new(Duration::from_secs(5));
        let mut last_publish = Instant::now();

        let result = loop {
            tokio::select! {
                Some(status) = rx.recv() => {
                    if self.apply(&status, &throttle).await {
                        last_publish = Instant::now();
                    }
                }
                _ = heartbeat.tick() => {
                    if last_publish.elapsed() >= self.progress_interval {
                        if let Ok(device) = self.registry.get(&self.device.id).await {
                            self.events.publish(Event::DeviceUpdate(DeviceUpdate::from_device(&device)));
                        }
                        last_publish = Instant::now();
                    }
                }
                joined = &mut work => {
                    while let Ok(status) = rx.try_recv() {
                        self.apply(&status, &throttle).await;
                    }
                    break joined.unwrap_or_else(|e| Err(WipeError::HardwareIo {
                        device_id: self.device.id.clone(),
                        message: format!("sanitizer task aborted: {}", e),
                    }));
                }
            }
        };

        self.finish(result).await
    }

    /// Apply one backend status. Returns true when an update was published.
    async fn apply(&self, status: &SanitizeStatus, throttle: &LogThrottle) -> bool {
        if *status == SanitizeStatus::PointOfNoReturn {
            self.past_ponr.store(true, Ordering::SeqCst);
            info!("Point of no return reached, cancellation no longer honoured");
            return false;
        }

        let Some(percentage) = status.percentage() else {
            return false;
        };

        let Some(device) = self.registry.record_progress(&self.device.id, percentage).await else {
            return false;
        };

        self.progress_tx.send_if_modified(|current| {
            if percentage > *current {
                *current = percentage;
                true
            } else {
                false
            }
        });
        self.events
            .publish(Event::DeviceUpdate(DeviceUpdate::from_device(&device)));

        if throttle.should_log() {
            debug!(progress = percentage, stage = %status.describe(), "Wipe progress");
        }
        true
    }

    async fn finish(self, result: Result<SanitizeReport, WipeError>) -> WipeOutcome {
        let id = self.device.id.clone();

        let device = match &result {
            Ok(report) => match self.registry.complete(&id).await {
                Ok(device) => {
                    self.progress_tx.send_replace(100);
                    info!(
                        bytes = report.bytes_processed,
                        duration_secs = report.duration_secs,
                        verified = report.verified,
                        "Wipe complete"
                    );
                    device
                }
                Err(e) => {
                    warn!(error = %e, "Wipe finished but device left the registry");
                    self.device.clone()
                }
            },
            Err(err) => {
                // Surfaced as-is; a destructive operation is never retried here.
                match err {
                    WipeError::Cancelled { .. } => warn!(error = %err, "Wipe cancelled"),
                    _ => error!(error = %err, "Wipe failed"),
                }
                match self.registry.fail(&id, &err.to_string()).await {
                    Ok(device) => device,
                    Err(e) => {
                        warn!(error = %e, "Wipe failed and device left the registry");
                        self.device.clone()
                    }
                }
            }
        };

        self.events
            .publish(Event::DeviceUpdate(DeviceUpdate::from_device(&device)));

        WipeOutcome {
            device,
            method: self.method,
            result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hardware::BlockDevice;
    use crate::core::models::{DeviceStatus, DeviceType};
    use crate::core::sanitizer::simulated::{FaultPlan, SimulatedSanitizer};
    use std::path::PathBuf;

    async fn engine_with(device_type: DeviceType, faults: FaultPlan) -> SanitizationEngine {
        let registry = DeviceRegistry::new();
        registry
            .upsert(&BlockDevice {
                id: "dev-1".into(),
                name: "sdz".into(),
                path: PathBuf::from("/dev/sdz"),
                model: "Test Disk".into(),
                serial: "SN-TEST".into(),
                device_type,
                capacity: 8_000_000,
                is_system: false,
                read_only: false,
            })
            .await;

        let sanitizer = SimulatedSanitizer::new(faults).with_tick(Duration::from_millis(2));
        SanitizationEngine::new(
            registry,
            EventBus::new(),
            Arc::new(sanitizer),
            Duration::from_millis(20),
        )
    }

    #[tokio::test]
    async fn wipe_reaches_wiped_with_monotonic_progress() {
        let engine = engine_with(DeviceType::Hdd, FaultPlan::new()).await;
        let handle = engine.start_wipe("dev-1", None).await.unwrap();

        let mut seen = Vec::new();
        let outcome = handle.wait_with_progress(|p| seen.push(p)).await;

        assert!(outcome.is_success());
        assert!(matches!(outcome.device.status, DeviceStatus::Wiped { .. }));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last(), Some(&100));
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_running() {
        let engine = engine_with(DeviceType::Hdd, FaultPlan::new()).await;
        let handle = engine.start_wipe("dev-1", None).await.unwrap();

        let err = engine.start_wipe("dev-1", None).await.unwrap_err();
        assert_eq!(err, WipeError::DeviceBusy("dev-1".into()));
        handle.wait().await;
    }

    #[tokio::test]
    async fn hardware_fault_ends_in_error_without_retry() {
        let faults = FaultPlan::new();
        faults.inject("dev-1", 40);
        let engine = engine_with(DeviceType::Hdd, faults).await;

        let outcome = engine.start_wipe("dev-1", None).await.unwrap().wait().await;
        assert!(matches!(outcome.result, Err(WipeError::HardwareIo { .. })));
        let message = outcome.device.status.error_message().unwrap();
        assert!(message.contains("simulated I/O fault"));

        let device = engine.registry().get("dev-1").await.unwrap();
        assert_eq!(device.status.label(), "Error");
    }

    #[tokio::test]
    async fn cancel_before_point_of_no_return() {
        let engine = engine_with(DeviceType::Hdd, FaultPlan::new()).await;
        let handle = engine
            .start_wipe("dev-1", Some("DoD 5220.22-M"))
            .await
            .unwrap();

        assert_eq!(handle.cancel(), CancelDisposition::Requested);
        let outcome = handle.wait().await;
        assert!(matches!(outcome.result, Err(WipeError::Cancelled { .. })));
        assert!(outcome.device.status.error_message().unwrap().contains("cancelled"));
    }

    #[tokio::test]
    async fn cancel_after_point_of_no_return_runs_to_completion() {
        let engine = engine_with(DeviceType::Nvme, FaultPlan::new()).await;
        let handle = engine.start_wipe("dev-1", None).await.unwrap();

        let mut progress = handle.subscribe_progress();
        while !handle.is_past_point_of_no_return() {
            if progress.changed().await.is_err() {
                break;
            }
        }

        assert_eq!(handle.cancel(), CancelDisposition::PastPointOfNoReturn);
        assert!(handle.wait().await.is_success());
    }
}
