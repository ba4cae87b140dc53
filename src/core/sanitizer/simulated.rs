use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::debug;

use super::{SanitizeControl, SanitizeFuture, SanitizeReport, SanitizeRequest, SanitizeStatus, Sanitizer};
use crate::core::error::WipeError;
use crate::core::methods::PointOfNoReturn;
use crate::core::models::DeviceType;

/// Faults armed for upcoming simulated wipes, keyed by device id.
/// Each entry fires once, when the wipe reaches the given percentage.
#[derive(Clone, Default)]
pub struct FaultPlan {
    faults: Arc<Mutex<HashMap<String, u8>>>,
}

impl FaultPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject(&self, device_id: &str, at_percent: u8) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device_id.to_string(), at_percent.min(100));
    }

    pub fn take(&self, device_id: &str) -> Option<u8> {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(device_id)
    }
}

/// Sanitizer that only pretends, for demos and tests.
pub struct SimulatedSanitizer {
    pub tick: Duration,
    faults: FaultPlan,
}

impl SimulatedSanitizer {
    pub fn new(faults: FaultPlan) -> Self {
        Self {
            tick: Duration::from_millis(500),
            faults,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }
}

fn steps_for(device_type: DeviceType) -> u64 {
    match device_type {
        DeviceType::Hdd => 20,
        DeviceType::Usb => 15,
        DeviceType::Ssd => 6,
        DeviceType::Nvme => 4,
    }
}

impl Sanitizer for SimulatedSanitizer {
    fn sanitize(&self, req: &SanitizeRequest, ctl: SanitizeControl) -> SanitizeFuture {
        let req = req.clone();
        let tick = self.tick;
        let fail_at = self.faults.take(&req.device_id);

        Box::pin(async move {
            let start_time = Instant::now();
            let steps = steps_for(req.device_type);
            let passes = req.method.passes().len() as u64;

            // Steps completed before cancellation stops being honoured.
            let ponr_step = match req.method.point_of_no_return() {
                PointOfNoReturn::FinalPass => steps * passes.saturating_sub(1) / passes.max(1),
                PointOfNoReturn::CommandIssued => 1,
            };

            let _ = ctl.progress.send(SanitizeStatus::Preparing).await;

            for step in 1..=steps {
                let past_ponr = step > ponr_step;

                if step == ponr_step + 1 {
                    // A cancel that lands before the final phase still counts.
                    if ctl.cancel.is_cancelled() {
                        return Err(cancelled(&req, step - 1, steps));
                    }
                    let _ = ctl.progress.send(SanitizeStatus::PointOfNoReturn).await;
                }

                if !past_ponr {
                    tokio::select! {
                        _ = sleep(tick) => {}
                        _ = ctl.cancel.cancelled() => {
                            return Err(cancelled(&req, step - 1, steps));
                        }
                    }
                } else {
                    sleep(tick).await;
                }

                let percentage = ((step * 100) / steps).min(99) as u8;

                if let Some(at) = fail_at {
                    if percentage >= at {
                        debug!(device_id = %req.device_id, percentage, "Injected fault fired");
                        return Err(WipeError::HardwareIo {
                            device_id: req.device_id.clone(),
                            message: format!("simulated I/O fault at {}%", percentage),
                        });
                    }
                }

                let status = if passes > 0 {
                    SanitizeStatus::Overwriting {
                        pass: (((step - 1) * passes) / steps + 1) as usize,
                        total_passes: passes as usize,
                        bytes_done: req.capacity / steps * step,
                        total_bytes: req.capacity,
                        percentage,
                    }
                } else {
                    SanitizeStatus::Erasing { percentage }
                };
                let _ = ctl.progress.send(status).await;
            }

            Ok(SanitizeReport {
                bytes_processed: req.capacity,
                duration_secs: start_time.elapsed().as_secs(),
                verified: passes > 0,
            })
        })
    }
}

fn cancelled(req: &SanitizeRequest, completed_steps: u64, steps: u64) -> WipeError {
    let detail = if completed_steps == 0 {
        "cancelled before any data was written; device contents unchanged".to_string()
    } else {
        format!(
            "cancelled after {}% of the wipe; device contents are partially overwritten",
            completed_steps * 100 / steps
        )
    };
    WipeError::Cancelled {
        device_id: req.device_id.clone(),
        detail,
    }
}
