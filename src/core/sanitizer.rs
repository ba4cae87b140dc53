pub mod firmware;
pub mod overwrite;
pub mod simulated;

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::error::WipeError;
use super::methods::{MethodKind, WipeMethod};
use super::models::{Device, DeviceType};
use firmware::FirmwareEraser;
use overwrite::OverwriteEngine;
use simulated::{FaultPlan, SimulatedSanitizer};

/// Everything a backend needs to sanitize one device.
#[derive(Debug, Clone)]
pub struct SanitizeRequest {
    pub device_id: String,
    pub path: PathBuf,
    pub device_type: DeviceType,
    pub capacity: u64,
    pub method: WipeMethod,
}

impl SanitizeRequest {
    pub fn for_device(device: &Device, method: WipeMethod) -> Self {
        Self {
            device_id: device.id.clone(),
            path: device.path.clone(),
            device_type: device.device_type,
            capacity: device.capacity,
            method,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SanitizeStatus {
    Preparing,
    Overwriting {
        pass: usize,
        total_passes: usize,
        bytes_done: u64,
        total_bytes: u64,
        percentage: u8,
    },
    Verifying {
        bytes_done: u64,
        total_bytes: u64,
        percentage: u8,
    },
    /// Firmware erase running; percentage is reported or estimated.
    Erasing { percentage: u8 },
    /// Cancellation is no longer honoured from here on.
    PointOfNoReturn,
}

impl SanitizeStatus {
    /// Whole-operation progress carried by this status, if any.
    pub fn percentage(&self) -> Option<u8> {
        match self {
            Self::Overwriting { percentage, .. }
            | Self::Verifying { percentage, .. }
            | Self::Erasing { percentage } => Some(*percentage),
            Self::Preparing | Self::PointOfNoReturn => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Preparing => "preparing".to_string(),
            Self::Overwriting {
                pass, total_passes, ..
            } => format!("overwrite pass {} of {}", pass, total_passes),
            Self::Verifying { .. } => "verifying final pass".to_string(),
            Self::Erasing { .. } => "firmware erase running".to_string(),
            Self::PointOfNoReturn => "point of no return reached".to_string(),
        }
    }
}

/// Result of a completed sanitization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SanitizeReport {
    pub bytes_processed: u64,
    pub duration_secs: u64,
    pub verified: bool,
}

/// Channels handed to a backend for one run.
#[derive(Clone)]
pub struct SanitizeControl {
    pub progress: mpsc::Sender<SanitizeStatus>,
    pub cancel: CancellationToken,
}

pub type SanitizeFuture = Pin<Box<dyn Future<Output = Result<SanitizeReport, WipeError>> + Send>>;

pub trait Sanitizer: Send + Sync {
    fn sanitize(&self, req: &SanitizeRequest, ctl: SanitizeControl) -> SanitizeFuture;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SanitizerBackend {
    /// Overwrite through the block device, firmware methods through hdparm and nvme-cli.
    #[default]
    Native,
    Simulated,
}

/// Real-hardware backend: routes each method to the mechanism that implements it.
pub struct DeviceSanitizer {
    overwrite: OverwriteEngine,
    firmware: FirmwareEraser,
}

impl DeviceSanitizer {
    pub fn new(ata_password: impl Into<String>) -> Self {
        Self {
            overwrite: OverwriteEngine::default(),
            firmware: FirmwareEraser::new(ata_password),
        }
    }
}

impl Sanitizer for DeviceSanitizer {
    fn sanitize(&self, req: &SanitizeRequest, ctl: SanitizeControl) -> SanitizeFuture {
        match req.method.kind() {
            MethodKind::Overwrite(_) => self.overwrite.sanitize(req, ctl),
            MethodKind::AtaSecureErase | MethodKind::NvmeSanitize(_) => {
                self.firmware.sanitize(req, ctl)
            }
        }
    }
}

pub fn create_sanitizer(
    backend: SanitizerBackend,
    ata_password: &str,
    faults: FaultPlan,
) -> Arc<dyn Sanitizer> {
    match backend {
        SanitizerBackend::Native => Arc::new(DeviceSanitizer::new(ata_password)),
        SanitizerBackend::Simulated => Arc::new(SimulatedSanitizer::new(faults)),
    }
}
