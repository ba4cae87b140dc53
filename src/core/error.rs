//! Error taxonomy shared by the registry, engine, coordinator and ledger.

use thiserror::Error;

/// Errors surfaced by wipe orchestration and the certificate ledger.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WipeError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("device {0} is already being wiped")]
    DeviceBusy(String),

    #[error("device {0} cannot be safely sanitized")]
    DeviceNotWipeable(String),

    #[error("method '{method}' is not supported for device {device_id}")]
    UnknownMethod { device_id: String, method: String },

    #[error("no devices selected")]
    EmptySelection,

    #[error("device {device_id} is not eligible for wiping: {reason}")]
    InvalidDevice { device_id: String, reason: String },

    #[error("hardware I/O error on {device_id}: {message}")]
    HardwareIo { device_id: String, message: String },

    /// The wipe stopped at an operator's request before its point of no return.
    #[error("wipe of {device_id} cancelled: {detail}")]
    Cancelled { device_id: String, detail: String },

    #[error("certificate chain integrity violated at index {index}: {reason}")]
    ChainIntegrity { index: u64, reason: String },

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("certificate not found: {0}")]
    CertificateNotFound(String),

    /// An uploaded certificate failed validation and was not linked.
    #[error("certificate {certificate_id} rejected: {reason}")]
    CertificateRejected { certificate_id: String, reason: String },

    #[error("certificate {0} is already on the ledger")]
    DuplicateCertificate(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl WipeError {
    /// Stable identifier used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DeviceNotFound(_) => "device_not_found",
            Self::DeviceBusy(_) => "device_busy",
            Self::DeviceNotWipeable(_) => "device_not_wipeable",
            Self::UnknownMethod { .. } => "unknown_method",
            Self::EmptySelection => "empty_selection",
            Self::InvalidDevice { .. } => "invalid_device",
            Self::HardwareIo { .. } => "hardware_io_error",
            Self::Cancelled { .. } => "cancelled",
            Self::ChainIntegrity { .. } => "chain_integrity_error",
            Self::JobNotFound(_) => "job_not_found",
            Self::CertificateNotFound(_) => "certificate_not_found",
            Self::CertificateRejected { .. } => "certificate_rejected",
            Self::DuplicateCertificate(_) => "duplicate_certificate",
            Self::ConnectionLost(_) => "connection_lost",
            Self::Storage(_) => "storage_error",
        }
    }

    /// Rejections that happen before any device is touched.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::DeviceNotFound(_)
                | Self::DeviceBusy(_)
                | Self::DeviceNotWipeable(_)
                | Self::UnknownMethod { .. }
                | Self::EmptySelection
                | Self::InvalidDevice { .. }
                | Self::CertificateRejected { .. }
                | Self::DuplicateCertificate(_)
        )
    }

    pub(crate) fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }
}
