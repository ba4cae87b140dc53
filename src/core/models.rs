use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::hardware::BlockDevice;
use super::methods::WipeMethod;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    #[serde(rename = "HDD")]
    Hdd,
    #[serde(rename = "SSD")]
    Ssd,
    #[serde(rename = "NVMe")]
    Nvme,
    #[serde(rename = "USB")]
    Usb,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hdd => "HDD",
            Self::Ssd => "SSD",
            Self::Nvme => "NVMe",
            Self::Usb => "USB",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "hdd" => Some(Self::Hdd),
            "ssd" => Some(Self::Ssd),
            "nvme" => Some(Self::Nvme),
            "usb" => Some(Self::Usb),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device lifecycle: `Ready -> WipeInProgress -> {Wiped | Error}`.
///
/// Progress only exists while a wipe runs and an error message only exists in
/// the `Error` state, so both live inside their variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum DeviceStatus {
    Ready,
    WipeInProgress {
        progress_percentage: u8,
        method: WipeMethod,
    },
    Wiped {
        method: WipeMethod,
        completed_at: DateTime<Utc>,
    },
    Error {
        error_message: String,
    },
}

impl DeviceStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ready => "Ready",
            Self::WipeInProgress { .. } => "WipeInProgress",
            Self::Wiped { .. } => "Wiped",
            Self::Error { .. } => "Error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Wiped { .. } | Self::Error { .. })
    }

    pub fn progress(&self) -> Option<u8> {
        match self {
            Self::WipeInProgress {
                progress_percentage,
                ..
            } => Some(*progress_percentage),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Error { error_message } => Some(error_message),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub model: String,
    pub serial_number: String,
    /// Capacity in bytes.
    pub capacity: u64,
    pub capacity_display: String,
    pub path: PathBuf,
    pub is_wipeable: bool,
    pub supported_methods: Vec<WipeMethod>,
    #[serde(flatten)]
    pub status: DeviceStatus,
}

impl Device {
    pub fn from_block(block: &BlockDevice) -> Self {
        Self {
            id: block.id.clone(),
            device_type: block.device_type,
            model: block.model.clone(),
            serial_number: block.serial.clone(),
            capacity: block.capacity,
            capacity_display: format_capacity(block.capacity),
            path: block.path.clone(),
            is_wipeable: block.is_wipeable(),
            supported_methods: WipeMethod::for_device_type(block.device_type).to_vec(),
            status: DeviceStatus::Ready,
        }
    }

    /// Resolve the method for a wipe request: the named one, or the device's default.
    pub fn resolve_method(&self, requested: Option<&str>) -> Option<WipeMethod> {
        match requested {
            Some(name) => WipeMethod::from_name(name).filter(|m| self.supported_methods.contains(m)),
            None => self.supported_methods.first().copied(),
        }
    }
}

/// Humanize a byte count with decimal units ("2.0 TB", "500 GB").
pub fn format_capacity(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else if value >= 100.0 {
        format!("{:.0} {}", value, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
    WipeInProgress,
    Wiped,
    Error,
}

impl MemberStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::WipeInProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WipeInProgress => "WipeInProgress",
            Self::Wiped => "Wiped",
            Self::Error => "Error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [Self::WipeInProgress, Self::Wiped, Self::Error]
            .into_iter()
            .find(|status| status.as_str() == s)
    }
}

/// Job-scoped view of one device's wipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMember {
    pub device_id: String,
    pub method: WipeMethod,
    pub status: MemberStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub certificate_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Running,
    /// Every device wiped and certified.
    Succeeded,
    /// Every device terminal, at least one without a certificate.
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [Self::Running, Self::Succeeded, Self::Failed]
            .into_iter()
            .find(|status| status.as_str() == s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WipeJob {
    pub job_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    /// Mean of member progress; failed members keep their last observed value.
    pub progress: u8,
    pub cancel_requested: bool,
    pub members: Vec<JobMember>,
}

impl WipeJob {
    pub fn new(job_id: String, devices: Vec<(String, WipeMethod)>) -> Self {
        let members = devices
            .into_iter()
            .map(|(device_id, method)| JobMember {
                device_id,
                method,
                status: MemberStatus::WipeInProgress,
                progress: 0,
                error: None,
                certificate_id: None,
            })
            .collect();

        Self {
            job_id,
            created_at: Utc::now(),
            finished_at: None,
            status: JobStatus::Running,
            progress: 0,
            cancel_requested: false,
            members,
        }
    }

    pub fn member(&self, device_id: &str) -> Option<&JobMember> {
        self.members.iter().find(|m| m.device_id == device_id)
    }

    pub fn member_mut(&mut self, device_id: &str) -> Option<&mut JobMember> {
        self.members.iter_mut().find(|m| m.device_id == device_id)
    }

    /// Raise a member's progress. Values never move backwards.
    pub fn record_progress(&mut self, device_id: &str, progress: u8) {
        if let Some(member) = self.member_mut(device_id) {
            if member.status == MemberStatus::WipeInProgress && progress > member.progress {
                member.progress = progress.min(100);
            }
        }
        self.refresh();
    }

    pub fn mark_wiped(&mut self, device_id: &str) {
        if let Some(member) = self.member_mut(device_id) {
            member.status = MemberStatus::Wiped;
            member.progress = 100;
        }
        self.refresh();
    }

    pub fn mark_failed(&mut self, device_id: &str, error: String) {
        if let Some(member) = self.member_mut(device_id) {
            member.status = MemberStatus::Error;
            member.error = Some(error);
        }
        self.refresh();
    }

    pub fn attach_certificate(&mut self, device_id: &str, certificate_id: String) {
        if let Some(member) = self.member_mut(device_id) {
            member.certificate_id = Some(certificate_id);
        }
        self.refresh();
    }

    /// A wiped device whose certificate could not be issued.
    pub fn mark_uncertified(&mut self, device_id: &str, error: String) {
        if let Some(member) = self.member_mut(device_id) {
            member.error = Some(error);
        }
        self.refresh();
    }

    pub fn is_done(&self) -> bool {
        self.members.iter().all(|m| m.status.is_terminal())
    }

    pub fn succeeded_count(&self) -> usize {
        self.members
            .iter()
            .filter(|m| m.status == MemberStatus::Wiped && m.certificate_id.is_some())
            .count()
    }

    /// Called once every member task has finished.
    pub fn finish(&mut self) {
        self.refresh();
        if self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
        self.status = if self.succeeded_count() == self.members.len() {
            JobStatus::Succeeded
        } else {
            JobStatus::Failed
        };
    }

    fn refresh(&mut self) {
        if self.members.is_empty() {
            self.progress = 0;
            return;
        }
        let sum: u32 = self.members.iter().map(|m| m.progress as u32).sum();
        self.progress = (sum / self.members.len() as u32) as u8;
    }
}

/// One link of the certificate ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub certificate_id: String,
    pub chain_index: u64,
    pub device_id: String,
    pub device_model: String,
    pub device_serial: String,
    pub device_type: DeviceType,
    pub capacity: u64,
    pub method_used: String,
    pub completion_timestamp: DateTime<Utc>,
    /// BLAKE3 of the verification code printed on the certificate document.
    pub verification_key: String,
    pub hash_of_previous_certificate: String,
    pub digest: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_humanized_with_decimal_units() {
        assert_eq!(format_capacity(2_000_000_000_000), "2.0 TB");
        assert_eq!(format_capacity(500_107_862_016), "500 GB");
        assert_eq!(format_capacity(240_000_000_000), "240 GB");
        assert_eq!(format_capacity(512), "512 B");
    }

    #[test]
    fn device_status_flattens_into_device_json() {
        let device = Device {
            id: "dev-1".into(),
            device_type: DeviceType::Hdd,
            model: "Seagate Barracuda 2TB".into(),
            serial_number: "SN-HDD-123456789".into(),
            capacity: 2_000_000_000_000,
            capacity_display: format_capacity(2_000_000_000_000),
            path: PathBuf::from("/dev/sda"),
            is_wipeable: true,
            supported_methods: WipeMethod::for_device_type(DeviceType::Hdd).to_vec(),
            status: DeviceStatus::WipeInProgress {
                progress_percentage: 45,
                method: WipeMethod::NistClear,
            },
        };

        let json = serde_json::to_value(&device).unwrap();
        assert_eq!(json["status"], "WipeInProgress");
        assert_eq!(json["progress_percentage"], 45);
        assert_eq!(json["type"], "HDD");
        assert!(json.get("error_message").is_none());

        let back: Device = serde_json::from_value(json).unwrap();
        assert_eq!(back, device);
    }

    #[test]
    fn job_progress_is_mean_and_failures_keep_last_value() {
        let mut job = WipeJob::new(
            "job-1".into(),
            vec![
                ("dev-1".into(), WipeMethod::NistClear),
                ("dev-2".into(), WipeMethod::NistClear),
            ],
        );
        job.record_progress("dev-1", 50);
        assert_eq!(job.progress, 25);

        job.record_progress("dev-2", 30);
        job.mark_failed("dev-2", "write error".into());
        job.record_progress("dev-2", 90);
        assert_eq!(job.member("dev-2").unwrap().progress, 30);
        assert_eq!(job.progress, 40);
        assert!(!job.is_done());

        job.mark_wiped("dev-1");
        job.attach_certificate("dev-1", "cert-1".into());
        assert!(job.is_done());
        job.finish();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.progress, 65);
    }

    #[test]
    fn progress_never_moves_backwards() {
        let mut job = WipeJob::new("job-2".into(), vec![("dev-1".into(), WipeMethod::NistClear)]);
        job.record_progress("dev-1", 60);
        job.record_progress("dev-1", 40);
        assert_eq!(job.member("dev-1").unwrap().progress, 60);
    }
}
