//! Catalogue of sanitization methods and the device types they apply to.

use serde::{Deserialize, Serialize};

use super::models::DeviceType;

/// Data pattern written by one overwrite pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pattern {
    Zeros,
    Ones,
    Random,
}

impl Pattern {
    pub fn byte(&self) -> Option<u8> {
        match self {
            Self::Zeros => Some(0x00),
            Self::Ones => Some(0xFF),
            Self::Random => None,
        }
    }
}

/// How a method sanitizes the medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    /// Host-driven overwrite passes followed by read-back of the final pass.
    Overwrite(&'static [Pattern]),
    /// ATA SECURITY ERASE UNIT issued to the drive firmware.
    AtaSecureErase,
    /// NVMe Sanitize with the given action (2 = block erase, 4 = crypto erase).
    NvmeSanitize(u8),
}

/// Where cancellation stops being honoured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PointOfNoReturn {
    /// The final overwrite pass has started.
    FinalPass,
    /// The erase command has been handed to the drive.
    CommandIssued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WipeMethod {
    #[serde(rename = "NIST Clear")]
    NistClear,
    #[serde(rename = "NIST Purge (Overwrite)")]
    NistPurgeOverwrite,
    #[serde(rename = "DoD 5220.22-M")]
    Dod522022M,
    #[serde(rename = "NIST Purge (Secure Erase)")]
    NistPurgeSecureErase,
    #[serde(rename = "NIST Purge (Crypto Erase)")]
    NistPurgeCryptoErase,
    #[serde(rename = "NIST Purge (Block Erase)")]
    NistPurgeBlockErase,
}

const CLEAR_PASSES: &[Pattern] = &[Pattern::Zeros];
const PURGE_PASSES: &[Pattern] = &[Pattern::Random, Pattern::Random, Pattern::Zeros];
const DOD_PASSES: &[Pattern] = &[Pattern::Zeros, Pattern::Ones, Pattern::Random];

impl WipeMethod {
    pub const ALL: [WipeMethod; 6] = [
        Self::NistClear,
        Self::NistPurgeOverwrite,
        Self::Dod522022M,
        Self::NistPurgeSecureErase,
        Self::NistPurgeCryptoErase,
        Self::NistPurgeBlockErase,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::NistClear => "NIST Clear",
            Self::NistPurgeOverwrite => "NIST Purge (Overwrite)",
            Self::Dod522022M => "DoD 5220.22-M",
            Self::NistPurgeSecureErase => "NIST Purge (Secure Erase)",
            Self::NistPurgeCryptoErase => "NIST Purge (Crypto Erase)",
            Self::NistPurgeBlockErase => "NIST Purge (Block Erase)",
        }
    }

    /// Case-insensitive lookup by display name.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|m| m.name().eq_ignore_ascii_case(name))
    }

    pub fn kind(&self) -> MethodKind {
        match self {
            Self::NistClear => MethodKind::Overwrite(CLEAR_PASSES),
            Self::NistPurgeOverwrite => MethodKind::Overwrite(PURGE_PASSES),
            Self::Dod522022M => MethodKind::Overwrite(DOD_PASSES),
            Self::NistPurgeSecureErase => MethodKind::AtaSecureErase,
            Self::NistPurgeCryptoErase => MethodKind::NvmeSanitize(4),
            Self::NistPurgeBlockErase => MethodKind::NvmeSanitize(2),
        }
    }

    /// Overwrite passes, empty for firmware methods.
    pub fn passes(&self) -> &'static [Pattern] {
        match self.kind() {
            MethodKind::Overwrite(passes) => passes,
            _ => &[],
        }
    }

    pub fn point_of_no_return(&self) -> PointOfNoReturn {
        match self.kind() {
            MethodKind::Overwrite(_) => PointOfNoReturn::FinalPass,
            _ => PointOfNoReturn::CommandIssued,
        }
    }

    /// Methods available for a device type, in preference order.
    pub fn for_device_type(device_type: DeviceType) -> &'static [WipeMethod] {
        match device_type {
            DeviceType::Hdd => &[Self::NistClear, Self::NistPurgeOverwrite, Self::Dod522022M],
            DeviceType::Ssd => &[Self::NistPurgeSecureErase, Self::NistClear],
            DeviceType::Nvme => &[Self::NistPurgeCryptoErase, Self::NistPurgeBlockErase],
            DeviceType::Usb => &[Self::NistClear, Self::Dod522022M],
        }
    }

    pub fn supports(&self, device_type: DeviceType) -> bool {
        Self::for_device_type(device_type).contains(self)
    }
}

impl std::fmt::Display for WipeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
