//! Downloadable proof-of-sanitization document.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::fmt::Write;

use super::error::WipeError;
use super::ledger::{CertificateLedger, Verification};
use super::models::{DeviceType, format_capacity};
use crate::db::certificates::StoredCertificate;

pub const ISSUER: &str = "sanitd";

#[derive(Debug, Clone, Serialize)]
pub struct CertificateDocument {
    pub issuer: &'static str,
    pub certificate_id: String,
    pub chain_index: u64,
    pub device: DocumentDevice,
    pub method: String,
    pub completed_at: DateTime<Utc>,
    pub verification_code: String,
    pub verification_key: String,
    pub previous_hash: String,
    pub digest: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub chain_valid: bool,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentDevice {
    pub id: String,
    pub model: String,
    pub serial_number: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub capacity: u64,
    pub capacity_display: String,
}

impl CertificateDocument {
    pub fn new(stored: StoredCertificate, verification: &Verification) -> Self {
        let cert = stored.certificate;
        Self {
            issuer: ISSUER,
            certificate_id: cert.certificate_id,
            chain_index: cert.chain_index,
            device: DocumentDevice {
                id: cert.device_id,
                model: cert.device_model,
                serial_number: cert.device_serial,
                device_type: cert.device_type,
                capacity: cert.capacity,
                capacity_display: format_capacity(cert.capacity),
            },
            method: cert.method_used,
            completed_at: cert.completion_timestamp,
            verification_code: stored.verification_code,
            verification_key: cert.verification_key,
            previous_hash: cert.hash_of_previous_certificate,
            digest: cert.digest,
            job_id: stored.job_id,
            chain_valid: verification.chain_valid,
            generated_at: Utc::now(),
        }
    }

    /// The device's most recent certificate, checked against the chain.
    pub async fn for_device(ledger: &CertificateLedger, device_id: &str) -> Result<Self, WipeError> {
        let stored = ledger.latest_for_device(device_id).await?;
        let verification = ledger.verify(&stored.certificate.certificate_id).await?;
        Ok(Self::new(stored, &verification))
    }

    pub fn file_name(&self, extension: &str) -> String {
        format!("certificate-{}-{}.{}", self.device.id, self.chain_index, extension)
    }

    /// Plain-text rendering for printing.
    pub fn render_text(&self) -> String {
        let rule = "=".repeat(64);
        let mut out = String::new();

        let _ = writeln!(out, "{}", rule);
        let _ = writeln!(out, "  CERTIFICATE OF DATA SANITIZATION");
        let _ = writeln!(out, "{}", rule);
        let _ = writeln!(out);
        let _ = writeln!(out, "Certificate ID:    {}", self.certificate_id);
        let _ = writeln!(out, "Ledger index:      {}", self.chain_index);
        let _ = writeln!(out, "Issued by:         {}", self.issuer);
        let _ = writeln!(out);
        let _ = writeln!(out, "Device ID:         {}", self.device.id);
        let _ = writeln!(out, "Model:             {}", self.device.model);
        let _ = writeln!(out, "Serial number:     {}", self.device.serial_number);
        let _ = writeln!(out, "Type:              {}", self.device.device_type);
        let _ = writeln!(out, "Capacity:          {}", self.device.capacity_display);
        let _ = writeln!(out);
        let _ = writeln!(out, "Method:            {}", self.method);
        let _ = writeln!(
            out,
            "Completed:         {}",
            self.completed_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        if let Some(job_id) = &self.job_id {
            let _ = writeln!(out, "Job:               {}", job_id);
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "Verification code: {}", self.verification_code);
        let _ = writeln!(out, "Digest:            {}", self.digest);
        let _ = writeln!(out, "Previous digest:   {}", self.previous_hash);
        let _ = writeln!(
            out,
            "Chain status:      {}",
            if self.chain_valid { "intact" } else { "BROKEN" }
        );
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "Present the verification code to the issuer to confirm this record."
        );
        let _ = writeln!(out, "{}", rule);
        out
    }
}
