//! Certificate Ledger: an append-only, hash-linked chain of wipe certificates.
//!
//! Each certificate's digest covers its own fields and the digest of its
//! predecessor, so altering any stored record breaks every link after it.
//! Appends are one `BEGIN IMMEDIATE` transaction on the database worker
//! thread, which makes the tail read and the insert a single critical section.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_rusqlite::Connection;
use tokio_rusqlite::rusqlite::{self, TransactionBehavior};
use tracing::{info, warn};
use uuid::Uuid;

use super::error::WipeError;
use super::events::{Event, EventBus, LedgerUpdate};
use super::methods::WipeMethod;
use super::models::{Certificate, Device, DeviceType};
use crate::db::certificates::{self, StoredCertificate};
use crate::db::{flatten, format_timestamp, parse_timestamp};

/// Previous-hash of the first certificate.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

const DIGEST_DOMAIN: &[u8] = b"sanitd-certificate-v1";
const UPLOAD_DOMAIN: &[u8] = b"sanitd-upload-v1";

#[derive(Clone)]
pub struct CertificateLedger {
    db: Connection,
    events: EventBus,
}

/// Result of `verify`. Never an error for a broken chain: the break is the answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    pub certificate_id: String,
    /// The record's own digest recomputes from its stored fields.
    pub valid: bool,
    /// Every link from genesis through this certificate recomputes.
    pub chain_valid: bool,
    pub chain_index: u64,
    pub digest: String,
    pub previous_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broken_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStatus {
    pub total_certificates: u64,
    pub chain_valid: bool,
    pub tail_digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broken_at: Option<u64>,
}

/// One certified wipe, as listed in device history and statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WipeRecord {
    pub certificate_id: String,
    pub device_id: String,
    pub chain_index: u64,
    pub wipe_method: String,
    pub wiped_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

impl From<&StoredCertificate> for WipeRecord {
    fn from(stored: &StoredCertificate) -> Self {
        Self {
            certificate_id: stored.certificate.certificate_id.clone(),
            device_id: stored.certificate.device_id.clone(),
            chain_index: stored.certificate.chain_index,
            wipe_method: stored.certificate.method_used.clone(),
            wiped_at: stored.certificate.completion_timestamp,
            job_id: stored.job_id.clone(),
        }
    }
}

/// The drive an external certificate was issued for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalDevice {
    pub device_id: String,
    pub device_type: DeviceType,
    pub model: String,
    pub serial_number: String,
    pub capacity: u64,
}

/// A certificate produced by a standalone wiping tool and uploaded for linking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalCertificate {
    pub certificate_id: String,
    pub device_info: ExternalDevice,
    pub wipe_method: String,
    pub timestamp: DateTime<Utc>,
    /// `upload_hash` of the fields above, as computed by the issuing tool.
    pub certificate_hash: String,
    /// Verification code printed on the tool's document. Defaults to the id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl ExternalCertificate {
    fn verification_code(&self) -> &str {
        match self.signature.as_deref() {
            Some(signature) if !signature.trim().is_empty() => signature,
            _ => &self.certificate_id,
        }
    }

    /// Check the upload and turn it into an unlinked certificate.
    fn validate(&self) -> Result<Certificate, WipeError> {
        let reject = |reason: String| WipeError::CertificateRejected {
            certificate_id: self.certificate_id.clone(),
            reason,
        };

        if self.certificate_id.trim().is_empty() {
            return Err(reject("certificate_id is empty".to_string()));
        }
        if self.device_info.device_id.trim().is_empty() {
            return Err(reject("device_info.device_id is empty".to_string()));
        }
        if !upload_hash(self).eq_ignore_ascii_case(self.certificate_hash.trim()) {
            return Err(reject("integrity hash does not match certificate contents".to_string()));
        }

        let method = WipeMethod::from_name(&self.wipe_method)
            .ok_or_else(|| reject(format!("unknown wipe method '{}'", self.wipe_method)))?;
        if !method.supports(self.device_info.device_type) {
            return Err(reject(format!(
                "{} is not a valid method for {} devices",
                method, self.device_info.device_type
            )));
        }

        let code = self.verification_code();
        let completed_at = parse_timestamp(0, &format_timestamp(&self.timestamp))
            .map_err(WipeError::storage)?;

        Ok(Certificate {
            certificate_id: self.certificate_id.clone(),
            chain_index: 0,
            device_id: self.device_info.device_id.clone(),
            device_model: self.device_info.model.clone(),
            device_serial: self.device_info.serial_number.clone(),
            device_type: self.device_info.device_type,
            capacity: self.device_info.capacity,
            method_used: method.to_string(),
            completion_timestamp: completed_at,
            verification_key: verification_key(code),
            hash_of_previous_certificate: String::new(),
            digest: String::new(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub certificate_id: String,
    pub chain_index: u64,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFailure {
    pub certificate_id: String,
    pub code: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub total: usize,
    pub uploaded: Vec<UploadReceipt>,
    pub failed: Vec<SyncFailure>,
}

/// Outcome of walking a chain segment from genesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainAudit {
    pub length: u64,
    pub broken_at: Option<u64>,
    pub reason: Option<String>,
}

impl ChainAudit {
    pub fn is_valid(&self) -> bool {
        self.broken_at.is_none()
    }
}

/// BLAKE3 over a domain tag and length-prefixed fields.
pub fn compute_digest(cert: &Certificate) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(DIGEST_DOMAIN);

    let chain_index = cert.chain_index.to_string();
    let capacity = cert.capacity.to_string();
    let completed_at = format_timestamp(&cert.completion_timestamp);
    let fields: [&str; 11] = [
        &chain_index,
        &cert.certificate_id,
        &cert.device_id,
        &cert.device_serial,
        &cert.device_model,
        cert.device_type.as_str(),
        &capacity,
        &cert.method_used,
        &completed_at,
        &cert.verification_key,
        &cert.hash_of_previous_certificate,
    ];

    for field in fields {
        hasher.update(&(field.len() as u64).to_le_bytes());
        hasher.update(field.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

/// Integrity hash an external tool attaches to an upload: BLAKE3 over a
/// domain tag and the length-prefixed id, device fields, method and timestamp.
pub fn upload_hash(upload: &ExternalCertificate) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(UPLOAD_DOMAIN);

    let device = &upload.device_info;
    let capacity = device.capacity.to_string();
    let timestamp = format_timestamp(&upload.timestamp);
    let fields: [&str; 8] = [
        &upload.certificate_id,
        &device.device_id,
        device.device_type.as_str(),
        &device.model,
        &device.serial_number,
        &capacity,
        &upload.wipe_method,
        &timestamp,
    ];

    for field in fields {
        hasher.update(&(field.len() as u64).to_le_bytes());
        hasher.update(field.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

/// Hash of a verification code as stored on the certificate.
pub fn verification_key(code: &str) -> String {
    blake3::hash(code.trim().as_bytes()).to_hex().to_string()
}

/// Walk a chain segment that starts at genesis. The first bad record marks
/// everything from it onwards invalid.
pub fn audit_chain(certs: &[Certificate]) -> ChainAudit {
    let mut expected_previous = GENESIS_HASH.to_string();

    for (position, cert) in certs.iter().enumerate() {
        let expected_index = position as u64 + 1;
        let broken = |reason: String| ChainAudit {
            length: certs.len() as u64,
            broken_at: Some(cert.chain_index),
            reason: Some(reason),
        };

        if cert.chain_index != expected_index {
            return broken(format!(
                "expected chain index {}, found {}",
                expected_index, cert.chain_index
            ));
        }
        if cert.hash_of_previous_certificate != expected_previous {
            return broken("previous hash does not match the preceding certificate".to_string());
        }

        let recomputed = compute_digest(cert);
        if recomputed != cert.digest {
            return broken("stored digest does not match certificate contents".to_string());
        }
        expected_previous = recomputed;
    }

    ChainAudit {
        length: certs.len() as u64,
        broken_at: None,
        reason: None,
    }
}

impl CertificateLedger {
    pub fn new(db: Connection, events: EventBus) -> Self {
        Self { db, events }
    }

    /// Issue the certificate for a freshly wiped device and link it to the tail.
    pub async fn append_certificate(
        &self,
        device: &Device,
        method: WipeMethod,
        completed_at: DateTime<Utc>,
        job_id: Option<&str>,
    ) -> Result<StoredCertificate, WipeError> {
        let verification_code = Uuid::now_v7().to_string();
        // Round-trip through the stored format so the digest covers exactly what is persisted.
        let completed_at = parse_timestamp(0, &format_timestamp(&completed_at))
            .map_err(WipeError::storage)?;

        let draft = Certificate {
            certificate_id: Uuid::now_v7().to_string(),
            chain_index: 0,
            device_id: device.id.clone(),
            device_model: device.model.clone(),
            device_serial: device.serial_number.clone(),
            device_type: device.device_type,
            capacity: device.capacity,
            method_used: method.to_string(),
            completion_timestamp: completed_at,
            verification_key: verification_key(&verification_code),
            hash_of_previous_certificate: String::new(),
            digest: String::new(),
        };
        let job_id = job_id.map(str::to_string);
        let cert = self
            .link(draft, verification_code.clone(), job_id.clone(), "certificate_added")
            .await?;

        Ok(StoredCertificate {
            certificate: cert,
            verification_code,
            job_id,
        })
    }

    /// Link a certificate issued by an external wiping tool. The submitted
    /// integrity hash must match its contents and the id must be new.
    pub async fn submit_external(&self, upload: ExternalCertificate) -> Result<UploadReceipt, WipeError> {
        let draft = upload.validate()?;
        let code = upload.verification_code().to_string();
        let cert = self.link(draft, code, None, "certificate_uploaded").await?;
        Ok(UploadReceipt {
            certificate_id: cert.certificate_id,
            chain_index: cert.chain_index,
            digest: cert.digest,
        })
    }

    /// Submit a batch in order. One bad certificate does not stop the rest.
    pub async fn sync_external(&self, batch: Vec<ExternalCertificate>) -> SyncReport {
        let mut report = SyncReport {
            total: batch.len(),
            ..SyncReport::default()
        };

        for upload in batch {
            let certificate_id = upload.certificate_id.clone();
            match self.submit_external(upload).await {
                Ok(receipt) => report.uploaded.push(receipt),
                Err(err) => {
                    warn!(%certificate_id, error = %err, "Certificate sync entry rejected");
                    report.failed.push(SyncFailure {
                        certificate_id,
                        code: err.code().to_string(),
                        error: err.to_string(),
                    });
                }
            }
        }

        info!(
            total = report.total,
            uploaded = report.uploaded.len(),
            failed = report.failed.len(),
            "Certificate sync finished"
        );
        report
    }

    /// Append under `BEGIN IMMEDIATE`: read the tail, refuse a tampered one,
    /// link and insert, all as one critical section.
    async fn link(
        &self,
        draft: Certificate,
        code: String,
        job_id: Option<String>,
        action: &str,
    ) -> Result<Certificate, WipeError> {
        let cert = flatten(
            self.db
                .call(move |c| {
                    let tx = c
                        .transaction_with_behavior(TransactionBehavior::Immediate)
                        .map_err(WipeError::storage)?;

                    if certificates::find(&tx, &draft.certificate_id)
                        .map_err(WipeError::storage)?
                        .is_some()
                    {
                        return Err(WipeError::DuplicateCertificate(draft.certificate_id));
                    }
                    if certificates::find_by_key(&tx, &draft.verification_key)
                        .map_err(WipeError::storage)?
                        .is_some()
                    {
                        return Err(WipeError::CertificateRejected {
                            certificate_id: draft.certificate_id,
                            reason: "verification code is already in use".to_string(),
                        });
                    }

                    let tail = certificates::tail(&tx).map_err(WipeError::storage)?;
                    let (chain_index, previous) = match tail {
                        Some(tail) => {
                            if compute_digest(&tail) != tail.digest {
                                return Err(WipeError::ChainIntegrity {
                                    index: tail.chain_index,
                                    reason: "tail digest does not match its contents; refusing to extend"
                                        .to_string(),
                                });
                            }
                            (tail.chain_index + 1, tail.digest)
                        }
                        None => (1, GENESIS_HASH.to_string()),
                    };

                    let mut cert = draft;
                    cert.chain_index = chain_index;
                    cert.hash_of_previous_certificate = previous;
                    cert.digest = compute_digest(&cert);

                    certificates::insert(&tx, &cert, &code, job_id.as_deref())
                        .map_err(|e| append_conflict(chain_index, e))?;
                    tx.commit().map_err(WipeError::storage)?;
                    Ok(cert)
                })
                .await,
        )?;

        info!(
            certificate_id = %cert.certificate_id,
            device_id = %cert.device_id,
            chain_index = cert.chain_index,
            action,
            "Certificate appended"
        );

        self.events.publish(Event::LedgerUpdate(LedgerUpdate {
            action: action.to_string(),
            certificate_id: cert.certificate_id.clone(),
            device_id: cert.device_id.clone(),
            chain_index: cert.chain_index,
            digest: cert.digest.clone(),
            timestamp: Utc::now(),
        }));

        Ok(cert)
    }

    /// Recompute the chain from genesis through the certificate. Read-only.
    pub async fn verify(&self, certificate_id: &str) -> Result<Verification, WipeError> {
        let id = certificate_id.to_string();
        let (target, prefix) = flatten(
            self.db
                .call(move |c| {
                    let target = certificates::find(c, &id)
                        .map_err(WipeError::storage)?
                        .ok_or_else(|| WipeError::CertificateNotFound(id.clone()))?;
                    let prefix = certificates::chain_through(c, target.certificate.chain_index as i64)
                        .map_err(WipeError::storage)?;
                    Ok((target.certificate, prefix))
                })
                .await,
        )?;

        let audit = audit_chain(&prefix);
        if let Some(index) = audit.broken_at {
            warn!(certificate_id = %target.certificate_id, broken_at = index, "Certificate chain broken");
        }
        let intact = compute_digest(&target) == target.digest;

        Ok(Verification {
            certificate_id: target.certificate_id.clone(),
            valid: intact,
            chain_valid: audit.is_valid(),
            chain_index: target.chain_index,
            digest: target.digest.clone(),
            previous_hash: target.hash_of_previous_certificate.clone(),
            broken_at: audit.broken_at,
            reason: audit.reason,
        })
    }

    /// Look a certificate up by the code printed on its document and verify it.
    pub async fn verify_code(&self, code: &str) -> Result<Verification, WipeError> {
        let key = verification_key(code);
        let found = flatten(
            self.db
                .call(move |c| certificates::find_by_key(c, &key).map_err(WipeError::storage))
                .await,
        )?;

        match found {
            Some(stored) => self.verify(&stored.certificate.certificate_id).await,
            None => Err(WipeError::CertificateNotFound(format!("verification code {}", code.trim()))),
        }
    }

    /// The full chain, only if every link holds.
    pub async fn get_chain(&self) -> Result<Vec<Certificate>, WipeError> {
        let chain = self.load_chain().await?;
        let audit = audit_chain(&chain);

        match audit.broken_at {
            None => Ok(chain),
            Some(index) => Err(WipeError::ChainIntegrity {
                index,
                reason: audit.reason.unwrap_or_default(),
            }),
        }
    }

    pub async fn status(&self) -> Result<LedgerStatus, WipeError> {
        let chain = self.load_chain().await?;
        let audit = audit_chain(&chain);

        Ok(LedgerStatus {
            total_certificates: chain.len() as u64,
            chain_valid: audit.is_valid(),
            tail_digest: chain.last().map(|c| c.digest.clone()),
            broken_at: audit.broken_at,
        })
    }

    pub async fn latest_for_device(&self, device_id: &str) -> Result<StoredCertificate, WipeError> {
        let id = device_id.to_string();
        flatten(
            self.db
                .call(move |c| {
                    certificates::latest_for_device(c, &id)
                        .map_err(WipeError::storage)?
                        .ok_or_else(|| {
                            WipeError::CertificateNotFound(format!("no certificate for device {}", id))
                        })
                })
                .await,
        )
    }

    pub async fn get(&self, certificate_id: &str) -> Result<StoredCertificate, WipeError> {
        let id = certificate_id.to_string();
        flatten(
            self.db
                .call(move |c| {
                    certificates::find(c, &id)
                        .map_err(WipeError::storage)?
                        .ok_or_else(|| WipeError::CertificateNotFound(id.clone()))
                })
                .await,
        )
    }

    /// Every wipe certified for a device, newest first.
    pub async fn history_for_device(&self, device_id: &str) -> Result<Vec<WipeRecord>, WipeError> {
        let id = device_id.to_string();
        let stored = flatten(
            self.db
                .call(move |c| certificates::for_device(c, &id).map_err(WipeError::storage))
                .await,
        )?;
        Ok(stored.iter().map(WipeRecord::from).collect())
    }

    /// The latest certified wipes across all devices.
    pub async fn recent_wipes(&self, limit: usize) -> Result<Vec<WipeRecord>, WipeError> {
        let stored = flatten(
            self.db
                .call(move |c| certificates::recent(c, limit).map_err(WipeError::storage))
                .await,
        )?;
        Ok(stored.iter().map(WipeRecord::from).collect())
    }

    async fn load_chain(&self) -> Result<Vec<Certificate>, WipeError> {
        flatten(
            self.db
                .call(|c| certificates::chain(c).map_err(WipeError::storage))
                .await,
        )
    }
}

/// A uniqueness violation on insert means another writer linked to the same tail.
fn append_conflict(chain_index: u64, err: rusqlite::Error) -> WipeError {
    match err.sqlite_error_code() {
        Some(rusqlite::ErrorCode::ConstraintViolation) => WipeError::ChainIntegrity {
            index: chain_index,
            reason: format!("append would fork the chain: {}", err),
        },
        _ => WipeError::storage(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::DeviceStatus;
    use std::path::PathBuf;

    fn device(id: &str) -> Device {
        Device {
            id: id.into(),
            device_type: DeviceType::Hdd,
            model: "Seagate Barracuda 2TB".into(),
            serial_number: format!("SN-{}", id),
            capacity: 2_000_000_000_000,
            capacity_display: "2.0 TB".into(),
            path: PathBuf::from("/dev/sda"),
            is_wipeable: true,
            supported_methods: WipeMethod::for_device_type(DeviceType::Hdd).to_vec(),
            status: DeviceStatus::Ready,
        }
    }

    async fn ledger() -> CertificateLedger {
        let db = crate::db::open_in_memory().await.unwrap();
        CertificateLedger::new(db, EventBus::new())
    }

    #[tokio::test]
    async fn appends_link_to_previous_digest() {
        let ledger = ledger().await;
        let first = ledger
            .append_certificate(&device("dev-1"), WipeMethod::NistClear, Utc::now(), None)
            .await
            .unwrap();
        let second = ledger
            .append_certificate(&device("dev-2"), WipeMethod::NistClear, Utc::now(), Some("job-1"))
            .await
            .unwrap();

        assert_eq!(first.certificate.chain_index, 1);
        assert_eq!(first.certificate.hash_of_previous_certificate, GENESIS_HASH);
        assert_eq!(
            second.certificate.hash_of_previous_certificate,
            first.certificate.digest
        );

        let chain = ledger.get_chain().await.unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1], second.certificate);
    }

    #[tokio::test]
    async fn verify_is_idempotent() {
        let ledger = ledger().await;
        let issued = ledger
            .append_certificate(&device("dev-1"), WipeMethod::NistClear, Utc::now(), None)
            .await
            .unwrap();

        let a = ledger.verify(&issued.certificate.certificate_id).await.unwrap();
        let b = ledger.verify(&issued.certificate.certificate_id).await.unwrap();
        assert!(a.valid && a.chain_valid);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn verification_code_finds_certificate() {
        let ledger = ledger().await;
        let issued = ledger
            .append_certificate(&device("dev-1"), WipeMethod::NistClear, Utc::now(), None)
            .await
            .unwrap();

        let verification = ledger.verify_code(&issued.verification_code).await.unwrap();
        assert_eq!(verification.certificate_id, issued.certificate.certificate_id);
        assert!(matches!(
            ledger.verify_code("not-a-code").await,
            Err(WipeError::CertificateNotFound(_))
        ));
    }

    #[tokio::test]
    async fn unknown_certificate_is_not_found() {
        let ledger = ledger().await;
        assert!(matches!(
            ledger.verify("missing").await,
            Err(WipeError::CertificateNotFound(_))
        ));
        let status = ledger.status().await.unwrap();
        assert_eq!(status.total_certificates, 0);
        assert!(status.chain_valid);
    }

    fn upload(certificate_id: &str, device_id: &str) -> ExternalCertificate {
        let mut upload = ExternalCertificate {
            certificate_id: certificate_id.into(),
            device_info: ExternalDevice {
                device_id: device_id.into(),
                device_type: DeviceType::Usb,
                model: "SanDisk Ultra 64GB".into(),
                serial_number: format!("SN-{}", device_id),
                capacity: 64_000_000_000,
            },
            wipe_method: "DoD 5220.22-M".into(),
            timestamp: Utc::now(),
            certificate_hash: String::new(),
            signature: None,
        };
        upload.certificate_hash = upload_hash(&upload);
        upload
    }

    #[tokio::test]
    async fn uploads_link_after_local_certificates() {
        let ledger = ledger().await;
        let local = ledger
            .append_certificate(&device("dev-1"), WipeMethod::NistClear, Utc::now(), None)
            .await
            .unwrap();

        let receipt = ledger.submit_external(upload("ext-1", "usb-7")).await.unwrap();
        assert_eq!(receipt.chain_index, 2);

        let chain = ledger.get_chain().await.unwrap();
        assert_eq!(chain[1].hash_of_previous_certificate, local.certificate.digest);
        assert_eq!(chain[1].digest, receipt.digest);

        // Without a signature the certificate id doubles as the verification code.
        let verification = ledger.verify_code("ext-1").await.unwrap();
        assert!(verification.valid && verification.chain_valid);
    }

    #[tokio::test]
    async fn uploads_with_bad_hash_or_known_id_are_refused() {
        let ledger = ledger().await;

        let mut tampered = upload("ext-1", "usb-7");
        tampered.device_info.serial_number = "SN-other".into();
        assert!(matches!(
            ledger.submit_external(tampered).await,
            Err(WipeError::CertificateRejected { .. })
        ));

        let mut wrong_method = upload("ext-2", "usb-7");
        wrong_method.wipe_method = "NIST Purge (Crypto Erase)".into();
        wrong_method.certificate_hash = upload_hash(&wrong_method);
        assert!(matches!(
            ledger.submit_external(wrong_method).await,
            Err(WipeError::CertificateRejected { .. })
        ));

        ledger.submit_external(upload("ext-3", "usb-7")).await.unwrap();
        assert_eq!(
            ledger.submit_external(upload("ext-3", "usb-8")).await,
            Err(WipeError::DuplicateCertificate("ext-3".into()))
        );

        let status = ledger.status().await.unwrap();
        assert_eq!(status.total_certificates, 1);
        assert!(status.chain_valid);
    }

    #[tokio::test]
    async fn sync_reports_each_entry() {
        let ledger = ledger().await;
        let mut bad = upload("ext-2", "usb-2");
        bad.certificate_hash = "00".repeat(32);

        let report = ledger
            .sync_external(vec![upload("ext-1", "usb-1"), bad, upload("ext-1", "usb-3"), upload("ext-4", "usb-4")])
            .await;

        assert_eq!(report.total, 4);
        let uploaded: Vec<&str> = report.uploaded.iter().map(|r| r.certificate_id.as_str()).collect();
        assert_eq!(uploaded, vec!["ext-1", "ext-4"]);
        let codes: Vec<&str> = report.failed.iter().map(|f| f.code.as_str()).collect();
        assert_eq!(codes, vec!["certificate_rejected", "duplicate_certificate"]);
        assert_eq!(ledger.get_chain().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn device_history_is_newest_first() {
        let ledger = ledger().await;
        for _ in 0..2 {
            ledger
                .append_certificate(&device("dev-1"), WipeMethod::NistClear, Utc::now(), Some("job-1"))
                .await
                .unwrap();
        }
        ledger
            .append_certificate(&device("dev-2"), WipeMethod::Dod522022M, Utc::now(), None)
            .await
            .unwrap();

        let history = ledger.history_for_device("dev-1").await.unwrap();
        let indexes: Vec<u64> = history.iter().map(|r| r.chain_index).collect();
        assert_eq!(indexes, vec![2, 1]);
        assert_eq!(history[0].job_id.as_deref(), Some("job-1"));
        assert!(ledger.history_for_device("dev-9").await.unwrap().is_empty());

        let recent = ledger.recent_wipes(2).await.unwrap();
        let ids: Vec<&str> = recent.iter().map(|r| r.device_id.as_str()).collect();
        assert_eq!(ids, vec!["dev-2", "dev-1"]);
        assert_eq!(recent[0].wipe_method, "DoD 5220.22-M");
    }

    #[test]
    fn audit_flags_first_broken_link() {
        let mut certs = Vec::new();
        let mut previous = GENESIS_HASH.to_string();
        for index in 1..=3u64 {
            let mut cert = Certificate {
                certificate_id: format!("cert-{}", index),
                chain_index: index,
                device_id: format!("dev-{}", index),
                device_model: "m".into(),
                device_serial: "s".into(),
                device_type: DeviceType::Ssd,
                capacity: 1,
                method_used: "NIST Clear".into(),
                completion_timestamp: Utc::now(),
                verification_key: verification_key("code"),
                hash_of_previous_certificate: previous.clone(),
                digest: String::new(),
            };
            cert.digest = compute_digest(&cert);
            previous = cert.digest.clone();
            certs.push(cert);
        }
        assert!(audit_chain(&certs).is_valid());

        certs[1].method_used = "DoD 5220.22-M".into();
        let audit = audit_chain(&certs);
        assert_eq!(audit.broken_at, Some(2));
        assert!(audit_chain(&certs[..1]).is_valid());
    }
}
