//! Certificate rows. These run inside `conn.call` closures so the ledger can
//! compose them into one transaction.

use tokio_rusqlite::rusqlite::{self, OptionalExtension, params};

use super::{format_timestamp, parse_timestamp};
use crate::core::models::{Certificate, DeviceType};

const COLUMNS: &str = "chain_index, certificate_id, device_id, device_model, device_serial, \
     device_type, capacity, method, completed_at, verification_key, previous_hash, digest, \
     verification_code, job_id";

/// A certificate together with the data kept alongside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCertificate {
    pub certificate: Certificate,
    pub verification_code: String,
    pub job_id: Option<String>,
}

pub fn insert(
    c: &rusqlite::Connection,
    cert: &Certificate,
    verification_code: &str,
    job_id: Option<&str>,
) -> rusqlite::Result<()> {
    c.execute(
        &format!(
            "INSERT INTO certificates ({COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
        ),
        params![
            cert.chain_index as i64,
            &cert.certificate_id,
            &cert.device_id,
            &cert.device_model,
            &cert.device_serial,
            cert.device_type.as_str(),
            cert.capacity as i64,
            &cert.method_used,
            format_timestamp(&cert.completion_timestamp),
            &cert.verification_key,
            &cert.hash_of_previous_certificate,
            &cert.digest,
            verification_code,
            job_id,
        ],
    )?;
    Ok(())
}

pub fn tail(c: &rusqlite::Connection) -> rusqlite::Result<Option<Certificate>> {
    c.query_row(
        &format!("SELECT {COLUMNS} FROM certificates ORDER BY chain_index DESC LIMIT 1"),
        [],
        map_stored,
    )
    .optional()
    .map(|row| row.map(|stored| stored.certificate))
}

/// The chain in link order.
pub fn chain(c: &rusqlite::Connection) -> rusqlite::Result<Vec<Certificate>> {
    chain_through(c, i64::MAX)
}

/// Genesis up to and including `chain_index`.
pub fn chain_through(c: &rusqlite::Connection, chain_index: i64) -> rusqlite::Result<Vec<Certificate>> {
    let mut stmt = c.prepare(&format!(
        "SELECT {COLUMNS} FROM certificates WHERE chain_index <= ?1 ORDER BY chain_index"
    ))?;
    let certs = stmt
        .query_map(params![chain_index], |row| map_stored(row).map(|s| s.certificate))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(certs)
}

pub fn find(c: &rusqlite::Connection, certificate_id: &str) -> rusqlite::Result<Option<StoredCertificate>> {
    c.query_row(
        &format!("SELECT {COLUMNS} FROM certificates WHERE certificate_id = ?1"),
        params![certificate_id],
        map_stored,
    )
    .optional()
}

pub fn find_by_key(
    c: &rusqlite::Connection,
    verification_key: &str,
) -> rusqlite::Result<Option<StoredCertificate>> {
    c.query_row(
        &format!("SELECT {COLUMNS} FROM certificates WHERE verification_key = ?1"),
        params![verification_key],
        map_stored,
    )
    .optional()
}

pub fn latest_for_device(
    c: &rusqlite::Connection,
    device_id: &str,
) -> rusqlite::Result<Option<StoredCertificate>> {
    c.query_row(
        &format!(
            "SELECT {COLUMNS} FROM certificates WHERE device_id = ?1
             ORDER BY chain_index DESC LIMIT 1"
        ),
        params![device_id],
        map_stored,
    )
    .optional()
}

/// Every certificate issued for a device, newest first.
pub fn for_device(c: &rusqlite::Connection, device_id: &str) -> rusqlite::Result<Vec<StoredCertificate>> {
    let mut stmt = c.prepare(&format!(
        "SELECT {COLUMNS} FROM certificates WHERE device_id = ?1 ORDER BY chain_index DESC"
    ))?;
    let rows = stmt
        .query_map(params![device_id], map_stored)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn recent(c: &rusqlite::Connection, limit: usize) -> rusqlite::Result<Vec<StoredCertificate>> {
    let mut stmt = c.prepare(&format!(
        "SELECT {COLUMNS} FROM certificates ORDER BY chain_index DESC LIMIT ?1"
    ))?;
    let rows = stmt
        .query_map(params![limit as i64], map_stored)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn map_stored(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredCertificate> {
    let device_type: String = row.get(5)?;
    let device_type = DeviceType::parse(&device_type).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            format!("unknown device type '{}'", device_type).into(),
        )
    })?;
    let completed_at: String = row.get(8)?;

    Ok(StoredCertificate {
        certificate: Certificate {
            chain_index: row.get::<_, i64>(0)? as u64,
            certificate_id: row.get(1)?,
            device_id: row.get(2)?,
            device_model: row.get(3)?,
            device_serial: row.get(4)?,
            device_type,
            capacity: row.get::<_, i64>(6)? as u64,
            method_used: row.get(7)?,
            completion_timestamp: parse_timestamp(8, &completed_at)?,
            verification_key: row.get(9)?,
            hash_of_previous_certificate: row.get(10)?,
            digest: row.get(11)?,
        },
        verification_code: row.get(12)?,
        job_id: row.get(13)?,
    })
}
