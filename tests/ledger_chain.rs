use chrono::Utc;
use sanitd::core::certificate::CertificateDocument;
use sanitd::core::hardware::BlockDevice;
use sanitd::core::ledger::GENESIS_HASH;
use sanitd::core::models::{Device, DeviceType};
use sanitd::core::{CertificateLedger, EventBus, WipeError, WipeMethod};
use sanitd::db;
use std::path::PathBuf;
use tempfile::TempDir;
use tokio_rusqlite::{Connection, rusqlite};

fn device(id: &str, serial: &str) -> Device {
    Device::from_block(&BlockDevice {
        id: id.to_string(),
        name: id.to_string(),
        path: PathBuf::from(format!("/dev/sim/{}", id)),
        model: "Seagate Barracuda 2TB".to_string(),
        serial: serial.to_string(),
        device_type: DeviceType::Hdd,
        capacity: 2_000_000_000_000,
        is_system: false,
        read_only: false,
    })
}

async fn ledger_with(dir: &TempDir, count: usize) -> (Connection, CertificateLedger, Vec<String>) {
    let conn = db::init(dir.path()).await.unwrap();
    let ledger = CertificateLedger::new(conn.clone(), EventBus::new());

    let mut ids = Vec::new();
    for i in 1..=count {
        let stored = ledger
            .append_certificate(
                &device(&format!("dev-{}", i), &format!("SN-{}", i)),
                WipeMethod::NistClear,
                Utc::now(),
                None,
            )
            .await
            .unwrap();
        ids.push(stored.certificate.certificate_id);
    }
    (conn, ledger, ids)
}

async fn tamper(conn: &Connection, sql: &'static str) {
    conn.call(move |c| Ok::<_, rusqlite::Error>(c.execute(sql, [])?))
        .await
        .unwrap();
}

#[tokio::test]
async fn chain_links_from_genesis() {
    let dir = TempDir::new().unwrap();
    let (_conn, ledger, ids) = ledger_with(&dir, 3).await;

    let chain = ledger.get_chain().await.unwrap();
    assert_eq!(chain.len(), 3);
    assert_eq!(chain[0].hash_of_previous_certificate, GENESIS_HASH);
    for pair in chain.windows(2) {
        assert_eq!(pair[1].hash_of_previous_certificate, pair[0].digest);
        assert_eq!(pair[1].chain_index, pair[0].chain_index + 1);
    }

    let status = ledger.status().await.unwrap();
    assert_eq!(status.total_certificates, 3);
    assert!(status.chain_valid);
    assert_eq!(status.tail_digest.as_deref(), Some(chain[2].digest.as_str()));

    for id in &ids {
        assert!(ledger.verify(id).await.unwrap().valid);
    }
}

#[tokio::test]
async fn tampered_record_breaks_itself_and_its_successors() {
    let dir = TempDir::new().unwrap();
    let (conn, ledger, ids) = ledger_with(&dir, 3).await;

    tamper(&conn, "UPDATE certificates SET device_serial = 'FORGED' WHERE chain_index = 2").await;

    // Earlier links only depend on what precedes them.
    assert!(ledger.verify(&ids[0]).await.unwrap().valid);

    let second = ledger.verify(&ids[1]).await.unwrap();
    assert!(!second.valid);
    assert!(!second.chain_valid);
    assert_eq!(second.broken_at, Some(2));
    assert!(second.reason.unwrap().contains("digest"));

    // The third record itself is untouched; only its ancestry is broken.
    let third = ledger.verify(&ids[2]).await.unwrap();
    assert!(third.valid);
    assert!(!third.chain_valid);
    assert_eq!(third.broken_at, Some(2));

    assert!(matches!(
        ledger.get_chain().await.unwrap_err(),
        WipeError::ChainIntegrity { index: 2, .. }
    ));

    let status = ledger.status().await.unwrap();
    assert!(!status.chain_valid);
    assert_eq!(status.broken_at, Some(2));
}

#[tokio::test]
async fn verification_is_repeatable_and_read_only() {
    let dir = TempDir::new().unwrap();
    let (conn, ledger, ids) = ledger_with(&dir, 2).await;
    tamper(&conn, "UPDATE certificates SET method = 'NIST Purge (Overwrite)' WHERE chain_index = 1").await;

    let first = ledger.verify(&ids[1]).await.unwrap();
    let second = ledger.verify(&ids[1]).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.broken_at, Some(1));

    let before = ledger.status().await.unwrap();
    ledger.verify(&ids[0]).await.unwrap();
    assert_eq!(ledger.status().await.unwrap(), before);
}

#[tokio::test]
async fn broken_tail_refuses_new_certificates() {
    let dir = TempDir::new().unwrap();
    let (conn, ledger, _ids) = ledger_with(&dir, 2).await;
    tamper(&conn, "UPDATE certificates SET capacity = 1 WHERE chain_index = 2").await;

    let err = ledger
        .append_certificate(&device("dev-9", "SN-9"), WipeMethod::NistClear, Utc::now(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, WipeError::ChainIntegrity { index: 2, .. }));
    assert_eq!(ledger.status().await.unwrap().total_certificates, 2);
}

#[tokio::test]
async fn verification_codes_resolve_to_their_certificate() {
    let dir = TempDir::new().unwrap();
    let (_conn, ledger, _ids) = ledger_with(&dir, 1).await;

    let stored = ledger
        .append_certificate(&device("dev-7", "SN-7"), WipeMethod::Dod522022M, Utc::now(), Some("job-7"))
        .await
        .unwrap();
    assert_eq!(stored.job_id.as_deref(), Some("job-7"));

    let by_code = ledger
        .verify_code(&format!("  {} ", stored.verification_code))
        .await
        .unwrap();
    assert_eq!(by_code.certificate_id, stored.certificate.certificate_id);
    assert!(by_code.valid);

    assert!(matches!(
        ledger.verify_code("not-a-code").await.unwrap_err(),
        WipeError::CertificateNotFound(_)
    ));
    assert!(matches!(
        ledger.verify("no-such-certificate").await.unwrap_err(),
        WipeError::CertificateNotFound(_)
    ));
}

#[tokio::test]
async fn ledger_survives_reopening() {
    let dir = TempDir::new().unwrap();
    let tail = {
        let (_conn, ledger, _ids) = ledger_with(&dir, 2).await;
        ledger.status().await.unwrap().tail_digest
    };

    let conn = db::init(dir.path()).await.unwrap();
    let ledger = CertificateLedger::new(conn, EventBus::new());
    assert_eq!(ledger.status().await.unwrap().tail_digest, tail);

    let stored = ledger
        .append_certificate(&device("dev-3", "SN-3"), WipeMethod::NistClear, Utc::now(), None)
        .await
        .unwrap();
    assert_eq!(stored.certificate.chain_index, 3);
    assert_eq!(Some(stored.certificate.hash_of_previous_certificate), tail);
}

#[tokio::test]
async fn certificate_document_reflects_the_latest_wipe() {
    let dir = TempDir::new().unwrap();
    let (_conn, ledger, _ids) = ledger_with(&dir, 1).await;

    let again = ledger
        .append_certificate(&device("dev-1", "SN-1"), WipeMethod::NistPurgeOverwrite, Utc::now(), None)
        .await
        .unwrap();

    let document = CertificateDocument::for_device(&ledger, "dev-1").await.unwrap();
    assert_eq!(document.certificate_id, again.certificate.certificate_id);
    assert_eq!(document.chain_index, 2);
    assert_eq!(document.verification_code, again.verification_code);
    assert!(document.chain_valid);

    let text = document.render_text();
    assert!(text.contains("NIST Purge (Overwrite)"));
    assert!(text.contains(&again.verification_code));

    assert!(matches!(
        CertificateDocument::for_device(&ledger, "dev-2").await.unwrap_err(),
        WipeError::CertificateNotFound(_)
    ));
}

#[tokio::test]
async fn concurrent_appends_never_fork_the_chain() {
    const WRITERS: usize = 16;
    let dir = TempDir::new().unwrap();
    let (_conn, first, _ids) = ledger_with(&dir, 0).await;
    // A second handle on the same file contends through SQLite, not the worker thread.
    let second = CertificateLedger::new(db::init(dir.path()).await.unwrap(), EventBus::new());

    let mut tasks = Vec::new();
    for i in 0..WRITERS {
        let ledger = if i % 2 == 0 { first.clone() } else { second.clone() };
        tasks.push(tokio::spawn(async move {
            ledger
                .append_certificate(
                    &device(&format!("dev-{}", i), &format!("SN-{}", i)),
                    WipeMethod::NistClear,
                    Utc::now(),
                    None,
                )
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let chain = first.get_chain().await.unwrap();
    assert_eq!(chain.len(), WRITERS);
    assert_eq!(chain[0].hash_of_previous_certificate, GENESIS_HASH);
    for pair in chain.windows(2) {
        assert_eq!(pair[1].chain_index, pair[0].chain_index + 1);
        assert_eq!(pair[1].hash_of_previous_certificate, pair[0].digest);
    }
    assert_eq!(second.status().await.unwrap().total_certificates, WRITERS as u64);
}
