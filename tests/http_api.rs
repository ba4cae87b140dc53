use sanitd::adapters::{SimulatedAdapter, apply_demo_states};
use sanitd::config::AppConfig;
use sanitd::context::AppContext;
use chrono::Utc;
use sanitd::core::ledger::{ExternalCertificate, ExternalDevice, upload_hash};
use sanitd::core::models::DeviceType;
use sanitd::core::orchestrator;
use sanitd::core::sanitizer::simulated::FaultPlan;
use sanitd::db;
use sanitd::web::{WebState, router};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

async fn serve() -> String {
    let faults = FaultPlan::new();
    let (adapter, _controller) = SimulatedAdapter::with_demo_drives(faults.clone());
    let config = AppConfig {
        simulation: true,
        ..AppConfig::default()
    };
    let ctx = AppContext::new(config, db::open_in_memory().await.unwrap(), Arc::new(adapter), faults);
    orchestrator::rescan(&ctx).await.unwrap();
    apply_demo_states(&ctx.registry).await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(WebState::new(ctx))).await.unwrap();
    });

    format!("http://{}", addr)
}

#[tokio::test]
async fn drives_are_listed_with_their_states() {
    let base = serve().await;

    let drives: Vec<Value> = reqwest::get(format!("{}/api/drives", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(drives.len(), 6);
    assert_eq!(drives[0]["id"], "dev-1");
    assert_eq!(drives[0]["type"], "HDD");
    assert_eq!(drives[0]["status"], "Ready");
    assert_eq!(drives[4]["status"], "Wiped");
    assert_eq!(drives[5]["error_message"], "Device not responding.");

    let resp = reqwest::get(format!("{}/api/drives/dev-404", base)).await.unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "device_not_found");
}

#[tokio::test]
async fn rejected_wipes_report_status_and_code() {
    let base = serve().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/api/wipe/dev-6", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "invalid_device");

    let resp = client
        .post(format!("{}/api/wipe/dev-2", base))
        .json(&json!({ "wipe_method": "DoD 5220.22-M" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "unknown_method");

    let resp = client
        .post(format!("{}/api/jobs", base))
        .json(&json!({ "device_ids": [] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(format!("{}/api/verify_code", base))
        .json(&json!({ "code": "nope" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn wipe_then_download_certificate() {
    let base = serve().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/api/wipe/dev-2", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let accepted: Value = resp.json().await.unwrap();
    assert_eq!(accepted["device_id"], "dev-2");
    let job_id = accepted["job_id"].as_str().unwrap().to_string();

    let mut job = Value::Null;
    for _ in 0..100 {
        job = client
            .get(format!("{}/api/jobs/{}", base, job_id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if job["status"] != "Running" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(job["status"], "Succeeded");
    let certificate_id = job["members"][0]["certificate_id"].as_str().unwrap().to_string();

    let verification: Value = client
        .get(format!("{}/api/verify_chain/{}", base, certificate_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(verification["valid"], true);

    let ledger: Value = client
        .get(format!("{}/api/blockchain", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ledger["status"]["total_certificates"], 1);
    assert_eq!(ledger["chain"][0]["certificate_id"], certificate_id.as_str());

    let resp = client
        .get(format!("{}/download_certificate/dev-2?format=text", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let disposition = resp.headers()["content-disposition"].to_str().unwrap().to_string();
    assert!(disposition.contains("certificate-dev-2-1.txt"));
    let text = resp.text().await.unwrap();
    assert!(text.contains(&certificate_id));
    assert!(text.contains("NIST Purge (Crypto Erase)"));
}

fn external(certificate_id: &str, device_id: &str) -> ExternalCertificate {
    let mut upload = ExternalCertificate {
        certificate_id: certificate_id.into(),
        device_info: ExternalDevice {
            device_id: device_id.into(),
            device_type: DeviceType::Hdd,
            model: "Toshiba P300 1TB".into(),
            serial_number: format!("SN-{}", device_id),
            capacity: 1_000_000_000_000,
        },
        wipe_method: "NIST Clear".into(),
        timestamp: Utc::now(),
        certificate_hash: String::new(),
        signature: Some(format!("code-{}", certificate_id)),
    };
    upload.certificate_hash = upload_hash(&upload);
    upload
}

#[tokio::test]
async fn uploaded_certificates_join_the_chain() {
    let base = serve().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/upload_certificate", base))
        .json(&external("ext-1", "bench-1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let receipt: Value = resp.json().await.unwrap();
    assert_eq!(receipt["chain_index"], 1);

    let resp = client
        .post(format!("{}/upload_certificate", base))
        .json(&external("ext-1", "bench-2"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "duplicate_certificate");

    let mut altered = external("ext-2", "bench-2");
    altered.wipe_method = "DoD 5220.22-M".into();
    let resp = client
        .post(format!("{}/upload_certificate", base))
        .json(&altered)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "certificate_rejected");

    let report: Value = client
        .post(format!("{}/sync_certificates", base))
        .json(&json!({ "certificates": [external("ext-3", "bench-3"), altered, external("ext-4", "bench-4")] }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(report["total"], 3);
    assert_eq!(report["uploaded"].as_array().unwrap().len(), 2);
    assert_eq!(report["failed"][0]["certificate_id"], "ext-2");

    let verification: Value = client
        .post(format!("{}/api/verify_code", base))
        .json(&json!({ "code": "code-ext-4" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(verification["chain_index"], 3);
    assert_eq!(verification["chain_valid"], true);
}

#[tokio::test]
async fn device_history_and_statistics() {
    let base = serve().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/upload_certificate", base))
        .json(&external("ext-1", "dev-1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);

    let history: Value = client
        .get(format!("{}/api/devices/dev-1/wipe-history", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history["total_wipes"], 1);
    assert_eq!(history["history"][0]["certificate_id"], "ext-1");

    let history: Value = client
        .get(format!("{}/api/devices/dev-3/wipe-history", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history["total_wipes"], 0);

    let resp = client
        .get(format!("{}/api/devices/dev-404/wipe-history", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let stats: Value = client
        .get(format!("{}/api/devices/statistics", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["total_devices"], 6);
    assert_eq!(stats["by_status"]["Ready"], 4);
    assert_eq!(stats["by_status"]["Wiped"], 1);
    assert_eq!(stats["by_status"]["Error"], 1);
    assert_eq!(stats["device_types"]["HDD"], 3);
    assert_eq!(stats["device_types"]["SSD"], 2);
    assert_eq!(stats["device_types"]["NVMe"], 1);
    assert_eq!(stats["recent_wipes"][0]["device_id"], "dev-1");
}
