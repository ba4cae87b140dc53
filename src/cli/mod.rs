//! Client subcommands: one RPC call each, printed as a table or raw JSON.

use anyhow::{Result, bail};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use crate::core::coordinator::CancelReport;
use crate::core::ledger::Verification;
use crate::core::models::{Certificate, Device, JobStatus, WipeJob};
use crate::core::registry::RescanReport;
use crate::db::jobs::StatusLogEntry;
use crate::rpc::RpcClient;
use crate::rpc::methods::{DaemonStatus, Submitted};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct Client {
    rpc: RpcClient,
    json: bool,
}

impl Client {
    pub fn new(addr: SocketAddr, json: bool) -> Self {
        Self {
            rpc: RpcClient::new(addr),
            json,
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Option<Value>) -> Result<T> {
        Ok(self.rpc.call(method, params).await?)
    }

    /// Print `value` as JSON when requested, otherwise through `render`.
    fn emit<T: Serialize>(&self, value: &T, render: impl FnOnce(&T)) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            render(value);
        }
        Ok(())
    }
}

pub async fn status(client: &Client) -> Result<()> {
    let status: DaemonStatus = client.call("daemon.status", None).await?;
    client.emit(&status, |s| {
        println!("sanitd {} (up {}s)", s.version, s.uptime_secs);
        println!("  backend:      {:?}{}", s.backend, if s.simulation { " (simulation)" } else { "" });
        println!("  devices:      {}", s.devices);
        println!("  active jobs:  {}", s.active_jobs);
        println!(
            "  certificates: {} (chain {})",
            s.certificates,
            if s.chain_valid { "valid" } else { "BROKEN" }
        );
        println!("  rpc:          {}", s.rpc_bind);
        println!("  http:         {}", s.http_bind);
    })
}

pub async fn devices(client: &Client) -> Result<()> {
    let devices: Vec<Device> = client.call("devices.list", None).await?;
    client.emit(&devices, |devices| {
        if devices.is_empty() {
            println!("No devices attached.");
            return;
        }
        println!(
            "{:<10} {:<6} {:<28} {:<18} {:>9}  {}",
            "ID", "TYPE", "MODEL", "SERIAL", "CAPACITY", "STATUS"
        );
        for device in devices {
            println!("{}", device_row(device));
        }
    })
}

fn device_row(device: &Device) -> String {
    let mut status = device.status.label().to_string();
    if let Some(progress) = device.status.progress() {
        status = format!("{} {}%", status, progress);
    }
    if let Some(message) = device.status.error_message() {
        status = format!("{}: {}", status, message);
    }
    if !device.is_wipeable {
        status.push_str(" [held]");
    }

    format!(
        "{:<10} {:<6} {:<28} {:<18} {:>9}  {}",
        device.id,
        device.device_type.as_str(),
        truncate(&device.model, 28),
        truncate(&device.serial_number, 18),
        device.capacity_display,
        status
    )
}

fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        return s.to_string();
    }
    let mut out: String = s.chars().take(width.saturating_sub(1)).collect();
    out.push('~');
    out
}

pub async fn rescan(client: &Client) -> Result<()> {
    let report: RescanReport = client.call("devices.rescan", None).await?;
    client.emit(&report, |r| {
        println!(
            "Added {}, removed {}, retained {} mid-wipe.",
            r.added.len(),
            r.removed.len(),
            r.retained.len()
        );
        for id in &r.added {
            println!("  + {}", id);
        }
        for id in &r.removed {
            println!("  - {}", id);
        }
    })
}

pub async fn wipe(client: &Client, device_ids: Vec<String>, method: Option<String>, wait: bool) -> Result<()> {
    let submitted: Submitted = client
        .call(
            "jobs.submit",
            Some(json!({ "device_ids": device_ids, "method": method })),
        )
        .await?;

    if !wait {
        return client.emit(&submitted, |s| println!("Submitted job {}", s.job_id));
    }
    if !client.json {
        println!("Submitted job {}", submitted.job_id);
    }

    let mut seen: HashMap<String, (u8, &'static str)> = HashMap::new();
    let job = loop {
        let job: WipeJob = client.call("jobs.get", Some(json!({ "id": submitted.job_id }))).await?;

        if !client.json {
            for member in &job.members {
                let now = (member.progress, member.status.as_str());
                if seen.get(&member.device_id) != Some(&now) {
                    println!("  {:<10} {:>3}%  {}", member.device_id, member.progress, member.status.as_str());
                    seen.insert(member.device_id.clone(), now);
                }
            }
        }

        if job.status != JobStatus::Running {
            break job;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    };

    client.emit(&job, print_job)?;
    if job.status == JobStatus::Failed {
        bail!("Job {} failed", job.job_id);
    }
    Ok(())
}

fn print_job(job: &WipeJob) {
    println!(
        "Job {}: {} ({}%){}",
        job.job_id,
        job.status.as_str(),
        job.progress,
        if job.cancel_requested { ", cancel requested" } else { "" }
    );
    println!("  created:  {}", job.created_at.to_rfc3339());
    if let Some(finished) = job.finished_at {
        println!("  finished: {}", finished.to_rfc3339());
    }
    for member in &job.members {
        let detail = match (&member.certificate_id, &member.error) {
            (Some(cert), _) => format!("certificate {}", cert),
            (None, Some(error)) => error.clone(),
            (None, None) => String::new(),
        };
        println!(
            "  {:<10} {:<16} {:<15} {:>3}%  {}",
            member.device_id,
            member.method.name(),
            member.status.as_str(),
            member.progress,
            detail
        );
    }
}

pub async fn jobs(client: &Client, limit: usize) -> Result<()> {
    let jobs: Vec<WipeJob> = client.call("jobs.list", Some(json!({ "limit": limit }))).await?;
    client.emit(&jobs, |jobs| {
        if jobs.is_empty() {
            println!("No jobs recorded.");
            return;
        }
        println!("{:<38} {:<10} {:<20} {}", "JOB", "STATUS", "CREATED", "DEVICES");
        for job in jobs {
            let devices: Vec<&str> = job.members.iter().map(|m| m.device_id.as_str()).collect();
            println!(
                "{:<38} {:<10} {:<20} {}",
                job.job_id,
                job.status.as_str(),
                job.created_at.format("%Y-%m-%d %H:%M:%S"),
                devices.join(",")
            );
        }
    })
}

pub async fn job(client: &Client, job_id: &str, history: bool) -> Result<()> {
    let job: WipeJob = client.call("jobs.get", Some(json!({ "id": job_id }))).await?;
    client.emit(&job, print_job)?;

    if history {
        let entries: Vec<StatusLogEntry> = client.call("jobs.history", Some(json!({ "id": job_id }))).await?;
        client.emit(&entries, |entries| {
            println!();
            for entry in entries {
                println!(
                    "  {}  {:<10} {:<18} {}",
                    entry.created_at,
                    entry.device_id.as_deref().unwrap_or("-"),
                    entry.status,
                    entry.description.as_deref().unwrap_or("")
                );
            }
        })?;
    }
    Ok(())
}

pub async fn cancel(client: &Client, job_id: &str) -> Result<()> {
    let report: CancelReport = client.call("jobs.cancel", Some(json!({ "id": job_id }))).await?;
    client.emit(&report, |r| {
        println!("Cancel requested for job {}", r.job_id);
        if !r.requested.is_empty() {
            println!("  stopping:          {}", r.requested.join(", "));
        }
        if !r.past_point_of_no_return.is_empty() {
            println!("  will run to finish: {}", r.past_point_of_no_return.join(", "));
        }
        if !r.already_finished.is_empty() {
            println!("  already finished:  {}", r.already_finished.join(", "));
        }
    })
}

pub async fn rearm(client: &Client, device_id: &str) -> Result<()> {
    let device: Device = client.call("devices.rearm", Some(json!({ "id": device_id }))).await?;
    client.emit(&device, |d| println!("{} is {}", d.id, d.status.label()))
}

pub async fn chain(client: &Client) -> Result<()> {
    let chain: Vec<Certificate> = client.call("ledger.chain", None).await?;
    client.emit(&chain, |chain| {
        if chain.is_empty() {
            println!("Ledger is empty.");
            return;
        }
        println!("{:>5}  {:<10} {:<16} {:<25} {}", "INDEX", "DEVICE", "METHOD", "COMPLETED", "DIGEST");
        for cert in chain {
            println!(
                "{:>5}  {:<10} {:<16} {:<25} {}",
                cert.chain_index,
                cert.device_id,
                cert.method_used,
                cert.completion_timestamp.to_rfc3339(),
                truncate(&cert.digest, 16)
            );
        }
    })
}

pub async fn verify(client: &Client, certificate_id: Option<String>, code: Option<String>) -> Result<()> {
    let verification: Verification = match (certificate_id, code) {
        (_, Some(code)) => client.call("ledger.verify_code", Some(json!({ "code": code }))).await?,
        (Some(id), None) => {
            client
                .call("ledger.verify", Some(json!({ "certificate_id": id })))
                .await?
        }
        (None, None) => bail!("Either a certificate id or --code is required"),
    };

    client.emit(&verification, |v| {
        println!(
            "Certificate {} (index {}): {}",
            v.certificate_id,
            v.chain_index,
            if v.valid && v.chain_valid { "VALID" } else { "INVALID" }
        );
        println!("  record:   {}", if v.valid { "intact" } else { "altered" });
        println!("  chain:    {}", if v.chain_valid { "intact" } else { "broken" });
        if let Some(index) = v.broken_at {
            println!("  broken at index {}", index);
        }
        if let Some(reason) = &v.reason {
            println!("  reason:   {}", reason);
        }
    })?;

    if !(verification.valid && verification.chain_valid) {
        bail!("Certificate {} failed verification", verification.certificate_id);
    }
    Ok(())
}

pub async fn certificate(client: &Client, device_id: &str, text: bool) -> Result<()> {
    if text {
        let rendered: String = client
            .call(
                "certificates.latest",
                Some(json!({ "device_id": device_id, "format": "text" })),
            )
            .await?;
        print!("{}", rendered);
        return Ok(());
    }

    let document: Value = client
        .call("certificates.latest", Some(json!({ "device_id": device_id })))
        .await?;
    println!("{}", serde_json::to_string_pretty(&document)?);
    Ok(())
}
