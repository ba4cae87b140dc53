use regex::Regex;
use serde_json::Value;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{Instrument, debug, info, info_span, warn};

use super::{SanitizeControl, SanitizeFuture, SanitizeReport, SanitizeRequest, SanitizeStatus, Sanitizer};
use crate::core::error::WipeError;
use crate::core::methods::MethodKind;

/// Used when the drive does not report an erase time estimate.
const DEFAULT_ERASE_MINUTES: u64 = 120;

/// How often estimated progress is reported during an ATA erase.
const ESTIMATE_TICK: Duration = Duration::from_secs(5);

const NVME_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Give up waiting on a controller that never reports completion.
const NVME_DEADLINE: Duration = Duration::from_secs(24 * 60 * 60);

static ERASE_TIME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(\d+)min for SECURITY ERASE UNIT").ok());

/// Firmware-level sanitization through `hdparm` (ATA) and `nvme-cli` (NVMe).
pub struct FirmwareEraser {
    ata_password: String,
    poll_interval: Duration,
}

impl FirmwareEraser {
    pub fn new(ata_password: impl Into<String>) -> Self {
        Self {
            ata_password: ata_password.into(),
            poll_interval: NVME_POLL_INTERVAL,
        }
    }
}

impl Sanitizer for FirmwareEraser {
    fn sanitize(&self, req: &SanitizeRequest, ctl: SanitizeControl) -> SanitizeFuture {
        let req = req.clone();
        let password = self.ata_password.clone();
        let poll_interval = self.poll_interval;

        Box::pin(async move {
            let span = info_span!("firmware_erase", device_id = %req.device_id, method = %req.method);

            async {
                let _ = ctl.progress.send(SanitizeStatus::Preparing).await;
                let start_time = Instant::now();

                match req.method.kind() {
                    MethodKind::AtaSecureErase => ata_secure_erase(&req, &password, &ctl).await?,
                    MethodKind::NvmeSanitize(action) => {
                        nvme_sanitize(&req, action, poll_interval, &ctl).await?
                    }
                    MethodKind::Overwrite(_) => {
                        return Err(WipeError::UnknownMethod {
                            device_id: req.device_id.clone(),
                            method: req.method.to_string(),
                        });
                    }
                }

                let duration_secs = start_time.elapsed().as_secs();
                info!(duration_secs, "Firmware erase complete");

                Ok(SanitizeReport {
                    bytes_processed: req.capacity,
                    duration_secs,
                    verified: false,
                })
            }
            .instrument(span)
            .await
        })
    }
}

async fn ata_secure_erase(
    req: &SanitizeRequest,
    password: &str,
    ctl: &SanitizeControl,
) -> Result<(), WipeError> {
    let dev = req.path.to_string_lossy().into_owned();

    let identify = run_tool(req, "hdparm", &["-I", &dev]).await?;
    let security = parse_ata_security(&identify);
    debug!(?security, "ATA security state");

    if !security.supported {
        return Err(hardware(req, "drive does not support the ATA security feature set"));
    }
    if security.frozen {
        return Err(hardware(
            req,
            "drive security is frozen; suspend and resume the host or re-plug the drive, then retry",
        ));
    }
    if security.enabled {
        return Err(hardware(
            req,
            "a user password is already set on the drive; clear it before sanitizing",
        ));
    }

    if ctl.cancel.is_cancelled() {
        return Err(cancelled(req, "cancelled before the erase command was issued; drive unchanged"));
    }

    run_tool(
        req,
        "hdparm",
        &["--user-master", "u", "--security-set-pass", password, &dev],
    )
    .await?;

    if ctl.cancel.is_cancelled() {
        if let Err(e) = run_tool(req, "hdparm", &["--security-disable", password, &dev]).await {
            warn!(error = %e, "Failed to clear temporary drive password after cancel");
        }
        return Err(cancelled(req, "cancelled before the erase command was issued; drive unchanged"));
    }

    let _ = ctl.progress.send(SanitizeStatus::PointOfNoReturn).await;

    let estimate =
        Duration::from_secs(security.erase_minutes.unwrap_or(DEFAULT_ERASE_MINUTES) * 60);
    info!(estimate_secs = estimate.as_secs(), "Issuing SECURITY ERASE UNIT");

    let mut child = Command::new("hdparm")
        .args(["--user-master", "u", "--security-erase", password, &dev])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| hardware(req, format!("failed to spawn hdparm: {}", e)))?;

    let started = Instant::now();
    let mut ticker = tokio::time::interval(ESTIMATE_TICK);

    let status = loop {
        tokio::select! {
            status = child.wait() => {
                break status.map_err(|e| hardware(req, format!("failed to wait for hdparm: {}", e)))?;
            }
            _ = ticker.tick() => {
                let percentage = estimated_progress(started.elapsed(), estimate);
                let _ = ctl.progress.send(SanitizeStatus::Erasing { percentage }).await;
            }
        }
    };

    if !status.success() {
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr).await;
        }
        return Err(hardware(
            req,
            format!("security erase failed ({}): {}", status, stderr.trim()),
        ));
    }

    Ok(())
}

async fn nvme_sanitize(
    req: &SanitizeRequest,
    action: u8,
    poll_interval: Duration,
    ctl: &SanitizeControl,
) -> Result<(), WipeError> {
    let ctrl = nvme_ctrl_path(&req.path.to_string_lossy());

    if ctl.cancel.is_cancelled() {
        return Err(cancelled(req, "cancelled before the sanitize command was issued; drive unchanged"));
    }

    let _ = ctl.progress.send(SanitizeStatus::PointOfNoReturn).await;
    info!(controller = %ctrl, action, "Issuing NVMe sanitize");
    run_tool(req, "nvme", &["sanitize", &ctrl, &format!("--sanact={}", action)]).await?;

    let started = Instant::now();
    loop {
        tokio::time::sleep(poll_interval).await;

        let log = run_tool(req, "nvme", &["sanitize-log", &ctrl, "--output-format=json"]).await?;
        let state = parse_sanitize_log(&log)
            .ok_or_else(|| hardware(req, "unrecognised sanitize-log output"))?;
        debug!(?state, "Sanitize status");

        match state {
            SanitizeState::Completed => return Ok(()),
            SanitizeState::InProgress(percentage) => {
                let _ = ctl
                    .progress
                    .send(SanitizeStatus::Erasing {
                        percentage: percentage.min(99),
                    })
                    .await;
            }
            SanitizeState::Failed => {
                return Err(hardware(req, "controller reported sanitize failure"));
            }
            SanitizeState::Idle => {}
        }

        if started.elapsed() > NVME_DEADLINE {
            return Err(hardware(req, "timed out waiting for sanitize to complete"));
        }
    }
}

/// Run an external tool and return its stdout. Arguments are never logged
/// since they can carry the drive password.
async fn run_tool(req: &SanitizeRequest, program: &str, args: &[&str]) -> Result<String, WipeError> {
    debug!(program, "Running tool");

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| hardware(req, format!("failed to run {}: {}", program, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(hardware(
            req,
            format!("{} exited with {}: {}", program, output.status, stderr.trim()),
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn hardware(req: &SanitizeRequest, message: impl Into<String>) -> WipeError {
    WipeError::HardwareIo {
        device_id: req.device_id.clone(),
        message: message.into(),
    }
}

fn cancelled(req: &SanitizeRequest, detail: &str) -> WipeError {
    WipeError::Cancelled {
        device_id: req.device_id.clone(),
        detail: detail.to_string(),
    }
}

/// ATA security state from the `Security:` section of `hdparm -I`.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AtaSecurity {
    pub supported: bool,
    pub enabled: bool,
    pub frozen: bool,
    pub erase_minutes: Option<u64>,
}

pub fn parse_ata_security(identify: &str) -> AtaSecurity {
    let mut security = AtaSecurity::default();

    let section = identify
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("Security:"))
        .skip(1)
        .take_while(|line| line.starts_with('\t') || line.starts_with(' ') || line.is_empty());

    for line in section {
        let normalized = line.split_whitespace().collect::<Vec<_>>().join(" ");
        match normalized.as_str() {
            "supported" => security.supported = true,
            "enabled" => security.enabled = true,
            "frozen" => security.frozen = true,
            _ => {}
        }

        if let Some(minutes) = ERASE_TIME
            .as_ref()
            .and_then(|re| re.captures(&normalized))
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
        {
            security.erase_minutes = Some(minutes);
        }
    }

    security
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SanitizeState {
    /// No sanitize recorded yet.
    Idle,
    InProgress(u8),
    Completed,
    Failed,
}

/// Interpret `nvme sanitize-log --output-format=json`. Newer nvme-cli nests
/// the fields under the device name, so they are searched for at any depth.
pub fn parse_sanitize_log(json: &str) -> Option<SanitizeState> {
    let value: Value = serde_json::from_str(json).ok()?;
    let sstat = find_number(&value, "sstat")?;
    let sprog = find_number(&value, "sprog").unwrap_or(0);

    let state = match sstat & 0x7 {
        0 => SanitizeState::Idle,
        1 | 4 => SanitizeState::Completed,
        2 => SanitizeState::InProgress(((sprog.min(65535) * 100) / 65536) as u8),
        _ => SanitizeState::Failed,
    };
    Some(state)
}

fn find_number(value: &Value, key: &str) -> Option<u64> {
    match value {
        Value::Object(map) => map
            .get(key)
            .and_then(Value::as_u64)
            .or_else(|| map.values().find_map(|v| find_number(v, key))),
        Value::Array(items) => items.iter().find_map(|v| find_number(v, key)),
        _ => None,
    }
}

/// Convert a namespace device path like /dev/nvme0n1 to its controller /dev/nvme0.
pub fn nvme_ctrl_path(dev_path: &str) -> String {
    if let Some(rest) = dev_path.strip_prefix("/dev/nvme") {
        if let Some(pos) = rest.rfind('n') {
            let tail = &rest[pos + 1..];
            if !tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit()) {
                return format!("/dev/nvme{}", &rest[..pos]);
            }
        }
    }
    dev_path.to_string()
}

fn estimated_progress(elapsed: Duration, estimate: Duration) -> u8 {
    let estimate = estimate.as_secs_f64().max(1.0);
    ((elapsed.as_secs_f64() / estimate) * 100.0).min(99.0) as u8
}
