//! Job Coordinator: turns "wipe these devices" into one independent wipe per
//! device, aggregates their progress and issues certificates as they finish.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio_rusqlite::Connection;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use super::engine::{CancelDisposition, SanitizationEngine, WipeCanceller, WipeHandle};
use super::error::WipeError;
use super::events::{DeviceUpdate, Event, EventBus, Notification, NotificationLevel, ProgressUpdate};
use super::ledger::CertificateLedger;
use super::methods::WipeMethod;
use super::models::{Device, DeviceStatus, JobStatus, WipeJob};
use super::notifications::{self, NotificationChannel, WipeNotice};
use super::progress::JobTracker;
use super::registry::DeviceRegistry;
use crate::db;
use crate::db::jobs::StatusLogEntry;

#[derive(Clone)]
pub struct JobCoordinator {
    engine: SanitizationEngine,
    registry: DeviceRegistry,
    ledger: CertificateLedger,
    jobs: JobTracker,
    events: EventBus,
    db: Connection,
    notifier: Option<Arc<dyn NotificationChannel>>,
    runs: Arc<Mutex<HashMap<String, JobRun>>>,
}

struct JobRun {
    cancel: CancellationToken,
    wipes: Vec<WipeCanceller>,
    done: watch::Receiver<bool>,
}

/// Per-device answer to a job cancel request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelReport {
    pub job_id: String,
    /// Signalled; these devices stop at their next check and end in `Error`.
    pub requested: Vec<String>,
    /// Too far along to stop; these finish on their own.
    pub past_point_of_no_return: Vec<String>,
    pub already_finished: Vec<String>,
}

/// Which rejections a submission reports.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Admission {
    /// Batch submission: any unusable device is `InvalidDevice`.
    Batch,
    /// Single-device wipe: keep the engine's specific error.
    Direct,
}

pub struct CoordinatorParts {
    pub engine: SanitizationEngine,
    pub registry: DeviceRegistry,
    pub ledger: CertificateLedger,
    pub jobs: JobTracker,
    pub events: EventBus,
    pub db: Connection,
    pub notifier: Option<Arc<dyn NotificationChannel>>,
}

impl JobCoordinator {
    pub fn new(parts: CoordinatorParts) -> Self {
        Self {
            engine: parts.engine,
            registry: parts.registry,
            ledger: parts.ledger,
            jobs: parts.jobs,
            events: parts.events,
            db: parts.db,
            notifier: parts.notifier,
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Wipe a set of devices concurrently. Every device must be `Ready` and
    /// wipeable; otherwise nothing starts.
    pub async fn submit_job(
        &self,
        device_ids: &[String],
        method: Option<&str>,
    ) -> Result<String, WipeError> {
        self.submit(device_ids, method, Admission::Batch).await
    }

    /// Wipe one device, reporting `DeviceBusy`, `DeviceNotWipeable` or
    /// `UnknownMethod` as such.
    pub async fn start_device_wipe(
        &self,
        device_id: &str,
        method: Option<&str>,
    ) -> Result<String, WipeError> {
        self.submit(&[device_id.to_string()], method, Admission::Direct)
            .await
    }

    async fn submit(
        &self,
        device_ids: &[String],
        method: Option<&str>,
        admission: Admission,
    ) -> Result<String, WipeError> {
        let mut seen = HashSet::new();
        let ids: Vec<String> = device_ids
            .iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty() && seen.insert(id.clone()))
            .collect();

        if ids.is_empty() {
            return Err(WipeError::EmptySelection);
        }

        let reserved = self
            .registry
            .reserve(&ids, method)
            .await
            .map_err(|e| match admission {
                Admission::Batch => as_invalid_device(e),
                Admission::Direct => e,
            })?;

        // Reservation runs in id order; members keep the order they were requested in.
        let mut by_id: HashMap<String, (Device, WipeMethod)> = reserved
            .into_iter()
            .map(|(device, method)| (device.id.clone(), (device, method)))
            .collect();
        let members: Vec<(Device, WipeMethod)> =
            ids.iter().filter_map(|id| by_id.remove(id)).collect();

        let job_id = Uuid::now_v7().to_string();
        let job = WipeJob::new(
            job_id.clone(),
            members
                .iter()
                .map(|(device, method)| (device.id.clone(), *method))
                .collect(),
        );

        self.jobs.insert(job.clone()).await;
        if let Err(e) = db::jobs::create(&self.db, &job).await {
            warn!(job_id = %job_id, error = %e, "Failed to persist job");
        }

        info!(job_id = %job_id, devices = ?ids, "Wipe job submitted");
        notifications::dispatch(
            &self.notifier,
            WipeNotice::JobStarted {
                job_id: job_id.clone(),
                device_ids: ids.clone(),
            },
        );
        self.events.publish(Event::Notification(Notification::new(
            NotificationLevel::Info,
            "Wipe started",
            format!("Job {} started for {} device(s)", short(&job_id), ids.len()),
        )));

        let job_cancel = CancellationToken::new();
        let handles: Vec<WipeHandle> = members
            .into_iter()
            .map(|(device, method)| self.engine.launch(device, method, job_cancel.child_token()))
            .collect();

        let (done_tx, done_rx) = watch::channel(false);
        self.runs.lock().await.insert(
            job_id.clone(),
            JobRun {
                cancel: job_cancel,
                wipes: handles.iter().map(WipeHandle::canceller).collect(),
                done: done_rx,
            },
        );

        let span = info_span!("job", job_id = %job_id);
        tokio::spawn(
            self.clone()
                .supervise(job_id.clone(), handles, done_tx)
                .instrument(span),
        );

        Ok(job_id)
    }

    async fn supervise(self, job_id: String, handles: Vec<WipeHandle>, done: watch::Sender<bool>) {
        let members: Vec<_> = handles
            .into_iter()
            .map(|handle| tokio::spawn(self.clone().track_member(job_id.clone(), handle)))
            .collect();

        for member in members {
            if let Err(e) = member.await {
                error!(error = %e, "Job member task aborted");
            }
        }

        let Some(job) = self.jobs.update(&job_id, WipeJob::finish).await else {
            self.runs.lock().await.remove(&job_id);
            let _ = done.send(true);
            return;
        };

        let persisted = match db::jobs::finish(&self.db, &job).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Failed to persist job outcome, keeping it in memory");
                false
            }
        };

        let succeeded = job.succeeded_count();
        let total = job.members.len();
        info!(status = job.status.as_str(), succeeded, total, "Wipe job finished");

        notifications::dispatch(
            &self.notifier,
            WipeNotice::JobFinished {
                job_id: job_id.clone(),
                succeeded,
                total,
            },
        );
        let (level, title) = match job.status {
            JobStatus::Succeeded => (NotificationLevel::Success, "Wipe job complete"),
            _ => (NotificationLevel::Warning, "Wipe job finished with failures"),
        };
        self.events.publish(Event::Notification(Notification::new(
            level,
            title,
            format!("Job {}: {} of {} device(s) wiped and certified", short(&job_id), succeeded, total),
        )));

        // From here on the database answers for this job.
        self.runs.lock().await.remove(&job_id);
        if persisted {
            self.jobs.remove(&job_id).await;
        }
        let _ = done.send(true);
    }

    async fn track_member(self, job_id: String, handle: WipeHandle) {
        let device_id = handle.device_id.clone();
        let method = handle.method;

        let mut progress = handle.subscribe_progress();
        while progress.changed().await.is_ok() {
            let value = *progress.borrow_and_update();
            self.publish_progress(&job_id, &device_id, value, |job| {
                job.record_progress(&device_id, value)
            })
            .await;
        }

        let outcome = handle.wait().await;

        match outcome.result {
            Ok(_) => {
                self.publish_progress(&job_id, &device_id, 100, |job| job.mark_wiped(&device_id))
                    .await;
                self.record(&job_id, Some(&device_id), "Wiped", None).await;
                self.certify(&job_id, &outcome.device, method).await;
            }
            Err(err) => {
                let message = err.to_string();
                let last = self
                    .jobs
                    .get(&job_id)
                    .await
                    .and_then(|job| job.member(&device_id).map(|m| m.progress))
                    .unwrap_or(0);
                self.publish_progress(&job_id, &device_id, last, |job| {
                    job.mark_failed(&device_id, message.clone())
                })
                .await;
                self.record(&job_id, Some(&device_id), "Error", Some(message.clone()))
                    .await;

                notifications::dispatch(
                    &self.notifier,
                    WipeNotice::DeviceFailed {
                        job_id: job_id.clone(),
                        device_id: device_id.clone(),
                        error: message.clone(),
                    },
                );
                let level = match err {
                    WipeError::Cancelled { .. } => NotificationLevel::Warning,
                    _ => NotificationLevel::Error,
                };
                self.events.publish(Event::Notification(Notification::new(
                    level,
                    "Wipe failed",
                    message,
                )));
            }
        }
    }

    async fn certify(&self, job_id: &str, device: &Device, method: WipeMethod) {
        let completed_at = match device.status {
            DeviceStatus::Wiped { completed_at, .. } => completed_at,
            _ => Utc::now(),
        };

        match self
            .ledger
            .append_certificate(device, method, completed_at, Some(job_id))
            .await
        {
            Ok(stored) => {
                let certificate_id = stored.certificate.certificate_id.clone();
                self.jobs
                    .update(job_id, |job| {
                        job.attach_certificate(&device.id, certificate_id.clone())
                    })
                    .await;
                self.record(
                    job_id,
                    Some(&device.id),
                    "Certified",
                    Some(format!("certificate {}", certificate_id)),
                )
                .await;

                notifications::dispatch(
                    &self.notifier,
                    WipeNotice::DeviceWiped {
                        job_id: job_id.to_string(),
                        device_id: device.id.clone(),
                        device_model: device.model.clone(),
                        method: method.to_string(),
                        certificate_id: certificate_id.clone(),
                    },
                );
                self.events.publish(Event::Notification(Notification::new(
                    NotificationLevel::Success,
                    "Wipe complete",
                    format!("{} wiped with {}; certificate {}", device.model, method, certificate_id),
                )));
            }
            Err(e) => {
                // The device is wiped but unproven, which fails the job.
                error!(device_id = %device.id, error = %e, "Certificate could not be issued");
                let message = format!("wiped but not certified: {}", e);
                self.jobs
                    .update(job_id, |job| job.mark_uncertified(&device.id, message.clone()))
                    .await;
                self.record(job_id, Some(&device.id), "CertificateFailed", Some(message.clone()))
                    .await;

                notifications::dispatch(
                    &self.notifier,
                    WipeNotice::DeviceFailed {
                        job_id: job_id.to_string(),
                        device_id: device.id.clone(),
                        error: message.clone(),
                    },
                );
                self.events.publish(Event::Notification(Notification::new(
                    NotificationLevel::Error,
                    "Certificate failed",
                    message,
                )));
            }
        }
    }

    async fn publish_progress(
        &self,
        job_id: &str,
        device_id: &str,
        device_progress: u8,
        change: impl FnOnce(&mut WipeJob),
    ) {
        let Some(job) = self.jobs.update(job_id, change).await else {
            return;
        };
        let member = job.member(device_id);
        let device_progress = member.map(|m| m.progress).unwrap_or(device_progress);
        let state = member.map(|m| m.status.as_str()).unwrap_or("Unknown");

        self.events.publish(Event::ProgressUpdate(ProgressUpdate {
            job_id: job_id.to_string(),
            device_id: device_id.to_string(),
            device_progress,
            job_progress: job.progress,
            message: format!("{} {} at {}%", device_id, state, device_progress),
            timestamp: Utc::now(),
        }));
    }

    /// Ask every running wipe in the job to stop.
    pub async fn cancel_job(&self, job_id: &str) -> Result<CancelReport, WipeError> {
        let mut report = CancelReport {
            job_id: job_id.to_string(),
            ..CancelReport::default()
        };

        let live = self
            .jobs
            .update(job_id, |job| {
                if job.status == JobStatus::Running {
                    job.cancel_requested = true;
                }
            })
            .await;
        let job = match live {
            Some(job) => job,
            None => self.get_job(job_id).await?,
        };

        {
            let runs = self.runs.lock().await;
            let Some(run) = runs.get(job_id) else {
                report.already_finished = job.members.iter().map(|m| m.device_id.clone()).collect();
                return Ok(report);
            };

            for wipe in &run.wipes {
                let finished = job
                    .member(&wipe.device_id)
                    .map(|m| m.status.is_terminal())
                    .unwrap_or(true);
                let disposition = if finished {
                    CancelDisposition::AlreadyFinished
                } else {
                    wipe.cancel()
                };

                match disposition {
                    CancelDisposition::Requested => report.requested.push(wipe.device_id.clone()),
                    CancelDisposition::PastPointOfNoReturn => {
                        report.past_point_of_no_return.push(wipe.device_id.clone())
                    }
                    CancelDisposition::AlreadyFinished => {
                        report.already_finished.push(wipe.device_id.clone())
                    }
                }
            }
            run.cancel.cancel();
        }

        info!(
            job_id = %job_id,
            requested = ?report.requested,
            past_point_of_no_return = ?report.past_point_of_no_return,
            "Job cancel requested"
        );
        self.record(
            job_id,
            None,
            "CancelRequested",
            Some(format!(
                "{} signalled, {} past point of no return",
                report.requested.len(),
                report.past_point_of_no_return.len()
            )),
        )
        .await;

        Ok(report)
    }

    /// Wait until every member of the job is terminal. A job that is no
    /// longer running is answered from its persisted state.
    pub async fn wait(&self, job_id: &str) -> Result<WipeJob, WipeError> {
        let done = self.runs.lock().await.get(job_id).map(|run| run.done.clone());
        if let Some(mut done) = done {
            // An Err means the supervisor is gone; fall through to the last snapshot.
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.get_job(job_id).await
    }

    /// Running jobs come from memory, finished ones from the database.
    pub async fn get_job(&self, job_id: &str) -> Result<WipeJob, WipeError> {
        if let Some(job) = self.jobs.get(job_id).await {
            return Ok(job);
        }
        db::jobs::load(&self.db, job_id.to_string())
            .await
            .map_err(WipeError::storage)?
            .ok_or_else(|| WipeError::JobNotFound(job_id.to_string()))
    }

    /// Newest first: running jobs plus the most recent finished ones.
    pub async fn list_jobs(&self, limit: usize) -> Result<Vec<WipeJob>, WipeError> {
        let mut jobs = self.jobs.list().await;
        let stored = db::jobs::recent(&self.db, limit)
            .await
            .map_err(WipeError::storage)?;

        let live: HashSet<String> = jobs.iter().map(|job| job.job_id.clone()).collect();
        jobs.extend(stored.into_iter().filter(|job| !live.contains(&job.job_id)));
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.job_id.cmp(&a.job_id)));
        jobs.truncate(limit);
        Ok(jobs)
    }

    /// Persisted transition history, including jobs from earlier runs.
    pub async fn history(&self, job_id: &str) -> Result<Vec<StatusLogEntry>, WipeError> {
        let entries = db::jobs::history(&self.db, job_id.to_string())
            .await
            .map_err(WipeError::storage)?;
        if entries.is_empty() {
            return Err(WipeError::JobNotFound(job_id.to_string()));
        }
        Ok(entries)
    }

    /// Return a finished device to `Ready` and tell subscribers.
    pub async fn rearm_device(&self, device_id: &str) -> Result<Device, WipeError> {
        let device = self.registry.rearm(device_id).await?;
        self.events
            .publish(Event::DeviceUpdate(DeviceUpdate::from_device(&device)));
        Ok(device)
    }

    pub async fn active_jobs(&self) -> usize {
        self.jobs.active_count().await
    }

    async fn record(&self, job_id: &str, device_id: Option<&str>, status: &str, description: Option<String>) {
        if let Err(e) = db::jobs::update_status(
            &self.db,
            job_id.to_string(),
            device_id.map(str::to_string),
            status.to_string(),
            description,
        )
        .await
        {
            warn!(job_id = %job_id, error = %e, "Failed to persist job status");
        }
    }
}

/// Batch submissions report every unusable device the same way.
fn as_invalid_device(err: WipeError) -> WipeError {
    let (device_id, reason) = match err {
        WipeError::DeviceNotFound(id) => (id, "device not found".to_string()),
        WipeError::DeviceBusy(id) => (id, "device is already being wiped".to_string()),
        WipeError::DeviceNotWipeable(id) => (id, "device cannot be safely sanitized".to_string()),
        other => return other,
    };
    WipeError::InvalidDevice { device_id, reason }
}

fn short(id: &str) -> &str {
    &id[..8.min(id.len())]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_rejections_become_invalid_device() {
        assert!(matches!(
            as_invalid_device(WipeError::DeviceBusy("dev-1".into())),
            WipeError::InvalidDevice { device_id, .. } if device_id == "dev-1"
        ));
        assert!(matches!(
            as_invalid_device(WipeError::DeviceNotFound("dev-9".into())),
            WipeError::InvalidDevice { .. }
        ));
        assert_eq!(
            as_invalid_device(WipeError::EmptySelection),
            WipeError::EmptySelection
        );
    }
}
