use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use tokio_rusqlite::{Connection, params, rusqlite};
use uuid::Uuid;

use super::{format_timestamp, parse_timestamp};
use crate::core::methods::WipeMethod;
use crate::core::models::{JobMember, JobStatus, MemberStatus, WipeJob};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusLogEntry {
    pub id: String,
    pub device_id: Option<String>,
    pub status: String,
    pub description: Option<String>,
    pub created_at: String,
}

pub async fn create(conn: &Connection, job: &WipeJob) -> Result<()> {
    let job_id = job.job_id.clone();
    let created_at = format_timestamp(&job.created_at);
    let members: Vec<(String, String)> = job
        .members
        .iter()
        .map(|m| (m.device_id.clone(), m.method.to_string()))
        .collect();

    conn.call(move |c| {
        let tx = c.transaction()?;

        tx.execute(
            "INSERT INTO wipe_jobs (id, created_at) VALUES (?1, ?2)",
            params![&job_id, &created_at],
        )?;

        for (position, (device_id, method)) in members.iter().enumerate() {
            tx.execute(
                "INSERT INTO job_members (job_id, device_id, position, method)
                 VALUES (?1, ?2, ?3, ?4)",
                params![&job_id, device_id, position as i64, method],
            )?;
        }

        let log_id = Uuid::now_v7().to_string();
        tx.execute(
            "INSERT INTO job_status_log (id, job_id, status, description)
             VALUES (?1, ?2, 'Running', ?3)",
            params![
                log_id,
                &job_id,
                format!("Job created with {} device(s)", members.len())
            ],
        )?;

        tx.commit()?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(())
}

pub async fn update_status(
    conn: &Connection,
    job_id: String,
    device_id: Option<String>,
    status: String,
    description: Option<String>,
) -> Result<()> {
    conn.call(move |c| {
        let log_id = Uuid::now_v7().to_string();
        c.execute(
            "INSERT INTO job_status_log (id, job_id, device_id, status, description)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![log_id, job_id, device_id, status, description],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(())
}

/// Persist the final state of a job and each of its members.
pub async fn finish(conn: &Connection, job: &WipeJob) -> Result<()> {
    let job_id = job.job_id.clone();
    let outcome = job.status.as_str().to_string();
    let finished_at = job.finished_at.as_ref().map(format_timestamp);
    let cancel_requested = job.cancel_requested;
    let members = job.members.clone();
    let description = format!(
        "{} of {} device(s) wiped and certified",
        job.succeeded_count(),
        job.members.len()
    );

    conn.call(move |c| {
        let tx = c.transaction()?;
        tx.execute(
            "UPDATE wipe_jobs SET finished_at = ?2, outcome = ?3, cancel_requested = ?4 WHERE id = ?1",
            params![&job_id, finished_at, &outcome, cancel_requested],
        )?;

        for member in &members {
            tx.execute(
                "UPDATE job_members SET status = ?3, progress = ?4, error = ?5, certificate_id = ?6
                 WHERE job_id = ?1 AND device_id = ?2",
                params![
                    &job_id,
                    &member.device_id,
                    member.status.as_str(),
                    member.progress as i64,
                    &member.error,
                    &member.certificate_id,
                ],
            )?;
        }

        let log_id = Uuid::now_v7().to_string();
        tx.execute(
            "INSERT INTO job_status_log (id, job_id, status, description)
             VALUES (?1, ?2, ?3, ?4)",
            params![log_id, &job_id, &outcome, description],
        )?;

        tx.commit()?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(())
}

/// A job as it was last persisted. Members of a job that never finished
/// (daemon stopped mid-wipe) read back as `WipeInProgress`.
pub async fn load(conn: &Connection, job_id: String) -> Result<Option<WipeJob>> {
    conn.call(move |c| load_job(c, &job_id))
        .await
        .map_err(|e| anyhow!("Failed to load job: {}", e))
}

/// Most recent jobs first, in full.
pub async fn recent(conn: &Connection, limit: usize) -> Result<Vec<WipeJob>> {
    conn.call(move |c| {
        let ids = {
            let mut stmt =
                c.prepare("SELECT id FROM wipe_jobs ORDER BY created_at DESC, id DESC LIMIT ?1")?;
            let ids = stmt
                .query_map(params![limit as i64], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ids
        };

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = load_job(c, &id)? {
                jobs.push(job);
            }
        }
        Ok::<_, rusqlite::Error>(jobs)
    })
    .await
    .map_err(|e| anyhow!("Failed to list recent jobs: {}", e))
}

pub async fn history(conn: &Connection, job_id: String) -> Result<Vec<StatusLogEntry>> {
    conn.call(move |c| {
        let mut stmt = c.prepare(
            "SELECT id, device_id, status, description, created_at
             FROM job_status_log WHERE job_id = ?1 ORDER BY id",
        )?;
        let entries = stmt
            .query_map(params![job_id], |row| {
                Ok(StatusLogEntry {
                    id: row.get(0)?,
                    device_id: row.get(1)?,
                    status: row.get(2)?,
                    description: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok::<_, rusqlite::Error>(entries)
    })
    .await
    .map_err(|e| anyhow!("Failed to read job history: {}", e))
}

fn load_job(c: &rusqlite::Connection, job_id: &str) -> rusqlite::Result<Option<WipeJob>> {
    let mut stmt = c.prepare(
        "SELECT id, created_at, finished_at, outcome, cancel_requested FROM wipe_jobs WHERE id = ?1",
    )?;
    let mut rows = stmt.query(params![job_id])?;
    let Some(row) = rows.next()? else {
        return Ok(None);
    };

    let created_at: String = row.get(1)?;
    let finished_at: Option<String> = row.get(2)?;
    let outcome: String = row.get(3)?;
    let mut job = WipeJob::new(row.get(0)?, Vec::new());
    job.created_at = parse_timestamp(1, &created_at)?;
    job.finished_at = finished_at
        .as_deref()
        .map(|raw| parse_timestamp(2, raw))
        .transpose()?;
    job.status = JobStatus::parse(&outcome).ok_or_else(|| unknown(3, "job outcome", &outcome))?;
    job.cancel_requested = row.get(4)?;

    let mut stmt = c.prepare(
        "SELECT device_id, method, status, progress, error, certificate_id
         FROM job_members WHERE job_id = ?1 ORDER BY position",
    )?;
    job.members = stmt
        .query_map(params![job_id], |row| {
            let method: String = row.get(1)?;
            let status: String = row.get(2)?;
            Ok(JobMember {
                device_id: row.get(0)?,
                method: WipeMethod::from_name(&method)
                    .ok_or_else(|| unknown(1, "wipe method", &method))?,
                status: MemberStatus::parse(&status)
                    .ok_or_else(|| unknown(2, "member status", &status))?,
                progress: row.get::<_, i64>(3)?.clamp(0, 100) as u8,
                error: row.get(4)?,
                certificate_id: row.get(5)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let sum: u32 = job.members.iter().map(|m| m.progress as u32).sum();
    job.progress = sum.checked_div(job.members.len() as u32).unwrap_or(0) as u8;
    Ok(Some(job))
}

fn unknown(idx: usize, what: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unknown {} '{}'", what, value).into(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> WipeJob {
        WipeJob::new(
            "job-1".into(),
            vec![
                ("dev-1".into(), WipeMethod::NistClear),
                ("dev-2".into(), WipeMethod::NistPurgeCryptoErase),
            ],
        )
    }

    #[tokio::test]
    async fn job_history_is_recorded_in_order() {
        let conn = crate::db::open_in_memory().await.unwrap();
        let mut job = job();
        create(&conn, &job).await.unwrap();

        update_status(
            &conn,
            "job-1".into(),
            Some("dev-1".into()),
            "Wiped".into(),
            None,
        )
        .await
        .unwrap();

        job.mark_wiped("dev-1");
        job.attach_certificate("dev-1", "cert-1".into());
        job.mark_failed("dev-2", "controller reported sanitize failure".into());
        job.finish();
        finish(&conn, &job).await.unwrap();

        let stored = load(&conn, "job-1".into()).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.finished_at.is_some());
        assert_eq!(stored.members.len(), 2);
        assert_eq!(stored.members[1].method, WipeMethod::NistPurgeCryptoErase);

        let history = history(&conn, "job-1".into()).await.unwrap();
        let statuses: Vec<&str> = history.iter().map(|e| e.status.as_str()).collect();
        assert_eq!(statuses, vec!["Running", "Wiped", "Failed"]);
        assert_eq!(history[1].device_id.as_deref(), Some("dev-1"));
    }

    #[tokio::test]
    async fn finished_job_loads_back_in_full() {
        let conn = crate::db::open_in_memory().await.unwrap();
        let mut job = WipeJob::new(
            "job-1".into(),
            vec![
                ("dev-3".into(), WipeMethod::NistClear),
                ("dev-1".into(), WipeMethod::NistPurgeCryptoErase),
            ],
        );
        job.created_at = parse_timestamp(0, "2024-05-01T10:00:00.000001Z").unwrap();
        create(&conn, &job).await.unwrap();

        let running = load(&conn, "job-1".into()).await.unwrap().unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert!(running.members.iter().all(|m| m.status == MemberStatus::WipeInProgress));

        job.record_progress("dev-3", 40);
        job.mark_failed("dev-3", "cancelled by operator".into());
        job.mark_wiped("dev-1");
        job.attach_certificate("dev-1", "cert-1".into());
        job.cancel_requested = true;
        job.finish();
        job.finished_at = Some(parse_timestamp(0, "2024-05-01T10:05:00.250000Z").unwrap());
        finish(&conn, &job).await.unwrap();

        let loaded = load(&conn, "job-1".into()).await.unwrap().unwrap();
        assert_eq!(loaded.created_at, job.created_at);
        assert_eq!(loaded.finished_at, job.finished_at);
        assert_eq!(loaded, job);

        // Members keep the order they were requested in.
        let order: Vec<&str> = loaded.members.iter().map(|m| m.device_id.as_str()).collect();
        assert_eq!(order, vec!["dev-3", "dev-1"]);

        let recent = recent(&conn, 10).await.unwrap();
        assert_eq!(recent, vec![job]);
    }

    #[tokio::test]
    async fn unknown_job_is_none() {
        let conn = crate::db::open_in_memory().await.unwrap();
        assert!(load(&conn, "nope".into()).await.unwrap().is_none());
        assert!(recent(&conn, 10).await.unwrap().is_empty());
    }
}
