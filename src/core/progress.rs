//! In-memory state for wipe jobs.
//!
//! Job progress changes on every device progress tick, so it lives here and is
//! NOT persisted. Only job creation, member transitions and the final outcome
//! are written to the database, and a job leaves this map once its outcome is
//! stored there.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::models::{JobStatus, WipeJob};

/// Thread-safe store of jobs whose outcome is not yet persisted.
///
/// Shared across the application via `AppContext`; the coordinator is the only
/// writer.
#[derive(Clone, Default)]
pub struct JobTracker {
    inner: Arc<RwLock<HashMap<String, WipeJob>>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, job: WipeJob) {
        let mut map = self.inner.write().await;
        map.insert(job.job_id.clone(), job);
    }

    /// Mutate a job in place and return the updated snapshot.
    pub async fn update<F>(&self, job_id: &str, f: F) -> Option<WipeJob>
    where
        F: FnOnce(&mut WipeJob),
    {
        let mut map = self.inner.write().await;
        let job = map.get_mut(job_id)?;
        f(job);
        Some(job.clone())
    }

    pub async fn remove(&self, job_id: &str) -> Option<WipeJob> {
        let mut map = self.inner.write().await;
        map.remove(job_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn get(&self, job_id: &str) -> Option<WipeJob> {
        let map = self.inner.read().await;
        map.get(job_id).cloned()
    }

    /// All jobs, newest first.
    pub async fn list(&self) -> Vec<WipeJob> {
        let map = self.inner.read().await;
        let mut jobs: Vec<WipeJob> = map.values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.job_id.cmp(&a.job_id)));
        jobs
    }

    /// Number of jobs still running.
    pub async fn active_count(&self) -> usize {
        let map = self.inner.read().await;
        map.values()
            .filter(|job| job.status == JobStatus::Running)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::methods::WipeMethod;

    #[tokio::test]
    async fn test_job_tracker_basic_operations() {
        let tracker = JobTracker::new();

        assert_eq!(tracker.active_count().await, 0);
        assert!(tracker.get("job-1").await.is_none());

        tracker
            .insert(WipeJob::new(
                "job-1".into(),
                vec![("dev-1".into(), WipeMethod::NistClear)],
            ))
            .await;
        assert_eq!(tracker.active_count().await, 1);

        let job = tracker
            .update("job-1", |job| job.record_progress("dev-1", 50))
            .await
            .unwrap();
        assert_eq!(job.progress, 50);

        tracker
            .update("job-1", |job| {
                job.mark_wiped("dev-1");
                job.attach_certificate("dev-1", "cert-1".into());
                job.finish();
            })
            .await;

        assert_eq!(tracker.active_count().await, 0);
        assert_eq!(tracker.get("job-1").await.unwrap().status, JobStatus::Succeeded);
        assert!(tracker.update("job-2", |_| {}).await.is_none());

        assert!(tracker.remove("job-1").await.is_some());
        assert!(tracker.get("job-1").await.is_none());
        assert_eq!(tracker.len().await, 0);
    }

    #[tokio::test]
    async fn test_job_tracker_lists_newest_first() {
        let tracker = JobTracker::new();
        let first = WipeJob::new("job-a".into(), vec![]);
        let mut second = WipeJob::new("job-b".into(), vec![]);
        second.created_at = first.created_at + chrono::Duration::seconds(1);

        tracker.insert(first).await;
        tracker.insert(second).await;

        let ids: Vec<String> = tracker.list().await.into_iter().map(|j| j.job_id).collect();
        assert_eq!(ids, vec!["job-b".to_string(), "job-a".to_string()]);
    }
}
