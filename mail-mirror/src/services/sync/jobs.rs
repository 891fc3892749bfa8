//! Child page jobs
//!
//! The coordinator hands each listing page to a background job and polls its
//! status. Job ids are deterministic (`<run_id>:page:<n>`), so a re-driven run
//! finds the job it already started instead of spawning a second one.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::worker::{PageMetrics, SyncTarget, ThreadSyncWorker};
use crate::error::{MirrorError, Result};

#[derive(Debug, Clone)]
pub enum JobStatus {
    Running,
    Completed(PageMetrics),
    Failed(MirrorError),
}

pub fn page_job_id(run_id: &str, page: u32) -> String {
    format!("{}:page:{}", run_id, page)
}

#[derive(Clone, Default)]
pub struct PageJobs {
    jobs: Arc<Mutex<HashMap<String, JobStatus>>>,
}

impl PageJobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `job` under `job_id` unless that id is running or completed.
    /// Failed jobs may be dispatched again. Returns whether a job was spawned.
    pub fn dispatch<F>(&self, job_id: &str, job: F) -> Result<bool>
    where
        F: Future<Output = Result<PageMetrics>> + Send + 'static,
    {
        {
            let mut jobs = self.lock()?;
            if matches!(
                jobs.get(job_id),
                Some(JobStatus::Running) | Some(JobStatus::Completed(_))
            ) {
                debug!("Page job {} already dispatched", job_id);
                return Ok(false);
            }
            jobs.insert(job_id.to_string(), JobStatus::Running);
        }

        let jobs = self.jobs.clone();
        let id = job_id.to_string();
        tokio::spawn(async move {
            let status = match job.await {
                Ok(metrics) => JobStatus::Completed(metrics),
                Err(e) => JobStatus::Failed(e),
            };
            if let Ok(mut jobs) = jobs.lock() {
                jobs.insert(id, status);
            }
        });

        Ok(true)
    }

    pub fn status(&self, job_id: &str) -> Result<Option<JobStatus>> {
        Ok(self.lock()?.get(job_id).cloned())
    }

    pub fn forget(&self, job_id: &str) -> Result<()> {
        self.lock()?.remove(job_id);
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, JobStatus>>> {
        self.jobs
            .lock()
            .map_err(|e| MirrorError::Concurrency(format!("job table poisoned: {}", e)))
    }
}

/// List one remote page and sync its threads
pub async fn run_page_job(
    worker: Arc<ThreadSyncWorker>,
    target: SyncTarget,
    folder: String,
    page_token: Option<String>,
    max_results: u32,
) -> Result<PageMetrics> {
    let listing = target
        .manager
        .list(&folder, page_token.as_deref(), max_results)
        .await
        .map_err(|e| match e {
            MirrorError::ThreadList(_) => e,
            other => MirrorError::ThreadList(other.to_string()),
        })?;

    let mut metrics = worker.sync_page(&target, &folder, &listing.threads).await;
    metrics.next_page_token = listing.next_page_token;
    Ok(metrics)
}
