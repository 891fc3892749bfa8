//! Folder sync coordinator
//!
//! Drives one paginated sync of a remote folder as a sequence of
//! checkpointed steps:
//!
//! ```text
//! Idle -> SettingUp -> ProcessingPage(1) -> .. -> ProcessingPage(n) -> Completed
//!                   \-> Skipped(reason)       any failure -> Failed(reason)
//! ```
//!
//! Step outputs are persisted under `(run_id, step_name)`. Running the same
//! run id again replays completed steps from their checkpoints and picks up
//! at the first unfinished one. Timeouts are not retried here; a later
//! re-trigger of the run does that.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::jobs::{page_job_id, run_page_job, JobStatus, PageJobs};
use super::provider::ProviderResolver;
use super::worker::{PageMetrics, SyncTarget, ThreadSyncWorker};
use crate::adapters::sqlite::checkpoints;
use crate::adapters::sqlite::connections::{self, ConnectionRecord};
use crate::adapters::sqlite::DbPool;
use crate::config::SyncSettings;
use crate::error::{MirrorError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "kebab-case")]
pub enum CoordinatorState {
    Idle,
    SettingUp,
    ProcessingPage(u32),
    Completed,
    Skipped(String),
    Failed(String),
}

impl CoordinatorState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CoordinatorState::Completed | CoordinatorState::Skipped(_) | CoordinatorState::Failed(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
enum SetupOutcome {
    Ready { max_page_count: u32, loop_enabled: bool },
    Skipped { reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub run_id: String,
    pub mailbox_id: String,
    pub folder: String,
    pub total_synced: usize,
    pub total_failed: usize,
    pub total_threads: usize,
    pub pages_processed: u32,
    pub skipped: Option<String>,
}

impl SyncSummary {
    fn fold(&mut self, page: u32, metrics: &PageMetrics) {
        self.total_synced += metrics.synced;
        self.total_failed += metrics.failed;
        self.total_threads += metrics.total;
        self.pages_processed = page;
    }
}

pub struct SyncCoordinator {
    pool: DbPool,
    resolver: Arc<dyn ProviderResolver>,
    worker: Arc<ThreadSyncWorker>,
    jobs: PageJobs,
    settings: SyncSettings,
}

impl SyncCoordinator {
    pub fn new(
        pool: DbPool,
        resolver: Arc<dyn ProviderResolver>,
        worker: Arc<ThreadSyncWorker>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            pool,
            resolver,
            worker,
            jobs: PageJobs::new(),
            settings,
        }
    }

    pub fn jobs(&self) -> &PageJobs {
        &self.jobs
    }

    pub fn run_state(&self, run_id: &str) -> Result<Option<CoordinatorState>> {
        checkpoints::get_run_state(&self.pool, run_id)
    }

    /// Run (or resume) a folder sync under `run_id`
    pub async fn run(&self, run_id: &str, mailbox_id: &str, folder: &str) -> Result<SyncSummary> {
        if !checkpoints::start_run(&self.pool, run_id, mailbox_id, folder, &CoordinatorState::Idle)? {
            let done = checkpoints::completed_steps(&self.pool, run_id)?;
            info!("Resuming run {} past {} completed steps", run_id, done.len());
        }

        match self.drive(run_id, mailbox_id, folder).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                error!("Sync run {} for {} failed: {}", run_id, mailbox_id, e);
                if let Err(state_err) =
                    self.set_state(run_id, &CoordinatorState::Failed(e.to_string()))
                {
                    warn!("Could not record failure of run {}: {}", run_id, state_err);
                }
                Err(e)
            }
        }
    }

    async fn drive(&self, run_id: &str, mailbox_id: &str, folder: &str) -> Result<SyncSummary> {
        let mut summary = SyncSummary {
            run_id: run_id.to_string(),
            mailbox_id: mailbox_id.to_string(),
            folder: folder.to_string(),
            ..Default::default()
        };

        self.set_state(run_id, &CoordinatorState::SettingUp)?;

        let connection = connections::get_connection(&self.pool, mailbox_id)?
            .ok_or_else(|| MirrorError::ConnectionNotFound(mailbox_id.to_string()))?;

        let setup = self
            .step(run_id, "setup", || async { Ok(self.setup(&connection)) })
            .await?;

        let (max_page_count, loop_enabled) = match setup {
            SetupOutcome::Ready {
                max_page_count,
                loop_enabled,
            } => (max_page_count, loop_enabled),
            SetupOutcome::Skipped { reason } => return self.skip(run_id, summary, reason),
        };

        // Drivers are not serializable; resolve again on every (re)run
        let Some(manager) = self.resolver.resolve(&connection) else {
            let reason = MirrorError::NoProviderAvailable(mailbox_id.to_string()).to_string();
            return self.skip(run_id, summary, reason);
        };
        let target = SyncTarget {
            mailbox_id: mailbox_id.to_string(),
            provider_id: connection.provider.clone(),
            manager,
        };

        let mut page: u32 = 1;
        let mut page_token: Option<String> = None;

        loop {
            self.set_state(run_id, &CoordinatorState::ProcessingPage(page))?;

            let token = page_token.clone();
            let metrics: PageMetrics = self
                .step(run_id, &format!("page-{}", page), || {
                    self.process_page(run_id, page, &target, folder, token, max_page_count)
                })
                .await?;
            // Checkpointed; the page job entry is no longer needed
            self.jobs.forget(&page_job_id(run_id, page))?;

            summary.fold(page, &metrics);
            info!(
                "Run {} page {}: {} synced, {} failed of {}",
                run_id, page, metrics.synced, metrics.failed, metrics.total
            );

            page_token = metrics.next_page_token;
            if page_token.is_none() || !loop_enabled {
                break;
            }

            let delay = self.settings.page_delay();
            self.step(run_id, &format!("delay-{}", page), || async move {
                tokio::time::sleep(delay).await;
                Ok(())
            })
            .await?;

            page += 1;
        }

        self.set_state(run_id, &CoordinatorState::Completed)?;
        info!(
            "Run {} completed: {} synced, {} failed over {} pages",
            run_id, summary.total_synced, summary.total_failed, summary.pages_processed
        );

        Ok(summary)
    }

    fn setup(&self, connection: &ConnectionRecord) -> SetupOutcome {
        if connection.is_aggregate {
            return SetupOutcome::Skipped {
                reason: format!("{} is an aggregate mailbox", connection.mailbox_id),
            };
        }

        if self.resolver.resolve(connection).is_none() {
            return SetupOutcome::Skipped {
                reason: MirrorError::NoProviderAvailable(connection.mailbox_id.clone()).to_string(),
            };
        }

        SetupOutcome::Ready {
            max_page_count: connection
                .max_page_count
                .unwrap_or(self.settings.max_page_count),
            loop_enabled: connection.loop_enabled.unwrap_or(self.settings.loop_enabled),
        }
    }

    fn skip(&self, run_id: &str, mut summary: SyncSummary, reason: String) -> Result<SyncSummary> {
        info!("Run {} skipped: {}", run_id, reason);
        self.set_state(run_id, &CoordinatorState::Skipped(reason.clone()))?;
        summary.skipped = Some(reason);
        Ok(summary)
    }

    /// Dispatch the page job and poll it until it settles or the poll budget
    /// runs out. A job still running at timeout is left to finish on its own.
    async fn process_page(
        &self,
        run_id: &str,
        page: u32,
        target: &SyncTarget,
        folder: &str,
        page_token: Option<String>,
        max_results: u32,
    ) -> Result<PageMetrics> {
        let job_id = page_job_id(run_id, page);

        self.jobs.dispatch(
            &job_id,
            run_page_job(
                self.worker.clone(),
                target.clone(),
                folder.to_string(),
                page_token,
                max_results,
            ),
        )?;

        for _ in 0..self.settings.poll_max_attempts {
            tokio::time::sleep(self.settings.poll_interval()).await;

            match self.jobs.status(&job_id)? {
                Some(JobStatus::Completed(metrics)) => return Ok(metrics),
                Some(JobStatus::Failed(e)) => return Err(e),
                Some(JobStatus::Running) => {}
                None => {
                    return Err(MirrorError::Concurrency(format!(
                        "page job {} disappeared",
                        job_id
                    )))
                }
            }
        }

        Err(MirrorError::Timeout(format!(
            "page job {} still running after {} polls",
            job_id, self.settings.poll_max_attempts
        )))
    }

    /// Run `body` once per run; later calls return the checkpointed output
    async fn step<T, F, Fut>(&self, run_id: &str, name: &str, body: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(output) = checkpoints::load_step::<T>(&self.pool, run_id, name)? {
            debug!("Run {} replaying step {}", run_id, name);
            return Ok(output);
        }

        let output = body().await?;
        checkpoints::save_step(&self.pool, run_id, name, &output)?;
        Ok(output)
    }

    fn set_state(&self, run_id: &str, state: &CoordinatorState) -> Result<()> {
        debug!("Run {} -> {:?}", run_id, state);
        checkpoints::set_run_state(&self.pool, run_id, state)
    }
}
