//! Remote folder synchronization
//!
//! `coordinator` drives a paginated, checkpointed run; `jobs` runs one page
//! in the background; `worker` fetches and upserts the threads of a page.

pub mod coordinator;
pub mod helpers;
pub mod jobs;
pub mod provider;
pub mod worker;

pub use coordinator::{CoordinatorState, SyncCoordinator, SyncSummary};
pub use jobs::{JobStatus, PageJobs};
pub use provider::{
    LatestMessage, MailManager, ProviderRegistry, ProviderResolver, ThreadListing, ThreadStub,
};
pub use worker::{PageMetrics, SyncTarget, ThreadSyncOutcome, ThreadSyncWorker};
