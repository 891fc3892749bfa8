use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::helpers::date_normalization::normalize_or_now;
use super::helpers::status_emit;
use super::provider::{MailManager, ThreadStub};
use crate::config::MAX_FETCH_CONCURRENCY;
use crate::error::{MirrorError, Result};
use crate::services::MailboxService;
use crate::types::Thread;

/// Mailbox being synced and the driver serving it
#[derive(Clone)]
pub struct SyncTarget {
    pub mailbox_id: String,
    pub provider_id: String,
    pub manager: Arc<dyn MailManager>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadSyncOutcome {
    Synced,
    /// Another call is already syncing this thread
    AlreadyInFlight,
}

/// Result of one page-processing job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMetrics {
    pub synced: usize,
    pub failed: usize,
    pub total: usize,
    pub next_page_token: Option<String>,
}

pub struct ThreadSyncWorker {
    mailboxes: Arc<MailboxService>,
    fetch_concurrency: usize,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

struct InFlightGuard {
    key: String,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.remove(&self.key);
        }
    }
}

impl ThreadSyncWorker {
    pub fn new(mailboxes: Arc<MailboxService>, fetch_concurrency: usize) -> Self {
        Self {
            mailboxes,
            fetch_concurrency: fetch_concurrency.clamp(1, MAX_FETCH_CONCURRENCY),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn mailboxes(&self) -> &Arc<MailboxService> {
        &self.mailboxes
    }

    fn claim(&self, key: String) -> Result<Option<InFlightGuard>> {
        let mut in_flight = self
            .in_flight
            .lock()
            .map_err(|e| MirrorError::Concurrency(format!("in-flight set poisoned: {}", e)))?;

        if !in_flight.insert(key.clone()) {
            return Ok(None);
        }

        Ok(Some(InFlightGuard {
            key,
            in_flight: self.in_flight.clone(),
        }))
    }

    /// Fetch the thread's latest message and upsert it.
    ///
    /// A call for a thread that is already being synced returns immediately.
    pub async fn sync_thread(&self, target: &SyncTarget, thread_id: &str) -> Result<ThreadSyncOutcome> {
        let key = format!("{}:{}", target.mailbox_id, thread_id);
        let Some(_guard) = self.claim(key)? else {
            debug!("Thread {} already in flight", thread_id);
            return Ok(ThreadSyncOutcome::AlreadyInFlight);
        };

        let message = target
            .manager
            .get_latest_message(thread_id)
            .await
            .map_err(|e| MirrorError::ThreadData(format!("{}: {}", thread_id, e)))?
            .ok_or_else(|| MirrorError::ThreadData(format!("{}: no latest message", thread_id)))?;

        let thread = Thread {
            id: thread_id.to_string(),
            thread_id: thread_id.to_string(),
            provider_id: target.provider_id.clone(),
            latest_sender: message.sender,
            latest_received_on: normalize_or_now(thread_id, &message.received_on),
            latest_subject: message.subject,
        };

        self.mailboxes
            .upsert_thread(&target.mailbox_id, thread, &message.labels)
            .await?;

        Ok(ThreadSyncOutcome::Synced)
    }

    /// Sync every thread of a listing page. Per-thread failures are counted,
    /// never raised.
    pub async fn sync_page(&self, target: &SyncTarget, folder: &str, stubs: &[ThreadStub]) -> PageMetrics {
        let ids: Vec<String> = stubs.iter().map(|stub| stub.id.clone()).collect();
        let results: Vec<(String, Result<ThreadSyncOutcome>)> = stream::iter(ids)
            .map(|id| async move {
                let result = self.sync_thread(target, &id).await;
                (id, result)
            })
            .buffer_unordered(self.fetch_concurrency)
            .collect()
            .await;

        let mut metrics = PageMetrics {
            total: stubs.len(),
            ..Default::default()
        };

        for (thread_id, result) in results {
            match result {
                Ok(_) => metrics.synced += 1,
                Err(e) => {
                    warn!("Failed to sync thread {}: {}", thread_id, e);
                    metrics.failed += 1;
                }
            }
        }

        info!(
            "Synced {}/{} threads of {} ({} failed)",
            metrics.synced, metrics.total, folder, metrics.failed
        );

        status_emit::emit_folder_reloaded(self.mailboxes.events(), &target.mailbox_id, folder);
        status_emit::broadcast_aggregate_state(&self.mailboxes, &target.mailbox_id).await;

        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::events::MailboxEvent;
    use crate::testing::{mailbox_service, message, MockMailManager};
    use std::time::Duration;

    fn target(manager: Arc<MockMailManager>) -> SyncTarget {
        SyncTarget {
            mailbox_id: "m1".into(),
            provider_id: "google".into(),
            manager,
        }
    }

    fn stubs(ids: &[&str]) -> Vec<ThreadStub> {
        ids.iter().map(|id| ThreadStub { id: id.to_string() }).collect()
    }

    #[tokio::test]
    async fn test_concurrent_calls_collapse() {
        let manager = Arc::new(
            MockMailManager::new()
                .with_thread("inbox", "t1", message("2024-01-01T00:00:00Z", &["INBOX"]))
                .with_fetch_delay(Duration::from_millis(50)),
        );
        let worker = ThreadSyncWorker::new(Arc::new(mailbox_service(u64::MAX)), 5);
        let target = target(manager.clone());

        let (a, b) = tokio::join!(
            worker.sync_thread(&target, "t1"),
            worker.sync_thread(&target, "t1")
        );

        let outcomes = [a.unwrap(), b.unwrap()];
        assert!(outcomes.contains(&ThreadSyncOutcome::Synced));
        assert!(outcomes.contains(&ThreadSyncOutcome::AlreadyInFlight));
        assert_eq!(manager.fetch_count(), 1);

        // The guard is released afterwards
        worker.sync_thread(&target, "t1").await.unwrap();
        assert_eq!(manager.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_missing_message_is_thread_data_error() {
        let manager = Arc::new(MockMailManager::new());
        let worker = ThreadSyncWorker::new(Arc::new(mailbox_service(u64::MAX)), 5);

        let result = worker.sync_thread(&target(manager), "ghost").await;
        assert!(matches!(result, Err(MirrorError::ThreadData(_))));
    }

    #[tokio::test]
    async fn test_bad_timestamp_falls_back_to_now() {
        let manager = Arc::new(
            MockMailManager::new().with_thread("inbox", "t1", message("garbage", &["INBOX"])),
        );
        let service = Arc::new(mailbox_service(u64::MAX));
        let worker = ThreadSyncWorker::new(service.clone(), 5);

        worker.sync_thread(&target(manager), "t1").await.unwrap();

        let stored = service.get_thread("m1", "t1").await.unwrap();
        assert!(stored.thread.latest_received_on.starts_with("20"));
        assert!(stored.thread.latest_received_on.ends_with('Z'));
    }

    #[tokio::test]
    async fn test_page_counts_failures_and_notifies() {
        let manager = Arc::new(
            MockMailManager::new()
                .with_thread("inbox", "a", message("2024-01-01T00:00:00Z", &["INBOX"]))
                .with_thread("inbox", "b", message("2024-01-02T00:00:00Z", &["INBOX"]))
                .with_thread("inbox", "c", message("2024-01-03T00:00:00Z", &["INBOX"]))
                .failing("b"),
        );
        let service = Arc::new(mailbox_service(u64::MAX));
        let mut rx = service.subscribe();
        let worker = ThreadSyncWorker::new(service.clone(), 2);

        let metrics = worker
            .sync_page(&target(manager), "inbox", &stubs(&["a", "b", "c", "missing"]))
            .await;

        assert_eq!(metrics.total, 4);
        assert_eq!(metrics.synced, 2);
        assert_eq!(metrics.failed, 2);

        let mut saw_reload = false;
        let mut saw_state = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                MailboxEvent::FolderReloaded { folder, .. } => saw_reload = folder == "inbox",
                MailboxEvent::StateChanged { state, .. } => {
                    saw_state = true;
                    assert_eq!(state.count_for("INBOX"), 2);
                }
                MailboxEvent::ThreadUpdated { .. } => {}
            }
        }
        assert!(saw_reload);
        assert!(saw_state);
    }
}
