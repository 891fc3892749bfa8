//! Shared test fixtures

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::adapters::sqlite::pool::create_memory_pool;
use crate::adapters::sqlite::schema::initialize_control_schema;
use crate::adapters::sqlite::DbPool;
use crate::config::MirrorConfig;
use crate::error::{MirrorError, Result};
use crate::fanout::FanOut;
use crate::registry::{ShardRegistry, PLACEHOLDER_LABEL_COLOR};
use crate::services::sync::{LatestMessage, MailManager, ThreadListing, ThreadStub};
use crate::services::{EventBus, MailboxService};
use crate::shard::{ShardHost, ShardLocation};
use crate::types::{Label, Sender, Thread};

pub fn thread(id: &str, received_on: &str) -> Thread {
    Thread {
        id: id.to_string(),
        thread_id: id.to_string(),
        provider_id: "google".to_string(),
        latest_sender: Sender {
            name: None,
            email: format!("{}@example.com", id),
        },
        latest_received_on: received_on.to_string(),
        latest_subject: format!("Subject {}", id),
    }
}

pub fn label(id: &str) -> Label {
    Label {
        id: id.to_string(),
        name: id.to_string(),
        color: PLACEHOLDER_LABEL_COLOR.to_string(),
    }
}

pub fn message(received_on: &str, labels: &[&str]) -> LatestMessage {
    LatestMessage {
        sender: Sender {
            name: Some("Sam Sender".to_string()),
            email: "sam@example.com".to_string(),
        },
        subject: "Hello".to_string(),
        received_on: received_on.to_string(),
        labels: labels.iter().map(|l| l.to_string()).collect(),
    }
}

pub fn control_pool() -> DbPool {
    let pool = create_memory_pool().expect("Failed to create control pool");
    initialize_control_schema(&pool.get().expect("Failed to get connection"))
        .expect("Failed to initialize control schema");
    pool
}

pub fn mailbox_service(max_shard_size: u64) -> MailboxService {
    let registry = Arc::new(ShardRegistry::new(
        control_pool(),
        Arc::new(ShardHost::new(ShardLocation::InMemory)),
        max_shard_size,
        10,
    ));
    MailboxService::new(FanOut::new(registry, 10), EventBus::new())
}

/// Defaults with the waits shrunk to test scale
pub fn fast_config() -> MirrorConfig {
    let mut config = MirrorConfig::default();
    config.sync.page_delay_ms = 0;
    config.sync.poll_interval_ms = 5;
    config.sync.poll_max_attempts = 2000;
    config
}

/// Scripted provider: one ordered thread list per folder, offset page tokens
#[derive(Default)]
pub struct MockMailManager {
    threads: Vec<(String, String, LatestMessage)>,
    fetch_delay: Option<Duration>,
    failing: HashSet<String>,
    listing_failures: Mutex<HashSet<String>>,
    fetches: AtomicUsize,
    lists: AtomicUsize,
}

impl MockMailManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thread(mut self, folder: &str, id: &str, message: LatestMessage) -> Self {
        self.threads
            .push((folder.to_string(), id.to_string(), message));
        self
    }

    /// `count` threads `t000..`, one minute apart
    pub fn with_folder(mut self, folder: &str, count: usize) -> Self {
        for i in 0..count {
            let received_on = format!("2024-01-01T{:02}:{:02}:00Z", i / 60, i % 60);
            let label = folder.to_uppercase();
            self = self.with_thread(folder, &format!("t{:03}", i), message(&received_on, &[&label]));
        }
        self
    }

    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    pub fn failing(mut self, id: &str) -> Self {
        self.failing.insert(id.to_string());
        self
    }

    /// Fail `list` for this page token ("" is the first page)
    pub fn fail_listing_at(self, token: &str) -> Self {
        self.listing_failures.lock().unwrap().insert(token.to_string());
        self
    }

    pub fn heal_listing(&self) {
        self.listing_failures.lock().unwrap().clear();
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn list_count(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailManager for MockMailManager {
    async fn list(
        &self,
        folder: &str,
        page_token: Option<&str>,
        max_results: u32,
    ) -> Result<ThreadListing> {
        self.lists.fetch_add(1, Ordering::SeqCst);

        let token = page_token.unwrap_or("");
        if self.listing_failures.lock().unwrap().contains(token) {
            return Err(MirrorError::ThreadList(format!("listing failed at {:?}", token)));
        }

        let in_folder: Vec<&String> = self
            .threads
            .iter()
            .filter(|(f, _, _)| f == folder)
            .map(|(_, id, _)| id)
            .collect();

        let offset: usize = token.parse().unwrap_or(0);
        let end = (offset + max_results as usize).min(in_folder.len());
        let threads = in_folder[offset.min(end)..end]
            .iter()
            .map(|id| ThreadStub { id: id.to_string() })
            .collect();

        Ok(ThreadListing {
            threads,
            next_page_token: (end < in_folder.len()).then(|| end.to_string()),
        })
    }

    async fn get_latest_message(&self, thread_id: &str) -> Result<Option<LatestMessage>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }

        if self.failing.contains(thread_id) {
            return Err(MirrorError::ThreadData(format!("{} unavailable", thread_id)));
        }

        Ok(self
            .threads
            .iter()
            .find(|(_, id, _)| id == thread_id)
            .map(|(_, _, message)| message.clone()))
    }
}
