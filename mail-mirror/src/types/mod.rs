pub mod cursor;
pub mod folder;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use cursor::PageCursor;
pub use folder::FolderFilter;

/// Sender of the most recent message in a thread.
/// Stored as an opaque JSON blob on the thread row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sender {
    pub name: Option<String>,
    pub email: String,
}

/// Mirrored thread, keyed by a stable provider-derived id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: String,
    pub thread_id: String,
    pub provider_id: String,
    pub latest_sender: Sender,
    /// Canonical UTC ISO-8601, also the sort/cursor key
    pub latest_received_on: String,
    pub latest_subject: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub id: String,
    pub name: String,
    pub color: String,
}

/// Thread plus the ids of every label linked to it in its shard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSummary {
    #[serde(flatten)]
    pub thread: Thread,
    pub label_ids: Vec<String>,
}

impl ThreadSummary {
    pub fn cursor(&self) -> PageCursor {
        PageCursor::after(&self.thread)
    }
}

/// Thread with full label rows, as returned by single-thread lookups
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadDetail {
    #[serde(flatten)]
    pub thread: Thread,
    pub labels: Vec<Label>,
}

/// Listing filters shared by the shard query and the cross-shard listing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadQuery {
    pub folder: Option<String>,
    #[serde(default)]
    pub label_ids: Vec<String>,
    /// ALL semantics when true, ANY otherwise
    #[serde(default)]
    pub require_all: bool,
    pub search_text: Option<String>,
    pub page_token: Option<String>,
    pub max_results: usize,
}

impl ThreadQuery {
    pub fn new(max_results: usize) -> Self {
        Self {
            max_results,
            ..Default::default()
        }
    }

    pub fn in_folder(mut self, folder: &str) -> Self {
        self.folder = Some(folder.to_string());
        self
    }

    pub fn with_labels(mut self, label_ids: &[&str], require_all: bool) -> Self {
        self.label_ids = label_ids.iter().map(|l| l.to_string()).collect();
        self.require_all = require_all;
        self
    }

    pub fn matching(mut self, text: &str) -> Self {
        self.search_text = Some(text.to_string());
        self
    }

    pub fn after(mut self, page_token: Option<String>) -> Self {
        self.page_token = page_token;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadPage {
    pub threads: Vec<ThreadSummary>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModifyLabelsResult {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeleteResult {
    pub count: usize,
    pub threads: Vec<Thread>,
}

impl DeleteResult {
    pub fn merge(mut self, other: DeleteResult) -> Self {
        self.count += other.count;
        self.threads.extend(other.threads);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderCount {
    pub label_id: String,
    pub count: u64,
}

/// Mailbox-wide storage snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateState {
    pub total_size_bytes: u64,
    pub per_folder_counts: Vec<FolderCount>,
    pub shard_count: usize,
}

impl AggregateState {
    pub fn from_counts(total_size_bytes: u64, counts: HashMap<String, u64>, shard_count: usize) -> Self {
        let mut per_folder_counts: Vec<FolderCount> = counts
            .into_iter()
            .map(|(label_id, count)| FolderCount { label_id, count })
            .collect();
        per_folder_counts.sort_by(|a, b| a.label_id.cmp(&b.label_id));

        Self {
            total_size_bytes,
            per_folder_counts,
            shard_count,
        }
    }

    pub fn count_for(&self, label_id: &str) -> u64 {
        self.per_folder_counts
            .iter()
            .find(|c| c.label_id == label_id)
            .map(|c| c.count)
            .unwrap_or(0)
    }
}
