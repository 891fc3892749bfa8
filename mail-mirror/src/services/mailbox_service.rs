//! Mailbox operations over the sharded store
//!
//! Every caller-facing read and write for a mailbox goes through here. Reads
//! fan out across the mailbox's shards; writes go to the shard that already
//! owns the thread, or to a registry-selected shard for threads seen the
//! first time.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::error::{MirrorError, Result};
use crate::fanout::{FanOut, Step};
use crate::registry::{ShardRef, ShardRegistry};
use crate::services::contacts::RecipientSuggestions;
use crate::services::events::{EventBus, MailboxEvent};
use crate::types::cursor::listing_order;
use crate::types::{
    AggregateState, DeleteResult, Label, ModifyLabelsResult, Sender, Thread, ThreadDetail,
    ThreadPage, ThreadQuery, ThreadSummary,
};

pub struct MailboxService {
    fanout: FanOut,
    events: EventBus,
    suggestions: Arc<RecipientSuggestions>,
    // Per-mailbox lock around owner lookup + first write, so a new thread
    // cannot be placed in two shards by concurrent writers
    placement: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MailboxService {
    pub fn new(fanout: FanOut, events: EventBus) -> Self {
        Self {
            fanout,
            events,
            suggestions: Arc::new(RecipientSuggestions::new()),
            placement: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ShardRegistry> {
        self.fanout.registry()
    }

    pub fn fanout(&self) -> &FanOut {
        &self.fanout
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn suggestions(&self) -> &Arc<RecipientSuggestions> {
        &self.suggestions
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MailboxEvent> {
        self.events.subscribe()
    }

    // ========== Reads ==========

    /// One page of threads across all shards, newest first.
    ///
    /// Each shard contributes its first `max_results + 1` rows past the
    /// cursor; the merged window is trimmed to `max_results` and the last kept
    /// row becomes the next cursor. Shards are not time-partitioned, so every
    /// shard is visited.
    pub async fn list_threads(&self, mailbox_id: &str, query: ThreadQuery) -> Result<ThreadPage> {
        if query.max_results == 0 {
            return Err(MirrorError::InvalidInput(
                "max_results must be at least 1".into(),
            ));
        }

        let max_results = query.max_results;
        let window = max_results.saturating_add(1);

        self.fanout
            .sequential_accumulate(
                mailbox_id,
                Vec::<ThreadSummary>::new(),
                |shard, mut acc| {
                    let query = query.clone();
                    async move {
                        let rows = shard.handle.fetch(query, window).await?;
                        acc.extend(rows);
                        acc.sort_by(|a, b| listing_order(&a.thread, &b.thread));
                        acc.truncate(window);
                        Ok::<_, MirrorError>(Step::next(acc))
                    }
                },
                |rows| finish_page(rows, max_results),
            )
            .await
    }

    pub async fn get_thread(&self, mailbox_id: &str, thread_id: &str) -> Result<ThreadDetail> {
        let found = self
            .fanout
            .race_first_success(
                mailbox_id,
                |shard| {
                    let id = thread_id.to_string();
                    async move { Ok::<_, MirrorError>(shard.handle.get_thread(id).await?.map(Some)) }
                },
                None,
            )
            .await?;

        found.ok_or_else(|| MirrorError::ThreadNotFound(thread_id.to_string()))
    }

    /// Shard currently holding the thread, if any.
    ///
    /// Every shard must answer: a shard that fails the lookup might be the
    /// owner, so the error is surfaced instead of being read as a miss.
    pub async fn owner_shard(&self, mailbox_id: &str, thread_id: &str) -> Result<Option<ShardRef>> {
        self.fanout
            .parallel_reduce(
                mailbox_id,
                |shard| {
                    let id = thread_id.to_string();
                    async move {
                        let held = shard.handle.has_thread(id).await?;
                        Ok::<_, MirrorError>(held.then_some(shard))
                    }
                },
                None,
                |owner: Option<ShardRef>, held| owner.or(held),
            )
            .await
    }

    pub async fn get_aggregate_state(&self, mailbox_id: &str) -> Result<AggregateState> {
        let (total_size, counts, shard_count) = self
            .fanout
            .parallel_reduce(
                mailbox_id,
                |shard| async move {
                    let size = shard.handle.size_bytes().await?;
                    let counts = shard.handle.label_counts().await?;
                    Ok::<_, MirrorError>((size, counts))
                },
                (0u64, HashMap::<String, u64>::new(), 0usize),
                |(total, mut merged, n), (size, counts)| {
                    for (label_id, count) in counts {
                        *merged.entry(label_id).or_insert(0) += count;
                    }
                    (total + size, merged, n + 1)
                },
            )
            .await?;

        Ok(AggregateState::from_counts(total_size, counts, shard_count))
    }

    pub fn list_labels(&self, mailbox_id: &str) -> Result<Vec<Label>> {
        self.registry().list_labels(mailbox_id)
    }

    pub async fn suggest_recipients(
        &self,
        mailbox_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Sender>> {
        self.suggestions
            .suggest(&self.fanout, mailbox_id, query, limit)
            .await
    }

    // ========== Writes ==========

    /// Insert or update a thread. Existing threads stay in their shard.
    /// Returns the id of the shard written to.
    pub async fn upsert_thread(
        &self,
        mailbox_id: &str,
        thread: Thread,
        label_ids: &[String],
    ) -> Result<String> {
        let labels = self.registry().resolve_labels(mailbox_id, label_ids)?;
        let thread_id = thread.id.clone();

        let shard_id = {
            let lock = self.placement_lock(mailbox_id).await;
            let _guard = lock.lock().await;

            let shard = match self.owner_shard(mailbox_id, &thread_id).await? {
                Some(owner) => owner,
                None => self.registry().select_write_shard(mailbox_id).await?,
            };
            shard.handle.upsert_thread(thread, labels).await?;
            shard.shard_id
        };

        debug!("Thread {} written to shard {}", thread_id, shard_id);

        self.suggestions.invalidate(mailbox_id).await;
        if let Err(e) = self.events.emit(MailboxEvent::ThreadUpdated {
            mailbox_id: mailbox_id.to_string(),
            thread_id,
        }) {
            warn!("Thread update not broadcast: {}", e);
        }

        Ok(shard_id)
    }

    pub async fn modify_labels(
        &self,
        mailbox_id: &str,
        thread_id: &str,
        add: &[String],
        remove: &[String],
    ) -> Result<ModifyLabelsResult> {
        let owner = self
            .owner_shard(mailbox_id, thread_id)
            .await?
            .ok_or_else(|| MirrorError::ThreadNotFound(thread_id.to_string()))?;

        let labels = self.registry().resolve_labels(mailbox_id, add)?;
        let result = owner
            .handle
            .modify_labels(thread_id.to_string(), labels, remove.to_vec())
            .await?;

        if !result.added.is_empty() || !result.removed.is_empty() {
            if let Err(e) = self.events.emit(MailboxEvent::ThreadUpdated {
                mailbox_id: mailbox_id.to_string(),
                thread_id: thread_id.to_string(),
            }) {
                warn!("Label change not broadcast: {}", e);
            }
        }

        Ok(result)
    }

    /// Delete one thread. Shards are walked in registry order and the walk
    /// stops at the shard that held it.
    pub async fn delete_thread(&self, mailbox_id: &str, thread_id: &str) -> Result<DeleteResult> {
        let result = self
            .fanout
            .sequential_accumulate(
                mailbox_id,
                DeleteResult::default(),
                |shard, acc| {
                    let id = thread_id.to_string();
                    async move {
                        let deleted = shard.handle.delete_thread(id).await?;
                        let found = deleted.count > 0;
                        let acc = acc.merge(deleted);
                        Ok::<_, MirrorError>(if found { Step::stop(acc) } else { Step::next(acc) })
                    }
                },
                |acc| acc,
            )
            .await?;

        if result.count > 0 {
            self.suggestions.invalidate(mailbox_id).await;
            if let Err(e) = self.events.emit(MailboxEvent::ThreadUpdated {
                mailbox_id: mailbox_id.to_string(),
                thread_id: thread_id.to_string(),
            }) {
                warn!("Thread deletion not broadcast: {}", e);
            }
        }

        Ok(result)
    }

    pub async fn delete_spam_threads(&self, mailbox_id: &str) -> Result<DeleteResult> {
        let result = self
            .fanout
            .parallel_reduce(
                mailbox_id,
                |shard| async move { shard.handle.delete_spam_threads().await },
                DeleteResult::default(),
                DeleteResult::merge,
            )
            .await?;

        info!("Deleted {} spam threads from {}", result.count, mailbox_id);

        if result.count > 0 {
            self.suggestions.invalidate(mailbox_id).await;
            if let Err(e) = self.events.emit(MailboxEvent::FolderReloaded {
                mailbox_id: mailbox_id.to_string(),
                folder: "spam".to_string(),
            }) {
                warn!("Spam folder reload not broadcast: {}", e);
            }
        }

        Ok(result)
    }

    /// Rename/recolor a label everywhere. Returns how many shards knew it.
    pub async fn update_label(&self, mailbox_id: &str, label: Label) -> Result<usize> {
        self.registry().update_label(mailbox_id, &label)?;

        self.fanout
            .parallel_reduce(
                mailbox_id,
                |shard| {
                    let label = label.clone();
                    async move { shard.handle.update_label(label).await }
                },
                0usize,
                |n, updated| if updated { n + 1 } else { n },
            )
            .await
    }

    /// Drop every shard of the mailbox; the next sync rebuilds from scratch
    pub async fn force_resync(&self, mailbox_id: &str) -> Result<usize> {
        let dropped = self.registry().force_resync(mailbox_id).await?;
        self.suggestions.invalidate(mailbox_id).await;
        Ok(dropped)
    }

    async fn placement_lock(&self, mailbox_id: &str) -> Arc<Mutex<()>> {
        self.placement
            .lock()
            .await
            .entry(mailbox_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

fn finish_page(mut rows: Vec<ThreadSummary>, max_results: usize) -> ThreadPage {
    let next_page_token = if rows.len() > max_results {
        rows.truncate(max_results);
        rows.last().map(|row| row.cursor().encode())
    } else {
        None
    };

    ThreadPage {
        threads: rows,
        next_page_token,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{mailbox_service, thread};
    use std::collections::HashSet;

    fn labels(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    async fn drain(service: &MailboxService, query: ThreadQuery) -> Vec<String> {
        let mut seen = Vec::new();
        let mut token = None;
        loop {
            let page = service
                .list_threads("m1", query.clone().after(token))
                .await
                .expect("Failed to list threads");
            assert!(page.threads.len() <= query.max_results);
            seen.extend(page.threads.into_iter().map(|t| t.thread.id));
            token = page.next_page_token;
            if token.is_none() {
                break;
            }
        }
        seen
    }

    #[tokio::test]
    async fn test_size_is_sum_of_shards() {
        // 1 byte limit: every new thread opens a new shard
        let service = mailbox_service(1);
        for i in 0..4 {
            service
                .upsert_thread("m1", thread(&format!("t{}", i), "2024-01-01T00:00:00.000Z"), &labels(&["INBOX"]))
                .await
                .unwrap();
        }

        let shards = service.registry().shards("m1").await.unwrap();
        assert_eq!(shards.len(), 4);

        let mut expected = 0;
        for shard in &shards {
            expected += shard.handle.size_bytes().await.unwrap();
        }

        let state = service.get_aggregate_state("m1").await.unwrap();
        assert_eq!(state.total_size_bytes, expected);
        assert_eq!(state.shard_count, 4);
        assert_eq!(state.count_for("INBOX"), 4);
    }

    #[tokio::test]
    async fn test_empty_mailbox_state() {
        let service = mailbox_service(u64::MAX);
        let state = service.get_aggregate_state("nobody").await.unwrap();
        assert_eq!(state, AggregateState::default());
    }

    #[tokio::test]
    async fn test_pagination_across_shards_is_complete() {
        let service = mailbox_service(1);
        let timestamps = [
            "2024-01-05T00:00:00.000Z",
            "2024-01-03T00:00:00.000Z",
            "2024-01-03T00:00:00.000Z",
            "2024-01-03T00:00:00.000Z",
            "2024-01-09T00:00:00.000Z",
            "2024-01-01T00:00:00.000Z",
            "2024-01-03T00:00:00.000Z",
            "2024-01-07T00:00:00.000Z",
            "2024-01-02T00:00:00.000Z",
            "2024-01-08T00:00:00.000Z",
            "2024-01-03T00:00:00.000Z",
        ];
        let mut expected = Vec::new();
        for (i, ts) in timestamps.iter().enumerate() {
            let t = thread(&format!("t{:02}", i), ts);
            expected.push(t.clone());
            service.upsert_thread("m1", t, &labels(&["INBOX"])).await.unwrap();
        }
        expected.sort_by(listing_order);
        let expected: Vec<String> = expected.into_iter().map(|t| t.id).collect();

        for page_size in [1, 3, 4, 20] {
            let seen = drain(&service, ThreadQuery::new(page_size).in_folder("inbox")).await;
            assert_eq!(seen, expected, "page size {}", page_size);
        }
    }

    #[tokio::test]
    async fn test_list_filters_apply_per_shard() {
        let service = mailbox_service(1);
        service
            .upsert_thread("m1", thread("a", "2024-01-03T00:00:00.000Z"), &labels(&["INBOX"]))
            .await
            .unwrap();
        service
            .upsert_thread("m1", thread("b", "2024-01-02T00:00:00.000Z"), &labels(&["SENT"]))
            .await
            .unwrap();
        service
            .upsert_thread("m1", thread("c", "2024-01-01T00:00:00.000Z"), &labels(&["INBOX", "STARRED"]))
            .await
            .unwrap();

        let inbox = drain(&service, ThreadQuery::new(10).in_folder("inbox")).await;
        assert_eq!(inbox, vec!["a", "c"]);

        let starred = drain(&service, ThreadQuery::new(10).with_labels(&["INBOX", "STARRED"], true)).await;
        assert_eq!(starred, vec!["c"]);
    }

    #[tokio::test]
    async fn test_zero_page_size_rejected() {
        let service = mailbox_service(u64::MAX);
        let result = service.list_threads("m1", ThreadQuery::new(0)).await;
        assert!(matches!(result, Err(MirrorError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_unbounded_page_size() {
        let service = mailbox_service(1);
        for i in 0..3 {
            service
                .upsert_thread("m1", thread(&format!("t{}", i), "2024-01-01T00:00:00.000Z"), &[])
                .await
                .unwrap();
        }

        let page = service.list_threads("m1", ThreadQuery::new(usize::MAX)).await.unwrap();
        assert_eq!(page.threads.len(), 3);
        assert!(page.next_page_token.is_none());
    }

    #[tokio::test]
    async fn test_unreadable_shard_blocks_placement() {
        let service = mailbox_service(u64::MAX);
        service
            .upsert_thread("m1", thread("t1", "2024-01-01T00:00:00.000Z"), &[])
            .await
            .unwrap();

        let shards = service.registry().shards("m1").await.unwrap();
        shards[0].handle.drop_tables().await.unwrap();

        let result = service
            .upsert_thread("m1", thread("t1", "2024-01-02T00:00:00.000Z"), &[])
            .await;
        assert!(result.is_err());
        assert!(service.owner_shard("m1", "t1").await.is_err());
        assert_eq!(service.registry().list_shards("m1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_get_thread_found_and_missing() {
        let service = mailbox_service(1);
        for i in 0..3 {
            service
                .upsert_thread("m1", thread(&format!("t{}", i), "2024-01-01T00:00:00.000Z"), &labels(&["INBOX"]))
                .await
                .unwrap();
        }

        let detail = service.get_thread("m1", "t2").await.unwrap();
        assert_eq!(detail.thread.id, "t2");
        assert_eq!(detail.labels[0].id, "INBOX");

        let missing = service.get_thread("m1", "nope").await;
        assert!(matches!(missing, Err(MirrorError::ThreadNotFound(_))));
    }

    #[tokio::test]
    async fn test_existing_thread_stays_in_its_shard() {
        let service = mailbox_service(1);
        let first = service
            .upsert_thread("m1", thread("t1", "2024-01-01T00:00:00.000Z"), &labels(&["INBOX"]))
            .await
            .unwrap();
        service
            .upsert_thread("m1", thread("t2", "2024-01-02T00:00:00.000Z"), &labels(&["INBOX"]))
            .await
            .unwrap();

        let again = service
            .upsert_thread("m1", thread("t1", "2024-01-03T00:00:00.000Z"), &labels(&["INBOX", "IMPORTANT"]))
            .await
            .unwrap();
        assert_eq!(first, again);

        let page = service.list_threads("m1", ThreadQuery::new(10)).await.unwrap();
        assert_eq!(page.threads.len(), 2);
        assert_eq!(page.threads[0].thread.id, "t1");
    }

    #[tokio::test]
    async fn test_concurrent_new_thread_lands_once() {
        let service = Arc::new(mailbox_service(1));
        let writes: Vec<_> = (0..4)
            .map(|_| {
                let service = service.clone();
                tokio::spawn(async move {
                    service
                        .upsert_thread("m1", thread("t1", "2024-01-01T00:00:00.000Z"), &[])
                        .await
                })
            })
            .collect();

        let mut shard_ids = HashSet::new();
        for write in writes {
            shard_ids.insert(write.await.unwrap().unwrap());
        }
        assert_eq!(shard_ids.len(), 1);
    }

    #[tokio::test]
    async fn test_modify_labels_emits_update() {
        let service = mailbox_service(u64::MAX);
        service
            .upsert_thread("m1", thread("t1", "2024-01-01T00:00:00.000Z"), &labels(&["INBOX"]))
            .await
            .unwrap();
        let mut rx = service.subscribe();

        let result = service
            .modify_labels("m1", "t1", &labels(&["STARRED"]), &labels(&["INBOX"]))
            .await
            .unwrap();
        assert_eq!(result.added, vec!["STARRED".to_string()]);
        assert_eq!(result.removed, vec!["INBOX".to_string()]);

        match rx.recv().await.unwrap() {
            MailboxEvent::ThreadUpdated { thread_id, .. } => assert_eq!(thread_id, "t1"),
            other => panic!("unexpected event: {:?}", other),
        }

        let missing = service.modify_labels("m1", "ghost", &[], &[]).await;
        assert!(matches!(missing, Err(MirrorError::ThreadNotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_thread_and_spam() {
        let service = mailbox_service(1);
        service
            .upsert_thread("m1", thread("keep", "2024-01-01T00:00:00.000Z"), &labels(&["INBOX"]))
            .await
            .unwrap();
        service
            .upsert_thread("m1", thread("junk1", "2024-01-02T00:00:00.000Z"), &labels(&["SPAM"]))
            .await
            .unwrap();
        service
            .upsert_thread("m1", thread("junk2", "2024-01-03T00:00:00.000Z"), &labels(&["SPAM"]))
            .await
            .unwrap();
        service
            .upsert_thread("m1", thread("gone", "2024-01-04T00:00:00.000Z"), &labels(&["INBOX"]))
            .await
            .unwrap();

        let mut rx = service.subscribe();
        let deleted = service.delete_thread("m1", "gone").await.unwrap();
        assert_eq!(deleted.count, 1);
        assert!(matches!(
            rx.try_recv().unwrap(),
            MailboxEvent::ThreadUpdated { thread_id, .. } if thread_id == "gone"
        ));
        assert_eq!(service.delete_thread("m1", "gone").await.unwrap().count, 0);

        let spam = service.delete_spam_threads("m1").await.unwrap();
        assert_eq!(spam.count, 2);
        assert!(matches!(
            rx.try_recv().unwrap(),
            MailboxEvent::FolderReloaded { folder, .. } if folder == "spam"
        ));

        let rest = drain(&service, ThreadQuery::new(10)).await;
        assert_eq!(rest, vec!["keep"]);
    }

    #[tokio::test]
    async fn test_label_identity_is_shared() {
        let service = mailbox_service(1);
        service
            .upsert_thread("m1", thread("a", "2024-01-01T00:00:00.000Z"), &labels(&["Label_1"]))
            .await
            .unwrap();
        service
            .upsert_thread("m1", thread("b", "2024-01-02T00:00:00.000Z"), &labels(&["Label_1"]))
            .await
            .unwrap();

        let renamed = Label {
            id: "Label_1".into(),
            name: "Receipts".into(),
            color: "#ff8800".into(),
        };
        assert_eq!(service.update_label("m1", renamed.clone()).await.unwrap(), 2);
        assert_eq!(service.list_labels("m1").unwrap(), vec![renamed.clone()]);

        for shard in service.registry().shards("m1").await.unwrap() {
            assert_eq!(shard.handle.list_labels().await.unwrap(), vec![renamed.clone()]);
        }

        // A third shard receives the canonical row, not a stub
        service
            .upsert_thread("m1", thread("c", "2024-01-03T00:00:00.000Z"), &labels(&["Label_1"]))
            .await
            .unwrap();
        let detail = service.get_thread("m1", "c").await.unwrap();
        assert_eq!(detail.labels, vec![renamed]);
    }

    #[tokio::test]
    async fn test_suggestions_invalidate_on_write() {
        let service = mailbox_service(u64::MAX);
        service
            .upsert_thread("m1", thread("a", "2024-01-01T00:00:00.000Z"), &[])
            .await
            .unwrap();

        let found = service.suggest_recipients("m1", "a@", 5).await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(service.suggestions().is_cached("m1").await);

        service
            .upsert_thread("m1", thread("b", "2024-01-02T00:00:00.000Z"), &[])
            .await
            .unwrap();
        assert!(!service.suggestions().is_cached("m1").await);
    }

    #[tokio::test]
    async fn test_force_resync_empties_mailbox() {
        let service = mailbox_service(1);
        for i in 0..3 {
            service
                .upsert_thread("m1", thread(&format!("t{}", i), "2024-01-01T00:00:00.000Z"), &[])
                .await
                .unwrap();
        }

        assert_eq!(service.force_resync("m1").await.unwrap(), 3);
        let page = service.list_threads("m1", ThreadQuery::new(10)).await.unwrap();
        assert!(page.threads.is_empty());
        assert_eq!(service.get_aggregate_state("m1").await.unwrap().shard_count, 0);
    }
}
