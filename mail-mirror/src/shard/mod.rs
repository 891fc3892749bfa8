//! Shard actor
//!
//! Every shard is served by one dedicated thread that owns its `ShardStore`.
//! Callers talk to it through a cloneable `ShardHandle`: requests go over a
//! flume channel as boxed closures, replies come back on a oneshot. Requests
//! to one shard therefore run strictly in arrival order.

pub mod host;

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use tokio::sync::oneshot;
use tracing::debug;

use crate::adapters::sqlite::ShardStore;
use crate::error::{MirrorError, Result};
use crate::types::{
    DeleteResult, Label, ModifyLabelsResult, Sender, Thread, ThreadDetail, ThreadPage,
    ThreadQuery, ThreadSummary,
};

pub use host::{ShardHost, ShardLocation};

type Job = Box<dyn FnOnce(&ShardStore) + Send + 'static>;

#[derive(Clone)]
pub struct ShardHandle {
    shard_id: Arc<str>,
    tx: flume::Sender<Job>,
}

impl ShardHandle {
    /// Start the shard thread. `open` runs on that thread and the call
    /// resolves once the store is ready or failed to open.
    pub async fn spawn<F>(shard_id: &str, open: F) -> Result<Self>
    where
        F: FnOnce() -> Result<ShardStore> + Send + 'static,
    {
        let (tx, rx) = flume::unbounded::<Job>();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();
        let id: Arc<str> = Arc::from(shard_id);
        let thread_id = id.clone();

        thread::Builder::new()
            .name(format!("shard-{}", shard_id))
            .spawn(move || {
                let store = match open() {
                    Ok(store) => {
                        let _ = ready_tx.send(Ok(()));
                        store
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                for job in rx.iter() {
                    job(&store);
                }

                debug!("Shard {} stopped", thread_id);
            })
            .map_err(|e| MirrorError::Concurrency(format!("Failed to spawn shard thread: {}", e)))?;

        ready_rx
            .await
            .map_err(|_| MirrorError::Storage(format!("Shard {} exited during open", id)))??;

        Ok(Self { shard_id: id, tx })
    }

    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    /// Run `f` against the store on the shard thread
    pub async fn call<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&ShardStore) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move |store| {
            let _ = reply_tx.send(f(store));
        });

        self.tx
            .send_async(job)
            .await
            .map_err(|_| MirrorError::Storage(format!("Shard {} is closed", self.shard_id)))?;

        reply_rx
            .await
            .map_err(|_| MirrorError::Storage(format!("Shard {} dropped the request", self.shard_id)))?
    }

    pub async fn upsert_thread(&self, thread: Thread, labels: Vec<Label>) -> Result<()> {
        self.call(move |store| store.upsert_thread(&thread, &labels)).await
    }

    pub async fn delete_thread(&self, id: String) -> Result<DeleteResult> {
        self.call(move |store| store.delete_thread(&id)).await
    }

    pub async fn delete_spam_threads(&self) -> Result<DeleteResult> {
        self.call(|store| store.delete_spam_threads()).await
    }

    pub async fn modify_labels(
        &self,
        thread_id: String,
        add: Vec<Label>,
        remove: Vec<String>,
    ) -> Result<ModifyLabelsResult> {
        self.call(move |store| store.modify_labels(&thread_id, &add, &remove))
            .await
    }

    pub async fn query(&self, query: ThreadQuery) -> Result<ThreadPage> {
        self.call(move |store| store.query(&query)).await
    }

    pub async fn fetch(&self, query: ThreadQuery, limit: usize) -> Result<Vec<ThreadSummary>> {
        self.call(move |store| store.fetch(&query, limit)).await
    }

    pub async fn get_thread(&self, id: String) -> Result<Option<ThreadDetail>> {
        self.call(move |store| store.get_thread(&id)).await
    }

    pub async fn has_thread(&self, id: String) -> Result<bool> {
        self.call(move |store| store.has_thread(&id)).await
    }

    pub async fn size_bytes(&self) -> Result<u64> {
        self.call(|store| store.size_bytes()).await
    }

    pub async fn label_counts(&self) -> Result<HashMap<String, u64>> {
        self.call(|store| store.label_counts()).await
    }

    pub async fn thread_count(&self) -> Result<u64> {
        self.call(|store| store.thread_count()).await
    }

    pub async fn list_labels(&self) -> Result<Vec<Label>> {
        self.call(|store| store.list_labels()).await
    }

    pub async fn update_label(&self, label: Label) -> Result<bool> {
        self.call(move |store| store.update_label(&label)).await
    }

    pub async fn recent_senders(&self, limit: usize) -> Result<Vec<Sender>> {
        self.call(move |store| store.recent_senders(limit)).await
    }

    pub async fn drop_tables(&self) -> Result<()> {
        self.call(|store| store.drop_tables()).await
    }
}

impl std::fmt::Debug for ShardHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardHandle")
            .field("shard_id", &self.shard_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{label, thread};

    #[tokio::test]
    async fn test_handle_round_trip() {
        let handle = ShardHandle::spawn("s1", ShardStore::in_memory)
            .await
            .expect("Failed to spawn shard");

        handle
            .upsert_thread(thread("t1", "2024-01-01T00:00:00.000Z"), vec![label("INBOX")])
            .await
            .unwrap();

        assert!(handle.has_thread("t1".into()).await.unwrap());
        assert_eq!(handle.thread_count().await.unwrap(), 1);
        assert_eq!(handle.shard_id(), "s1");
    }

    #[tokio::test]
    async fn test_requests_run_in_order() {
        let handle = ShardHandle::spawn("s1", ShardStore::in_memory).await.unwrap();

        let writes: Vec<_> = (0..20)
            .map(|i| {
                let h = handle.clone();
                async move {
                    h.upsert_thread(thread(&format!("t{}", i), "2024-01-01T00:00:00.000Z"), vec![])
                        .await
                }
            })
            .collect();
        for result in futures::future::join_all(writes).await {
            result.unwrap();
        }

        assert_eq!(handle.thread_count().await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_open_failure_surfaces() {
        let result = ShardHandle::spawn("bad", || {
            Err(MirrorError::Storage("disk on fire".into()))
        })
        .await;
        assert!(matches!(result, Err(MirrorError::Storage(_))));
    }
}
