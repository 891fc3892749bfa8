//! Shard registry service
//!
//! Per-mailbox directory of shards, backed by the control database. Picks the
//! target shard for new writes and hands out live shard handles for fan-out.
//! Label identity is owned here too, so every shard of a mailbox carries the
//! same name and color for a given label id.
//!
//! Storage failures surface as `MirrorError::Registry` and are fatal to the
//! calling operation.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::adapters::sqlite::registry::{self as store, ShardRow};
use crate::adapters::sqlite::DbPool;
use crate::config::MAX_FANOUT_CONCURRENCY;
use crate::error::{MirrorError, Result};
use crate::shard::{ShardHandle, ShardHost};
use crate::types::Label;

/// Color given to labels first seen through a thread write
pub const PLACEHOLDER_LABEL_COLOR: &str = "#999999";

/// A registered shard and its live actor
#[derive(Debug, Clone)]
pub struct ShardRef {
    pub shard_id: String,
    pub handle: ShardHandle,
}

pub struct ShardRegistry {
    pool: DbPool,
    host: Arc<ShardHost>,
    max_shard_size: u64,
    probe_concurrency: usize,
    // Serializes selection so two writers never both create a shard
    select_lock: Mutex<()>,
}

fn registry_error(e: MirrorError) -> MirrorError {
    match e {
        MirrorError::Registry(_) => e,
        other => MirrorError::Registry(other.to_string()),
    }
}

impl ShardRegistry {
    pub fn new(
        pool: DbPool,
        host: Arc<ShardHost>,
        max_shard_size: u64,
        probe_concurrency: usize,
    ) -> Self {
        Self {
            pool,
            host,
            max_shard_size,
            probe_concurrency: probe_concurrency.clamp(1, MAX_FANOUT_CONCURRENCY),
            select_lock: Mutex::new(()),
        }
    }

    pub fn max_shard_size(&self) -> u64 {
        self.max_shard_size
    }

    /// Known shards in registry order; empty before the first write
    pub fn list_shards(&self, mailbox_id: &str) -> Result<Vec<ShardRow>> {
        store::list_shards(&self.pool, mailbox_id).map_err(registry_error)
    }

    /// Live handles for every known shard, in registry order
    pub async fn shards(&self, mailbox_id: &str) -> Result<Vec<ShardRef>> {
        let rows = self.list_shards(mailbox_id)?;
        let mut refs = Vec::with_capacity(rows.len());

        for row in rows {
            let handle = self
                .host
                .open(mailbox_id, &row.shard_id)
                .await
                .map_err(registry_error)?;
            refs.push(ShardRef {
                shard_id: row.shard_id,
                handle,
            });
        }

        Ok(refs)
    }

    /// Pick the smallest shard still under the size limit, or create one.
    ///
    /// Sizes are probed concurrently. Ties go to the shard registered first.
    /// A shard whose size cannot be read is not eligible this round.
    pub async fn select_write_shard(&self, mailbox_id: &str) -> Result<ShardRef> {
        let _guard = self.select_lock.lock().await;

        let shards = self.shards(mailbox_id).await?;

        let handles: Vec<(usize, ShardHandle)> = shards
            .iter()
            .map(|shard| shard.handle.clone())
            .enumerate()
            .collect();
        let sizes: Vec<(usize, Result<u64>)> = stream::iter(handles)
            .map(|(index, handle)| async move { (index, handle.size_bytes().await) })
            .buffer_unordered(self.probe_concurrency)
            .collect()
            .await;

        let mut best: Option<(usize, u64)> = None;
        for (index, size) in sizes {
            match size {
                Ok(size) if size < self.max_shard_size => {
                    let better = match best {
                        None => true,
                        Some((best_index, best_size)) => {
                            size < best_size || (size == best_size && index < best_index)
                        }
                    };
                    if better {
                        best = Some((index, size));
                    }
                }
                Ok(size) => {
                    debug!(
                        "Shard {} is full ({} >= {} bytes)",
                        shards[index].shard_id, size, self.max_shard_size
                    );
                }
                Err(e) => {
                    warn!(
                        "Skipping shard {} for writes, size unavailable: {}",
                        shards[index].shard_id, e
                    );
                }
            }
        }

        if let Some((index, size)) = best {
            let chosen = shards[index].clone();
            store::touch_shard(&self.pool, mailbox_id, &chosen.shard_id).map_err(registry_error)?;
            debug!(
                "Selected shard {} ({} bytes) for {}",
                chosen.shard_id, size, mailbox_id
            );
            return Ok(chosen);
        }

        self.create_shard(mailbox_id).await
    }

    async fn create_shard(&self, mailbox_id: &str) -> Result<ShardRef> {
        let shard_id = uuid::Uuid::new_v4().to_string();

        let handle = self
            .host
            .open(mailbox_id, &shard_id)
            .await
            .map_err(registry_error)?;
        let row = store::insert_shard(&self.pool, mailbox_id, &shard_id).map_err(registry_error)?;

        info!(
            "Created shard {} (#{}) for mailbox {}",
            shard_id, row.seq, mailbox_id
        );

        Ok(ShardRef { shard_id, handle })
    }

    /// Drop every shard of the mailbox and clear its registry entries.
    /// The next write starts from a fresh shard.
    pub async fn force_resync(&self, mailbox_id: &str) -> Result<usize> {
        let _guard = self.select_lock.lock().await;

        let rows = self.list_shards(mailbox_id)?;
        for row in &rows {
            self.host
                .drop_shard(mailbox_id, &row.shard_id)
                .await
                .map_err(registry_error)?;
        }

        store::delete_shards(&self.pool, mailbox_id).map_err(registry_error)?;
        store::delete_labels(&self.pool, mailbox_id).map_err(registry_error)?;

        info!("Force resync dropped {} shards for {}", rows.len(), mailbox_id);
        Ok(rows.len())
    }

    // ========== Labels ==========

    /// Canonical label for each id, creating stubs for ids seen the first time
    pub fn resolve_labels(&self, mailbox_id: &str, label_ids: &[String]) -> Result<Vec<Label>> {
        let mut labels = Vec::with_capacity(label_ids.len());

        for label_id in label_ids {
            if labels.iter().any(|l: &Label| &l.id == label_id) {
                continue;
            }

            let stub = Label {
                id: label_id.clone(),
                name: label_id.clone(),
                color: PLACEHOLDER_LABEL_COLOR.to_string(),
            };
            store::insert_label_if_missing(&self.pool, mailbox_id, &stub).map_err(registry_error)?;

            let label = store::get_label(&self.pool, mailbox_id, label_id)
                .map_err(registry_error)?
                .unwrap_or(stub);
            labels.push(label);
        }

        Ok(labels)
    }

    pub fn update_label(&self, mailbox_id: &str, label: &Label) -> Result<()> {
        store::upsert_label(&self.pool, mailbox_id, label).map_err(registry_error)
    }

    pub fn list_labels(&self, mailbox_id: &str) -> Result<Vec<Label>> {
        store::list_labels(&self.pool, mailbox_id).map_err(registry_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::ShardLocation;
    use crate::testing::{control_pool, thread};

    fn registry(max_shard_size: u64) -> ShardRegistry {
        ShardRegistry::new(
            control_pool(),
            Arc::new(ShardHost::new(ShardLocation::InMemory)),
            max_shard_size,
            10,
        )
    }

    #[tokio::test]
    async fn test_first_write_creates_shard() {
        let registry = registry(u64::MAX);
        assert!(registry.list_shards("m1").unwrap().is_empty());

        let shard = registry.select_write_shard("m1").await.unwrap();
        let rows = registry.list_shards("m1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].shard_id, shard.shard_id);
    }

    #[tokio::test]
    async fn test_reuses_shard_under_limit() {
        let registry = registry(u64::MAX);
        let first = registry.select_write_shard("m1").await.unwrap();
        let second = registry.select_write_shard("m1").await.unwrap();
        assert_eq!(first.shard_id, second.shard_id);
        assert_eq!(registry.list_shards("m1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_full_shards_force_new_shard() {
        // Any non-empty database is over a 1 byte limit
        let registry = registry(1);
        let first = registry.select_write_shard("m1").await.unwrap();
        let second = registry.select_write_shard("m1").await.unwrap();
        assert_ne!(first.shard_id, second.shard_id);
        assert_eq!(registry.list_shards("m1").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_picks_smallest_under_limit() {
        let registry = registry(u64::MAX);
        let pool = registry.pool.clone();

        let big = registry.select_write_shard("m1").await.unwrap();
        for i in 0..300 {
            let mut t = thread(&format!("t{}", i), "2024-01-01T00:00:00.000Z");
            t.latest_subject = "x".repeat(300);
            big.handle.upsert_thread(t, vec![]).await.unwrap();
        }

        // Register a second, empty shard directly
        let small_id = "small";
        registry.host.open("m1", small_id).await.unwrap();
        store::insert_shard(&pool, "m1", small_id).unwrap();

        let chosen = registry.select_write_shard("m1").await.unwrap();
        assert_eq!(chosen.shard_id, small_id);
    }

    #[tokio::test]
    async fn test_full_shard_is_passed_over_for_open_one() {
        let setup = registry(u64::MAX);

        let full = setup.select_write_shard("m1").await.unwrap();
        for i in 0..300 {
            let mut t = thread(&format!("t{}", i), "2024-01-01T00:00:00.000Z");
            t.latest_subject = "x".repeat(300);
            full.handle.upsert_thread(t, vec![]).await.unwrap();
        }
        let open = setup.host.open("m1", "open").await.unwrap();
        store::insert_shard(&setup.pool, "m1", "open").unwrap();

        let full_size = full.handle.size_bytes().await.unwrap();
        let open_size = open.size_bytes().await.unwrap();
        assert!(full_size > open_size + 1);

        // Same shards, with a limit only the empty one is under
        let registry = ShardRegistry::new(
            setup.pool.clone(),
            setup.host.clone(),
            open_size + 1,
            10,
        );

        for _ in 0..3 {
            let chosen = registry.select_write_shard("m1").await.unwrap();
            assert_eq!(chosen.shard_id, "open");
        }
        assert_eq!(registry.list_shards("m1").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_force_resync_clears_everything() {
        let registry = registry(u64::MAX);
        let shard = registry.select_write_shard("m1").await.unwrap();
        shard
            .handle
            .upsert_thread(thread("t1", "2024-01-01T00:00:00.000Z"), vec![])
            .await
            .unwrap();
        registry.resolve_labels("m1", &["INBOX".into()]).unwrap();

        assert_eq!(registry.force_resync("m1").await.unwrap(), 1);
        assert!(registry.list_shards("m1").unwrap().is_empty());
        assert!(registry.list_labels("m1").unwrap().is_empty());

        let fresh = registry.select_write_shard("m1").await.unwrap();
        assert_ne!(fresh.shard_id, shard.shard_id);
        assert_eq!(fresh.handle.thread_count().await.unwrap(), 0);
    }

    #[test]
    fn test_resolve_labels_is_canonical() {
        let registry = registry(u64::MAX);
        let custom = Label {
            id: "Label_7".into(),
            name: "Travel".into(),
            color: "#00aaff".into(),
        };
        registry.update_label("m1", &custom).unwrap();

        let resolved = registry
            .resolve_labels("m1", &["INBOX".into(), "Label_7".into(), "INBOX".into()])
            .unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].name, "INBOX");
        assert_eq!(resolved[0].color, PLACEHOLDER_LABEL_COLOR);
        assert_eq!(resolved[1], custom);
    }
}
