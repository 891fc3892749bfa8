use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::ShardHandle;
use crate::adapters::sqlite::ShardStore;
use crate::error::Result;

/// Where shard stores are materialized
#[derive(Debug, Clone)]
pub enum ShardLocation {
    /// `<root>/shards/<mailbox>/<shard_id>.db`
    Directory(PathBuf),
    /// Each shard lives in its own in-memory database (for testing)
    InMemory,
}

/// Opens shards on demand and keeps one live actor per (mailbox, shard)
pub struct ShardHost {
    location: ShardLocation,
    shards: RwLock<HashMap<(String, String), ShardHandle>>,
}

impl ShardHost {
    pub fn new(location: ShardLocation) -> Self {
        Self {
            location,
            shards: RwLock::new(HashMap::new()),
        }
    }

    pub fn shard_path(&self, mailbox_id: &str, shard_id: &str) -> Option<PathBuf> {
        match &self.location {
            ShardLocation::Directory(root) => Some(
                root.join("shards")
                    .join(sanitize(mailbox_id))
                    .join(format!("{}.db", sanitize(shard_id))),
            ),
            ShardLocation::InMemory => None,
        }
    }

    /// Get or create the actor for a shard
    pub async fn open(&self, mailbox_id: &str, shard_id: &str) -> Result<ShardHandle> {
        let key = (mailbox_id.to_string(), shard_id.to_string());

        {
            let shards = self.shards.read().await;
            if let Some(handle) = shards.get(&key) {
                return Ok(handle.clone());
            }
        }

        let mut shards = self.shards.write().await;
        if let Some(handle) = shards.get(&key) {
            return Ok(handle.clone());
        }

        let handle = match self.shard_path(mailbox_id, shard_id) {
            Some(path) => {
                info!("Opening shard {} for {} at {:?}", shard_id, mailbox_id, path);
                ShardHandle::spawn(shard_id, move || {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    ShardStore::open(&path)
                })
                .await?
            }
            None => ShardHandle::spawn(shard_id, ShardStore::in_memory).await?,
        };

        shards.insert(key, handle.clone());
        Ok(handle)
    }

    /// Drop the shard's tables, forget its actor and remove its files
    pub async fn drop_shard(&self, mailbox_id: &str, shard_id: &str) -> Result<()> {
        let handle = self.open(mailbox_id, shard_id).await?;
        handle.drop_tables().await?;

        self.shards
            .write()
            .await
            .remove(&(mailbox_id.to_string(), shard_id.to_string()));
        drop(handle);

        if let Some(path) = self.shard_path(mailbox_id, shard_id) {
            for file in [path.clone(), with_suffix(&path, "-wal"), with_suffix(&path, "-shm")] {
                remove_if_exists(&file);
            }
        }

        info!("Dropped shard {} for {}", shard_id, mailbox_id);
        Ok(())
    }

    pub async fn open_count(&self) -> usize {
        self.shards.read().await.len()
    }
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@') {
                c
            } else {
                '_'
            }
        })
        .collect();

    // "." and ".." would escape the shard directory
    if cleaned.chars().all(|c| c == '.') {
        cleaned.replace('.', "_")
    } else {
        cleaned
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(suffix);
    PathBuf::from(raw)
}

fn remove_if_exists(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {:?}: {}", path, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::thread;

    #[tokio::test]
    async fn test_open_reuses_handle() {
        let host = ShardHost::new(ShardLocation::InMemory);
        let a = host.open("m1", "s1").await.unwrap();
        a.upsert_thread(thread("t1", "2024-01-01T00:00:00.000Z"), vec![])
            .await
            .unwrap();

        let b = host.open("m1", "s1").await.unwrap();
        assert!(b.has_thread("t1".into()).await.unwrap());
        assert_eq!(host.open_count().await, 1);
    }

    #[tokio::test]
    async fn test_file_shards_persist_and_drop() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let host = ShardHost::new(ShardLocation::Directory(dir.path().to_path_buf()));
        let path = host.shard_path("me@example.com", "s1").unwrap();

        let handle = host.open("me@example.com", "s1").await.unwrap();
        handle
            .upsert_thread(thread("t1", "2024-01-01T00:00:00.000Z"), vec![])
            .await
            .unwrap();
        assert!(path.exists());

        host.drop_shard("me@example.com", "s1").await.unwrap();
        assert_eq!(host.open_count().await, 0);
        assert!(!path.exists());
    }

    #[test]
    fn test_sanitize_path_segments() {
        assert_eq!(sanitize("me@example.com"), "me@example.com");
        assert_eq!(sanitize("../etc/passwd"), ".._etc_passwd");
        assert_eq!(sanitize(".."), "__");
    }
}
