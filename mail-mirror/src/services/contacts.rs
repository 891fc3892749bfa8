//! Recipient suggestions
//!
//! A per-mailbox index of people who recently wrote in, built lazily by
//! fanning out over the shards and dropped whenever a thread write lands.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::Result;
use crate::fanout::{with_fallback, FanOut};
use crate::types::Sender;

const SENDERS_PER_SHARD: usize = 500;

pub struct RecipientSuggestions {
    cache: RwLock<HashMap<String, Arc<Vec<Sender>>>>,
}

impl RecipientSuggestions {
    pub fn new() -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn invalidate(&self, mailbox_id: &str) {
        if self.cache.write().await.remove(mailbox_id).is_some() {
            debug!("Invalidated recipient suggestions for {}", mailbox_id);
        }
    }

    pub async fn is_cached(&self, mailbox_id: &str) -> bool {
        self.cache.read().await.contains_key(mailbox_id)
    }

    /// Senders whose address or name contains `query`, most frequent first
    pub async fn suggest(
        &self,
        fanout: &FanOut,
        mailbox_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Sender>> {
        let senders = self.senders(fanout, mailbox_id).await?;
        let needle = query.trim().to_lowercase();

        Ok(senders
            .iter()
            .filter(|s| {
                needle.is_empty()
                    || s.email.to_lowercase().contains(&needle)
                    || s
                        .name
                        .as_deref()
                        .map(|n| n.to_lowercase().contains(&needle))
                        .unwrap_or(false)
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn senders(&self, fanout: &FanOut, mailbox_id: &str) -> Result<Arc<Vec<Sender>>> {
        if let Some(cached) = self.cache.read().await.get(mailbox_id) {
            return Ok(cached.clone());
        }

        let collected: Vec<Sender> = fanout
            .parallel_reduce(
                mailbox_id,
                |shard| async move {
                    Ok(with_fallback(
                        &shard.shard_id,
                        shard.handle.recent_senders(SENDERS_PER_SHARD),
                        Vec::new(),
                    )
                    .await)
                },
                Vec::new(),
                |mut acc, batch| {
                    acc.extend(batch);
                    acc
                },
            )
            .await?;

        let index = Arc::new(rank_senders(collected));
        self.cache
            .write()
            .await
            .insert(mailbox_id.to_string(), index.clone());

        debug!("Built recipient index for {} ({} entries)", mailbox_id, index.len());
        Ok(index)
    }
}

impl Default for RecipientSuggestions {
    fn default() -> Self {
        Self::new()
    }
}

/// Dedupe by case-insensitive address; rank by frequency, then address.
/// The first display name seen for an address is kept.
fn rank_senders(senders: Vec<Sender>) -> Vec<Sender> {
    let mut seen: HashMap<String, (Sender, usize)> = HashMap::new();

    for sender in senders {
        let key = sender.email.trim().to_lowercase();
        if key.is_empty() {
            continue;
        }
        let entry = seen.entry(key).or_insert_with(|| (sender.clone(), 0));
        if entry.0.name.is_none() && sender.name.is_some() {
            entry.0.name = sender.name;
        }
        entry.1 += 1;
    }

    let mut ranked: Vec<(Sender, usize)> = seen.into_values().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.email.cmp(&b.0.email)));
    ranked.into_iter().map(|(sender, _)| sender).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender(name: Option<&str>, email: &str) -> Sender {
        Sender {
            name: name.map(String::from),
            email: email.into(),
        }
    }

    #[test]
    fn test_rank_dedupes_case_insensitively() {
        let ranked = rank_senders(vec![
            sender(None, "Ann@Example.com"),
            sender(Some("Bob"), "bob@example.com"),
            sender(Some("Ann"), "ann@example.com"),
            sender(None, ""),
        ]);

        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].email, "Ann@Example.com");
        assert_eq!(ranked[0].name.as_deref(), Some("Ann"));
        assert_eq!(ranked[1].email, "bob@example.com");
    }
}
