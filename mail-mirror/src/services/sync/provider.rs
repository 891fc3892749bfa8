//! Remote provider capability
//!
//! The concrete Gmail/IMAP drivers live outside this crate. The sync side
//! only needs a paginated thread listing and the latest message per thread.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::adapters::sqlite::connections::ConnectionRecord;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadStub {
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadListing {
    pub threads: Vec<ThreadStub>,
    pub next_page_token: Option<String>,
}

/// Most recent message of a remote thread, as the provider reports it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestMessage {
    pub sender: crate::types::Sender,
    pub subject: String,
    /// Provider-native timestamp; normalized before it is stored
    pub received_on: String,
    pub labels: Vec<String>,
}

#[async_trait]
pub trait MailManager: Send + Sync {
    async fn list(
        &self,
        folder: &str,
        page_token: Option<&str>,
        max_results: u32,
    ) -> Result<ThreadListing>;

    async fn get_latest_message(&self, thread_id: &str) -> Result<Option<LatestMessage>>;
}

/// Maps a mailbox connection to the driver able to sync it
pub trait ProviderResolver: Send + Sync {
    fn resolve(&self, connection: &ConnectionRecord) -> Option<Arc<dyn MailManager>>;
}

/// Resolver keyed by the connection's provider name
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    managers: HashMap<String, Arc<dyn MailManager>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: &str, manager: Arc<dyn MailManager>) {
        self.managers.insert(provider.to_lowercase(), manager);
    }

    pub fn with(mut self, provider: &str, manager: Arc<dyn MailManager>) -> Self {
        self.register(provider, manager);
        self
    }
}

impl ProviderResolver for ProviderRegistry {
    fn resolve(&self, connection: &ConnectionRecord) -> Option<Arc<dyn MailManager>> {
        self.managers
            .get(&connection.provider.to_lowercase())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockMailManager;

    #[test]
    fn test_resolves_by_provider_name() {
        let registry = ProviderRegistry::new().with("Google", Arc::new(MockMailManager::new()));

        let gmail = ConnectionRecord::new("m1", "google", "me@example.com");
        assert!(registry.resolve(&gmail).is_some());

        let imap = ConnectionRecord::new("m2", "imap", "me@example.org");
        assert!(registry.resolve(&imap).is_none());
    }
}
