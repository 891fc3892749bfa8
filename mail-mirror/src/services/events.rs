//! Mailbox event channel
//!
//! Subscribers (the UI/API layer) receive folder reloads, thread updates and
//! aggregate state snapshots. Having no subscribers is not an error.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::{MirrorError, Result};
use crate::types::AggregateState;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MailboxEvent {
    #[serde(rename_all = "camelCase")]
    FolderReloaded { mailbox_id: String, folder: String },
    #[serde(rename_all = "camelCase")]
    ThreadUpdated { mailbox_id: String, thread_id: String },
    #[serde(rename_all = "camelCase")]
    StateChanged {
        mailbox_id: String,
        state: AggregateState,
    },
}

impl MailboxEvent {
    pub fn mailbox_id(&self) -> &str {
        match self {
            MailboxEvent::FolderReloaded { mailbox_id, .. }
            | MailboxEvent::ThreadUpdated { mailbox_id, .. }
            | MailboxEvent::StateChanged { mailbox_id, .. } => mailbox_id,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MailboxEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MailboxEvent> {
        self.tx.subscribe()
    }

    /// Returns the number of subscribers reached
    pub fn emit(&self, event: MailboxEvent) -> Result<usize> {
        if self.tx.receiver_count() == 0 {
            return Ok(0);
        }
        self.tx
            .send(event)
            .map_err(|e| MirrorError::Broadcast(format!("Failed to send {:?}", e.0)))
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
