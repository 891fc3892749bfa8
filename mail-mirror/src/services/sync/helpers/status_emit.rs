use tracing::{debug, warn};

use crate::error::MirrorError;
use crate::services::events::{EventBus, MailboxEvent};
use crate::services::MailboxService;

pub fn emit_folder_reloaded(events: &EventBus, mailbox_id: &str, folder: &str) {
    if let Err(e) = events.emit(MailboxEvent::FolderReloaded {
        mailbox_id: mailbox_id.to_string(),
        folder: folder.to_string(),
    }) {
        warn!("Folder reload for {} not broadcast: {} ({})", folder, e, mailbox_id);
    }
}

/// Compute and publish the mailbox's aggregate state. Failures are logged
/// and swallowed; a broadcast never fails the write that triggered it.
pub async fn broadcast_aggregate_state(service: &MailboxService, mailbox_id: &str) {
    let state = match service.get_aggregate_state(mailbox_id).await {
        Ok(state) => state,
        Err(e) => {
            let e = MirrorError::Broadcast(format!("aggregate state unavailable: {}", e));
            warn!("{} ({})", e, mailbox_id);
            return;
        }
    };

    match service.events().emit(MailboxEvent::StateChanged {
        mailbox_id: mailbox_id.to_string(),
        state,
    }) {
        Ok(reached) => debug!("Broadcast state for {} to {} subscribers", mailbox_id, reached),
        Err(e) => warn!("{} ({})", e, mailbox_id),
    }
}
