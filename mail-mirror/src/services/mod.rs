//! Mailbox services
//!
//! Storage-agnostic business logic on top of the registry and fan-out
//! layers. Services use `MirrorError` for error handling and can be driven
//! from tests without any remote provider.

pub mod contacts;
pub mod events;
mod mailbox_service;
pub mod sync;

pub use events::{EventBus, MailboxEvent};
pub use mailbox_service::MailboxService;
